use studio_core::AgencyId;

/// An intent aimed at exactly one agency stream.
///
/// Commands are never persisted. The aggregate either rejects them with a domain
/// error or turns them into events, and one command never spans two agencies:
/// cross-agency effects (rival sanctions, founding a new agency) are issued as
/// separate commands by the service layer.
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    fn target_agency_id(&self) -> AgencyId;
}
