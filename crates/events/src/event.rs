use chrono::{DateTime, Utc};

/// A fact recorded in an agency stream.
///
/// Events are immutable, versioned for schema evolution, and only ever appended.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable type name (e.g. "agency.mercato.vote_cast").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// Game time at which the fact happened.
    fn occurred_at(&self) -> DateTime<Utc>;
}
