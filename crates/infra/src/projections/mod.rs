//! Projection implementations (read model builders).
//!
//! Projections consume committed envelopes and build query-optimized read
//! models. They are rebuildable from the event store and idempotent under
//! at-least-once delivery.

pub mod agency_directory;

pub use agency_directory::{AgencyDirectory, AgencyDirectoryError, AgencySummary, MemberSummary};
