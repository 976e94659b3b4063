//! Aggregate traits and the compare-and-swap expectation used on every write.

use crate::error::{DomainError, DomainResult};

/// Aggregate root marker + minimal interface.
pub trait AggregateRoot {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> &Self::Id;

    /// Stream revision: number of events applied so far.
    ///
    /// Every write is checked against this value, so two admins editing the same
    /// agency cannot silently overwrite each other.
    fn version(&self) -> u64;
}

/// Optimistic concurrency expectation for a stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking.
    Any,
    /// The stream must not exist yet.
    NoStream,
    /// Require the stream to be at an exact revision.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::NoStream => actual == 0,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "stale revision (expected: {self:?}, actual: {actual})"
            )))
        }
    }
}

/// Decide/evolve split for event-sourced aggregates.
///
/// - `handle(&self, cmd)` decides which events happen, without mutating state.
/// - `apply(&mut self, event)` evolves state from one event and bumps the version.
///
/// Neither may perform IO; anything random or time-dependent arrives inside the
/// command.
pub trait Aggregate: AggregateRoot {
    type Command: Clone + core::fmt::Debug;
    type Event: Clone + core::fmt::Debug;
    type Error: core::fmt::Debug;

    fn apply(&mut self, event: &Self::Event);

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_stream_only_matches_zero() {
        assert!(ExpectedVersion::NoStream.matches(0));
        assert!(!ExpectedVersion::NoStream.matches(3));
    }

    #[test]
    fn exact_mismatch_is_a_conflict() {
        let err = ExpectedVersion::Exact(2).check(5).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
        assert!(ExpectedVersion::Any.check(42).is_ok());
    }
}
