//! `studio-core`: building blocks shared by the simulator's rule engines.
//!
//! Pure domain primitives only: no storage, no clocks, no IO.

pub mod aggregate;
pub mod entity;
pub mod error;
pub mod id;
pub mod value_object;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{AgencyId, RequestId, StudentId};
pub use value_object::{Bounded100, ValueObject};
