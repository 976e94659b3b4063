//! Infrastructure layer: event store, dispatcher, read models, game config,
//! workers and the `StudioService` facade.

pub mod bootstrap;
pub mod command_dispatcher;
pub mod config;
pub mod event_store;
pub mod game_config;
pub mod projections;
pub mod read_model;
pub mod service;
pub mod workers;

mod integration_tests;

pub use config::{AutoPilotConfig, ConfigError, StudioConfig};
pub use service::{ServiceError, StudioService};
