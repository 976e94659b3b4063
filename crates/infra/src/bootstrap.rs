//! Process-edge wiring: configuration, stores, service and auto-pilot.

use std::sync::Arc;

use anyhow::Context;
use serde_json::Value as JsonValue;
use tracing::info;

use studio_events::{EventEnvelope, InMemoryEventBus};

use crate::config::StudioConfig;
use crate::event_store::{EventStore, InMemoryEventStore};
use crate::game_config::{GameConfigStore, InMemoryGameConfigStore};
use crate::service::StudioService;
use crate::workers::{AutoPilot, SystemClock, WorkerHandle};

pub type SharedBus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;

pub type InMemoryStudio = StudioService<Arc<InMemoryEventStore>, SharedBus, Arc<InMemoryGameConfigStore>>;

pub fn load_config() -> anyhow::Result<StudioConfig> {
    StudioConfig::from_env().context("failed to load studio configuration")
}

/// Everything in process memory; state is lost on exit.
pub fn in_memory(config: StudioConfig) -> Arc<InMemoryStudio> {
    Arc::new(StudioService::new(
        Arc::new(InMemoryEventStore::new()),
        Arc::new(InMemoryEventBus::new()),
        Arc::new(InMemoryGameConfigStore::new()),
        config,
    ))
}

#[cfg(feature = "postgres")]
pub type PostgresStudio = StudioService<
    Arc<crate::event_store::PostgresEventStore>,
    SharedBus,
    Arc<crate::game_config::PostgresGameConfigStore>,
>;

/// Connect to `database_url`, create the schema and warm the agency directory.
#[cfg(feature = "postgres")]
pub fn postgres(config: StudioConfig) -> anyhow::Result<Arc<PostgresStudio>> {
    use crate::event_store::PostgresEventStore;
    use crate::game_config::PostgresGameConfigStore;

    let url = config
        .database_url
        .clone()
        .context("DATABASE_URL is required for the postgres backend")?;
    let store = PostgresEventStore::connect(&url, 5).context("failed to connect to postgres")?;
    store.migrate().context("failed to apply schema")?;
    let game_config = PostgresGameConfigStore::from_event_store(&store);

    let service = StudioService::new(
        Arc::new(store),
        Arc::new(InMemoryEventBus::new()),
        Arc::new(game_config),
        config,
    );
    service.warm_up().context("failed to rebuild agency directory")?;
    Ok(Arc::new(service))
}

/// Start the weekly auto-pilot on the wall clock.
pub fn start_autopilot<S, G>(service: Arc<StudioService<S, SharedBus, G>>) -> anyhow::Result<WorkerHandle>
where
    S: EventStore + 'static,
    G: GameConfigStore + 'static,
{
    let schedule = service.config().auto_pilot.clone();
    let handle = AutoPilot::new(service, Arc::new(SystemClock))
        .spawn()
        .context("failed to spawn auto-pilot thread")?;
    info!(
        weekday = %schedule.weekday,
        hour = schedule.hour,
        poll_secs = schedule.poll_interval_secs,
        "auto-pilot started"
    );
    Ok(handle)
}
