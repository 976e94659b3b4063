//! Headless auto-pilot: settles every agency once a week.
//!
//! Uses Postgres when built with the `postgres` feature and `DATABASE_URL` is
//! set, in-memory state otherwise.

use std::thread;

#[cfg(feature = "postgres")]
use tracing::info;
use tracing::warn;

use studio_infra::bootstrap;

fn main() -> anyhow::Result<()> {
    studio_observability::init();

    let config = bootstrap::load_config()?;

    #[cfg(feature = "postgres")]
    if config.database_url.is_some() {
        let service = bootstrap::postgres(config)?;
        info!(agencies = service.agencies().len(), "studio ready (postgres)");
        let _handle = bootstrap::start_autopilot(service)?;
        park_forever();
    }

    warn!("no database configured, running on in-memory state");
    let service = bootstrap::in_memory(config);
    let _handle = bootstrap::start_autopilot(service)?;
    park_forever()
}

fn park_forever() -> ! {
    loop {
        thread::park();
    }
}
