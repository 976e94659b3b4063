//! Weekly auto-pilot.
//!
//! Polls at a fixed interval. On the configured weekday, from the configured
//! hour on, it runs the weekly settlement once per ISO week. The week key is
//! compared with `last_finance_run` in the game config as a shortcut; the
//! agency streams themselves refuse a second settlement of the same week, so
//! overlapping ticks bill each agency once.

use std::io;
use std::sync::{mpsc, Arc};
use std::thread;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, error, info};

use studio_agency::WeekKey;
use studio_events::{EventBus, EventEnvelope};

use crate::config::AutoPilotConfig;
use crate::event_store::EventStore;
use crate::game_config::GameConfigStore;
use crate::service::{ServiceError, SettlementReport, StudioService};

use super::WorkerHandle;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// `auto_pilot` is off in the game config.
    Disabled,
    NotDue,
    AlreadyRan(WeekKey),
    Ran(SettlementReport),
}

pub struct AutoPilot<S, B, G> {
    service: Arc<StudioService<S, B, G>>,
    schedule: AutoPilotConfig,
    clock: Arc<dyn Clock>,
}

impl<S, B, G> AutoPilot<S, B, G>
where
    S: EventStore + 'static,
    B: EventBus<EventEnvelope<JsonValue>> + 'static,
    G: GameConfigStore + 'static,
{
    pub fn new(service: Arc<StudioService<S, B, G>>, clock: Arc<dyn Clock>) -> Self {
        let schedule = service.config().auto_pilot.clone();
        Self {
            service,
            schedule,
            clock,
        }
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        now.weekday() == self.schedule.weekday && now.hour() >= self.schedule.hour
    }

    /// One scheduler step at `now`.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<TickOutcome, ServiceError> {
        let game = self.service.game_config()?;
        if !game.auto_pilot {
            return Ok(TickOutcome::Disabled);
        }
        if !self.is_due(now) {
            return Ok(TickOutcome::NotDue);
        }

        let week = WeekKey::from_date(now.date_naive());
        if game.last_finance_run.as_ref() == Some(&week) {
            return Ok(TickOutcome::AlreadyRan(week));
        }

        info!(week = %week, "auto-pilot running weekly settlement");
        match self.service.run_weekly_settlement(&week) {
            Ok(report) => Ok(TickOutcome::Ran(report)),
            Err(ServiceError::AlreadySettled(week)) => Ok(TickOutcome::AlreadyRan(week)),
            Err(err) => Err(err),
        }
    }

    /// Run `tick` every poll interval on a named thread until shut down.
    pub fn spawn(self) -> io::Result<WorkerHandle> {
        let name = "studio-autopilot";
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let interval = self.schedule.poll_interval();

        let join = thread::Builder::new().name(name.to_string()).spawn(move || {
            loop {
                match shutdown_rx.recv_timeout(interval) {
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }

                match self.tick(self.clock.now()) {
                    Ok(TickOutcome::Ran(report)) => info!(
                        week = %report.week,
                        agencies = report.agencies.len(),
                        breaches = report.breaches().count(),
                        "auto-pilot settlement done"
                    ),
                    Ok(outcome) => debug!(outcome = ?outcome, "auto-pilot idle"),
                    // Nothing was committed, so the next tick retries.
                    Err(err) => error!(error = %err, "auto-pilot settlement failed"),
                }
            }
            debug!(worker = name, "auto-pilot stopped");
        })?;

        Ok(WorkerHandle::new(name, shutdown_tx, join))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Barrier, Mutex};
    use std::time::Duration;

    use chrono::{TimeZone, Weekday};

    use studio_agency::{GameEventKind, Student};
    use studio_core::StudentId;
    use studio_events::InMemoryEventBus;

    use crate::config::StudioConfig;
    use crate::event_store::InMemoryEventStore;
    use crate::game_config::{GameConfig, GameConfigError, GameConfigPatch, InMemoryGameConfigStore};

    type Service = StudioService<
        Arc<InMemoryEventStore>,
        Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>,
        Arc<InMemoryGameConfigStore>,
    >;

    struct FixedClock(Mutex<DateTime<Utc>>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    /// Holds the first two config reads once armed until both have arrived,
    /// so two ticks see the same `last_finance_run`.
    struct GatedConfig {
        inner: InMemoryGameConfigStore,
        armed: AtomicBool,
        reads: AtomicUsize,
        gate: Barrier,
    }

    impl GameConfigStore for GatedConfig {
        fn get_or_create(&self) -> Result<GameConfig, GameConfigError> {
            let config = self.inner.get_or_create()?;
            if self.armed.load(Ordering::SeqCst) && self.reads.fetch_add(1, Ordering::SeqCst) < 2 {
                self.gate.wait();
            }
            Ok(config)
        }

        fn patch(&self, patch: &GameConfigPatch, expected_version: u64) -> Result<GameConfig, GameConfigError> {
            self.inner.patch(patch, expected_version)
        }
    }

    fn schedule() -> StudioConfig {
        StudioConfig {
            auto_pilot: AutoPilotConfig {
                weekday: Weekday::Mon,
                hour: 8,
                poll_interval_secs: 1,
            },
            rng_seed: Some(1),
            ..StudioConfig::default()
        }
    }

    fn service() -> Arc<Service> {
        let svc = StudioService::new(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryEventBus::new()),
            Arc::new(InMemoryGameConfigStore::new()),
            schedule(),
        );
        svc.create_agency("Studio Alpha", vec![Student::new(StudentId::new(), "Ada", 60, 0)], 0, 50)
            .unwrap();
        Arc::new(svc)
    }

    // 2026-10-19 is a Monday in ISO week 43.
    fn monday(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, hour, 0, 0).unwrap()
    }

    fn pilot(svc: &Arc<Service>) -> AutoPilot<Arc<InMemoryEventStore>, Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>, Arc<InMemoryGameConfigStore>> {
        AutoPilot::new(svc.clone(), Arc::new(SystemClock))
    }

    #[test]
    fn does_nothing_while_disabled() {
        let svc = service();
        assert_eq!(pilot(&svc).tick(monday(9)).unwrap(), TickOutcome::Disabled);
    }

    #[test]
    fn waits_for_the_configured_slot() {
        let svc = service();
        svc.set_auto_pilot(true).unwrap();
        let pilot = pilot(&svc);
        assert_eq!(pilot.tick(monday(7)).unwrap(), TickOutcome::NotDue);
        let tuesday = Utc.with_ymd_and_hms(2026, 10, 20, 9, 0, 0).unwrap();
        assert_eq!(pilot.tick(tuesday).unwrap(), TickOutcome::NotDue);
    }

    #[test]
    fn settles_once_per_iso_week() {
        let svc = service();
        svc.set_auto_pilot(true).unwrap();
        let pilot = pilot(&svc);

        let first = pilot.tick(monday(8)).unwrap();
        assert!(matches!(first, TickOutcome::Ran(ref r) if r.week.as_str() == "2026-W43"));
        let ledger_after_first = svc.agencies()[0].ledger_entries;

        let second = pilot.tick(monday(15)).unwrap();
        assert_eq!(second, TickOutcome::AlreadyRan(WeekKey::parse("2026-W43").unwrap()));
        assert_eq!(svc.agencies()[0].ledger_entries, ledger_after_first);

        let next_monday = Utc.with_ymd_and_hms(2026, 10, 26, 8, 30, 0).unwrap();
        assert!(matches!(pilot.tick(next_monday).unwrap(), TickOutcome::Ran(_)));
    }

    #[test]
    fn worker_thread_ticks_and_shuts_down() {
        let svc = service();
        svc.set_auto_pilot(true).unwrap();
        let clock = Arc::new(FixedClock(Mutex::new(monday(10))));
        let handle = AutoPilot::new(svc.clone(), clock).spawn().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while svc.game_config().unwrap().last_finance_run.is_none() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        handle.shutdown();
        assert_eq!(
            svc.game_config().unwrap().last_finance_run,
            Some(WeekKey::parse("2026-W43").unwrap())
        );
    }

    #[test]
    fn overlapping_ticks_settle_the_week_once() {
        let gated = Arc::new(GatedConfig {
            inner: InMemoryGameConfigStore::new(),
            armed: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
            gate: Barrier::new(2),
        });
        let svc = Arc::new(StudioService::new(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryEventBus::new()),
            gated.clone(),
            schedule(),
        ));
        let mut agencies = Vec::new();
        for name in ["Studio Alpha", "Studio Beta"] {
            let founder = Student::new(StudentId::new(), "Ada", 60, 0);
            agencies.push(svc.create_agency(name, vec![founder], 0, 50).unwrap().agency_id);
        }
        svc.set_auto_pilot(true).unwrap();
        gated.armed.store(true, Ordering::SeqCst);

        let ticks: Vec<_> = (0..2)
            .map(|_| {
                let pilot = AutoPilot::new(svc.clone(), Arc::new(SystemClock));
                thread::spawn(move || pilot.tick(monday(9)).unwrap())
            })
            .collect();
        let outcomes: Vec<TickOutcome> = ticks.into_iter().map(|t| t.join().unwrap()).collect();

        let ran = outcomes.iter().filter(|o| matches!(o, TickOutcome::Ran(_))).count();
        let skipped = outcomes
            .iter()
            .filter(|o| matches!(o, TickOutcome::AlreadyRan(w) if w.as_str() == "2026-W43"))
            .count();
        assert_eq!((ran, skipped), (1, 1));

        for agency_id in agencies {
            let agency = svc.load_agency(agency_id).unwrap();
            let revenue = agency
                .event_log()
                .iter()
                .filter(|e| e.kind == GameEventKind::Revenue)
                .count();
            assert_eq!(revenue, 1);
        }
    }
}
