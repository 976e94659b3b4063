//! Integration tests for the full event-sourced pipeline.
//!
//! Tests: Command → EventStore → EventBus → Projection → ReadModel
//!
//! Verifies:
//! - Commands produce events that update the agency directory
//! - Multi-agency batches are all-or-nothing
//! - Optimistic concurrency conflicts are detected and retried
//! - The settlement scenario holds end to end

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::Value as JsonValue;

    use studio_agency::{
        AdjustmentKind, Agency, AgencyCommand, CreateAgency, GameRules, PostAdjustment, SettleWeek,
        Student, WeekKey, AGENCY_STREAM_TYPE,
    };
    use studio_core::{AgencyId, StudentId};
    use studio_events::{EventBus, EventEnvelope, InMemoryEventBus};

    use crate::command_dispatcher::{CommandDispatcher, DispatchError};
    use crate::config::StudioConfig;
    use crate::event_store::{EventStore, InMemoryEventStore};
    use crate::game_config::InMemoryGameConfigStore;
    use crate::projections::{AgencyDirectory, AgencySummary};
    use crate::read_model::InMemoryReadModelStore;
    use crate::service::StudioService;
    use crate::workers::ProjectionWorker;

    type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
    type Directory = AgencyDirectory<Arc<InMemoryReadModelStore<AgencyId, AgencySummary>>>;

    fn setup() -> (CommandDispatcher<Arc<InMemoryEventStore>, Bus>, Arc<Directory>) {
        let store = Arc::new(InMemoryEventStore::new());
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let dispatcher = CommandDispatcher::new(store, bus.clone());
        let directory = Arc::new(AgencyDirectory::new(Arc::new(InMemoryReadModelStore::new())));

        // Subscribe to the bus BEFORE any events are published
        let directory_clone = directory.clone();
        let bus_clone = bus.clone();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<()>();
        std::thread::spawn(move || {
            let sub = bus_clone.subscribe();
            let _ = ready_tx.send(());
            while let Ok(env) = sub.recv() {
                if let Err(e) = directory_clone.apply_envelope(&env) {
                    eprintln!("Failed to apply envelope: {:?}", e);
                }
            }
        });
        let _ = ready_rx.recv_timeout(Duration::from_secs(1));

        (dispatcher, directory)
    }

    /// The subscriber thread processes events asynchronously.
    fn wait_for_processing() {
        std::thread::sleep(Duration::from_millis(50));
    }

    fn create(agency_id: AgencyId, name: &str, budget: i64) -> AgencyCommand {
        AgencyCommand::CreateAgency(CreateAgency {
            agency_id,
            name: name.to_string(),
            founders: vec![
                Student::new(StudentId::new(), "Ada", 80, 0),
                Student::new(StudentId::new(), "Bo", 40, 0),
            ],
            initial_budget: budget,
            initial_ve: 50,
            occurred_at: Utc::now(),
        })
    }

    fn bonus(agency_id: AgencyId, amount: i64) -> AgencyCommand {
        AgencyCommand::PostAdjustment(PostAdjustment {
            agency_id,
            kind: AdjustmentKind::Bonus,
            label: "Client bonus".to_string(),
            budget_delta: amount,
            ve_delta: 0,
            occurred_at: Utc::now(),
        })
    }

    fn settle(agency_id: AgencyId) -> AgencyCommand {
        AgencyCommand::SettleWeek(SettleWeek {
            agency_id,
            week: WeekKey::parse("2026-W43").unwrap(),
            rules: GameRules::default(),
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn command_creates_agency_and_updates_directory() {
        let (dispatcher, directory) = setup();
        let id = AgencyId::new();

        let stored = dispatcher
            .dispatch(id, AGENCY_STREAM_TYPE, create(id, "Studio Nord", 1000), Agency::empty)
            .unwrap();
        assert_eq!(stored.len(), 2);

        wait_for_processing();

        let row = directory.get(id).unwrap();
        assert_eq!(row.name, "Studio Nord");
        assert_eq!(row.budget, 1000);
        assert_eq!(row.members.len(), 2);
        assert_eq!(row.version, 2);
    }

    #[test]
    fn stale_decision_is_a_concurrency_conflict() {
        let (dispatcher, _) = setup();
        let id = AgencyId::new();
        dispatcher
            .dispatch(id, AGENCY_STREAM_TYPE, create(id, "Studio Nord", 0), Agency::empty)
            .unwrap();

        let first = dispatcher.decide(id, &bonus(id, 100), Agency::empty).unwrap();
        let second = dispatcher.decide(id, &bonus(id, 200), Agency::empty).unwrap();

        dispatcher
            .commit(vec![first.into_append(AGENCY_STREAM_TYPE).unwrap()])
            .unwrap();
        let err = dispatcher
            .commit(vec![second.into_append(AGENCY_STREAM_TYPE).unwrap()])
            .unwrap_err();
        assert!(matches!(err, DispatchError::Concurrency(_)));

        let (agency, _) = dispatcher.load(id, Agency::empty).unwrap();
        assert_eq!(agency.budget(), 100);
    }

    #[test]
    fn batch_with_one_stale_stream_writes_nothing() {
        let (dispatcher, _) = setup();
        let a = AgencyId::new();
        let b = AgencyId::new();
        for (id, name) in [(a, "Studio A"), (b, "Studio B")] {
            dispatcher
                .dispatch(id, AGENCY_STREAM_TYPE, create(id, name, 2000), Agency::empty)
                .unwrap();
        }

        let settle_a = dispatcher.decide(a, &settle(a), Agency::empty).unwrap();
        let settle_b = dispatcher.decide(b, &settle(b), Agency::empty).unwrap();
        // Another writer moves B between decision and commit.
        dispatcher
            .dispatch(b, AGENCY_STREAM_TYPE, bonus(b, 10), Agency::empty)
            .unwrap();

        let err = dispatcher
            .commit(vec![
                settle_a.into_append(AGENCY_STREAM_TYPE).unwrap(),
                settle_b.into_append(AGENCY_STREAM_TYPE).unwrap(),
            ])
            .unwrap_err();
        assert!(err.is_concurrency());

        let history_a = dispatcher.store().load_stream(a).unwrap();
        assert_eq!(history_a.len(), 2, "agency A must be untouched");
    }

    #[test]
    fn concurrent_writers_all_land_with_retry() {
        let (dispatcher, directory) = setup();
        let dispatcher = Arc::new(dispatcher);
        let id = AgencyId::new();
        dispatcher
            .dispatch(id, AGENCY_STREAM_TYPE, create(id, "Studio Nord", 0), Agency::empty)
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                std::thread::spawn(move || {
                    dispatcher
                        .dispatch_with_retry(id, AGENCY_STREAM_TYPE, bonus(id, 10), Agency::empty, 50)
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let (agency, version) = dispatcher.load(id, Agency::empty).unwrap();
        assert_eq!(agency.budget(), 80);
        assert_eq!(version, 9);

        wait_for_processing();
        assert_eq!(directory.get(id).unwrap().budget, 80);
    }

    #[test]
    fn worker_fed_directory_matches_service_directory() {
        let store = Arc::new(InMemoryEventStore::new());
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let worker_directory: Arc<Directory> =
            Arc::new(AgencyDirectory::new(Arc::new(InMemoryReadModelStore::new())));

        let sink = worker_directory.clone();
        let worker = ProjectionWorker::spawn("agency-directory", &bus, Some(AGENCY_STREAM_TYPE), move |env| {
            sink.apply_envelope(&env).map(|_| ())
        })
        .unwrap();

        let svc = StudioService::new(
            store,
            bus,
            Arc::new(InMemoryGameConfigStore::new()),
            StudioConfig {
                rng_seed: Some(3),
                ..StudioConfig::default()
            },
        );
        let row = svc
            .create_agency("Studio Nord", vec![Student::new(StudentId::new(), "Ada", 70, 0)], 500, 50)
            .unwrap();
        svc.post_adjustment(row.agency_id, AdjustmentKind::Crisis, "Server outage", -200, -4)
            .unwrap();
        svc.run_weekly_settlement(&WeekKey::parse("2026-W43").unwrap())
            .unwrap();

        std::thread::sleep(Duration::from_millis(400));
        worker.shutdown();

        assert_eq!(worker_directory.get(row.agency_id), svc.agency(row.agency_id).unwrap());
    }

    #[test]
    fn settlement_scenario_end_to_end() {
        let rules = GameRules {
            ve_multiplier: 30,
            revenue_bonus: 0,
            revenue_base: 0,
            rent: 500,
            salary_multiplier: 10,
            salary_cap: 800,
            cost_of_living: 100,
            ..GameRules::default()
        };
        let svc = StudioService::new(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryEventBus::<EventEnvelope<JsonValue>>::new()),
            Arc::new(InMemoryGameConfigStore::new()),
            StudioConfig {
                rules,
                rng_seed: Some(3),
                ..StudioConfig::default()
            },
        );
        let members = vec![
            Student::new(StudentId::new(), "Ada", 80, 0),
            Student::new(StudentId::new(), "Bo", 50, 0),
            Student::new(StudentId::new(), "Cy", 20, 0),
        ];
        let row = svc.create_agency("Studio Nord", members, 0, 50).unwrap();

        let report = svc
            .run_weekly_settlement(&WeekKey::parse("2026-W43").unwrap())
            .unwrap();
        assert_eq!(report.agencies[0].budget, -500);
        assert!(!report.agencies[0].breached);

        let after = svc.agency(row.agency_id).unwrap().unwrap();
        let wallets: Vec<i64> = after.members.iter().map(|m| m.wallet).collect();
        assert_eq!(wallets, vec![700, 400, 100]);
        assert_eq!(after.ledger_entries, 4);
    }

    #[test]
    fn directory_rebuild_from_store_matches_live_state() {
        let (dispatcher, directory) = setup();
        let id = AgencyId::new();
        dispatcher
            .dispatch(id, AGENCY_STREAM_TYPE, create(id, "Studio Nord", 300), Agency::empty)
            .unwrap();
        dispatcher
            .dispatch(id, AGENCY_STREAM_TYPE, bonus(id, 50), Agency::empty)
            .unwrap();
        wait_for_processing();
        let live = directory.get(id).unwrap();

        let rebuilt: Directory = AgencyDirectory::new(Arc::new(InMemoryReadModelStore::new()));
        assert_eq!(rebuilt.rebuild_from_store(dispatcher.store()).unwrap(), 1);
        assert_eq!(rebuilt.get(id).unwrap(), live);
    }
}
