//! `StudioService`: the application-facing facade over the agency aggregate.
//!
//! Every operation builds a command, runs it through the dispatcher (with the
//! bounded compare-and-swap retry), then feeds the committed events into the
//! agency directory so the caller reads its own writes.
//!
//! Operations that touch several agencies (weekly settlement, founding a new
//! agency, hiring from another roster, black-market actions against a rival)
//! decide every stream first and commit them in one atomic batch.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

use studio_agency::{
    AddMember, AdjustmentKind, Agency, AgencyCommand, AgencyEvent, BlackOpKind, CastVote,
    CreateAgency, Decision, DepartureReason, Effect, GradeDeliverable, Grade, MemberLeft,
    OpenRequest, PostAdjustment, PurchaseBlackOp, ReleaseMember, RemoveMember, RequestKind,
    RequestStatus, ResolveRequest, SettleWeek, Student, SubmitDeliverable, TransferToAgency,
    Vote, WeekKey, AGENCY_STREAM_TYPE,
};
use studio_core::{Aggregate, AgencyId, DomainError, ExpectedVersion, RequestId, StudentId};
use studio_events::{EventBus, EventEnvelope};

use crate::command_dispatcher::{retry_on_conflict, CommandDispatcher, Decided, DispatchError};
use crate::config::StudioConfig;
use crate::event_store::{EventStore, StoredEvent, StreamAppend};
use crate::game_config::{GameConfig, GameConfigError, GameConfigPatch, GameConfigStore};
use crate::projections::{AgencyDirectory, AgencyDirectoryError, AgencySummary};
use crate::read_model::InMemoryReadModelStore;

pub type DirectoryStore = Arc<InMemoryReadModelStore<AgencyId, AgencySummary>>;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Rejected before any write.
    #[error(transparent)]
    Domain(DomainError),
    #[error(transparent)]
    Dispatch(DispatchError),
    #[error(transparent)]
    GameConfig(#[from] GameConfigError),
    #[error(transparent)]
    Projection(#[from] AgencyDirectoryError),
    /// Every agency already carries a settlement for this week.
    #[error("week {0} is already settled")]
    AlreadySettled(WeekKey),
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl From<DispatchError> for ServiceError {
    fn from(value: DispatchError) -> Self {
        match value {
            DispatchError::Domain(err) => ServiceError::Domain(err),
            other => ServiceError::Dispatch(other),
        }
    }
}

impl From<DomainError> for ServiceError {
    fn from(value: DomainError) -> Self {
        ServiceError::Domain(value)
    }
}

/// What a vote or an admin override led to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestOutcome {
    pub request_id: RequestId,
    pub status: RequestStatus,
    /// Set when an approved found-agency request created a new agency.
    pub founded_agency: Option<AgencyId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlackOpReceipt {
    pub action: BlackOpKind,
    pub roll: u8,
    pub success: bool,
    pub effect: Effect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettledAgency {
    pub agency_id: AgencyId,
    pub name: String,
    pub budget: i64,
    pub breached: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettlementReport {
    pub week: WeekKey,
    pub agencies: Vec<SettledAgency>,
    pub events_committed: usize,
}

impl SettlementReport {
    pub fn breaches(&self) -> impl Iterator<Item = &SettledAgency> {
        self.agencies.iter().filter(|a| a.breached)
    }
}

/// A roster holding candidates of pending hires, as loaded.
struct HireSource {
    agency: Agency,
    version: u64,
    candidates: Vec<Student>,
}

pub struct StudioService<S, B, G> {
    dispatcher: CommandDispatcher<S, B>,
    directory: AgencyDirectory<DirectoryStore>,
    game_config: G,
    rng: Mutex<ChaCha8Rng>,
    config: StudioConfig,
}

impl<S, B, G> StudioService<S, B, G>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
    G: GameConfigStore,
{
    pub fn new(store: S, bus: B, game_config: G, config: StudioConfig) -> Self {
        let seed = config.rng_seed.unwrap_or_else(rand::random);
        Self {
            dispatcher: CommandDispatcher::new(store, bus),
            directory: AgencyDirectory::new(Arc::new(InMemoryReadModelStore::new())),
            game_config,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            config,
        }
    }

    pub fn config(&self) -> &StudioConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &CommandDispatcher<S, B> {
        &self.dispatcher
    }

    pub fn directory(&self) -> &AgencyDirectory<DirectoryStore> {
        &self.directory
    }

    /// Replay every agency stream into the directory (startup, or after drift).
    pub fn warm_up(&self) -> Result<usize, ServiceError> {
        let count = self.directory.rebuild_from_store(self.dispatcher.store())?;
        info!(agencies = count, "agency directory rebuilt");
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Read-through lookup: served from the directory, filled from the store on a miss.
    pub fn agency(&self, agency_id: AgencyId) -> Result<Option<AgencySummary>, ServiceError> {
        if let Some(summary) = self.directory.get(agency_id) {
            return Ok(Some(summary));
        }
        self.sync_agency(agency_id)
    }

    /// Re-read one stream from the store and replace its directory entry.
    pub fn sync_agency(&self, agency_id: AgencyId) -> Result<Option<AgencySummary>, ServiceError> {
        let history = self
            .dispatcher
            .store()
            .load_stream(agency_id)
            .map_err(DispatchError::from)?;
        Ok(self.directory.refresh_stream(agency_id, &history)?)
    }

    pub fn agencies(&self) -> Vec<AgencySummary> {
        self.directory.list()
    }

    /// Full aggregate state straight from the event store.
    pub fn load_agency(&self, agency_id: AgencyId) -> Result<Agency, ServiceError> {
        let (agency, _) = self.dispatcher.load(agency_id, Agency::empty)?;
        if !agency.is_created() {
            return Err(DomainError::not_found().into());
        }
        Ok(agency)
    }

    pub fn game_config(&self) -> Result<GameConfig, ServiceError> {
        Ok(self.game_config.get_or_create()?)
    }

    // -----------------------------------------------------------------------
    // Game config
    // -----------------------------------------------------------------------

    /// Merge `patch` into the game config, re-reading on a version clash.
    pub fn patch_game_config(&self, patch: &GameConfigPatch) -> Result<GameConfig, ServiceError> {
        let attempts = self.config.max_dispatch_attempts.max(1);
        let mut attempt = 1;
        loop {
            let current = self.game_config.get_or_create()?;
            match self.game_config.patch(patch, current.version) {
                Err(GameConfigError::Concurrency { .. }) if attempt < attempts => attempt += 1,
                other => return Ok(other?),
            }
        }
    }

    pub fn set_auto_pilot(&self, enabled: bool) -> Result<GameConfig, ServiceError> {
        let config = self.patch_game_config(&GameConfigPatch::auto_pilot(enabled))?;
        info!(enabled, "auto-pilot toggled");
        Ok(config)
    }

    // -----------------------------------------------------------------------
    // Roster
    // -----------------------------------------------------------------------

    pub fn create_agency(
        &self,
        name: &str,
        founders: Vec<Student>,
        initial_budget: i64,
        initial_ve: i64,
    ) -> Result<AgencySummary, ServiceError> {
        for founder in &founders {
            self.ensure_unassigned(founder.id)?;
        }
        let agency_id = AgencyId::new();
        self.execute(
            agency_id,
            AgencyCommand::CreateAgency(CreateAgency {
                agency_id,
                name: name.to_string(),
                founders,
                initial_budget,
                initial_ve,
                occurred_at: Utc::now(),
            }),
        )?;
        info!(agency_id = %agency_id, name, "agency created");
        self.summary(agency_id)
    }

    pub fn add_member(&self, agency_id: AgencyId, student: Student) -> Result<AgencySummary, ServiceError> {
        self.ensure_unassigned(student.id)?;
        self.execute(
            agency_id,
            AgencyCommand::AddMember(AddMember {
                agency_id,
                student,
                occurred_at: Utc::now(),
            }),
        )?;
        self.summary(agency_id)
    }

    pub fn remove_member(
        &self,
        agency_id: AgencyId,
        student_id: StudentId,
        note: &str,
    ) -> Result<AgencySummary, ServiceError> {
        let occurred_at = Utc::now();
        self.decide_roster_change(agency_id, |candidates| {
            AgencyCommand::RemoveMember(RemoveMember {
                agency_id,
                student_id,
                note: note.to_string(),
                rules: self.config.rules.clone(),
                candidates,
                occurred_at,
            })
        })?;
        info!(agency_id = %agency_id, student_id = %student_id, "member removed by admin");
        self.summary(agency_id)
    }

    /// The agency whose roster currently lists `student_id`.
    pub fn roster_of(&self, student_id: StudentId) -> Result<Option<AgencyId>, ServiceError> {
        let ids = self
            .dispatcher
            .store()
            .list_streams(AGENCY_STREAM_TYPE)
            .map_err(DispatchError::from)?;
        for agency_id in ids {
            let (agency, _) = self.dispatcher.load(agency_id, Agency::empty)?;
            if agency.member(student_id).is_some() {
                return Ok(Some(agency_id));
            }
        }
        Ok(None)
    }

    fn ensure_unassigned(&self, student_id: StudentId) -> Result<(), ServiceError> {
        match self.roster_of(student_id)? {
            Some(agency_id) => Err(DomainError::conflict(format!(
                "student {student_id} is already on the roster of agency {agency_id}"
            ))
            .into()),
            None => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Mercato
    // -----------------------------------------------------------------------

    pub fn open_request(
        &self,
        agency_id: AgencyId,
        requester_id: StudentId,
        kind: RequestKind,
    ) -> Result<RequestId, ServiceError> {
        if let RequestKind::Hire { student_id } = &kind {
            // Hiring moves a student from another roster; unassigned students
            // are placed by an admin.
            if self.roster_of(*student_id)?.is_none() {
                return Err(DomainError::not_found().into());
            }
        }
        let request_id = RequestId::new();
        let kind_name = kind.name();
        self.execute(
            agency_id,
            AgencyCommand::OpenRequest(OpenRequest {
                agency_id,
                request_id,
                requester_id,
                kind,
                occurred_at: Utc::now(),
            }),
        )?;
        info!(agency_id = %agency_id, request_id = %request_id, kind = kind_name, "mercato request opened");
        Ok(request_id)
    }

    pub fn cast_vote(
        &self,
        agency_id: AgencyId,
        request_id: RequestId,
        voter_id: StudentId,
        vote: Vote,
    ) -> Result<RequestOutcome, ServiceError> {
        let occurred_at = Utc::now();
        let founded = self.decide_roster_change(agency_id, |candidates| {
            AgencyCommand::CastVote(CastVote {
                agency_id,
                request_id,
                voter_id,
                vote,
                rules: self.config.rules.clone(),
                candidates,
                occurred_at,
            })
        })?;
        Ok(self.request_outcome(agency_id, request_id, founded))
    }

    /// Admin override of a pending request.
    pub fn resolve_request(
        &self,
        agency_id: AgencyId,
        request_id: RequestId,
        decision: Decision,
    ) -> Result<RequestOutcome, ServiceError> {
        let occurred_at = Utc::now();
        let founded = self.decide_roster_change(agency_id, |candidates| {
            AgencyCommand::ResolveRequest(ResolveRequest {
                agency_id,
                request_id,
                decision,
                rules: self.config.rules.clone(),
                candidates,
                occurred_at,
            })
        })?;
        Ok(self.request_outcome(agency_id, request_id, founded))
    }

    fn request_outcome(
        &self,
        agency_id: AgencyId,
        request_id: RequestId,
        founded: Vec<AgencyId>,
    ) -> RequestOutcome {
        let status = self
            .request_status(agency_id, request_id)
            .unwrap_or(RequestStatus::Pending);
        info!(
            agency_id = %agency_id,
            request_id = %request_id,
            status = ?status,
            founded = ?founded,
            "mercato request updated"
        );
        RequestOutcome {
            request_id,
            status,
            founded_agency: founded.first().copied(),
        }
    }

    /// Decide a command that may resolve Mercato requests, plus every stream
    /// its roster changes reach: the previous rosters of hired candidates and
    /// the agencies of approved founders. Returns the ids of founded agencies.
    fn decide_roster_change(
        &self,
        agency_id: AgencyId,
        build: impl Fn(Vec<Student>) -> AgencyCommand,
    ) -> Result<Vec<AgencyId>, ServiceError> {
        let (committed, founded) = retry_on_conflict(self.config.max_dispatch_attempts, || {
            let (agency, version) = self.dispatcher.load(agency_id, Agency::empty)?;
            let sources = self.hire_sources(&agency)?;
            let candidates = sources
                .iter()
                .flat_map(|s| s.candidates.iter().cloned())
                .collect();
            let decided = Decided::against(agency_id, agency, version, &build(candidates))?;
            let releases = self.hire_releases(&decided, sources)?;

            let mut foundings = Vec::new();
            for d in std::iter::once(&decided).chain(releases.iter()) {
                foundings.extend(self.founding_followups(d)?);
            }
            let founded: Vec<AgencyId> = foundings.iter().map(|d| d.stream_id).collect();

            let mut batch = vec![decided.into_append(AGENCY_STREAM_TYPE)?];
            for d in releases.into_iter().chain(foundings) {
                batch.push(d.into_append(AGENCY_STREAM_TYPE)?);
            }
            Ok((self.dispatcher.commit(batch)?, founded))
        })?;
        self.project(&committed);
        Ok(founded)
    }

    /// Load the current roster of every pending hire candidate of `hiring`.
    fn hire_sources(&self, hiring: &Agency) -> Result<Vec<HireSource>, DispatchError> {
        let wanted: Vec<StudentId> = hiring
            .pending_requests()
            .filter_map(|r| match r.kind {
                RequestKind::Hire { student_id } => Some(student_id),
                _ => None,
            })
            .collect();
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        let mut sources = Vec::new();
        for agency_id in self.dispatcher.store().list_streams(AGENCY_STREAM_TYPE)? {
            if agency_id == hiring.id_typed() {
                continue;
            }
            let (agency, version) = self.dispatcher.load(agency_id, Agency::empty)?;
            let candidates: Vec<Student> = wanted
                .iter()
                .filter_map(|id| agency.member(*id).cloned())
                .collect();
            if !candidates.is_empty() {
                sources.push(HireSource {
                    agency,
                    version,
                    candidates,
                });
            }
        }
        Ok(sources)
    }

    /// Release every candidate `decided` hires from the roster they came
    /// from, decided against the same state their record was read from.
    fn hire_releases(
        &self,
        decided: &Decided<Agency>,
        sources: Vec<HireSource>,
    ) -> Result<Vec<Decided<Agency>>, DispatchError> {
        let hired: Vec<(StudentId, RequestId, DateTime<Utc>)> = decided
            .events
            .iter()
            .filter_map(|ev| match ev {
                AgencyEvent::RequestResolved(r) if r.status == RequestStatus::Approved => {
                    match decided.aggregate.request(r.request_id).map(|req| &req.kind) {
                        Some(RequestKind::Hire { student_id }) => {
                            Some((*student_id, r.request_id, r.occurred_at))
                        }
                        _ => None,
                    }
                }
                _ => None,
            })
            .collect();

        let mut releases = Vec::new();
        for source in sources {
            let source_id = source.agency.id_typed();
            let mut state = source.agency.clone();
            let mut events = Vec::new();
            for (student_id, request_id, occurred_at) in &hired {
                if !source.candidates.iter().any(|c| c.id == *student_id) {
                    continue;
                }
                let release = AgencyCommand::ReleaseMember(ReleaseMember {
                    agency_id: source_id,
                    student_id: *student_id,
                    request_id: *request_id,
                    to_agency: decided.stream_id,
                    rules: self.config.rules.clone(),
                    occurred_at: *occurred_at,
                });
                for ev in state.handle(&release)? {
                    state.apply(&ev);
                    events.push(ev);
                }
            }
            if !events.is_empty() {
                releases.push(Decided {
                    stream_id: source_id,
                    expected_version: ExpectedVersion::Exact(source.version),
                    aggregate: source.agency,
                    events,
                });
            }
        }
        Ok(releases)
    }

    /// Decide the creation of a new agency for every founder `decided` releases.
    fn founding_followups(&self, decided: &Decided<Agency>) -> Result<Vec<Decided<Agency>>, DispatchError> {
        let mut created = Vec::new();
        for ev in &decided.events {
            let AgencyEvent::MemberLeft(MemberLeft {
                student,
                reason: DepartureReason::FoundedAgency { agency_name, .. },
                occurred_at,
                ..
            }) = ev
            else {
                continue;
            };
            let new_id = AgencyId::new();
            let create = AgencyCommand::CreateAgency(CreateAgency {
                agency_id: new_id,
                name: agency_name.clone(),
                founders: vec![student.clone()],
                initial_budget: self.config.new_agency_budget,
                initial_ve: self.config.new_agency_ve,
                occurred_at: *occurred_at,
            });
            created.push(self.dispatcher.decide(new_id, &create, Agency::empty)?);
        }
        Ok(created)
    }

    fn request_status(&self, agency_id: AgencyId, request_id: RequestId) -> Option<RequestStatus> {
        self.load_agency(agency_id)
            .ok()
            .and_then(|agency| agency.request(request_id).map(|r| r.status))
    }

    // -----------------------------------------------------------------------
    // Black market
    // -----------------------------------------------------------------------

    /// Buy a black-market action. The roll is drawn once, so a retried commit
    /// replays the same outcome.
    pub fn purchase_black_op(
        &self,
        agency_id: AgencyId,
        buyer_id: StudentId,
        action: BlackOpKind,
        target: Option<AgencyId>,
    ) -> Result<BlackOpReceipt, ServiceError> {
        let roll = self.roll()?;
        let command = AgencyCommand::PurchaseBlackOp(PurchaseBlackOp {
            agency_id,
            buyer_id,
            action,
            target,
            roll,
            occurred_at: Utc::now(),
        });

        let (committed, receipt) = retry_on_conflict(self.config.max_dispatch_attempts, || {
            if let Some(rival_id) = target {
                let (rival, _) = self.dispatcher.load(rival_id, Agency::empty)?;
                if !rival.is_created() {
                    return Err(DomainError::not_found().into());
                }
            }

            let decided = self.dispatcher.decide(agency_id, &command, Agency::empty)?;
            let receipt = decided
                .events
                .iter()
                .find_map(|ev| match ev {
                    AgencyEvent::BlackOpResolved(e) => Some(BlackOpReceipt {
                        action: e.action,
                        roll,
                        success: e.success,
                        effect: e.effect,
                    }),
                    _ => None,
                })
                .ok_or_else(|| DomainError::invariant("purchase produced no outcome"))?;

            let mut batch = vec![decided.into_append(AGENCY_STREAM_TYPE)?];
            if let (Some(rival_id), true) = (target, receipt.effect.touches_rival()) {
                batch.push(self.sanction(rival_id, action, receipt.effect)?);
            }
            Ok((self.dispatcher.commit(batch)?, receipt))
        })?;
        self.project(&committed);

        info!(
            agency_id = %agency_id,
            buyer_id = %buyer_id,
            action = ?action,
            target = ?target,
            roll,
            success = receipt.success,
            "black-market action resolved"
        );
        Ok(receipt)
    }

    fn sanction(&self, rival_id: AgencyId, action: BlackOpKind, effect: Effect) -> Result<StreamAppend, DispatchError> {
        let command = AgencyCommand::PostAdjustment(PostAdjustment {
            agency_id: rival_id,
            kind: AdjustmentKind::Sanction,
            label: format!("Targeted by a rival: {}", studio_agency::black_market::spec(action).name),
            budget_delta: effect.rival_budget,
            ve_delta: effect.rival_ve,
            occurred_at: Utc::now(),
        });
        self.dispatcher
            .decide(rival_id, &command, Agency::empty)?
            .into_append(AGENCY_STREAM_TYPE)
    }

    fn roll(&self) -> Result<u8, ServiceError> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| ServiceError::Unavailable("rng lock poisoned".to_string()))?;
        Ok(rng.gen_range(0..100u8))
    }

    // -----------------------------------------------------------------------
    // Ledger and deliverables
    // -----------------------------------------------------------------------

    pub fn post_adjustment(
        &self,
        agency_id: AgencyId,
        kind: AdjustmentKind,
        label: &str,
        budget_delta: i64,
        ve_delta: i64,
    ) -> Result<AgencySummary, ServiceError> {
        self.execute(
            agency_id,
            AgencyCommand::PostAdjustment(PostAdjustment {
                agency_id,
                kind,
                label: label.to_string(),
                budget_delta,
                ve_delta,
                occurred_at: Utc::now(),
            }),
        )?;
        info!(agency_id = %agency_id, kind = ?kind, budget_delta, ve_delta, "adjustment posted");
        self.summary(agency_id)
    }

    pub fn submit_deliverable(
        &self,
        agency_id: AgencyId,
        week: u32,
        url: &str,
        submitted_by: StudentId,
    ) -> Result<AgencySummary, ServiceError> {
        self.execute(
            agency_id,
            AgencyCommand::SubmitDeliverable(SubmitDeliverable {
                agency_id,
                week,
                url: url.to_string(),
                submitted_by,
                occurred_at: Utc::now(),
            }),
        )?;
        self.summary(agency_id)
    }

    pub fn grade_deliverable(
        &self,
        agency_id: AgencyId,
        week: u32,
        grade: Grade,
    ) -> Result<AgencySummary, ServiceError> {
        self.execute(
            agency_id,
            AgencyCommand::GradeDeliverable(GradeDeliverable {
                agency_id,
                week,
                grade,
                rules: self.config.rules.clone(),
                occurred_at: Utc::now(),
            }),
        )?;
        info!(agency_id = %agency_id, week, grade = ?grade, "deliverable graded");
        self.summary(agency_id)
    }

    pub fn transfer_to_agency(
        &self,
        agency_id: AgencyId,
        student_id: StudentId,
        amount: i64,
    ) -> Result<AgencySummary, ServiceError> {
        self.execute(
            agency_id,
            AgencyCommand::TransferToAgency(TransferToAgency {
                agency_id,
                student_id,
                amount,
                occurred_at: Utc::now(),
            }),
        )?;
        self.summary(agency_id)
    }

    // -----------------------------------------------------------------------
    // Weekly settlement
    // -----------------------------------------------------------------------

    /// Settle every agency for `week` in one atomic batch, then record the week
    /// as `last_finance_run`.
    ///
    /// Each agency stream records the weeks it has settled, so a week is billed
    /// at most once per agency whatever the config says: agencies already
    /// settled are skipped, and when all of them are the call fails with
    /// [`ServiceError::AlreadySettled`] after recording the week.
    pub fn run_weekly_settlement(&self, week: &WeekKey) -> Result<SettlementReport, ServiceError> {
        let occurred_at = Utc::now();
        let (committed, skipped) = retry_on_conflict(self.config.max_dispatch_attempts, || {
            let ids = self
                .dispatcher
                .store()
                .list_streams(AGENCY_STREAM_TYPE)
                .map_err(DispatchError::from)?;

            let mut batch = Vec::with_capacity(ids.len());
            let mut skipped = 0usize;
            for agency_id in ids {
                let (agency, version) = self.dispatcher.load(agency_id, Agency::empty)?;
                if agency.has_settled(week) {
                    skipped += 1;
                    continue;
                }
                let command = AgencyCommand::SettleWeek(SettleWeek {
                    agency_id,
                    week: week.clone(),
                    rules: self.config.rules.clone(),
                    occurred_at,
                });
                let decided = Decided::against(agency_id, agency, version, &command)?;
                batch.push(decided.into_append(AGENCY_STREAM_TYPE)?);
            }
            Ok((self.dispatcher.commit(batch)?, skipped))
        })?;

        if committed.is_empty() && skipped > 0 {
            info!(week = %week, agencies = skipped, "week already settled");
            self.record_finance_run(week);
            return Err(ServiceError::AlreadySettled(week.clone()));
        }
        self.project(&committed);

        let mut settled: Vec<AgencyId> = committed.iter().map(|e| e.stream_id).collect();
        settled.dedup();

        let mut agencies = Vec::with_capacity(settled.len());
        for agency_id in settled {
            let breached = committed.iter().any(|e| {
                e.stream_id == agency_id && e.event_type == "agency.ledger.bankruptcy_threshold_breached"
            });
            let Some(summary) = self.directory.get(agency_id) else {
                warn!(agency_id = %agency_id, week = %week, "settled agency missing from the directory");
                continue;
            };
            if breached {
                warn!(
                    agency_id = %agency_id,
                    name = %summary.name,
                    budget = summary.budget,
                    threshold = self.config.rules.bankruptcy_threshold,
                    week = %week,
                    "agency below bankruptcy threshold"
                );
            }
            agencies.push(SettledAgency {
                agency_id,
                name: summary.name,
                budget: summary.budget,
                breached,
            });
        }

        self.record_finance_run(week);
        info!(
            week = %week,
            agencies = agencies.len(),
            skipped,
            events = committed.len(),
            "weekly settlement committed"
        );

        Ok(SettlementReport {
            week: week.clone(),
            agencies,
            events_committed: committed.len(),
        })
    }

    /// The batch is already durable here; a failed patch is repaired by the
    /// next run, which finds every agency settled.
    fn record_finance_run(&self, week: &WeekKey) {
        if let Err(err) = self.patch_game_config(&GameConfigPatch::finance_run(week.clone())) {
            warn!(week = %week, error = %err, "could not record last_finance_run");
        }
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    fn execute(&self, agency_id: AgencyId, command: AgencyCommand) -> Result<Vec<StoredEvent>, ServiceError> {
        let committed = self.dispatcher.dispatch_with_retry(
            agency_id,
            AGENCY_STREAM_TYPE,
            command,
            Agency::empty,
            self.config.max_dispatch_attempts,
        )?;
        self.project(&committed);
        Ok(committed)
    }

    /// Feed committed events into the directory; a stream that fails to fold
    /// is re-read from the store.
    fn project(&self, committed: &[StoredEvent]) {
        let mut broken: Vec<AgencyId> = Vec::new();
        for stored in committed {
            if broken.contains(&stored.stream_id) {
                continue;
            }
            if let Err(err) = self.directory.apply_envelope(&stored.to_envelope()) {
                warn!(agency_id = %stored.stream_id, error = %err, "directory fold failed, resyncing stream");
                broken.push(stored.stream_id);
            }
        }
        for agency_id in broken {
            if let Err(err) = self.sync_agency(agency_id) {
                warn!(agency_id = %agency_id, error = %err, "directory resync failed, keeping last known state");
            }
        }
    }

    fn summary(&self, agency_id: AgencyId) -> Result<AgencySummary, ServiceError> {
        self.agency(agency_id)?
            .ok_or_else(|| ServiceError::Domain(DomainError::not_found()))
    }
}
