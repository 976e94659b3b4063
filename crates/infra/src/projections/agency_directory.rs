use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use studio_agency::{Agency, AgencyEvent, WeekKey, WeekStatus, AGENCY_STREAM_TYPE};
use studio_core::{Aggregate, AggregateRoot, AgencyId, StudentId};
use studio_events::EventEnvelope;

use crate::event_store::{EventStore, StoredEvent};
use crate::read_model::ReadModelStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberSummary {
    pub student_id: StudentId,
    pub name: String,
    pub individual_score: i64,
    pub wallet: i64,
}

/// Dashboard row for one agency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgencySummary {
    pub agency_id: AgencyId,
    pub name: String,
    pub budget: i64,
    pub ve: i64,
    pub members: Vec<MemberSummary>,
    pub pending_requests: usize,
    pub ledger_entries: usize,
    pub graded_weeks: usize,
    pub last_breach: Option<WeekKey>,
    /// Sequence number of the last event folded in.
    pub version: u64,
}

impl AgencySummary {
    pub fn from_agency(agency: &Agency) -> Self {
        Self {
            agency_id: agency.id_typed(),
            name: agency.name().to_string(),
            budget: agency.budget(),
            ve: agency.ve().get(),
            members: agency
                .members()
                .iter()
                .map(|m| MemberSummary {
                    student_id: m.id,
                    name: m.name.clone(),
                    individual_score: m.individual_score.get(),
                    wallet: m.wallet,
                })
                .collect(),
            pending_requests: agency.pending_requests().count(),
            ledger_entries: agency.event_log().len(),
            graded_weeks: agency
                .progress()
                .values()
                .filter(|m| m.status == WeekStatus::Graded)
                .count(),
            last_breach: agency.last_breach().cloned(),
            version: agency.version(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AgencyDirectoryError {
    #[error("failed to deserialize agency event: {0}")]
    Deserialize(String),
    #[error("out-of-order event on stream {stream_id} (last={last}, found={found})")]
    NonMonotonicSequence {
        stream_id: AgencyId,
        last: u64,
        found: u64,
    },
    #[error("failed to load stream: {0}")]
    Load(String),
}

/// Agency read model fed from the bus.
///
/// Each stream keeps a rehydrated `Agency`; its version is the projection
/// cursor, so redelivered envelopes (seq <= version) are no-ops. A gap leaves
/// the last good summary in place and reports the error.
#[derive(Debug)]
pub struct AgencyDirectory<S>
where
    S: ReadModelStore<AgencyId, AgencySummary>,
{
    store: S,
    states: Mutex<HashMap<AgencyId, Agency>>,
}

impl<S> AgencyDirectory<S>
where
    S: ReadModelStore<AgencyId, AgencySummary>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, agency_id: AgencyId) -> Option<AgencySummary> {
        self.store.get(&agency_id)
    }

    /// All agencies, ordered by name.
    pub fn list(&self) -> Vec<AgencySummary> {
        let mut rows = self.store.list();
        rows.sort_by(|a, b| a.name.cmp(&b.name).then(a.agency_id.cmp(&b.agency_id)));
        rows
    }

    pub fn cursor(&self, agency_id: AgencyId) -> u64 {
        self.states
            .lock()
            .ok()
            .and_then(|s| s.get(&agency_id).map(|a| a.version()))
            .unwrap_or(0)
    }

    /// Fold one envelope in. Returns `false` for envelopes that were skipped
    /// (other stream types, redeliveries).
    pub fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<bool, AgencyDirectoryError> {
        if envelope.stream_type() != AGENCY_STREAM_TYPE {
            return Ok(false);
        }

        let stream_id = envelope.stream_id();
        let seq = envelope.sequence_number();

        let mut states = self
            .states
            .lock()
            .map_err(|_| AgencyDirectoryError::Load("directory lock poisoned".to_string()))?;
        let last = states.get(&stream_id).map(|a| a.version()).unwrap_or(0);

        if seq == 0 || seq > last + 1 {
            return Err(AgencyDirectoryError::NonMonotonicSequence {
                stream_id,
                last,
                found: seq,
            });
        }
        if seq <= last {
            return Ok(false);
        }

        let ev: AgencyEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| AgencyDirectoryError::Deserialize(e.to_string()))?;

        let agency = states
            .entry(stream_id)
            .or_insert_with(|| Agency::empty(stream_id));
        agency.apply(&ev);
        self.store.upsert(stream_id, AgencySummary::from_agency(agency));
        Ok(true)
    }

    /// Replace one stream's state with a full history (self-heal after a gap).
    pub fn refresh_stream(
        &self,
        stream_id: AgencyId,
        history: &[StoredEvent],
    ) -> Result<Option<AgencySummary>, AgencyDirectoryError> {
        let mut agency = Agency::empty(stream_id);
        for stored in history {
            let ev: AgencyEvent = stored
                .decode()
                .map_err(|e| AgencyDirectoryError::Deserialize(e.to_string()))?;
            agency.apply(&ev);
        }
        if !agency.is_created() {
            return Ok(None);
        }

        let summary = AgencySummary::from_agency(&agency);
        let mut states = self
            .states
            .lock()
            .map_err(|_| AgencyDirectoryError::Load("directory lock poisoned".to_string()))?;
        states.insert(stream_id, agency);
        self.store.upsert(stream_id, summary.clone());
        Ok(Some(summary))
    }

    /// Drop everything and replay the given envelopes.
    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), AgencyDirectoryError> {
        if let Ok(mut states) = self.states.lock() {
            states.clear();
        }
        self.store.clear();

        for env in envelopes {
            self.apply_envelope(&env)?;
        }
        Ok(())
    }

    /// Drop everything and replay every agency stream from the event store.
    pub fn rebuild_from_store<E: EventStore>(&self, store: &E) -> Result<usize, AgencyDirectoryError> {
        let ids = store
            .list_streams(AGENCY_STREAM_TYPE)
            .map_err(|e| AgencyDirectoryError::Load(e.to_string()))?;

        let mut envelopes = Vec::new();
        for id in &ids {
            let history = store
                .load_stream(*id)
                .map_err(|e| AgencyDirectoryError::Load(e.to_string()))?;
            envelopes.extend(history.iter().map(StoredEvent::to_envelope));
        }
        self.rebuild_from_scratch(envelopes)?;
        Ok(ids.len())
    }
}
