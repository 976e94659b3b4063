//! Command execution pipeline.
//!
//! ```text
//! Command
//!   ↓
//! 1. Load the stream from the store
//!   ↓
//! 2. Rehydrate the aggregate (apply history in sequence order)
//!   ↓
//! 3. Handle the command (pure decision, produces events)
//!   ↓
//! 4. Append with ExpectedVersion::Exact(loaded version)
//!   ↓
//! 5. Publish committed events to the bus
//! ```
//!
//! Steps 1-3 are exposed separately as [`CommandDispatcher::decide`] so several
//! decisions on different streams can be committed in one atomic batch with
//! [`CommandDispatcher::commit`].
//!
//! This module contains no IO itself; it composes the store and bus traits.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use studio_core::{Aggregate, AgencyId, DomainError, ExpectedVersion};
use studio_events::{EventBus, EventEnvelope};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, StreamAppend, UncommittedEvent};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The stream moved between load and append.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),
    /// Rejected by the aggregate before any write.
    #[error(transparent)]
    Domain(#[from] DomainError),
    /// History could not be decoded into the aggregate's event type.
    #[error("failed to decode stream history: {0}")]
    Deserialize(String),
    #[error("event store failure: {0}")]
    Store(EventStoreError),
    /// Publication failed after a successful append (at-least-once; the events are durable).
    #[error("publication failed after commit: {0}")]
    Publish(String),
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg),
            EventStoreError::Corrupt(msg) => DispatchError::Deserialize(msg),
            other => DispatchError::Store(other),
        }
    }
}

impl DispatchError {
    pub fn is_concurrency(&self) -> bool {
        matches!(self, DispatchError::Concurrency(_))
    }
}

/// Events decided against one stream, not yet written.
#[derive(Debug, Clone)]
pub struct Decided<A: Aggregate> {
    pub stream_id: AgencyId,
    pub expected_version: ExpectedVersion,
    /// State the command was decided against.
    pub aggregate: A,
    pub events: Vec<A::Event>,
}

impl<A> Decided<A>
where
    A: Aggregate<Error = DomainError>,
{
    /// Decide `command` against a state already loaded at `version`.
    pub fn against(
        stream_id: AgencyId,
        aggregate: A,
        version: u64,
        command: &A::Command,
    ) -> Result<Self, DispatchError> {
        let events = aggregate.handle(command)?;
        Ok(Self {
            stream_id,
            expected_version: ExpectedVersion::Exact(version),
            aggregate,
            events,
        })
    }
}

impl<A> Decided<A>
where
    A: Aggregate,
    A::Event: studio_events::Event + Serialize,
{
    pub fn into_append(self, stream_type: &str) -> Result<StreamAppend, DispatchError> {
        let events = self
            .events
            .iter()
            .map(|ev| UncommittedEvent::from_typed(self.stream_id, stream_type, Uuid::now_v7(), ev))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(StreamAppend {
            stream_id: self.stream_id,
            expected_version: self.expected_version,
            events,
        })
    }
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// Events are persisted before publication: if the append fails nothing is
/// published; if publication fails the caller gets `Publish` with the events
/// already durable.
#[derive(Debug)]
pub struct CommandDispatcher<S, B> {
    store: S,
    bus: B,
}

impl<S, B> CommandDispatcher<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<S, B> CommandDispatcher<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Load and rehydrate an aggregate. Returns the aggregate and its stream revision.
    pub fn load<A>(
        &self,
        stream_id: AgencyId,
        make_aggregate: impl FnOnce(AgencyId) -> A,
    ) -> Result<(A, u64), DispatchError>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        let history = self.store.load_stream(stream_id)?;
        validate_loaded_stream(stream_id, &history)?;
        let version = stream_version(&history);

        let mut aggregate = make_aggregate(stream_id);
        apply_history(&mut aggregate, &history)?;
        Ok((aggregate, version))
    }

    /// Steps 1-3: load, rehydrate, decide. Nothing is written.
    pub fn decide<A>(
        &self,
        stream_id: AgencyId,
        command: &A::Command,
        make_aggregate: impl FnOnce(AgencyId) -> A,
    ) -> Result<Decided<A>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: DeserializeOwned,
    {
        let (aggregate, version) = self.load(stream_id, make_aggregate)?;
        Decided::against(stream_id, aggregate, version, command)
    }

    /// Steps 4-5 for any number of streams, atomically.
    pub fn commit(&self, batch: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, DispatchError> {
        if batch.iter().all(|entry| entry.events.is_empty()) {
            return Ok(vec![]);
        }
        let committed = self.store.append_batch(batch)?;
        self.publish(&committed)?;
        Ok(committed)
    }

    pub fn publish(&self, committed: &[StoredEvent]) -> Result<(), DispatchError> {
        for stored in committed {
            self.bus
                .publish(stored.to_envelope())
                .map_err(|e| DispatchError::Publish(format!("{e:?}")))?;
        }
        Ok(())
    }

    /// Full pipeline for a single stream.
    pub fn dispatch<A>(
        &self,
        stream_id: AgencyId,
        stream_type: &str,
        command: A::Command,
        make_aggregate: impl FnOnce(AgencyId) -> A,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: studio_events::Event + Serialize + DeserializeOwned,
    {
        let decided = self.decide(stream_id, &command, make_aggregate)?;
        if decided.events.is_empty() {
            return Ok(vec![]);
        }
        self.commit(vec![decided.into_append(stream_type)?])
    }

    /// `dispatch`, re-loading and re-deciding when another writer got there first.
    pub fn dispatch_with_retry<A>(
        &self,
        stream_id: AgencyId,
        stream_type: &str,
        command: A::Command,
        make_aggregate: impl Fn(AgencyId) -> A,
        max_attempts: u32,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: studio_events::Event + Serialize + DeserializeOwned,
    {
        retry_on_conflict(max_attempts, || {
            self.dispatch(stream_id, stream_type, command.clone(), &make_aggregate)
        })
    }
}

/// Run `op` until it succeeds, fails with something other than a concurrency
/// conflict, or `max_attempts` is spent. Each attempt must re-read its inputs.
pub fn retry_on_conflict<T>(
    max_attempts: u32,
    mut op: impl FnMut() -> Result<T, DispatchError>,
) -> Result<T, DispatchError> {
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Err(err) if err.is_concurrency() && attempt < max_attempts => {
                debug!(attempt, error = %err, "retrying after concurrency conflict");
                attempt += 1;
            }
            Err(err) if err.is_concurrency() => {
                warn!(attempts = attempt, error = %err, "giving up after repeated conflicts");
                return Err(err);
            }
            other => return other,
        }
    }
}

fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

fn validate_loaded_stream(stream_id: AgencyId, stream: &[StoredEvent]) -> Result<(), DispatchError> {
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.stream_id != stream_id {
            return Err(DispatchError::Deserialize(format!(
                "loaded stream contains foreign stream_id at index {idx}"
            )));
        }
        if e.sequence_number != last + 1 {
            return Err(DispatchError::Deserialize(format!(
                "gap or reordering in loaded stream (last={last}, found={})",
                e.sequence_number
            )));
        }
        last = e.sequence_number;
    }
    Ok(())
}

fn apply_history<A>(aggregate: &mut A, history: &[StoredEvent]) -> Result<(), DispatchError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    for stored in history {
        let ev: A::Event = stored.decode().map_err(DispatchError::from)?;
        aggregate.apply(&ev);
    }
    Ok(())
}
