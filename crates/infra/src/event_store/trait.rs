use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use studio_core::{AgencyId, ExpectedVersion};
use studio_events::EventEnvelope;

/// An event ready to be appended to a stream (not yet assigned a sequence number).
///
/// Lifecycle: a domain event decided by `Aggregate::handle` is wrapped here with
/// its stream metadata, persisted as a [`StoredEvent`], then published as an
/// [`EventEnvelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub stream_id: AgencyId,
    pub stream_type: String,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

/// A persisted event with its position in the stream.
///
/// Sequence numbers start at 1, increase by one per event and are scoped to
/// the stream. They double as the aggregate version after the event applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub stream_id: AgencyId,
    pub stream_type: String,

    pub sequence_number: u64,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    pub fn stream_version(&self) -> u64 {
        self.sequence_number
    }

    pub fn to_envelope(&self) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            self.event_id,
            self.stream_id,
            self.stream_type.clone(),
            self.sequence_number,
            self.event_type.clone(),
            self.occurred_at,
            self.payload.clone(),
        )
    }

    /// Decode the payload back into the typed domain event.
    pub fn decode<E: DeserializeOwned>(&self) -> Result<E, EventStoreError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            EventStoreError::Corrupt(format!(
                "cannot decode {} #{}: {e}",
                self.event_type, self.sequence_number
            ))
        })
    }
}

/// Events for one stream inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamAppend {
    pub stream_id: AgencyId,
    pub expected_version: ExpectedVersion,
    pub events: Vec<UncommittedEvent>,
}

/// Infrastructure errors, as opposed to domain rejections.
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("stream type mismatch: {0}")]
    StreamTypeMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("corrupt stream data: {0}")]
    Corrupt(String),

    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("event publication failed: {0}")]
    Publish(String),
}

/// Append-only store of per-agency event streams.
///
/// Implementations must:
/// - check `ExpectedVersion` against the current stream revision before writing
/// - assign gapless sequence numbers starting at `current + 1`
/// - keep one stream type per stream
/// - make `append_batch` all-or-nothing across every stream it touches
pub trait EventStore: Send + Sync {
    /// Append events to a single stream.
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Append to several streams atomically. Either every stream's expectation
    /// holds and all events are written, or nothing is.
    fn append_batch(&self, batch: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Full stream in sequence order; empty if the stream does not exist.
    fn load_stream(&self, stream_id: AgencyId) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Ids of every stream of the given type.
    fn list_streams(&self, stream_type: &str) -> Result<Vec<AgencyId>, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(events, expected_version)
    }

    fn append_batch(&self, batch: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append_batch(batch)
    }

    fn load_stream(&self, stream_id: AgencyId) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream(stream_id)
    }

    fn list_streams(&self, stream_type: &str) -> Result<Vec<AgencyId>, EventStoreError> {
        (**self).list_streams(stream_type)
    }
}

impl UncommittedEvent {
    /// Wrap a typed domain event, capturing the metadata needed to decode it later.
    pub fn from_typed<E>(
        stream_id: AgencyId,
        stream_type: impl Into<String>,
        event_id: Uuid,
        event: &E,
    ) -> Result<Self, EventStoreError>
    where
        E: studio_events::Event + Serialize,
    {
        let payload = serde_json::to_value(event)
            .map_err(|e| EventStoreError::InvalidAppend(format!("payload serialization failed: {e}")))?;

        Ok(Self {
            event_id,
            stream_id,
            stream_type: stream_type.into(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
        })
    }
}

/// Shared batch validation: one stream per entry, one entry per stream, and
/// each event tagged with its entry's stream.
pub(crate) fn validate_batch(batch: &[StreamAppend]) -> Result<(), EventStoreError> {
    let mut seen = std::collections::HashSet::new();
    for entry in batch {
        if !seen.insert(entry.stream_id) {
            return Err(EventStoreError::InvalidAppend(format!(
                "stream {} appears twice in one batch",
                entry.stream_id
            )));
        }
        let Some(first) = entry.events.first() else {
            continue;
        };
        for (idx, e) in entry.events.iter().enumerate() {
            if e.stream_id != entry.stream_id {
                return Err(EventStoreError::InvalidAppend(format!(
                    "event {idx} targets stream {} inside the batch entry for {}",
                    e.stream_id, entry.stream_id
                )));
            }
            if e.stream_type != first.stream_type {
                return Err(EventStoreError::StreamTypeMismatch(format!(
                    "batch entry for {} mixes stream types (index {idx})",
                    entry.stream_id
                )));
            }
        }
    }
    Ok(())
}
