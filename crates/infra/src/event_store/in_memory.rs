use std::collections::HashMap;
use std::sync::RwLock;

use studio_core::{AgencyId, ExpectedVersion};

use super::r#trait::{
    validate_batch, EventStore, EventStoreError, StoredEvent, StreamAppend, UncommittedEvent,
};

/// In-memory append-only event store.
///
/// Intended for tests/dev. A single write lock covers a whole batch, which is
/// what makes `append_batch` atomic here.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<AgencyId, Vec<StoredEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: &[StoredEvent]) -> u64 {
        stream.last().map(|e| e.sequence_number).unwrap_or(0)
    }

    /// Check one batch entry against the current state without writing.
    fn check_entry(
        streams: &HashMap<AgencyId, Vec<StoredEvent>>,
        entry: &StreamAppend,
    ) -> Result<(), EventStoreError> {
        let stream = streams.get(&entry.stream_id).map(Vec::as_slice).unwrap_or(&[]);
        let current = Self::current_version(stream);

        if !entry.expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "stream {}: expected {:?}, found {current}",
                entry.stream_id, entry.expected_version
            )));
        }

        if let (Some(existing), Some(incoming)) = (stream.first(), entry.events.first()) {
            if existing.stream_type != incoming.stream_type {
                return Err(EventStoreError::StreamTypeMismatch(format!(
                    "stream type is '{}', attempted append with '{}'",
                    existing.stream_type, incoming.stream_type
                )));
            }
        }
        Ok(())
    }

    fn write_entry(stream: &mut Vec<StoredEvent>, events: Vec<UncommittedEvent>) -> Vec<StoredEvent> {
        let mut next = Self::current_version(stream) + 1;
        let mut committed = Vec::with_capacity(events.len());
        for e in events {
            let stored = StoredEvent {
                event_id: e.event_id,
                stream_id: e.stream_id,
                stream_type: e.stream_type,
                sequence_number: next,
                event_type: e.event_type,
                event_version: e.event_version,
                occurred_at: e.occurred_at,
                payload: e.payload,
            };
            next += 1;
            stream.push(stored.clone());
            committed.push(stored);
        }
        committed
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let Some(first) = events.first() else {
            return Ok(vec![]);
        };
        let stream_id = first.stream_id;
        self.append_batch(vec![StreamAppend {
            stream_id,
            expected_version,
            events,
        }])
    }

    fn append_batch(&self, batch: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError> {
        validate_batch(&batch)?;

        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;

        // Every expectation is checked before the first write.
        for entry in &batch {
            Self::check_entry(&streams, entry)?;
        }

        let mut committed = Vec::new();
        for entry in batch {
            if entry.events.is_empty() {
                continue;
            }
            let stream = streams.entry(entry.stream_id).or_default();
            committed.extend(Self::write_entry(stream, entry.events));
        }
        Ok(committed)
    }

    fn load_stream(&self, stream_id: AgencyId) -> Result<Vec<StoredEvent>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;

        Ok(streams.get(&stream_id).cloned().unwrap_or_default())
    }

    fn list_streams(&self, stream_type: &str) -> Result<Vec<AgencyId>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;

        let mut ids: Vec<AgencyId> = streams
            .iter()
            .filter(|(_, events)| events.first().is_some_and(|e| e.stream_type == stream_type))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}
