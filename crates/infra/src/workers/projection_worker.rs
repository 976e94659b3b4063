use std::io;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use studio_events::{EventBus, EventEnvelope, Subscription};

use super::WorkerHandle;

const POLL: Duration = Duration::from_millis(250);

/// Generic projection worker loop.
///
/// - Subscribes to the envelope bus
/// - Applies an idempotent handler for each message
/// - Supports graceful shutdown
/// - Optional stream-type filtering
#[derive(Debug)]
pub struct ProjectionWorker;

impl ProjectionWorker {
    /// Spawn a worker thread that processes events from the bus subscription.
    ///
    /// - `stream_type`: when provided, envelopes of other stream types are ignored
    /// - `handler`: must be idempotent (at-least-once delivery safe)
    pub fn spawn<B, H, E>(
        name: &'static str,
        bus: &B,
        stream_type: Option<&'static str>,
        mut handler: H,
    ) -> io::Result<WorkerHandle>
    where
        B: EventBus<EventEnvelope<JsonValue>>,
        H: FnMut(EventEnvelope<JsonValue>) -> Result<(), E> + Send + 'static,
        E: core::fmt::Debug + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sub = bus.subscribe();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(name, sub, shutdown_rx, stream_type, &mut handler))?;

        Ok(WorkerHandle::new(name, shutdown_tx, join))
    }
}

fn worker_loop<H, E>(
    name: &'static str,
    sub: Subscription<EventEnvelope<JsonValue>>,
    shutdown_rx: mpsc::Receiver<()>,
    stream_type: Option<&'static str>,
    handler: &mut H,
) where
    H: FnMut(EventEnvelope<JsonValue>) -> Result<(), E>,
    E: core::fmt::Debug,
{
    loop {
        if shutdown_rx.try_recv().is_ok() {
            debug!(worker = name, "projection worker stopping");
            break;
        }

        match sub.recv_timeout(POLL) {
            Ok(msg) => {
                if stream_type.is_some_and(|t| msg.stream_type() != t) {
                    continue;
                }

                let seq = msg.sequence_number();
                if let Err(err) = handler(msg) {
                    // Read side only; the store stays authoritative and a rebuild recovers.
                    warn!(worker = name, sequence_number = seq, error = ?err, "projection worker handler failed");
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}
