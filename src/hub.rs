//! Reader registry and fan-out.
//!
//! The hub owns the cached snapshot and the set of registered readers. Each
//! reader is represented by a bounded outbound queue that its connection
//! task drains onto the socket, so fan-out never touches the network while
//! holding the registry lock.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event::{LogEvent, PushMessage};

/// Default deadline for a single push to a reader.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Messages buffered per reader before pushes start waiting.
const READER_QUEUE_CAPACITY: usize = 64;

#[derive(Clone)]
struct ReaderHandle {
    tx: mpsc::Sender<Utf8Bytes>,
    closed: CancellationToken,
}

/// A freshly registered reader.
pub struct Registration {
    pub id: Uuid,

    /// Serialized push messages, starting with the snapshot
    pub outbound: mpsc::Receiver<Utf8Bytes>,

    /// Fired when the hub evicts or force-closes this reader
    pub closed: CancellationToken,
}

/// Shared state between the fan-out task and reader connections.
pub struct Hub {
    readers: RwLock<HashMap<Uuid, ReaderHandle>>,
    snapshot: RwLock<Arc<Vec<LogEvent>>>,
    write_timeout: Duration,
    /// Parent of every reader's close token; cancelled by `close_all`
    closing: CancellationToken,
}

impl Hub {
    pub fn new(write_timeout: Duration) -> Self {
        Self {
            readers: RwLock::new(HashMap::new()),
            snapshot: RwLock::new(Arc::new(Vec::new())),
            write_timeout,
            closing: CancellationToken::new(),
        }
    }

    pub fn replace_snapshot(&self, events: Vec<LogEvent>) {
        let events = Arc::new(events);
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = events;
    }

    pub fn snapshot(&self) -> Arc<Vec<LogEvent>> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Add a reader. The snapshot message is queued before the reader becomes
    /// visible to fan-out, so it is always the first message delivered.
    ///
    /// After [`Hub::close_all`] the reader is not added and its `closed`
    /// token is already cancelled.
    pub fn register(&self) -> Registration {
        let id = Uuid::new_v4();
        let (tx, outbound) = mpsc::channel(READER_QUEUE_CAPACITY);
        let closed = self.closing.child_token();

        let snapshot = self.snapshot();
        if let Some(text) = encode(&PushMessage::Snapshot { events: &snapshot }) {
            // Fresh queue with spare capacity.
            let _ = tx.try_send(text);
        }

        let handle = ReaderHandle {
            tx,
            closed: closed.clone(),
        };
        let count = {
            let mut readers = self.readers.write().unwrap_or_else(PoisonError::into_inner);
            if self.closing.is_cancelled() {
                None
            } else {
                readers.insert(id, handle);
                Some(readers.len())
            }
        };
        match count {
            Some(count) => info!(reader = %id, readers = count, "Reader registered"),
            None => debug!(reader = %id, "Hub closed, reader refused"),
        }

        Registration {
            id,
            outbound,
            closed,
        }
    }

    pub fn deregister(&self, id: Uuid) {
        let removed = self
            .readers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(handle) = removed {
            handle.closed.cancel();
            info!(reader = %id, readers = self.reader_count(), "Reader deregistered");
        }
    }

    pub fn reader_count(&self) -> usize {
        self.readers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Push one event to every registered reader, evicting any reader whose
    /// queue does not accept it within the write deadline.
    pub async fn broadcast(&self, event: &LogEvent) {
        let Some(text) = encode(&PushMessage::Event { event }) else {
            return;
        };

        let targets: Vec<(Uuid, ReaderHandle)> = self
            .readers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect();

        for (id, handle) in targets {
            if let Err(e) = handle.tx.send_timeout(text.clone(), self.write_timeout).await {
                warn!(reader = %id, error = %e, "Push failed, dropping reader");
                self.deregister(id);
            }
        }
    }

    /// Drain the ingestion channel until every producer has gone away.
    pub async fn run_fan_out(self: Arc<Self>, mut rx: mpsc::Receiver<LogEvent>) {
        while let Some(event) = rx.recv().await {
            self.broadcast(&event).await;
        }
        debug!("Fan-out finished");
    }

    /// Force-close every reader and refuse later registrations.
    pub fn close_all(&self) {
        let drained: Vec<(Uuid, ReaderHandle)> = {
            let mut readers = self.readers.write().unwrap_or_else(PoisonError::into_inner);
            self.closing.cancel();
            readers.drain().collect()
        };

        for (_, handle) in &drained {
            handle.closed.cancel();
        }
        info!(readers = drained.len(), "Closed all readers");
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(DEFAULT_WRITE_TIMEOUT)
    }
}

fn encode(message: &PushMessage<'_>) -> Option<Utf8Bytes> {
    match serde_json::to_string(message) {
        Ok(text) => Some(text.into()),
        Err(e) => {
            warn!(error = %e, "Failed to encode push message");
            None
        }
    }
}
