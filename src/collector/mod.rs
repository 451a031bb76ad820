//! Source collectors.
//!
//! A [`Collector`] is bound to one source for its lifetime and exposes the
//! same four operations for both variants:
//!
//! - `snapshot`: up to [`SNAPSHOT_LINES`] most recent events, oldest first
//! - `start`: spawn the single follow task feeding a bounded channel
//! - `stop`: idempotent; every blocking point in the follow task observes it
//! - `source_name`: file path or canonical container name
//!
//! Follow tasks never return errors. Transient failures become in-band
//! notice events and are retried with [`Backoff`].

pub mod container;
pub mod demux;
pub mod file;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::event::LogEvent;
use crate::runtime::RuntimeError;

pub use container::ContainerCollector;
pub use file::FileCollector;

/// Number of events returned by a snapshot.
pub const SNAPSHOT_LINES: usize = 100;

/// Capacity of the ingestion channel between a collector and the server.
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Default first reconnect delay.
const DEFAULT_RECONNECT_INITIAL: Duration = Duration::from_secs(2);

/// Default reconnect delay ceiling.
const DEFAULT_RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Default file poll cadence while caught up.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors surfaced by collector construction and snapshots.
#[derive(Debug)]
pub enum CollectorError {
    /// The file could not be opened or read
    SourceUnreadable {
        path: String,
        source: std::io::Error,
    },

    /// The container runtime does not know the identifier
    ContainerNotFound {
        identifier: String,
        source: RuntimeError,
    },

    /// The container runtime failed for another reason
    Runtime(RuntimeError),

    /// `start` was called on a collector that is already following
    AlreadyStarted,
}

impl std::fmt::Display for CollectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectorError::SourceUnreadable { path, source } => {
                write!(f, "source unreadable: {}: {}", path, source)
            }
            CollectorError::ContainerNotFound { identifier, source } => write!(
                f,
                "container not found (tried: {}). Make sure the container name or ID is correct: {}",
                identifier, source
            ),
            CollectorError::Runtime(e) => write!(f, "container runtime error: {}", e),
            CollectorError::AlreadyStarted => write!(f, "collector is already streaming"),
        }
    }
}

impl std::error::Error for CollectorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CollectorError::SourceUnreadable { source, .. } => Some(source),
            CollectorError::ContainerNotFound { source, .. } => Some(source),
            CollectorError::Runtime(e) => Some(e),
            CollectorError::AlreadyStarted => None,
        }
    }
}

/// Timing knobs shared by both collector variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorTiming {
    /// Delay between file polls when caught up
    pub poll_interval: Duration,

    /// First reconnect delay, also the value backoff resets to
    pub reconnect_initial: Duration,

    /// Reconnect delay ceiling
    pub reconnect_max: Duration,
}

impl Default for CollectorTiming {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            reconnect_initial: DEFAULT_RECONNECT_INITIAL,
            reconnect_max: DEFAULT_RECONNECT_MAX,
        }
    }
}

/// Doubling reconnect delay with a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn from_timing(timing: &CollectorTiming) -> Self {
        Self::new(timing.reconnect_initial, timing.reconnect_max)
    }

    /// Delay to wait now.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Double the delay, capped at the ceiling.
    pub fn advance(&mut self) {
        self.current = self.current.saturating_mul(2).min(self.max);
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Why a push into the ingestion channel did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendOutcome {
    Delivered,
    Stopped,
    ReceiverGone,
}

/// Push an event, giving up as soon as `stop` fires.
///
/// A full channel must never keep a stopped collector alive.
pub(crate) async fn send_event(
    tx: &mpsc::Sender<LogEvent>,
    event: LogEvent,
    stop: &CancellationToken,
) -> SendOutcome {
    tokio::select! {
        biased;
        _ = stop.cancelled() => SendOutcome::Stopped,
        sent = tx.send(event) => match sent {
            Ok(()) => SendOutcome::Delivered,
            Err(_) => SendOutcome::ReceiverGone,
        },
    }
}

/// Sleep for `delay` unless `stop` fires first. Returns `false` when stopped.
pub(crate) async fn sleep_or_stop(delay: Duration, stop: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = stop.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Stop token plus a guard allowing a single follow task per collector.
#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
    stop: CancellationToken,
    started: AtomicBool,
}

impl Lifecycle {
    pub(crate) fn claim_start(&self) -> Result<CancellationToken, CollectorError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CollectorError::AlreadyStarted);
        }
        Ok(self.stop.clone())
    }

    pub(crate) fn stop(&self) {
        self.stop.cancel();
    }
}

/// A log source: either a followed file or a container's log stream.
pub enum Collector {
    File(FileCollector),
    Container(ContainerCollector),
}

impl Collector {
    /// Most recent events, oldest first, at most [`SNAPSHOT_LINES`].
    pub async fn snapshot(&self) -> Result<Vec<LogEvent>, CollectorError> {
        match self {
            Collector::File(c) => c.snapshot().await,
            Collector::Container(c) => c.snapshot().await,
        }
    }

    /// Spawn the follow task. Only the first call succeeds.
    pub fn start(&self, tx: mpsc::Sender<LogEvent>) -> Result<JoinHandle<()>, CollectorError> {
        match self {
            Collector::File(c) => c.start(tx),
            Collector::Container(c) => c.start(tx),
        }
    }

    /// Signal the follow task to finish. Safe to call repeatedly and from any task.
    pub fn stop(&self) {
        match self {
            Collector::File(c) => c.stop(),
            Collector::Container(c) => c.stop(),
        }
    }

    pub fn source_name(&self) -> &str {
        match self {
            Collector::File(c) => c.source_name(),
            Collector::Container(c) => c.source_name(),
        }
    }
}

impl From<FileCollector> for Collector {
    fn from(c: FileCollector) -> Self {
        Collector::File(c)
    }
}

impl From<ContainerCollector> for Collector {
    fn from(c: ContainerCollector) -> Self {
        Collector::Container(c)
    }
}
