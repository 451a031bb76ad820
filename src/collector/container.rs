//! Container log collector with a reconnect state machine.
//!
//! The follow task cycles through these states:
//!
//! ```text
//! probing ──missing──────────► wait(backoff) ──► probing
//!    │    ──not running──────► wait(backoff) ──► probing
//!    ▼
//! connecting ──failed────────► wait(backoff) ──► probing
//!    ▼
//! streaming ──eof / error────► wait(backoff) ──► probing
//! ```
//!
//! A notice is emitted when entering an outage, not on every retry, and a
//! single "resuming" notice follows once a stream is open again. Every
//! blocking call races the stop token.

use std::future::Future;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::demux::{demux_all, FrameDecoder};
use super::{
    send_event, sleep_or_stop, Backoff, CollectorError, CollectorTiming, Lifecycle, SendOutcome,
    SNAPSHOT_LINES,
};
use crate::event::{LogEvent, SourceKind, StreamKind};
use crate::runtime::{ContainerRuntime, LogByteStream, RuntimeError};

/// Collects the combined stdout/stderr log stream of one container.
pub struct ContainerCollector {
    runtime: Arc<dyn ContainerRuntime>,
    /// Canonical name without the leading `/`, so restarts are re-discovered
    name: String,
    timing: CollectorTiming,
    lifecycle: Lifecycle,
}

impl ContainerCollector {
    /// Resolve `identifier` (name, full ID or short ID) against the runtime.
    pub async fn connect(
        runtime: Arc<dyn ContainerRuntime>,
        identifier: &str,
    ) -> Result<Self, CollectorError> {
        Self::connect_with_timing(runtime, identifier, CollectorTiming::default()).await
    }

    pub async fn connect_with_timing(
        runtime: Arc<dyn ContainerRuntime>,
        identifier: &str,
        timing: CollectorTiming,
    ) -> Result<Self, CollectorError> {
        let info = runtime.inspect(identifier).await.map_err(|e| match e {
            RuntimeError::NotFound(_) => CollectorError::ContainerNotFound {
                identifier: identifier.to_string(),
                source: e,
            },
            other => CollectorError::Runtime(other),
        })?;

        let name = match info.name.trim_start_matches('/') {
            "" => identifier.to_string(),
            canonical => canonical.to_string(),
        };

        info!(
            identifier = identifier,
            name = %name,
            id = %info.id,
            running = info.running,
            "Resolved container"
        );

        Ok(Self {
            runtime,
            name,
            timing,
            lifecycle: Lifecycle::default(),
        })
    }

    /// Last [`SNAPSHOT_LINES`] lines from the runtime's tail query.
    pub async fn snapshot(&self) -> Result<Vec<LogEvent>, CollectorError> {
        let body = self
            .runtime
            .tail_logs(&self.name, SNAPSHOT_LINES)
            .await
            .map_err(CollectorError::Runtime)?;

        let mut events = demux_all(&body);
        if events.len() > SNAPSHOT_LINES {
            events.drain(..events.len() - SNAPSHOT_LINES);
        }
        debug!(name = %self.name, events = events.len(), "Container snapshot taken");
        Ok(events)
    }

    pub fn start(&self, tx: mpsc::Sender<LogEvent>) -> Result<JoinHandle<()>, CollectorError> {
        let stop = self.lifecycle.claim_start()?;
        let follower = ContainerFollower {
            runtime: self.runtime.clone(),
            name: self.name.clone(),
            timing: self.timing,
            stop,
            tx,
        };
        info!(name = %self.name, "Following container logs");
        Ok(tokio::spawn(follower.run()))
    }

    pub fn stop(&self) {
        self.lifecycle.stop();
    }

    pub fn source_name(&self) -> &str {
        &self.name
    }
}

/// Outage currently announced to viewers.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outage {
    Missing,
    NotRunning(String),
    ConnectionLost,
}

/// How a streaming session ended.
enum StreamEnd {
    Eof,
    Failed(RuntimeError),
    Stopped,
}

struct ContainerFollower {
    runtime: Arc<dyn ContainerRuntime>,
    name: String,
    timing: CollectorTiming,
    stop: CancellationToken,
    tx: mpsc::Sender<LogEvent>,
}

impl ContainerFollower {
    async fn run(self) {
        let mut backoff = Backoff::from_timing(&self.timing);
        let mut outage: Option<Outage> = None;

        'probe: loop {
            if self.stop.is_cancelled() {
                break;
            }

            let next_outage = match self.until_stopped(self.runtime.inspect(&self.name)).await {
                None => break,
                Some(Ok(info)) if info.running => None,
                Some(Ok(info)) => Some(Outage::NotRunning(info.status)),
                Some(Err(e)) => {
                    debug!(name = %self.name, error = %e, "Container inspect failed");
                    Some(Outage::Missing)
                }
            };

            if let Some(next) = next_outage {
                if !self.announce(&mut outage, next).await {
                    break;
                }
                if !sleep_or_stop(backoff.current(), &self.stop).await {
                    break;
                }
                backoff.advance();
                continue 'probe;
            }

            backoff.reset();
            let stream = match self.until_stopped(self.runtime.follow_logs(&self.name)).await {
                None => break,
                Some(Ok(stream)) => stream,
                Some(Err(e)) => {
                    warn!(name = %self.name, error = %e, "Failed to open log stream");
                    if !self.announce(&mut outage, Outage::ConnectionLost).await {
                        break;
                    }
                    if !sleep_or_stop(backoff.current(), &self.stop).await {
                        break;
                    }
                    backoff.advance();
                    continue 'probe;
                }
            };

            if outage.take().is_some() {
                info!(name = %self.name, "Container log stream resumed");
                let text = format!("Container '{}' found. Resuming log streaming...", self.name);
                if !self.notify(StreamKind::Stdout, text).await {
                    break;
                }
            }

            match self.pump(stream).await {
                StreamEnd::Stopped => break,
                StreamEnd::Eof => debug!(name = %self.name, "Log stream ended"),
                StreamEnd::Failed(e) => {
                    warn!(name = %self.name, error = %e, "Log stream broken");
                    if !self.announce(&mut outage, Outage::ConnectionLost).await {
                        break;
                    }
                }
            }

            if !sleep_or_stop(backoff.current(), &self.stop).await {
                break;
            }
        }

        debug!(name = %self.name, "Container follower stopped");
    }

    /// Forward demultiplexed events until the stream ends or stop fires.
    async fn pump(&self, mut stream: LogByteStream) -> StreamEnd {
        let mut decoder = FrameDecoder::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return StreamEnd::Stopped,
                next = stream.next() => next,
            };

            match next {
                None => return StreamEnd::Eof,
                Some(Err(e)) => return StreamEnd::Failed(e),
                Some(Ok(chunk)) => {
                    for event in decoder.decode(&chunk) {
                        if send_event(&self.tx, event, &self.stop).await != SendOutcome::Delivered {
                            return StreamEnd::Stopped;
                        }
                    }
                }
            }
        }
    }

    /// Record `next` and emit its notice unless it is already announced.
    async fn announce(&self, current: &mut Option<Outage>, next: Outage) -> bool {
        if current.as_ref() == Some(&next) {
            return true;
        }

        let text = match &next {
            Outage::Missing => {
                format!("Container '{}' not found. Waiting for container...", self.name)
            }
            Outage::NotRunning(status) => format!(
                "Container '{}' is not running (status={}). Waiting...",
                self.name, status
            ),
            Outage::ConnectionLost => {
                format!("Connection to container '{}' lost. Reconnecting...", self.name)
            }
        };
        info!(name = %self.name, outage = ?next, "Container unavailable");
        *current = Some(next);
        self.notify(StreamKind::Stderr, text).await
    }

    async fn notify(&self, stream: StreamKind, text: impl AsRef<str>) -> bool {
        let event = LogEvent::notice(SourceKind::Container, stream, text);
        send_event(&self.tx, event, &self.stop).await == SendOutcome::Delivered
    }

    async fn until_stopped<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => None,
            out = fut => Some(out),
        }
    }
}
