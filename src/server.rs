//! Broadcast server.
//!
//! Serves three routes on one listener:
//!
//! - `/ws` push channel: snapshot message on connect, then one message per live event
//! - `/api/snapshot` pull endpoint returning the cached snapshot
//! - `/` minimal landing page
//!
//! Push connections are only accepted from loopback origins. Each connection
//! runs a writer task (outbound queue, keepalive pings) and a reader task
//! (read deadline); whichever ends first takes the other down with it.

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collector::{Collector, CollectorError, EVENT_CHANNEL_CAPACITY};
use crate::event::SnapshotResponse;
use crate::hub::{Hub, Registration, DEFAULT_WRITE_TIMEOUT};

/// Default interval between keepalive pings.
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(54);

/// Default time a reader may stay silent before it is dropped.
const DEFAULT_READ_DEADLINE: Duration = Duration::from_secs(60);

/// Default time allowed for listeners to drain on shutdown.
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>shepai</title></head>
<body>
<h1>shepai</h1>
<p>The log stream is served at <code>/ws</code> and the current snapshot at
<a href="/api/snapshot"><code>/api/snapshot</code></a>.</p>
</body>
</html>
"#;

/// Errors returned by [`Server::run`].
#[derive(Debug)]
pub enum ServerError {
    /// The initial snapshot could not be taken
    Snapshot(CollectorError),

    /// The collector refused to start following
    Collector(CollectorError),

    /// The listener failed while serving
    Serve(std::io::Error),

    /// Listeners did not drain within the grace window
    ShutdownTimeout(Duration),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Snapshot(e) => write!(f, "failed to get snapshot: {}", e),
            ServerError::Collector(e) => write!(f, "failed to start collector: {}", e),
            ServerError::Serve(e) => write!(f, "server error: {}", e),
            ServerError::ShutdownTimeout(grace) => {
                write!(f, "server shutdown did not finish within {:?}", grace)
            }
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Snapshot(e) | ServerError::Collector(e) => Some(e),
            ServerError::Serve(e) => Some(e),
            ServerError::ShutdownTimeout(_) => None,
        }
    }
}

/// Connection and shutdown timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    pub ping_interval: Duration,
    pub read_deadline: Duration,
    pub write_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            read_deadline: DEFAULT_READ_DEADLINE,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

#[derive(Clone)]
struct AppState {
    hub: Arc<Hub>,
    config: ServerConfig,
}

/// Owns one collector and fans its events out to push readers.
pub struct Server {
    collector: Collector,
    hub: Arc<Hub>,
    config: ServerConfig,
}

impl Server {
    pub fn new(collector: Collector, config: ServerConfig) -> Self {
        Self {
            collector,
            hub: Arc::new(Hub::new(config.write_timeout)),
            config,
        }
    }

    pub fn hub(&self) -> Arc<Hub> {
        self.hub.clone()
    }

    /// Serve on `listener` until `shutdown` resolves.
    ///
    /// Shutdown stops the collector, closes every reader and then gives the
    /// listener [`ServerConfig::shutdown_grace`] to drain.
    pub async fn run<F>(self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            collector,
            hub,
            config,
        } = self;

        let snapshot = collector.snapshot().await.map_err(ServerError::Snapshot)?;
        info!(
            source = collector.source_name(),
            events = snapshot.len(),
            "Snapshot cached"
        );
        hub.replace_snapshot(snapshot);

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let producer = collector.start(tx).map_err(ServerError::Collector)?;
        let fan_out = tokio::spawn(hub.clone().run_fan_out(rx));

        let app = router(AppState {
            hub: hub.clone(),
            config,
        });
        let stop_serving = CancellationToken::new();
        let graceful = stop_serving.clone();
        let mut serving = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(graceful.cancelled_owned())
                .await
        });

        let failed_early = tokio::select! {
            _ = shutdown => None,
            res = &mut serving => Some(res),
        };

        info!("Shutting down");
        collector.stop();
        hub.close_all();
        stop_serving.cancel();

        let result = match failed_early {
            Some(res) => serve_result(res),
            None => match timeout(config.shutdown_grace, &mut serving).await {
                Ok(res) => serve_result(res),
                Err(_) => {
                    serving.abort();
                    Err(ServerError::ShutdownTimeout(config.shutdown_grace))
                }
            },
        };

        if timeout(config.shutdown_grace, producer).await.is_err() {
            warn!("Collector did not stop within the grace window");
        }
        fan_out.abort();
        result
    }
}

fn serve_result(res: Result<std::io::Result<()>, JoinError>) -> Result<(), ServerError> {
    match res {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ServerError::Serve(e)),
        Err(e) => Err(ServerError::Serve(std::io::Error::other(e))),
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route("/api/snapshot", get(snapshot_handler))
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn snapshot_handler(State(state): State<AppState>) -> Json<SnapshotResponse> {
    Json(SnapshotResponse {
        events: state.hub.snapshot().as_ref().clone(),
    })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    if !origin_allowed(&headers) {
        warn!(
            origin = ?headers.get(header::ORIGIN),
            host = ?headers.get(header::HOST),
            "Rejected push connection from non-loopback origin"
        );
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }
    ws.on_upgrade(move |socket| serve_reader(socket, state))
}

/// Accept only loopback browsers. Without an `Origin` header the `Host` must be loopback.
fn origin_allowed(headers: &HeaderMap) -> bool {
    match headers.get(header::ORIGIN) {
        Some(origin) => origin
            .to_str()
            .ok()
            .and_then(|o| o.parse::<Uri>().ok())
            .and_then(|uri| uri.host().map(is_loopback_host))
            .unwrap_or(false),
        None => headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| format!("http://{}", h).parse::<Uri>().ok())
            .and_then(|uri| uri.host().map(is_loopback_host))
            .unwrap_or(false),
    }
}

fn is_loopback_host(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host.eq_ignore_ascii_case("localhost")
        || host.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}

async fn serve_reader(socket: WebSocket, state: AppState) {
    let Registration {
        id,
        outbound,
        closed,
    } = state.hub.register();
    let (sink, stream) = socket.split();

    let mut writer = tokio::spawn(write_loop(id, sink, outbound, closed, state.config));
    let mut reader = tokio::spawn(read_loop(id, stream, state.config.read_deadline));

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    state.hub.deregister(id);
}

async fn write_loop(
    id: Uuid,
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Utf8Bytes>,
    closed: CancellationToken,
    config: ServerConfig,
) {
    let mut ping = tokio::time::interval_at(
        Instant::now() + config.ping_interval,
        config.ping_interval,
    );
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let message = tokio::select! {
            biased;
            _ = closed.cancelled() => {
                let _ = timeout(config.write_timeout, sink.send(Message::Close(None))).await;
                debug!(reader = %id, "Reader closed by server");
                return;
            }
            next = outbound.recv() => match next {
                Some(text) => Message::Text(text),
                None => return,
            },
            _ = ping.tick() => Message::Ping(Bytes::new()),
        };

        match timeout(config.write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(reader = %id, error = %e, "Write failed");
                return;
            }
            Err(_) => {
                warn!(reader = %id, "Write deadline exceeded");
                return;
            }
        }
    }
}

/// Consume inbound frames; any frame, pongs included, refreshes the deadline.
async fn read_loop(id: Uuid, mut stream: SplitStream<WebSocket>, deadline: Duration) {
    loop {
        match timeout(deadline, stream.next()).await {
            Err(_) => {
                info!(reader = %id, "Reader missed keepalive deadline");
                return;
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => {
                debug!(reader = %id, "Reader disconnected");
                return;
            }
            Ok(Some(Err(e))) => {
                debug!(reader = %id, error = %e, "Read failed");
                return;
            }
            Ok(Some(Ok(_))) => {}
        }
    }
}
