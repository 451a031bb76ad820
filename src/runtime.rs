//! Container runtime client.
//!
//! [`ContainerRuntime`] is the boundary the container collector depends
//! on: inspect a container, fetch a bounded log tail, and open a live
//! follow stream. Both log calls return the runtime's raw multiplexed bytes;
//! demultiplexing happens in the collector.
//!
//! [`DockerEngine`] implements it against the Docker Engine HTTP API,
//! reached over a unix socket or a plain TCP endpoint taken from
//! `DOCKER_HOST`. Each call opens its own HTTP/1 connection.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::TcpStream;
use tracing::debug;

/// Endpoint used when `DOCKER_HOST` is unset.
pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";

/// Raw multiplexed log bytes as they arrive from the runtime.
pub type LogByteStream = BoxStream<'static, Result<Bytes, RuntimeError>>;

/// What the collector needs to know about a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    /// Name as reported by the runtime, possibly with a leading `/`
    pub name: String,
    pub running: bool,
    /// Runtime state string such as `running`, `exited`, `paused`
    pub status: String,
}

/// Errors from runtime calls.
#[derive(Debug)]
pub enum RuntimeError {
    /// No container matches the identifier
    NotFound(String),

    /// The runtime endpoint could not be reached
    Unreachable {
        endpoint: String,
        source: std::io::Error,
    },

    /// HTTP-level failure talking to the runtime
    Http(String),

    /// The runtime answered with an error status
    Status { code: StatusCode, message: String },

    /// Response body did not have the expected shape
    Parse(String),

    /// `DOCKER_HOST` could not be understood
    InvalidEndpoint(String),
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeError::NotFound(id) => write!(f, "no such container: {}", id),
            RuntimeError::Unreachable { endpoint, source } => {
                write!(f, "container runtime unreachable at {}: {}", endpoint, source)
            }
            RuntimeError::Http(e) => write!(f, "runtime request failed: {}", e),
            RuntimeError::Status { code, message } => {
                write!(f, "runtime error ({}): {}", code, message)
            }
            RuntimeError::Parse(e) => write!(f, "failed to parse runtime response: {}", e),
            RuntimeError::InvalidEndpoint(e) => write!(f, "invalid runtime endpoint: {}", e),
        }
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RuntimeError::Unreachable { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<hyper::Error> for RuntimeError {
    fn from(err: hyper::Error) -> Self {
        RuntimeError::Http(err.to_string())
    }
}

/// Operations the container collector consumes.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Look up a container by name or full/short ID.
    async fn inspect(&self, identifier: &str) -> Result<ContainerInfo, RuntimeError>;

    /// Last `lines` log lines of both streams with timestamps, as one body.
    async fn tail_logs(&self, identifier: &str, lines: usize) -> Result<Bytes, RuntimeError>;

    /// Live log stream of both streams with timestamps and no history.
    async fn follow_logs(&self, identifier: &str) -> Result<LogByteStream, RuntimeError>;
}

/// Where the runtime API listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl Endpoint {
    /// Parse a `DOCKER_HOST`-style value: `unix:///path`, `tcp://host:port`,
    /// `http://host:port`, or a bare absolute socket path.
    pub fn parse(value: &str) -> Result<Self, RuntimeError> {
        let value = value.trim();
        if let Some(path) = value.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(RuntimeError::InvalidEndpoint(value.to_string()));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        if value.starts_with('/') {
            return Ok(Endpoint::Unix(PathBuf::from(value)));
        }

        let authority = value
            .strip_prefix("tcp://")
            .or_else(|| value.strip_prefix("http://"))
            .ok_or_else(|| RuntimeError::InvalidEndpoint(value.to_string()))?;
        let authority = authority.trim_end_matches('/');
        if authority.is_empty() || !authority.contains(':') {
            return Err(RuntimeError::InvalidEndpoint(value.to_string()));
        }
        Ok(Endpoint::Tcp(authority.to_string()))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

#[derive(Debug, Deserialize)]
struct InspectBody {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "State")]
    state: InspectState,
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "Running", default)]
    running: bool,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Docker Engine API client.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    endpoint: Endpoint,
}

impl DockerEngine {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    /// Build a client from a `DOCKER_HOST`-style string.
    pub fn from_host(host: &str) -> Result<Self, RuntimeError> {
        Ok(Self::new(Endpoint::parse(host)?))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn get(&self, path_and_query: &str) -> Result<Response<Incoming>, RuntimeError> {
        let host = match &self.endpoint {
            Endpoint::Unix(_) => "docker",
            Endpoint::Tcp(addr) => addr.as_str(),
        };
        let request = Request::builder()
            .method(Method::GET)
            .uri(path_and_query)
            .header(header::HOST, host)
            .body(Empty::<Bytes>::new())
            .map_err(|e| RuntimeError::Http(e.to_string()))?;

        debug!(endpoint = %self.endpoint, path = path_and_query, "Runtime request");

        match &self.endpoint {
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(|source| self.unreachable(source))?;
                send_request(TokioIo::new(stream), request).await
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(RuntimeError::InvalidEndpoint(
                "unix sockets are not supported on this platform".to_string(),
            )),
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr)
                    .await
                    .map_err(|source| self.unreachable(source))?;
                send_request(TokioIo::new(stream), request).await
            }
        }
    }

    /// GET that maps 404 to `NotFound` and other failures to `Status`.
    async fn get_ok(
        &self,
        identifier: &str,
        path_and_query: &str,
    ) -> Result<Response<Incoming>, RuntimeError> {
        let response = self.get(path_and_query).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.into_body().collect().await?.to_bytes();
        let message = serde_json::from_slice::<ErrorBody>(&body)
            .map(|e| e.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());

        if status == StatusCode::NOT_FOUND {
            Err(RuntimeError::NotFound(identifier.to_string()))
        } else {
            Err(RuntimeError::Status {
                code: status,
                message,
            })
        }
    }

    fn unreachable(&self, source: std::io::Error) -> RuntimeError {
        RuntimeError::Unreachable {
            endpoint: self.endpoint.to_string(),
            source,
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerEngine {
    async fn inspect(&self, identifier: &str) -> Result<ContainerInfo, RuntimeError> {
        let id = checked_identifier(identifier)?;
        let response = self.get_ok(identifier, &format!("/containers/{}/json", id)).await?;
        let body = response.into_body().collect().await?.to_bytes();
        let parsed: InspectBody =
            serde_json::from_slice(&body).map_err(|e| RuntimeError::Parse(e.to_string()))?;

        Ok(ContainerInfo {
            id: parsed.id,
            name: parsed.name,
            running: parsed.state.running,
            status: parsed.state.status,
        })
    }

    async fn tail_logs(&self, identifier: &str, lines: usize) -> Result<Bytes, RuntimeError> {
        let id = checked_identifier(identifier)?;
        let path = format!(
            "/containers/{}/logs?stdout=1&stderr=1&timestamps=1&follow=0&tail={}",
            id, lines
        );
        let response = self.get_ok(identifier, &path).await?;
        Ok(response.into_body().collect().await?.to_bytes())
    }

    async fn follow_logs(&self, identifier: &str) -> Result<LogByteStream, RuntimeError> {
        let id = checked_identifier(identifier)?;
        let path = format!(
            "/containers/{}/logs?stdout=1&stderr=1&timestamps=1&follow=1&tail=0",
            id
        );
        let response = self.get_ok(identifier, &path).await?;
        Ok(response
            .into_body()
            .into_data_stream()
            .map(|chunk| chunk.map_err(RuntimeError::from))
            .boxed())
    }
}

async fn send_request<T>(
    io: T,
    request: Request<Empty<Bytes>>,
) -> Result<Response<Incoming>, RuntimeError>
where
    T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (mut sender, connection) = hyper::client::conn::http1::handshake(io).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "Runtime connection closed with error");
        }
    });
    Ok(sender.send_request(request).await?)
}

/// Container names and IDs are `[A-Za-z0-9_.-]`, optionally with a leading `/`.
fn checked_identifier(identifier: &str) -> Result<&str, RuntimeError> {
    let id = identifier.strip_prefix('/').unwrap_or(identifier);
    let valid = !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'));
    if valid {
        Ok(id)
    } else {
        Err(RuntimeError::NotFound(identifier.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse() {
        assert_eq!(
            Endpoint::parse("unix:///var/run/docker.sock").unwrap(),
            Endpoint::Unix(PathBuf::from("/var/run/docker.sock"))
        );
        assert_eq!(
            Endpoint::parse("/run/user/1000/docker.sock").unwrap(),
            Endpoint::Unix(PathBuf::from("/run/user/1000/docker.sock"))
        );
        assert_eq!(
            Endpoint::parse("tcp://127.0.0.1:2375").unwrap(),
            Endpoint::Tcp("127.0.0.1:2375".to_string())
        );
        assert_eq!(
            Endpoint::parse("http://localhost:2375/").unwrap(),
            Endpoint::Tcp("localhost:2375".to_string())
        );
    }

    #[test]
    fn test_endpoint_parse_rejects_garbage() {
        assert!(Endpoint::parse("ssh://user@host").is_err());
        assert!(Endpoint::parse("tcp://").is_err());
        assert!(Endpoint::parse("tcp://hostonly").is_err());
        assert!(Endpoint::parse("unix://").is_err());
    }

    #[test]
    fn test_endpoint_display() {
        let endpoint = Endpoint::parse(DEFAULT_DOCKER_HOST).unwrap();
        assert_eq!(endpoint.to_string(), DEFAULT_DOCKER_HOST);

        let engine = DockerEngine::from_host("tcp://127.0.0.1:2375").unwrap();
        assert_eq!(engine.endpoint().to_string(), "tcp://127.0.0.1:2375");
    }

    #[test]
    fn test_checked_identifier() {
        assert_eq!(checked_identifier("web-1").unwrap(), "web-1");
        assert_eq!(checked_identifier("/web_1.blue").unwrap(), "web_1.blue");
        assert_eq!(checked_identifier("abc123def456").unwrap(), "abc123def456");
        assert!(matches!(checked_identifier(""), Err(RuntimeError::NotFound(_))));
        assert!(matches!(checked_identifier("../etc"), Err(RuntimeError::NotFound(_))));
        assert!(matches!(checked_identifier("a?b=c"), Err(RuntimeError::NotFound(_))));
    }

    #[test]
    fn test_inspect_body_parsing() {
        let json = r#"{
            "Id": "abc123",
            "Name": "/web",
            "State": {"Status": "exited", "Running": false, "ExitCode": 0}
        }"#;
        let parsed: InspectBody = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.id, "abc123");
        assert_eq!(parsed.name, "/web");
        assert_eq!(parsed.state.status, "exited");
        assert!(!parsed.state.running);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        // Port 1 on loopback is reserved and refuses connections.
        let engine = DockerEngine::from_host("tcp://127.0.0.1:1").unwrap();
        let err = engine.inspect("web").await.unwrap_err();
        assert!(matches!(err, RuntimeError::Unreachable { .. }), "got {:?}", err);
    }

    #[test]
    fn test_runtime_error_display() {
        assert_eq!(
            RuntimeError::NotFound("web".to_string()).to_string(),
            "no such container: web"
        );
        let err = RuntimeError::Status {
            code: StatusCode::INTERNAL_SERVER_ERROR,
            message: "boom".to_string(),
        };
        assert!(err.to_string().contains("500"));
        assert!(err.to_string().contains("boom"));
    }
}
