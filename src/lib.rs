//! shepai library
//!
//! Components for streaming one log source to local browser viewers:
//!
//! - **event**: Normalized log events and push/pull wire messages
//! - **timestamp**: Leading-timestamp extraction for file lines and container payloads
//! - **collector**: File and container collectors with snapshot and follow
//! - **runtime**: Container runtime boundary and Docker Engine client
//! - **hub**: Reader registry, cached snapshot and fan-out
//! - **server**: Push channel, pull endpoint and shutdown sequencing
//! - **port**: Preferred-port binding with upward scan
//! - **config**: Environment-based configuration
//!
//! # Example
//!
//! ```no_run
//! use shepai::collector::FileCollector;
//! use shepai::config::Config;
//! use shepai::port::bind_preferred;
//! use shepai::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let collector = FileCollector::with_timing("/var/log/app.log", config.collector_timing())?;
//!
//!     let bound = bind_preferred(config.host, config.port, config.port_search_window).await?;
//!     let server = Server::new(collector.into(), config.server_config());
//!     server
//!         .run(bound.listener, async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod collector;
pub mod config;
pub mod event;
pub mod hub;
pub mod port;
pub mod runtime;
pub mod server;
pub mod timestamp;

pub use collector::{Collector, CollectorError, ContainerCollector, FileCollector};
pub use config::{Config, ConfigError};
pub use event::{LogEvent, SourceKind, StreamKind};
pub use hub::Hub;
pub use runtime::{ContainerRuntime, DockerEngine, RuntimeError};
pub use server::{Server, ServerConfig, ServerError};
