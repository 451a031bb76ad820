//! shepai - live log viewer for a local file or a container
//!
//! Tails one source, keeps the most recent lines as a snapshot and pushes
//! every new line to connected browser viewers.
//!
//! ## Usage
//!
//! ```text
//! shepai file <path> [--port N]
//! shepai docker <container> [--port N]
//! ```
//!
//! ## Configuration
//!
//! See [`shepai::config::Config`] for the environment variables. `RUST_LOG`
//! controls diagnostic output (default: info), which is written to stderr.

use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use shepai::collector::{Collector, ContainerCollector, FileCollector};
use shepai::config::Config;
use shepai::port::bind_preferred;
use shepai::runtime::DockerEngine;
use shepai::server::Server;

#[derive(Debug, Parser)]
#[command(name = "shepai", version, about = "Stream logs from a file or container to your browser")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Stream a log file
    File {
        /// Path of the file to follow
        path: PathBuf,

        /// Port for the web dashboard
        #[arg(long)]
        port: Option<u16>,
    },

    /// Stream a container's logs
    #[command(alias = "container")]
    Docker {
        /// Container name, full ID or short ID
        container: String,

        /// Port for the web dashboard
        #[arg(long)]
        port: Option<u16>,
    },
}

impl Command {
    fn port(&self) -> Option<u16> {
        match self {
            Command::File { port, .. } | Command::Docker { port, .. } => *port,
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => exit_with("Error loading configuration", &e),
    };
    if let Some(port) = cli.command.port() {
        config.port = port;
    }
    info!(
        port = config.port,
        host = %config.host,
        docker_host = %config.docker_host,
        "Configuration loaded"
    );

    let collector = build_collector(&cli.command, &config).await;

    let bound = match bind_preferred(config.host, config.port, config.port_search_window).await {
        Ok(bound) => bound,
        Err(e) => exit_with("Error starting server", &e),
    };
    if bound.is_fallback() {
        println!(
            "Port {} is in use, using port {} instead",
            bound.preferred, bound.port
        );
    }
    let url = match bound.listener.local_addr() {
        Ok(addr) => format!("http://{}", addr),
        Err(_) => format!("http://{}:{}", config.host, bound.port),
    };

    println!("Streaming logs from: {}", collector.source_name());
    println!("shepai running at {}", url);
    println!("Press Ctrl+C to stop\n");

    let server = Server::new(collector, config.server_config());
    if let Err(e) = server.run(bound.listener, shutdown_signal()).await {
        exit_with("Error running server", &e);
    }

    info!("shepai stopped");
}

async fn build_collector(command: &Command, config: &Config) -> Collector {
    match command {
        Command::File { path, .. } => {
            match FileCollector::with_timing(path, config.collector_timing()) {
                Ok(collector) => collector.into(),
                Err(e) => exit_with("Error creating file collector", &e),
            }
        }
        Command::Docker { container, .. } => {
            let engine = match DockerEngine::from_host(&config.docker_host) {
                Ok(engine) => engine,
                Err(e) => exit_with("Error creating container collector", &e),
            };
            info!(endpoint = %engine.endpoint(), "Using container runtime");
            match ContainerCollector::connect_with_timing(
                Arc::new(engine),
                container,
                config.collector_timing(),
            )
            .await
            {
                Ok(collector) => collector.into(),
                Err(e) => {
                    eprintln!("Make sure Docker is running and the container exists");
                    eprintln!("You can use either container name or ID (full or short)");
                    exit_with("Error creating container collector", &e)
                }
            }
        }
    }
}

fn exit_with(context: &str, err: &dyn Display) -> ! {
    error!(error = %err, "{}", context);
    eprintln!("{}: {}", context, err);
    std::process::exit(1);
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received, stopping...");
}
