use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use redichunk::server::{Config, Server};
use redichunk::utils::{duration, size};

#[derive(Parser, Debug)]
#[command(about = "A chunked, expiring key-value store speaking a subset of RESP")]
struct Args {
    /// The address to listen on
    #[arg(long, env = "REDICHUNK_ADDR", default_value = "localhost:5533")]
    addr: String,

    /// Directory the database chunks are stored in
    #[arg(long, env = "REDICHUNK_DIR", default_value = "db")]
    dir: PathBuf,

    /// Size at which the write log is sealed into a read chunk, e.g. 100MB or 64MiB
    #[arg(long, env = "REDICHUNK_CHUNK_SIZE", default_value = "100MB", value_parser = parse_size)]
    chunk_size: u64,

    /// How long a key lives, e.g. 1h or 1h30m
    #[arg(long, env = "REDICHUNK_EXPIRY", default_value = "1h", value_parser = parse_duration)]
    expiry: Duration,

    /// StatsD address; an empty string disables metrics
    #[arg(long, env = "REDICHUNK_STATSD_ADDR", default_value = "localhost:8125")]
    statsd_addr: String,

    /// Largest incomplete request buffered before the client is disconnected
    #[arg(long, env = "REDICHUNK_MAX_FRAME_SIZE", default_value = "512MB", value_parser = parse_size)]
    max_frame_size: u64,

    /// Replies a connection may hold before it stops reading requests
    #[arg(long, env = "REDICHUNK_MAX_PENDING_REPLIES")]
    max_pending_replies: Option<usize>,
}

fn parse_size(s: &str) -> Result<u64, size::Error> {
    size::parse(s)
}

fn parse_duration(s: &str) -> Result<Duration, duration::Error> {
    duration::parse(s)
}

impl Args {
    fn into_config(self) -> Result<Config, redichunk::Error> {
        Ok(Config {
            addr: self.addr,
            dir: self.dir,
            chunk_size: self.chunk_size,
            expiry: self.expiry,
            statsd_addr: self.statsd_addr,
            max_frame_size: usize::try_from(self.max_frame_size)?,
            max_pending_replies: self.max_pending_replies,
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Args::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let server = match Server::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start server: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let shutdown = server.shutdown_handle();

    tokio::select! {
        res = server.run() => {
            if let Err(e) = res {
                error!("Server stopped: {}", e);
            }
            // The process is going down either way.
            let _ = shutdown.stop();
            ExitCode::FAILURE
        }
        signal = shutdown_signal() => {
            info!("Received {}, shutting down", signal);
            match shutdown.stop() {
                Ok(()) => ExitCode::SUCCESS,
                Err(_) => ExitCode::FAILURE,
            }
        }
    }
}

async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}
