//! sqlgate Server Binary
//!
//! Starts the connection layer in front of the echo engine.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use sqlgate::execution::EchoEngine;
use sqlgate::network::load_server_tls;
use sqlgate::{Config, Server};
use tracing_subscriber::{fmt, EnvFilter};

/// sqlgate Server
#[derive(Parser, Debug)]
#[command(name = "sqlgate-server")]
#[command(about = "Event-driven SQL connection server")]
#[command(version)]
struct Args {
    /// Listen address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:15432")]
    listen: String,

    /// Maximum concurrent connections
    #[arg(short, long, default_value = "1024")]
    max_connections: usize,

    /// Connection handler threads
    #[arg(short = 't', long, default_value = "4")]
    handler_threads: usize,

    /// Background execution threads (0 = execute inline)
    #[arg(short, long, default_value = "4")]
    execution_threads: usize,

    /// Per-connection buffer size in KB
    #[arg(short, long, default_value = "64")]
    buffer_kb: usize,

    /// PEM certificate chain; enables TLS together with --tls-key
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlgate=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("sqlgate Server v{}", sqlgate::VERSION);
    tracing::info!("Listen address: {}", args.listen);

    // Build config from args
    let mut builder = Config::builder()
        .listen_addr(&args.listen)
        .max_connections(args.max_connections)
        .handler_threads(args.handler_threads)
        .execution_threads(args.execution_threads)
        .buffer_capacity(args.buffer_kb * 1024);

    if let (Some(cert), Some(key)) = (&args.tls_cert, &args.tls_key) {
        match load_server_tls(cert, key) {
            Ok(tls) => {
                tracing::info!("TLS enabled with {}", cert.display());
                builder = builder.tls(tls);
            }
            Err(e) => {
                tracing::error!("Failed to load TLS material: {}", e);
                std::process::exit(1);
            }
        }
    }
    let config = builder.build();

    let mut server = match Server::new(config, Arc::new(EchoEngine)) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("Failed to start server: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run() {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }

    tracing::info!("Server stopped");
}
