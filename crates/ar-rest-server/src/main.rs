// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! agent-relay server binary.

use ar_logging::{init, Level, LogFormat};
use ar_rest_server::{Server, ServerConfig};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "A2A gateway for local worker-CLI agents", long_about = None)]
struct Args {
    /// Bind address for the server
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Configuration file (TOML); falls back to AGENT_RELAY_CONFIG
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory (database, default workdir)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Log level when LOG_LEVEL/RUST_LOG are unset
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let format = if args.log_json { LogFormat::Json } else { LogFormat::Plaintext };
    if let Err(e) = init("agent-relay", level, format) {
        eprintln!("failed to initialize logging: {e}");
        std::process::exit(1);
    }

    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "fatal startup error");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config_path = args.config.or_else(|| {
        std::env::var(format!("{}_CONFIG", ar_rest_server::config::ENV_PREFIX))
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
    });
    let mut config = ServerConfig::load(config_path.as_deref())?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    tracing::info!(
        bind = %config.bind_addr,
        agents = config.agents.len(),
        auth = config.requires_auth(),
        "starting agent-relay"
    );

    let server = Server::new(config).await?;
    server.run().await
}
