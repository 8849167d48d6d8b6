//! ponswarp-speedtest: relay credential and loss-probe server.

use clap::Parser;
use speedtest_lib::config::ServerConfig;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// PonsWarp Speedtest backend
#[derive(Parser, Debug)]
#[command(name = "ponswarp-speedtest", version, about = "Relay credentials and packet-loss probe server")]
struct Cli {
    /// Config file path (TOML)
    #[arg(short, long, env = "SPEEDTEST_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Run the embedded TURN relay
    #[arg(long)]
    embedded_relay: bool,

    /// Embedded relay UDP port
    #[arg(long)]
    relay_port: Option<u16>,

    /// Session timeout in seconds
    #[arg(long)]
    session_timeout: Option<u64>,

    /// Maximum concurrent probe sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Disable the WebRTC loss probe (credentials only)
    #[arg(long)]
    no_probe: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if self.embedded_relay {
            config.relay.embedded = true;
        }
        if let Some(port) = self.relay_port {
            config.relay.port = port;
        }
        if let Some(timeout) = self.session_timeout {
            config.probe.session_timeout_sec = timeout;
        }
        if let Some(max) = self.max_sessions {
            config.probe.max_sessions = max;
        }
        if self.no_probe {
            config.probe.enabled = false;
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let mut config = match ServerConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };
    cli.apply(&mut config);

    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        std::process::exit(1);
    }

    info!(
        listen = %config.listen,
        embedded_relay = config.relay.embedded,
        probe = config.probe.enabled,
        "configuration loaded"
    );

    if let Err(e) = speedtest_lib::run(config).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}
