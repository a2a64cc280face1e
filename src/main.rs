//! Playback proxy CLI

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use playback_proxy::{MatchStrategy, Mode, ProxyConfig, ProxyEngine};

/// HTTP recording/playback proxy
#[derive(Parser, Debug)]
#[command(name = "playback-proxy")]
#[command(author, version, about = "Record HTTP traffic and replay it with the original timing")]
struct Args {
    /// TOML configuration file; command line options override it
    #[arg(short, long, env = "PLAYBACK_PROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Cache root directory
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Hostname of proxy
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Proxy port; 0 assigns an unused port
    #[arg(short, long)]
    port: Option<u16>,

    /// Mode: online, offline or mixed
    #[arg(short, long)]
    mode: Option<Mode>,

    /// Disable resource TTFB waiting
    #[arg(short = 'W', long)]
    no_waiting: bool,

    /// Disable resource data rate
    #[arg(short = 'T', long)]
    no_throttling: bool,

    /// Assumed millisecond gap of this proxy
    #[arg(long)]
    latency_gap: Option<f64>,

    /// Playback speed multiplier
    #[arg(long)]
    speed: Option<f64>,

    /// Fixed data rate in bytes per second for every response
    #[arg(long)]
    fixed_data_rate: Option<f64>,

    /// Return debug information in response headers
    #[arg(short, long)]
    debug_headers: bool,

    /// Auto save each N seconds; 0 disables
    #[arg(long)]
    auto_save: Option<u64>,

    /// Query parameter whose value is ignored when matching (repeatable)
    #[arg(long = "ignore-param")]
    ignore_params: Vec<String>,

    /// Layer consulted before the default one, highest precedence first (repeatable)
    #[arg(long)]
    cascade: Vec<String>,

    /// Approximate matching: prefix-edit-distance or path-tree
    #[arg(long)]
    match_strategy: Option<MatchStrategy>,
}

impl Args {
    fn into_config(self) -> Result<ProxyConfig> {
        let mut config = match &self.config {
            Some(path) => ProxyConfig::from_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => ProxyConfig::default(),
        };

        if let Some(root) = self.root {
            config.cache_root = root;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if self.no_waiting {
            config.playback.waiting = false;
        }
        if self.no_throttling {
            config.playback.throttling = false;
        }
        if let Some(gap) = self.latency_gap {
            config.playback.latency_gap = gap;
        }
        if let Some(speed) = self.speed {
            config.playback.speed = speed;
        }
        if let Some(rate) = self.fixed_data_rate {
            config.playback.fixed_data_rate = rate;
        }
        if self.debug_headers {
            config.debug_headers = true;
        }
        if let Some(secs) = self.auto_save {
            config.autosave_secs = secs;
        }
        if !self.ignore_params.is_empty() {
            config.ignore_params = self.ignore_params;
        }
        if !self.cascade.is_empty() {
            config.cascade = self.cascade;
        }
        if let Some(strategy) = self.match_strategy {
            config.match_strategy = strategy;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = Args::parse().into_config()?;
    let autosave_secs = config.autosave_secs;

    let engine = ProxyEngine::new(config).context("Failed to create proxy")?;
    let addr = engine.start().await.context("Failed to start proxy")?;
    println!("Playback proxy listening on http://{addr}");

    let autosave = (autosave_secs > 0).then(|| {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(autosave_secs));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = engine.autosave().await {
                    warn!("Autosave failed: {}", e);
                }
            }
        })
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Received SIGINT, shutting down");

    if let Some(task) = autosave {
        task.abort();
    }
    if let Err(e) = engine.stop().await {
        error!("Failed to save index: {}", e);
        return Err(e.into());
    }

    Ok(())
}
