//! Failover controller daemon

use clap::Parser;
use failoverd::common::{Broker, Config, Metrics, StartupState};
use failoverd::controller::{MasterRegistry, Orchestrator};
use failoverd::node::TcpConnector;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "failoverd")]
#[command(about = "Leader-gated master failover controller")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Control surface listen address, also the controller identity
    #[arg(long)]
    addr: Option<String>,

    /// Masters to monitor (comma-separated)
    #[arg(long, value_delimiter = ',')]
    masters: Vec<String>,

    /// Replace (new) or extend (existing) the saved masters
    #[arg(long, value_enum)]
    masters_state: Option<StartupState>,

    /// Probe interval in milliseconds
    #[arg(long)]
    check_interval: Option<i64>,

    /// Seconds a master may stay unreachable before failover
    #[arg(long)]
    max_down_time: Option<i64>,

    /// Consensus backend
    #[arg(long, value_enum)]
    broker: Option<Broker>,

    /// Raft transport address
    #[arg(long)]
    raft_addr: Option<String>,

    /// Raft data directory
    #[arg(long)]
    raft_data_dir: Option<PathBuf>,

    /// Raft peers (comma-separated)
    #[arg(long, value_delimiter = ',')]
    raft_cluster: Vec<String>,

    /// Discard (new) or keep (existing) saved raft state
    #[arg(long, value_enum)]
    raft_cluster_state: Option<StartupState>,

    /// Coordination service endpoints (comma-separated)
    #[arg(long, value_delimiter = ',')]
    coord_endpoints: Vec<String>,

    /// Base path of the controller nodes in the coordination service
    #[arg(long)]
    coord_base_dir: Option<String>,

    /// Log level used when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    /// CLI flags take priority over the file and environment.
    fn apply(self, mut config: Config) -> failoverd::Result<Config> {
        if let Some(addr) = self.addr {
            config.addr = addr;
        }
        if !self.masters.is_empty() {
            config.masters = self.masters;
        }
        if let Some(state) = self.masters_state {
            config.masters_state = state;
        }
        if let Some(interval) = self.check_interval {
            config.check_interval = interval;
        }
        if let Some(down) = self.max_down_time {
            config.max_down_time = down;
        }
        if let Some(broker) = self.broker {
            config.broker = broker;
        }
        if let Some(addr) = self.raft_addr {
            config.raft.addr = addr;
        }
        if let Some(dir) = self.raft_data_dir {
            config.raft.data_dir = dir;
        }
        if !self.raft_cluster.is_empty() {
            config.raft.cluster = self.raft_cluster;
        }
        if let Some(state) = self.raft_cluster_state {
            config.raft.cluster_state = state;
        }
        if !self.coord_endpoints.is_empty() {
            config.coord.endpoints = self.coord_endpoints;
        }
        if let Some(dir) = self.coord_base_dir {
            config.coord.base_dir = dir;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        config.normalized()
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let config = cli.apply(config)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(version = failoverd::VERSION, broker = %config.broker, "starting failoverd");

    let config = Arc::new(config);
    let registry = MasterRegistry::new();
    let cluster = failoverd::cluster::build(&config, registry.clone()).await?;
    let app = Orchestrator::new(
        config,
        cluster,
        registry,
        Arc::new(Metrics::new()),
        Arc::new(TcpConnector::default()),
    );
    app.start().await?;

    shutdown_signal().await;
    info!("shutting down");
    app.shutdown().await?;

    Ok(())
}
