//! Runs one member of a replicated Ravel graph.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ravel::raft::{Coordinator, TcpNetwork};
use ravel::{telemetry, Config};
use tokio::net::TcpListener;
use tracing::{error, info, info_span};

#[derive(Parser, Debug)]
#[command(name = "ravel-node", version, about = "Run a Ravel graph replica")]
struct Cli {
    #[arg(long, env = "RAVEL_CONFIG", value_name = "FILE", help = "TOML configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Override the configured node id")]
    node_id: Option<u64>,

    #[arg(long, value_name = "ADDR", help = "Override the Raft listen address")]
    listen: Option<String>,

    #[arg(long, value_name = "ADDR", help = "Override the address advertised to peers")]
    advertise: Option<String>,

    #[arg(long, value_name = "DIR", help = "Override the data directory")]
    data_dir: Option<PathBuf>,

    #[arg(long, conflicts_with = "join", help = "Initialize a new single-voter cluster")]
    bootstrap: bool,

    #[arg(long, value_name = "ADDR", help = "Join the cluster reachable at ADDR")]
    join: Option<String>,
}

impl Cli {
    fn resolve(&self) -> Result<Config, Box<dyn Error>> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(id) = self.node_id {
            config.node_id = id;
        }
        if let Some(listen) = &self.listen {
            config.listen_addr = listen.clone();
        }
        if let Some(advertise) = &self.advertise {
            config.advertise_addr = Some(advertise.clone());
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match cli.resolve() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("ravel-node: {err}");
            std::process::exit(2);
        }
    };
    telemetry::init(&config.log_filter);
    if let Err(err) = run(cli, config).await {
        error!(error = %err, "node.failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli, config: Config) -> Result<(), Box<dyn Error>> {
    let span = info_span!("node", id = config.node_id);
    let graph = config.open_graph()?;
    let listener = TcpListener::bind(&config.listen_addr).await?;
    let coordinator = Arc::new(
        Coordinator::start(
            config.node_id,
            config.advertise_addr(),
            graph.clone(),
            &config.raft_dir(),
            &config.raft,
            TcpNetwork::new(config.raft.rpc_timeout()),
            span.clone(),
        )
        .await?,
    );
    coordinator.serve(listener);

    if cli.bootstrap {
        coordinator.bootstrap().await?;
    }
    if let Some(seed) = &cli.join {
        coordinator.join_cluster(seed).await?;
    }
    let election = Duration::from_millis(config.raft.election_timeout_max_ms * 4);
    match coordinator.wait_for_leader(election).await {
        Ok(leader) => span.in_scope(|| info!(leader, "node.ready")),
        Err(err) => span.in_scope(|| info!(error = %err, "node.waiting_for_cluster")),
    }

    tokio::signal::ctrl_c().await?;
    span.in_scope(|| info!(stats = ?coordinator.stats(), "node.stopping"));
    coordinator.shutdown().await?;
    graph.close()?;
    Ok(())
}
