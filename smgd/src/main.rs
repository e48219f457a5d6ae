//! `smgd`: cluster daemon.
//!
//! Watches the configured channels and pulls every announced image until
//! interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use smuggler::daemon::{ClusterDaemon, DaemonError};
use smuggler::exit_codes;
use smuggler::io::config::{ClusterConfig, ConfigOverrides, default_config_path, load_config};
use smuggler::io::runtime::DockerCli;
use smuggler::io::store::EtcdClient;
use smuggler::logging;
use tracing::info;

#[derive(Parser)]
#[command(name = "smgd", version, about = "Pull images announced on cluster channels")]
struct Cli {
    /// Cluster config file (defaults to `~/.smg/smgd.toml`).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Coordination store endpoint; repeat for failover.
    #[arg(long = "etcd")]
    endpoints: Vec<String>,
    /// Channel to watch; repeat for several channels.
    #[arg(long = "subscribe")]
    subscriptions: Vec<String>,
    /// Cluster id that scopes every channel.
    #[arg(long = "cluster")]
    cluster_id: Option<String>,
    /// Docker daemon address passed to the docker client.
    #[arg(long = "docker")]
    docker_host: Option<String>,
}

#[tokio::main]
async fn main() {
    logging::init("info");
    if let Err(err) = run(Cli::parse()).await {
        eprintln!("{:#}", err);
        let code = if err.downcast_ref::<DaemonError>().is_some() {
            exit_codes::CONFIG
        } else {
            exit_codes::FAILED
        };
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut cfg = match cli.config.or_else(default_config_path) {
        Some(path) => {
            load_config(&path).map_err(|err| DaemonError::Config(format!("{err:#}")))?
        }
        None => ClusterConfig::default(),
    };
    cfg.apply(ConfigOverrides {
        cluster_id: cli.cluster_id,
        endpoints: cli.endpoints,
        subscriptions: cli.subscriptions,
        docker_host: cli.docker_host,
    });

    let store = Arc::new(EtcdClient::new(cfg.endpoints.clone()).context("create store client")?);
    let runtime = Arc::new(DockerCli::new(&cfg.docker));
    let daemon = ClusterDaemon::new(cfg, store, runtime)?;
    let handle = daemon.start();

    shutdown_signal().await?;
    info!("shutdown requested");
    let report = handle.stop().await;
    info!(
        pulled = report.pulled,
        dropped = report.dropped,
        discarded = report.discarded,
        "bye"
    );
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("wait for ctrl-c"),
        _ = term.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_repeated_flags() {
        let cli = Cli::parse_from([
            "smgd",
            "--etcd",
            "http://10.0.0.1:2379",
            "--subscribe",
            "web",
            "--subscribe",
            "jobs",
            "--cluster",
            "prod",
        ]);
        assert_eq!(cli.endpoints, vec!["http://10.0.0.1:2379"]);
        assert_eq!(cli.subscriptions, vec!["web", "jobs"]);
        assert_eq!(cli.cluster_id.as_deref(), Some("prod"));
    }
}
