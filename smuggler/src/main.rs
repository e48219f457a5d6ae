//! `smg`: build-side CLI.
//!
//! Resolves the build rule for the current branch, builds and pushes the
//! image, and announces it on the rule's deploy channels.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use smuggler::broker::SubscriptionBroker;
use smuggler::build::{BuildError, BuildOptions, plan_build, run_build};
use smuggler::core::channel::ChannelPath;
use smuggler::core::naming::{NameError, parse_image_reference};
use smuggler::core::resolver::ResolveError;
use smuggler::exit_codes;
use smuggler::io::config::{ClusterConfig, ConfigOverrides, default_config_path, load_config};
use smuggler::io::git::Git;
use smuggler::io::manifest::{MANIFEST_FILE, Manifest, load_manifest};
use smuggler::io::runtime::DockerCli;
use smuggler::io::store::EtcdClient;
use smuggler::logging;

#[derive(Parser)]
#[command(
    name = "smg",
    version,
    about = "Build images per branch rule and announce them to the cluster"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct GlobalArgs {
    /// Working copy holding `smg.toml` (defaults to the current directory).
    #[arg(short = 'C', long = "dir", global = true)]
    dir: Option<PathBuf>,
    /// Cluster config file (defaults to `~/.smg/smgd.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Coordination store endpoint; repeat for failover.
    #[arg(long = "etcd", global = true)]
    endpoints: Vec<String>,
    /// Cluster id that scopes every channel.
    #[arg(long = "cluster", global = true)]
    cluster_id: Option<String>,
    /// Debug logging for this crate.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Args)]
struct RuleArgs {
    /// Select the rule by this tag instead of the current branch.
    #[arg(short, long)]
    tag: Option<String>,
    /// Push even when the rule doesn't ask for it.
    #[arg(long)]
    push: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Build, tag, push and announce the image for the current branch.
    Build {
        #[command(flatten)]
        rule: RuleArgs,
        /// Remove local images afterwards.
        #[arg(long)]
        delete: bool,
        /// Seconds the `onlyif` check may run.
        #[arg(long, default_value_t = 600)]
        onlyif_timeout: u64,
    },
    /// Print the resolved rule, channels and image names without building.
    Plan {
        #[command(flatten)]
        rule: RuleArgs,
    },
    /// Announce existing images on channels.
    Publish {
        /// Channel name; repeat for several channels.
        #[arg(short, long = "channel", required = true)]
        channels: Vec<String>,
        /// Image references (`name:tag`).
        #[arg(required = true)]
        images: Vec<String>,
    },
}

/// Marks errors caused by configuration or manifest content.
#[derive(Debug)]
struct InvalidConfig;

impl fmt::Display for InvalidConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid configuration")
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(if cli.global.verbose {
        "smuggler=debug,smg=debug"
    } else {
        "warn"
    });
    if let Err(err) = run(cli).await {
        eprintln!("{:#}", err);
        std::process::exit(exit_code_for(&err));
    }
}

async fn run(cli: Cli) -> Result<()> {
    let global = cli.global;
    match cli.command {
        Command::Build {
            rule,
            delete,
            onlyif_timeout,
        } => cmd_build(&global, &rule, delete, Duration::from_secs(onlyif_timeout)).await,
        Command::Plan { rule } => cmd_plan(&global, &rule),
        Command::Publish { channels, images } => cmd_publish(&global, &channels, &images).await,
    }
}

fn cmd_plan(global: &GlobalArgs, rule: &RuleArgs) -> Result<()> {
    let workdir = workdir(global)?;
    let manifest = read_manifest(&workdir)?;
    let cfg = cluster_config(global)?;
    let vcs = Git::new(&workdir).vcs_state()?;
    let plan = plan_build(&manifest, &vcs, rule.tag.as_deref(), rule.push, &cfg.cluster_id)?;
    print!("{}", plan.render());
    Ok(())
}

async fn cmd_build(
    global: &GlobalArgs,
    rule: &RuleArgs,
    delete: bool,
    onlyif_timeout: Duration,
) -> Result<()> {
    let workdir = workdir(global)?;
    let manifest = read_manifest(&workdir)?;
    let cfg = cluster_config(global)?;
    let vcs = Git::new(&workdir).vcs_state()?;
    let plan = plan_build(&manifest, &vcs, rule.tag.as_deref(), rule.push, &cfg.cluster_id)?;

    let runtime = DockerCli::new(&cfg.docker);
    let broker = SubscriptionBroker::new(Arc::new(
        EtcdClient::new(cfg.endpoints.clone()).context("create store client")?,
    ));
    let options = BuildOptions {
        workdir,
        onlyif_timeout,
        delete,
    };
    let outcome = run_build(&plan, &options, &runtime, &broker).await?;
    for name in &outcome.pushed {
        println!("pushed {name}");
    }
    if outcome.pushed.is_empty() {
        for name in &outcome.built {
            println!("built {name}");
        }
    }
    if outcome.published > 0 {
        println!(
            "announced {} image(s) on {} channel(s)",
            outcome.pushed.len(),
            plan.channels.len()
        );
    }
    Ok(())
}

async fn cmd_publish(global: &GlobalArgs, channels: &[String], images: &[String]) -> Result<()> {
    let cfg = cluster_config(global)?;
    for image in images {
        parse_image_reference(image)?;
    }
    let channels = channels
        .iter()
        .map(|name| ChannelPath::new(&cfg.cluster_id, name))
        .collect::<Result<Vec<_>>>()
        .context(InvalidConfig)?;
    let broker = SubscriptionBroker::new(Arc::new(
        EtcdClient::new(cfg.endpoints.clone()).context("create store client")?,
    ));
    let published = broker
        .publish_pull_request(images, &channels)
        .await
        .context("publish pull requests")?;
    println!("published {published} pull request(s)");
    Ok(())
}

fn workdir(global: &GlobalArgs) -> Result<PathBuf> {
    match &global.dir {
        Some(dir) => Ok(dir.clone()),
        None => std::env::current_dir().context("resolve current directory"),
    }
}

fn read_manifest(workdir: &Path) -> Result<Manifest> {
    load_manifest(&workdir.join(MANIFEST_FILE)).context(InvalidConfig)
}

fn cluster_config(global: &GlobalArgs) -> Result<ClusterConfig> {
    let mut cfg = match global.config.clone().or_else(default_config_path) {
        Some(path) => load_config(&path).context(InvalidConfig)?,
        None => ClusterConfig::default(),
    };
    cfg.apply(ConfigOverrides {
        cluster_id: global.cluster_id.clone(),
        endpoints: global.endpoints.clone(),
        ..ConfigOverrides::default()
    });
    cfg.validate().context(InvalidConfig)?;
    Ok(cfg)
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<ResolveError>().is_some() {
        return exit_codes::NO_MATCHING_RULE;
    }
    if err.downcast_ref::<InvalidConfig>().is_some() {
        return exit_codes::CONFIG;
    }
    if err.downcast_ref::<NameError>().is_some() {
        return exit_codes::BUILD_ABORTED;
    }
    match err.downcast_ref::<BuildError>() {
        Some(BuildError::InvalidChannel { .. }) => return exit_codes::CONFIG,
        Some(BuildError::OnlyIfFailed { .. }) => return exit_codes::BUILD_ABORTED,
        _ => {}
    }
    exit_codes::FAILED
}
