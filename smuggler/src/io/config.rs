//! Cluster configuration stored in `smgd.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::channel::ChannelPath;
use crate::core::retry::RetryPolicy;
use crate::io::store::DEFAULT_ENDPOINT;

/// Hostname reported when none can be discovered.
pub const UNDEFINED_HOST: &str = "undefined";

/// Cluster configuration (TOML).
///
/// Shared by the daemon and by the build CLI when it publishes. Missing
/// fields take the defaults below; a missing file is the default config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClusterConfig {
    /// Prefix of every key this cluster reads or writes.
    pub cluster_id: String,

    /// Coordination store endpoints, tried in order on connection errors.
    pub endpoints: Vec<String>,

    /// Channels this host watches for pull requests.
    pub subscriptions: Vec<String>,

    /// Capacity of the queue between watch tasks and the dispatcher.
    pub queue_capacity: usize,

    /// Overrides hostname discovery for the liveness key.
    pub hostname: Option<String>,

    pub retry: RetryConfig,
    pub liveness: LivenessConfig,
    pub docker: DockerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub pull: RetryPolicy,
    pub reconnect: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            pull: RetryPolicy::pull(),
            reconnect: RetryPolicy::reconnect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LivenessConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub ttl_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 20,
            ttl_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DockerConfig {
    /// Container CLI used for pull/build/push.
    pub binary: String,
    /// Passed as `--host` when set.
    pub host: Option<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            host: None,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_id: "default".to_string(),
            endpoints: vec![DEFAULT_ENDPOINT.to_string()],
            subscriptions: Vec::new(),
            queue_capacity: 50,
            hostname: None,
            retry: RetryConfig::default(),
            liveness: LivenessConfig::default(),
            docker: DockerConfig::default(),
        }
    }
}

/// Command-line values that replace file values when present.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub cluster_id: Option<String>,
    pub endpoints: Vec<String>,
    pub subscriptions: Vec<String>,
    pub docker_host: Option<String>,
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        let cluster_id = self.cluster_id.trim();
        if cluster_id.is_empty() || cluster_id.contains('/') {
            return Err(anyhow!("cluster_id must be a non-empty name without '/'"));
        }
        if self.endpoints.iter().all(|endpoint| endpoint.trim().is_empty()) {
            return Err(anyhow!("endpoints must list at least one store endpoint"));
        }
        if self.queue_capacity == 0 {
            return Err(anyhow!("queue_capacity must be > 0"));
        }
        self.retry.pull.validate("retry.pull")?;
        if self.retry.pull.max_attempts.is_none() {
            return Err(anyhow!("retry.pull.max_attempts must be set"));
        }
        self.retry.reconnect.validate("retry.reconnect")?;
        if self.liveness.ttl_secs == 0 {
            return Err(anyhow!("liveness.ttl_secs must be > 0"));
        }
        if self.liveness.enabled && self.liveness.interval_secs == 0 {
            return Err(anyhow!("liveness.interval_secs must be > 0"));
        }
        if self.docker.binary.trim().is_empty() {
            return Err(anyhow!("docker.binary can't be empty"));
        }
        Ok(())
    }

    /// Replace file values with non-empty command-line values.
    pub fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(cluster_id) = overrides.cluster_id {
            self.cluster_id = cluster_id;
        }
        if !overrides.endpoints.is_empty() {
            self.endpoints = overrides.endpoints;
        }
        if !overrides.subscriptions.is_empty() {
            self.subscriptions = overrides.subscriptions;
        }
        if overrides.docker_host.is_some() {
            self.docker.host = overrides.docker_host;
        }
    }

    /// Resolve every subscription into a cluster-scoped channel path.
    ///
    /// Duplicates (after normalization) collapse into one channel.
    pub fn channels(&self) -> Result<Vec<ChannelPath>> {
        let mut channels: Vec<ChannelPath> = Vec::with_capacity(self.subscriptions.len());
        for name in &self.subscriptions {
            let channel = ChannelPath::new(&self.cluster_id, name)
                .with_context(|| format!("subscription '{name}'"))?;
            if !channels.contains(&channel) {
                channels.push(channel);
            }
        }
        Ok(channels)
    }

    /// Hostname for the liveness key: config override, then the kernel, then `$HOSTNAME`.
    pub fn resolve_hostname(&self) -> String {
        if let Some(name) = self.hostname.as_deref().map(str::trim)
            && !name.is_empty()
        {
            return name.to_string();
        }
        for path in ["/proc/sys/kernel/hostname", "/etc/hostname"] {
            if let Ok(contents) = fs::read_to_string(path) {
                let name = contents.trim();
                if !name.is_empty() {
                    return name.to_string();
                }
            }
        }
        std::env::var("HOSTNAME")
            .ok()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| UNDEFINED_HOST.to_string())
    }
}

/// `~/.smg/smgd.toml`, when a home directory is known.
pub fn default_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".smg").join("smgd.toml"))
}

/// Load config from a TOML file without validating it.
///
/// If the file is missing, returns `ClusterConfig::default()`. Callers apply
/// overrides and then call [`ClusterConfig::validate`].
pub fn load_config(path: &Path) -> Result<ClusterConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config file missing, using defaults");
        return Ok(ClusterConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ClusterConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(cfg)
}
