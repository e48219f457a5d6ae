//! Coordination-store key layout, always scoped by cluster id.

use std::fmt;

use anyhow::{Result, bail};

/// Path of one pull-request channel: `<cluster>/subscriptions/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelPath {
    cluster_id: String,
    name: String,
}

impl ChannelPath {
    /// Build a channel path, normalizing the channel name like a relative path
    /// (`./a//b/` -> `a/b`). Names that escape the cluster prefix are rejected.
    pub fn new(cluster_id: &str, channel: &str) -> Result<Self> {
        let cluster_id = cluster_id.trim();
        if cluster_id.is_empty() || cluster_id.contains('/') {
            bail!("invalid cluster id '{cluster_id}'");
        }
        let name = clean_segments(channel)?;
        Ok(Self {
            cluster_id: cluster_id.to_string(),
            name,
        })
    }

    /// Normalized channel name without the cluster prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store key of the channel directory.
    pub fn key(&self) -> String {
        format!("{}/subscriptions/{}", self.cluster_id, self.name)
    }
}

impl fmt::Display for ChannelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Liveness key of one daemon host: `<cluster>/machines/<host>/alive`.
pub fn liveness_key(cluster_id: &str, hostname: &str) -> String {
    format!("{cluster_id}/machines/{hostname}/alive")
}

fn clean_segments(channel: &str) -> Result<String> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in channel.trim().split('/') {
        match segment {
            "" | "." => {}
            ".." => bail!("channel '{channel}' escapes the subscription directory"),
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        bail!("channel name can't be empty");
    }
    Ok(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_key_is_cluster_scoped() {
        let channel = ChannelPath::new("prod", "web").expect("channel");
        assert_eq!(channel.key(), "prod/subscriptions/web");
        let other = ChannelPath::new("staging", "web").expect("channel");
        assert_ne!(channel.key(), other.key());
    }

    #[test]
    fn channel_names_are_cleaned() {
        let channel = ChannelPath::new("default", "./teams//web/").expect("channel");
        assert_eq!(channel.name(), "teams/web");
        assert_eq!(channel.key(), "default/subscriptions/teams/web");
    }

    #[test]
    fn rejects_empty_and_escaping_names() {
        assert!(ChannelPath::new("default", "").is_err());
        assert!(ChannelPath::new("default", "/./").is_err());
        assert!(ChannelPath::new("default", "../machines").is_err());
        assert!(ChannelPath::new("", "web").is_err());
        assert!(ChannelPath::new("a/b", "web").is_err());
    }

    #[test]
    fn liveness_key_layout() {
        assert_eq!(liveness_key("prod", "node-1"), "prod/machines/node-1/alive");
    }
}
