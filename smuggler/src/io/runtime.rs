//! Container runtime abstraction.
//!
//! The [`ContainerRuntime`] trait decouples the dispatcher and the build
//! pipeline from the container engine. [`DockerCli`] shells out to the
//! `docker` client; tests use the scripted runtime from `test_support`.

use std::future::Future;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::io::config::DockerConfig;

/// Stderr kept in a failure report.
const STDERR_LIMIT: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("can't run `{command}`: {reason}")]
    Spawn { command: String, reason: String },
    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
}

/// Image operations the engine needs from the container engine.
pub trait ContainerRuntime: Send + Sync {
    /// Fetch `image` (`name:tag`) into the local image store.
    fn pull(&self, image: &str) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    /// Build `image` from `dockerfile` using `context` as the build context.
    fn build(
        &self,
        image: &str,
        dockerfile: &Path,
        context: &Path,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    /// Add `target` as another name of `source`.
    fn tag(
        &self,
        source: &str,
        target: &str,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn push(&self, image: &str) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn remove(&self, image: &str) -> impl Future<Output = Result<(), RuntimeError>> + Send;
}

/// Runtime backed by the `docker` command-line client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
    host: Option<String>,
}

impl DockerCli {
    pub fn new(config: &DockerConfig) -> Self {
        Self {
            binary: PathBuf::from(&config.binary),
            host: config.host.clone(),
        }
    }

    fn command_line(&self, args: &[&str]) -> Vec<String> {
        let mut line = Vec::with_capacity(args.len() + 2);
        if let Some(host) = &self.host {
            line.push("--host".to_string());
            line.push(host.clone());
        }
        line.extend(args.iter().map(|arg| arg.to_string()));
        line
    }

    async fn run(&self, args: &[&str]) -> Result<(), RuntimeError> {
        let line = self.command_line(args);
        let rendered = format!("{} {}", self.binary.display(), line.join(" "));
        debug!(command = %rendered, "running container command");
        let output = Command::new(&self.binary)
            .args(&line)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| RuntimeError::Spawn {
                command: rendered.clone(),
                reason: err.to_string(),
            })?;
        if output.status.success() {
            return Ok(());
        }
        let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.len() > STDERR_LIMIT {
            let mut cut = STDERR_LIMIT;
            while !stderr.is_char_boundary(cut) {
                cut -= 1;
            }
            stderr.truncate(cut);
        }
        warn!(command = %rendered, exit_code = ?output.status.code(), "container command failed");
        Err(RuntimeError::CommandFailed {
            command: rendered,
            status: output.status.to_string(),
            stderr,
        })
    }
}

impl ContainerRuntime for DockerCli {
    #[instrument(skip(self))]
    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        self.run(&["pull", image]).await
    }

    #[instrument(skip(self))]
    async fn build(&self, image: &str, dockerfile: &Path, context: &Path) -> Result<(), RuntimeError> {
        let dockerfile = dockerfile.to_string_lossy();
        let context = context.to_string_lossy();
        self.run(&["build", "--tag", image, "--file", &dockerfile, &context])
            .await
    }

    async fn tag(&self, source: &str, target: &str) -> Result<(), RuntimeError> {
        self.run(&["tag", source, target]).await
    }

    #[instrument(skip(self))]
    async fn push(&self, image: &str) -> Result<(), RuntimeError> {
        self.run(&["push", image]).await
    }

    async fn remove(&self, image: &str) -> Result<(), RuntimeError> {
        self.run(&["rmi", image]).await
    }
}
