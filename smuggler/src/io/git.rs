//! Git adapter that reads the working-copy state used for image naming.

use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::types::VcsState;

/// Length of the commit short id used as an image tag.
pub const SHORT_ID_LEN: usize = 9;

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Read branch, head commit and head tags in one pass.
    #[instrument(skip_all, fields(workdir = %self.workdir.display()))]
    pub fn vcs_state(&self) -> Result<VcsState> {
        let commit_id = self
            .run_capture(&["rev-parse", "--verify", "HEAD"])
            .context("repository has no commits")?
            .trim()
            .to_string();
        let branch = self.current_branch()?;
        let short_id = short_id(&commit_id);
        let tags = self.head_tags()?;
        debug!(branch = %branch, short_id = %short_id, tags = tags.len(), "read vcs state");
        Ok(VcsState {
            branch,
            commit_id,
            short_id,
            tags,
        })
    }

    /// Return the current branch name, or an empty string on a detached HEAD.
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim();
        if name == "HEAD" {
            warn!("detached HEAD, branch is empty");
            return Ok(String::new());
        }
        Ok(name.to_string())
    }

    /// Tags pointing at HEAD, sorted by name.
    pub fn head_tags(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["tag", "--points-at", "HEAD"])?;
        Ok(parse_tag_list(&out))
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn short_id(commit_id: &str) -> String {
    commit_id.chars().take(SHORT_ID_LEN).collect()
}

fn parse_tag_list(out: &str) -> Vec<String> {
    let mut tags: Vec<String> = out
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    tags.sort();
    tags
}
