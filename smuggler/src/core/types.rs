//! Shared deterministic types for build resolution and image distribution.
//!
//! These types define stable contracts between core components. They carry no
//! handles to external state and are cheap to clone.

use serde::{Deserialize, Serialize};

/// Declared build behavior for one branch key of the application manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildRule {
    /// Push every tag after a successful build.
    pub push: bool,
    /// Channel names that receive a pull request once the image is pushed.
    pub deploy: Vec<String>,
    /// Explicit image name; falls back to the application name.
    pub name: Option<String>,
    /// Dockerfile path relative to the working copy.
    pub dockerfile: Option<String>,
    /// Shell command that must succeed before building.
    pub onlyif: Option<String>,
}

/// Identity of the application being built or run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppIdentity {
    pub name: String,
    /// Externally supplied image; `None` means the image is built locally.
    pub image: Option<String>,
}

/// Snapshot of the working copy, read once per build invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VcsState {
    /// Empty on a detached HEAD.
    pub branch: String,
    pub commit_id: String,
    /// First 9 hex characters of `commit_id`.
    pub short_id: String,
    /// Tags pointing at HEAD, in enumeration order.
    pub tags: Vec<String>,
}

/// Whether an image reference is derived for a build or a local run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Build,
    Run,
}

/// A "fetch this image" notice in flight between a channel and the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    /// Bare image reference string as published.
    pub image: String,
    /// Channel name the notice arrived on.
    pub channel: String,
}
