//! Build pipeline: resolve the rule, name the image, run the `onlyif` check,
//! build and tag, push, then announce the pushed names on every deploy channel.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::broker::SubscriptionBroker;
use crate::core::channel::ChannelPath;
use crate::core::naming::{DEFAULT_DOCKERFILE, ImageReference, name_image};
use crate::core::resolver::{Selector, resolve};
use crate::core::types::{BuildRule, Mode, VcsState};
use crate::io::manifest::Manifest;
use crate::io::process::run_shell_check;
use crate::io::runtime::{ContainerRuntime, RuntimeError};
use crate::io::store::{CoordinationStore, StoreError};

/// Output kept from an `onlyif` check.
const ONLYIF_OUTPUT_LIMIT: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("deploy channel '{channel}' of rule '{rule}' is invalid: {reason}")]
    InvalidChannel {
        rule: String,
        channel: String,
        reason: String,
    },
    #[error("onlyif check `{command}` failed: {detail}")]
    OnlyIfFailed { command: String, detail: String },
    #[error("{step} {image} failed: {source}")]
    Runtime {
        step: &'static str,
        image: String,
        #[source]
        source: RuntimeError,
    },
    #[error("publish to {channels} failed: {source}")]
    Publish {
        channels: String,
        #[source]
        source: StoreError,
    },
}

/// Everything decided before the runtime is touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    pub rule_id: String,
    pub rule: BuildRule,
    pub image: ImageReference,
    pub push: bool,
    pub channels: Vec<ChannelPath>,
}

impl BuildPlan {
    pub fn dockerfile(&self) -> &str {
        self.image.dockerfile.as_deref().unwrap_or(DEFAULT_DOCKERFILE)
    }

    /// Human-readable summary printed by `smg plan`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "rule: {}", self.rule_id);
        let _ = writeln!(out, "push: {}", self.push);
        let _ = writeln!(out, "dockerfile: {}", self.dockerfile());
        if let Some(onlyif) = &self.rule.onlyif {
            let _ = writeln!(out, "onlyif: {onlyif}");
        }
        for channel in &self.channels {
            let _ = writeln!(out, "channel: {channel}");
        }
        for name in self.image.all_names() {
            let _ = writeln!(out, "image: {name}");
        }
        out
    }
}

/// Resolve the active rule and derive the image and channels.
///
/// `tag` is an explicit rule selector from the command line; without it the
/// current branch selects the rule. `force_push` pushes even when the rule
/// doesn't ask for it.
pub fn plan_build(
    manifest: &Manifest,
    vcs: &VcsState,
    tag: Option<&str>,
    force_push: bool,
    cluster_id: &str,
) -> Result<BuildPlan> {
    let selector = match tag {
        Some(tag) => Selector::Explicit(tag),
        None => Selector::Branch(&vcs.branch),
    };
    let (rule_id, rule) = resolve(selector, &manifest.build)?;
    let image = name_image(&manifest.identity(), vcs, Mode::Build, Some(rule))?;
    let channels = rule
        .deploy
        .iter()
        .map(|name| {
            ChannelPath::new(cluster_id, name).map_err(|err| BuildError::InvalidChannel {
                rule: rule_id.to_string(),
                channel: name.clone(),
                reason: format!("{err:#}"),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    debug!(rule = %rule_id, image = %image, "build planned");
    Ok(BuildPlan {
        rule_id: rule_id.to_string(),
        rule: rule.clone(),
        image,
        push: rule.push || force_push,
        channels,
    })
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Working copy used as the build context.
    pub workdir: PathBuf,
    pub onlyif_timeout: Duration,
    /// Remove every local name after the pipeline finishes.
    pub delete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOutcome {
    pub built: Vec<String>,
    pub pushed: Vec<String>,
    /// Values appended across all channels.
    pub published: usize,
}

/// Execute a plan against the runtime and announce the result.
#[instrument(skip_all, fields(rule = %plan.rule_id, image = %plan.image))]
pub async fn run_build<R, S>(
    plan: &BuildPlan,
    options: &BuildOptions,
    runtime: &R,
    broker: &SubscriptionBroker<S>,
) -> Result<BuildOutcome, BuildError>
where
    R: ContainerRuntime,
    S: CoordinationStore,
{
    if let Some(command) = &plan.rule.onlyif {
        run_onlyif(command, &options.workdir, options.onlyif_timeout).await?;
    }

    let names = plan.image.all_names();
    let result = build_push_publish(plan, options, runtime, broker, &names).await;

    if options.delete {
        for name in &names {
            if let Err(err) = runtime.remove(name).await {
                warn!(image = %name, err = %err, "can't remove local image");
            }
        }
    }
    result
}

async fn build_push_publish<R, S>(
    plan: &BuildPlan,
    options: &BuildOptions,
    runtime: &R,
    broker: &SubscriptionBroker<S>,
    names: &[String],
) -> Result<BuildOutcome, BuildError>
where
    R: ContainerRuntime,
    S: CoordinationStore,
{
    let mut outcome = BuildOutcome::default();
    let primary = plan.image.primary();
    let dockerfile = options.workdir.join(plan.dockerfile());

    info!(image = %primary, dockerfile = %dockerfile.display(), "building image");
    runtime
        .build(&primary, &dockerfile, &options.workdir)
        .await
        .map_err(|source| runtime_error("build", &primary, source))?;
    outcome.built.push(primary.clone());
    for name in names.iter().filter(|name| **name != primary) {
        runtime
            .tag(&primary, name)
            .await
            .map_err(|source| runtime_error("tag", name, source))?;
        outcome.built.push(name.clone());
    }

    if !plan.push {
        info!("push disabled by rule, skipping push and publish");
        return Ok(outcome);
    }
    for name in names {
        info!(image = %name, "pushing image");
        runtime
            .push(name)
            .await
            .map_err(|source| runtime_error("push", name, source))?;
        outcome.pushed.push(name.clone());
    }

    if plan.channels.is_empty() {
        debug!("rule has no deploy channels");
        return Ok(outcome);
    }
    outcome.published = broker
        .publish_pull_request(&outcome.pushed, &plan.channels)
        .await
        .map_err(|source| BuildError::Publish {
            channels: plan
                .channels
                .iter()
                .map(ChannelPath::to_string)
                .collect::<Vec<_>>()
                .join(","),
            source,
        })?;
    Ok(outcome)
}

fn runtime_error(step: &'static str, image: &str, source: RuntimeError) -> BuildError {
    BuildError::Runtime {
        step,
        image: image.to_string(),
        source,
    }
}

async fn run_onlyif(command: &str, workdir: &Path, timeout: Duration) -> Result<(), BuildError> {
    info!(command, "running onlyif check");
    let script = command.to_string();
    let dir = workdir.to_path_buf();
    let output = tokio::task::spawn_blocking(move || {
        run_shell_check(&dir, &script, timeout, ONLYIF_OUTPUT_LIMIT)
    })
    .await
    .map_err(|err| onlyif_failed(command, format!("check task failed: {err}")))?
    .map_err(|err| onlyif_failed(command, format!("{err:#}")))?;

    if output.timed_out {
        return Err(onlyif_failed(
            command,
            format!("timed out after {}s", timeout.as_secs()),
        ));
    }
    if !output.passed() {
        let code = output
            .status
            .code()
            .map_or_else(|| "signal".to_string(), |code| code.to_string());
        return Err(onlyif_failed(
            command,
            format!("exit {code}: {}", output.summary()),
        ));
    }
    Ok(())
}

fn onlyif_failed(command: &str, detail: String) -> BuildError {
    BuildError::OnlyIfFailed {
        command: command.to_string(),
        detail,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::resolver::ResolveError;
    use crate::test_support::{MemoryStore, ScriptedRuntime, rule, rules, vcs};

    fn manifest(build: &[(&str, BuildRule)]) -> Manifest {
        Manifest {
            name: "api".to_string(),
            image: None,
            build: rules(build),
        }
    }

    fn options(workdir: &Path) -> BuildOptions {
        BuildOptions {
            workdir: workdir.to_path_buf(),
            onlyif_timeout: Duration::from_secs(10),
            delete: false,
        }
    }

    #[test]
    fn feature_branch_resolves_pattern_rule() {
        let manifest = manifest(&[
            ("master", rule(true, &["web"])),
            ("feature/.*", rule(false, &[])),
        ]);
        let plan = plan_build(&manifest, &vcs("feature/login", "abc123def", &[]), None, false, "prod")
            .expect("plan");
        assert_eq!(plan.rule_id, "feature/.*");
        assert!(!plan.push);
        assert_eq!(
            plan.image.tags,
            vec!["feature.login", "abc123def", "latest"]
        );
    }

    #[test]
    fn explicit_tag_without_match_is_an_error() {
        let manifest = manifest(&[("default", rule(false, &[]))]);
        let err = plan_build(&manifest, &vcs("master", "abc", &[]), Some("v9"), false, "prod")
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ResolveError>(),
            Some(ResolveError::ExplicitTagNotFound { .. })
        ));
    }

    #[test]
    fn escaping_deploy_channel_is_rejected() {
        let manifest = manifest(&[("master", rule(true, &["web", "../machines"]))]);
        let err = plan_build(&manifest, &vcs("master", "abc", &[]), None, false, "prod")
            .unwrap_err();
        match err.downcast_ref::<BuildError>() {
            Some(BuildError::InvalidChannel { rule, channel, .. }) => {
                assert_eq!(rule, "master");
                assert_eq!(channel, "../machines");
            }
            other => panic!("expected invalid channel, got {other:?}"),
        }
    }

    #[test]
    fn render_lists_channels_and_images() {
        let manifest = manifest(&[("master", rule(true, &["web"]))]);
        let plan = plan_build(&manifest, &vcs("master", "abc123def", &[]), None, false, "prod")
            .expect("plan");
        let text = plan.render();
        assert!(text.contains("rule: master\n"));
        assert!(text.contains("channel: prod/subscriptions/web\n"));
        assert!(text.contains("image: api:abc123def\n"));
    }

    #[tokio::test]
    async fn pushed_build_is_announced_on_deploy_channels() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manifest = manifest(&[("master", rule(true, &["web", "jobs"]))]);
        let plan = plan_build(&manifest, &vcs("master", "abc123def", &[]), None, false, "prod")
            .expect("plan");
        let runtime = ScriptedRuntime::new();
        let broker = SubscriptionBroker::new(Arc::new(MemoryStore::new()));

        let outcome = run_build(&plan, &options(temp.path()), &runtime, &broker)
            .await
            .expect("build");

        assert_eq!(outcome.pushed.len(), 3);
        assert_eq!(outcome.published, 6);
        assert_eq!(
            broker.store().values("prod/subscriptions/web"),
            vec!["api:master", "api:abc123def", "api:latest"]
        );
        let calls = runtime.calls();
        assert!(calls[0].starts_with("build api:master "));
        assert_eq!(calls[1], "tag api:master api:abc123def");
    }

    #[tokio::test]
    async fn unpushed_build_publishes_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manifest = manifest(&[("default", rule(false, &["web"]))]);
        let plan = plan_build(&manifest, &vcs("dev", "abc", &[]), None, false, "prod")
            .expect("plan");
        let broker = SubscriptionBroker::new(Arc::new(MemoryStore::new()));
        let outcome = run_build(&plan, &options(temp.path()), &ScriptedRuntime::new(), &broker)
            .await
            .expect("build");
        assert!(outcome.pushed.is_empty());
        assert_eq!(outcome.published, 0);
        assert!(broker.store().values("prod/subscriptions/web").is_empty());
    }

    #[tokio::test]
    async fn failing_onlyif_aborts_before_build() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut gated = rule(true, &["web"]);
        gated.onlyif = Some("test -f missing-file".to_string());
        let manifest = manifest(&[("master", gated)]);
        let plan = plan_build(&manifest, &vcs("master", "abc", &[]), None, false, "prod")
            .expect("plan");
        let runtime = ScriptedRuntime::new();
        let broker = SubscriptionBroker::new(Arc::new(MemoryStore::new()));
        let err = run_build(&plan, &options(temp.path()), &runtime, &broker)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::OnlyIfFailed { .. }));
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn push_failure_stops_publish_and_still_cleans_up() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manifest = manifest(&[("master", rule(true, &["web"]))]);
        let plan = plan_build(&manifest, &vcs("master", "abc", &[]), None, false, "prod")
            .expect("plan");
        let runtime = ScriptedRuntime::new().fail_verb("push");
        let broker = SubscriptionBroker::new(Arc::new(MemoryStore::new()));
        let mut opts = options(temp.path());
        opts.delete = true;
        let err = run_build(&plan, &opts, &runtime, &broker).await.unwrap_err();
        assert!(matches!(err, BuildError::Runtime { step: "push", .. }));
        assert!(broker.store().values("prod/subscriptions/web").is_empty());
        let removed = runtime
            .calls()
            .iter()
            .filter(|call| call.starts_with("rmi "))
            .count();
        assert_eq!(removed, 3);
    }
}
