//! Test-only fakes for the coordination store and the container runtime,
//! plus small builders for rules, VCS state and configs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};

use crate::core::retry::RetryPolicy;
use crate::core::types::{BuildRule, VcsState};
use crate::io::config::ClusterConfig;
use crate::io::runtime::{ContainerRuntime, RuntimeError};
use crate::io::store::{CoordinationStore, StoreEntry, StoreError, WatchEvent};

/// In-process coordination store with etcd-like index semantics.
///
/// Every write bumps the store index and is kept as an event, so watches can
/// resume from any index at or above the compaction floor.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    changed: Notify,
}

#[derive(Debug, Default)]
struct StoreState {
    index: u64,
    floor: u64,
    dirs: HashSet<String>,
    events: Vec<WatchEvent>,
    ttl_keys: BTreeMap<String, (String, Duration)>,
    watch_faults: Vec<StoreError>,
    unreachable: bool,
    connects: usize,
    watches: usize,
}

impl StoreState {
    fn record(&mut self, action: &str, key: &str, value: Option<String>) -> u64 {
        self.index += 1;
        self.events.push(WatchEvent {
            action: action.to_string(),
            key: key.to_string(),
            value,
            index: self.index,
        });
        self.index
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.unreachable {
            return Err(StoreError::Connect {
                endpoints: "memory".to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().expect("memory store lock")
    }

    /// Make the next watch call fail with `err`. Faults queue up in order.
    pub fn fail_next_watch(&self, err: StoreError) {
        self.lock().watch_faults.insert(0, err);
        self.changed.notify_waiters();
    }

    /// Refuse every request with a connection error until cleared.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
        self.changed.notify_waiters();
    }

    /// Drop all history up to the current index.
    pub fn compact(&self) {
        let mut state = self.lock();
        state.floor = state.index + 1;
    }

    /// Values appended directly under `dir`, in order.
    pub fn values(&self, dir: &str) -> Vec<String> {
        let prefix = format!("{dir}/");
        self.lock()
            .events
            .iter()
            .filter(|event| event.action == "create" && event.key.starts_with(&prefix))
            .filter_map(|event| event.value.clone())
            .collect()
    }

    pub fn ttl_key(&self, key: &str) -> Option<(String, Duration)> {
        self.lock().ttl_keys.get(key).cloned()
    }

    /// Number of `ensure_dir` calls, i.e. connects and reconnects.
    pub fn connect_calls(&self) -> usize {
        self.lock().connects
    }

    pub fn watch_calls(&self) -> usize {
        self.lock().watches
    }
}

impl CoordinationStore for MemoryStore {
    async fn ensure_dir(&self, key: &str) -> Result<u64, StoreError> {
        let mut state = self.lock();
        state.connects += 1;
        state.check_reachable()?;
        if state.dirs.insert(key.to_string()) {
            state.record("set", key, None);
            self.changed.notify_waiters();
        }
        Ok(state.index)
    }

    async fn append(&self, dir: &str, value: &str) -> Result<StoreEntry, StoreError> {
        let mut state = self.lock();
        state.check_reachable()?;
        state.dirs.insert(dir.to_string());
        let key = format!("{dir}/{:020}", state.index + 1);
        let index = state.record("create", &key, Some(value.to_string()));
        self.changed.notify_waiters();
        Ok(StoreEntry {
            key,
            value: value.to_string(),
            index,
        })
    }

    async fn watch(&self, dir: &str, wait_index: u64) -> Result<WatchEvent, StoreError> {
        let prefix = format!("{dir}/");
        let mut counted = false;
        loop {
            let notified = self.changed.notified();
            {
                let mut state = self.lock();
                if !counted {
                    state.watches += 1;
                    counted = true;
                }
                if let Some(err) = state.watch_faults.pop() {
                    return Err(err);
                }
                state.check_reachable()?;
                if wait_index < state.floor {
                    return Err(StoreError::EventIndexCleared {
                        key: dir.to_string(),
                        requested: wait_index,
                        current: state.index,
                    });
                }
                let found = state.events.iter().find(|event| {
                    event.index >= wait_index && (event.key == dir || event.key.starts_with(&prefix))
                });
                if let Some(event) = found {
                    return Ok(event.clone());
                }
            }
            notified.await;
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.check_reachable()?;
        state
            .ttl_keys
            .insert(key.to_string(), (value.to_string(), ttl));
        state.record("set", key, Some(value.to_string()));
        self.changed.notify_waiters();
        Ok(())
    }
}

/// Container runtime that records calls and fails on request.
#[derive(Debug, Default)]
pub struct ScriptedRuntime {
    script: Mutex<RuntimeScript>,
    gate: Option<Semaphore>,
}

#[derive(Debug, Default)]
struct RuntimeScript {
    pull_failures: HashMap<String, u32>,
    broken_images: HashSet<String>,
    failing_verbs: HashSet<String>,
    attempts: HashMap<String, u32>,
    pulled: Vec<String>,
    calls: Vec<String>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every pull waits for a permit from [`ScriptedRuntime::release`].
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        }
    }

    pub fn release(&self, pulls: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(pulls);
        }
    }

    /// Fail the first `times` pulls of `image`.
    pub fn fail_pull_times(self, image: &str, times: u32) -> Self {
        self.lock().pull_failures.insert(image.to_string(), times);
        self
    }

    /// Fail every pull of `image`.
    pub fn fail_pull_always(self, image: &str) -> Self {
        self.lock().broken_images.insert(image.to_string());
        self
    }

    /// Fail every `build`, `tag`, `push` or `rmi` call.
    pub fn fail_verb(self, verb: &str) -> Self {
        self.lock().failing_verbs.insert(verb.to_string());
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RuntimeScript> {
        self.script.lock().expect("runtime script lock")
    }

    /// Images pulled successfully, in order.
    pub fn pulled(&self) -> Vec<String> {
        self.lock().pulled.clone()
    }

    pub fn pull_attempts(&self, image: &str) -> u32 {
        self.lock().attempts.get(image).copied().unwrap_or(0)
    }

    /// Every non-pull call as `verb arg...`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    fn record(&self, verb: &str, args: &[&str]) -> Result<(), RuntimeError> {
        let command = std::iter::once(verb)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        let mut script = self.lock();
        script.calls.push(command.clone());
        if script.failing_verbs.contains(verb) {
            return Err(RuntimeError::CommandFailed {
                command,
                status: "exit status: 1".to_string(),
                stderr: format!("scripted {verb} failure"),
            });
        }
        Ok(())
    }
}

impl ContainerRuntime for ScriptedRuntime {
    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("runtime gate").forget();
        }
        let mut guard = self.lock();
        let script = &mut *guard;
        *script.attempts.entry(image.to_string()).or_default() += 1;
        let failing = match script.pull_failures.get_mut(image) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => script.broken_images.contains(image),
        };
        if failing {
            return Err(RuntimeError::CommandFailed {
                command: format!("docker pull {image}"),
                status: "exit status: 1".to_string(),
                stderr: "manifest unknown".to_string(),
            });
        }
        script.pulled.push(image.to_string());
        Ok(())
    }

    async fn build(&self, image: &str, dockerfile: &Path, _context: &Path) -> Result<(), RuntimeError> {
        self.record("build", &[image, &dockerfile.to_string_lossy()])
    }

    async fn tag(&self, source: &str, target: &str) -> Result<(), RuntimeError> {
        self.record("tag", &[source, target])
    }

    async fn push(&self, image: &str) -> Result<(), RuntimeError> {
        self.record("push", &[image])
    }

    async fn remove(&self, image: &str) -> Result<(), RuntimeError> {
        self.record("rmi", &[image])
    }
}

/// Build rule with the given push flag and deploy channels.
pub fn rule(push: bool, deploy: &[&str]) -> BuildRule {
    BuildRule {
        push,
        deploy: deploy.iter().map(|channel| channel.to_string()).collect(),
        ..BuildRule::default()
    }
}

pub fn rules(entries: &[(&str, BuildRule)]) -> BTreeMap<String, BuildRule> {
    entries
        .iter()
        .map(|(key, rule)| (key.to_string(), rule.clone()))
        .collect()
}

/// VCS state whose commit id starts with `short_id`.
pub fn vcs(branch: &str, short_id: &str, tags: &[&str]) -> VcsState {
    VcsState {
        branch: branch.to_string(),
        commit_id: format!("{short_id}{}", "0".repeat(40usize.saturating_sub(short_id.len()))),
        short_id: short_id.to_string(),
        tags: tags.iter().map(|tag| tag.to_string()).collect(),
    }
}

/// Cluster config with fast, delay-free retries for tests.
pub fn cluster_config(cluster_id: &str, subscriptions: &[&str]) -> ClusterConfig {
    let mut cfg = ClusterConfig {
        cluster_id: cluster_id.to_string(),
        subscriptions: subscriptions.iter().map(|name| name.to_string()).collect(),
        ..ClusterConfig::default()
    };
    cfg.retry.pull = RetryPolicy::immediate(Some(3));
    cfg.retry.reconnect = RetryPolicy {
        max_attempts: None,
        base_delay_ms: 1,
        max_delay_ms: 10,
        jitter_ms: 0,
    };
    cfg.hostname = Some("test-node".to_string());
    cfg
}
