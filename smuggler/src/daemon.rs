//! Cluster daemon: one watch task per subscribed channel, one dispatcher, and
//! an optional liveness heartbeat, all under a single root cancellation token.
//!
//! # Lifecycle
//!
//! 1. **Creation**: [`ClusterDaemon::new`] validates the config and refuses to
//!    build a daemon without subscriptions.
//! 2. **Operation**: [`ClusterDaemon::start`] spawns every task and returns a
//!    [`DaemonHandle`].
//! 3. **Shutdown**: [`DaemonHandle::stop`] cancels the root token and joins
//!    every task before returning the dispatch report.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::SubscriptionBroker;
use crate::core::channel::{ChannelPath, liveness_key};
use crate::core::lifecycle::{DaemonEvent, DaemonState, DaemonStatus};
use crate::core::retry::RetryPolicy;
use crate::dispatch::{DispatchReport, PullDispatcher, PullSender, pull_queue};
use crate::io::config::ClusterConfig;
use crate::io::runtime::ContainerRuntime;
use crate::io::store::{CoordinationStore, StoreError};

/// `YYYYMMDDHHMMSS` in UTC.
const LIVENESS_FORMAT: &str = "%Y%m%d%H%M%S";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DaemonError {
    #[error("invalid daemon configuration: {0}")]
    Config(String),
}

/// A configured, not yet running daemon.
pub struct ClusterDaemon<S, R> {
    config: ClusterConfig,
    channels: Vec<ChannelPath>,
    broker: SubscriptionBroker<S>,
    runtime: Arc<R>,
}

impl<S, R> ClusterDaemon<S, R>
where
    S: CoordinationStore + 'static,
    R: ContainerRuntime + 'static,
{
    pub fn new(config: ClusterConfig, store: Arc<S>, runtime: Arc<R>) -> Result<Self, DaemonError> {
        let channels = config
            .validate()
            .and_then(|()| config.channels())
            .map_err(|err| reject(format!("{err:#}")))?;
        if channels.is_empty() {
            return Err(reject(
                "no subscription channels configured, refusing to start".to_string(),
            ));
        }
        Ok(Self {
            config,
            channels,
            broker: SubscriptionBroker::new(store),
            runtime,
        })
    }

    pub fn channels(&self) -> &[ChannelPath] {
        &self.channels
    }

    /// Spawn every task. Must be called inside a tokio runtime.
    pub fn start(self) -> DaemonHandle {
        let (state, _) = watch::channel(DaemonStatus::new(self.channels.len()));
        report(&state, DaemonEvent::Start);
        let root = CancellationToken::new();
        let (queue_tx, queue_rx) = pull_queue(self.config.queue_capacity);
        info!(
            cluster_id = %self.config.cluster_id,
            channels = self.channels.len(),
            queue_capacity = self.config.queue_capacity,
            "starting daemon"
        );

        let mut tasks = Vec::with_capacity(self.channels.len() + 1);
        for channel in self.channels {
            tasks.push(tokio::spawn(watch_channel(
                self.broker.clone(),
                channel,
                queue_tx.clone(),
                self.config.retry.reconnect,
                state.clone(),
                root.child_token(),
            )));
        }
        drop(queue_tx);

        if self.config.liveness.enabled {
            let key = liveness_key(&self.config.cluster_id, &self.config.resolve_hostname());
            tasks.push(tokio::spawn(heartbeat(
                self.broker.clone(),
                key,
                Duration::from_secs(self.config.liveness.interval_secs),
                Duration::from_secs(self.config.liveness.ttl_secs),
                root.child_token(),
            )));
        }

        let dispatcher =
            PullDispatcher::new(self.runtime, self.config.retry.pull).with_state(state.clone());
        let dispatch_cancel = root.child_token();
        let dispatcher = tokio::spawn(async move { dispatcher.run(queue_rx, dispatch_cancel).await });

        DaemonHandle {
            root,
            state,
            tasks,
            dispatcher,
        }
    }
}

fn reject(reason: String) -> DaemonError {
    let state = DaemonState::Disconnected.on(DaemonEvent::ConfigRejected);
    error!(state = %state, reason = %reason, "daemon configuration rejected");
    DaemonError::Config(reason)
}

/// Running daemon. Dropping the handle without [`DaemonHandle::stop`] leaves
/// the tasks running until the tokio runtime shuts down.
pub struct DaemonHandle {
    root: CancellationToken,
    state: watch::Sender<DaemonStatus>,
    tasks: Vec<JoinHandle<()>>,
    dispatcher: JoinHandle<DispatchReport>,
}

impl DaemonHandle {
    pub fn state(&self) -> DaemonState {
        self.state.borrow().state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<DaemonStatus> {
        self.state.subscribe()
    }

    /// Cancel every task and wait for all of them to finish.
    pub async fn stop(self) -> DispatchReport {
        info!("stopping daemon");
        self.root.cancel();

        for result in join_all(self.tasks).await {
            if let Err(err) = result {
                error!(err = %err, "daemon task panicked");
            }
        }
        let report = match self.dispatcher.await {
            Ok(report) => report,
            Err(err) => {
                error!(err = %err, "dispatcher task panicked");
                DispatchReport::default()
            }
        };

        crate::daemon::report(&self.state, DaemonEvent::Stop);
        info!(
            pulled = report.pulled,
            dropped = report.dropped,
            rejected = report.rejected,
            discarded = report.discarded,
            "daemon stopped"
        );
        report
    }
}

fn report(state: &watch::Sender<DaemonStatus>, event: DaemonEvent) {
    state.send_modify(|current| *current = current.on(event));
}

/// Follow one channel until cancelled, forwarding every value to the queue.
async fn watch_channel<S: CoordinationStore>(
    broker: SubscriptionBroker<S>,
    channel: ChannelPath,
    queue: PullSender,
    policy: RetryPolicy,
    state: watch::Sender<DaemonStatus>,
    cancel: CancellationToken,
) {
    let Some(mut watcher) =
        retry_store(&channel, &policy, &cancel, || broker.subscribe(channel.clone())).await
    else {
        return;
    };
    info!(channel = %channel, index = watcher.next_index(), "watching channel");
    report(&state, DaemonEvent::Connected);

    // Spans consecutive watch failures; only a delivered value resets it.
    let mut backoff = policy.backoff();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = watcher.next() => next,
        };
        match next {
            Ok(request) => {
                backoff.reset();
                debug!(channel = %channel, image = %request.image, "pull request received");
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    sent = queue.send(request) => sent,
                };
                if sent.is_err() {
                    debug!(channel = %channel, "pull queue closed");
                    break;
                }
            }
            Err(err) => {
                let failures = backoff.retries() + 1;
                if err.is_transient() {
                    warn!(channel = %channel, err = %err, failures, "watch interrupted");
                } else {
                    error!(channel = %channel, err = %err, failures, "watch rejected by store");
                }
                report(&state, DaemonEvent::ConnectionLost);
                if !policy.allows(failures) {
                    error!(channel = %channel, failures, "giving up on channel");
                    break;
                }
                let delay = policy.with_jitter(backoff.next_delay(), rand::random::<f64>());
                debug!(
                    channel = %channel,
                    delay_ms = delay.as_millis() as u64,
                    "rewatching after delay"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                if retry_store(&channel, &policy, &cancel, || watcher.reconnect())
                    .await
                    .is_none()
                {
                    break;
                }
                info!(channel = %channel, index = watcher.next_index(), "watch resumed");
                report(&state, DaemonEvent::Connected);
            }
        }
    }
    debug!(channel = %channel, "watch task finished");
}

/// Run `attempt` until it succeeds, sleeping per `policy` between failures.
///
/// Returns `None` when cancelled or when a bounded policy runs out.
async fn retry_store<T, F, Fut>(
    channel: &ChannelPath,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut backoff = policy.backoff();
    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            outcome = attempt() => outcome,
        };
        let err = match outcome {
            Ok(value) => return Some(value),
            Err(err) => err,
        };
        if !policy.allows(backoff.retries() + 1) {
            error!(channel = %channel, err = %err, attempts = backoff.retries() + 1, "giving up on channel");
            return None;
        }
        let delay = policy.with_jitter(backoff.next_delay(), rand::random::<f64>());
        warn!(
            channel = %channel,
            attempt = backoff.retries(),
            err = %err,
            delay_ms = delay.as_millis() as u64,
            "coordination store unavailable, retrying"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Refresh the liveness key every `interval` until cancelled.
async fn heartbeat<S: CoordinationStore>(
    broker: SubscriptionBroker<S>,
    key: String,
    interval: Duration,
    ttl: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(key = %key, "liveness heartbeat started");
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let stamp = liveness_timestamp(Utc::now());
        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            written = broker.set_with_ttl(&key, &stamp, ttl) => written,
        };
        match written {
            Ok(()) => debug!(key = %key, stamp = %stamp, "liveness refreshed"),
            Err(err) => warn!(key = %key, err = %err, "liveness refresh failed"),
        }
    }
}

pub fn liveness_timestamp(now: DateTime<Utc>) -> String {
    now.format(LIVENESS_FORMAT).to_string()
}
