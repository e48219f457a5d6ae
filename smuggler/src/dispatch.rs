//! Pull dispatcher: drains the pull queue one request at a time.
//!
//! Watch tasks push onto a bounded queue; when it is full they wait, which is
//! the only backpressure between the store and the container runtime. Each
//! request is validated, then pulled with the configured retry policy. A
//! request that exhausts its attempts is dropped and the loop moves on.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::lifecycle::{DaemonEvent, DaemonStatus};
use crate::core::naming::parse_image_reference;
use crate::core::retry::RetryPolicy;
use crate::core::types::PullRequest;
use crate::io::runtime::{ContainerRuntime, RuntimeError};

pub type PullSender = mpsc::Sender<PullRequest>;
pub type PullReceiver = mpsc::Receiver<PullRequest>;

/// Bounded queue between watch tasks and the dispatcher.
pub fn pull_queue(capacity: usize) -> (PullSender, PullReceiver) {
    mpsc::channel(capacity.max(1))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PullError {
    #[error("rejected '{image}' from channel {channel}: {reason}")]
    Rejected {
        image: String,
        channel: String,
        reason: String,
    },
    #[error("pull of {image} failed after {attempts} attempts: {last}")]
    Exhausted {
        image: String,
        attempts: u32,
        last: RuntimeError,
    },
    #[error("pull of {image} interrupted by shutdown")]
    Cancelled { image: String },
}

/// Outcome counts of one dispatcher run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub pulled: usize,
    /// Requests dropped after exhausting their attempts.
    pub dropped: usize,
    /// Values that are not image references.
    pub rejected: usize,
    /// Requests still queued or in flight at shutdown.
    pub discarded: usize,
}

pub struct PullDispatcher<R> {
    runtime: Arc<R>,
    policy: RetryPolicy,
    state: Option<watch::Sender<DaemonStatus>>,
}

impl<R: ContainerRuntime> PullDispatcher<R> {
    pub fn new(runtime: Arc<R>, policy: RetryPolicy) -> Self {
        Self {
            runtime,
            policy,
            state: None,
        }
    }

    /// Report `PullStarted`/`PullFinished` on a shared daemon state.
    pub fn with_state(mut self, state: watch::Sender<DaemonStatus>) -> Self {
        self.state = Some(state);
        self
    }

    fn report(&self, event: DaemonEvent) {
        if let Some(state) = &self.state {
            state.send_modify(|current| *current = current.on(event));
        }
    }

    /// Drain `queue` until it closes or `cancel` fires.
    ///
    /// On cancellation the queue is closed and whatever is still buffered is
    /// counted as discarded.
    pub async fn run(&self, mut queue: PullReceiver, cancel: CancellationToken) -> DispatchReport {
        let mut report = DispatchReport::default();
        loop {
            let request = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = queue.recv() => match next {
                    Some(request) => request,
                    None => break,
                },
            };
            self.report(DaemonEvent::PullStarted);
            match self.dispatch(&request, &cancel).await {
                Ok(attempts) => {
                    info!(image = %request.image, channel = %request.channel, attempts, "image pulled");
                    report.pulled += 1;
                }
                Err(err @ PullError::Rejected { .. }) => {
                    warn!(err = %err, "ignoring unusable pull request");
                    report.rejected += 1;
                }
                Err(err @ PullError::Exhausted { .. }) => {
                    warn!(err = %err, "dropping pull request");
                    report.dropped += 1;
                }
                Err(PullError::Cancelled { image }) => {
                    debug!(image = %image, "pull abandoned on shutdown");
                    report.discarded += 1;
                }
            }
            self.report(DaemonEvent::PullFinished);
        }

        queue.close();
        while let Ok(request) = queue.try_recv() {
            debug!(image = %request.image, channel = %request.channel, "discarding queued pull request");
            report.discarded += 1;
        }
        if report.discarded > 0 {
            warn!(discarded = report.discarded, "pull requests discarded at shutdown");
        }
        report
    }

    /// Pull one request, returning the number of attempts it took.
    #[instrument(skip(self, cancel), fields(image = %request.image, channel = %request.channel))]
    pub async fn dispatch(
        &self,
        request: &PullRequest,
        cancel: &CancellationToken,
    ) -> Result<u32, PullError> {
        let image = parse_image_reference(&request.image)
            .map_err(|err| PullError::Rejected {
                image: request.image.clone(),
                channel: request.channel.clone(),
                reason: err.to_string(),
            })?
            .primary();

        let mut backoff = self.policy.backoff();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PullError::Cancelled { image: image.clone() }),
                outcome = self.runtime.pull(&image) => outcome,
            };
            let err = match outcome {
                Ok(()) => return Ok(attempts),
                Err(err) => err,
            };
            if !self.policy.allows(attempts) {
                return Err(PullError::Exhausted {
                    image,
                    attempts,
                    last: err,
                });
            }
            let delay = self
                .policy
                .with_jitter(backoff.next_delay(), rand::random::<f64>());
            warn!(attempt = attempts, err = %err, delay_ms = delay.as_millis() as u64, "pull failed, retrying");
            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(PullError::Cancelled { image }),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
