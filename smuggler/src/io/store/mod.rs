//! Coordination store abstraction.
//!
//! The [`CoordinationStore`] trait is the seam between the subscription broker
//! and the distributed key/value service. It provides ordered-append
//! directories, a long-poll watch resumable by store index, and TTL keys.
//! [`EtcdClient`] speaks the etcd v2 key API; tests use the in-process store
//! from `test_support`.

mod etcd;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

pub use etcd::{DEFAULT_ENDPOINT, EtcdClient};

/// Value appended to an ordered directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    /// Store-assigned key, ordered within the directory.
    pub key: String,
    pub value: String,
    /// Store index at which the entry was created.
    pub index: u64,
}

/// One change observed by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Store action (`create`, `set`, `delete`, `expire`, ...).
    pub action: String,
    pub key: String,
    /// `None` for directories and removals.
    pub value: Option<String>,
    pub index: u64,
}

impl WatchEvent {
    /// True when the event carries a freshly written value.
    pub fn is_new_value(&self) -> bool {
        matches!(self.action.as_str(), "create" | "set" | "update" | "compareAndSwap")
            && self.value.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("can't reach coordination store ({endpoints}): {reason}")]
    Connect { endpoints: String, reason: String },
    #[error("watch on {key} interrupted: {reason}")]
    WatchTransport { key: String, reason: String },
    #[error("watch index {requested} on {key} was compacted (store is at {current})")]
    EventIndexCleared {
        key: String,
        requested: u64,
        current: u64,
    },
    #[error("store rejected {key}: {message} (code {code})")]
    Api {
        key: String,
        code: u32,
        message: String,
    },
    #[error("decode store response for {key}: {reason}")]
    Decode { key: String, reason: String },
}

impl StoreError {
    /// Errors a caller should answer with a reconnect rather than a report.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Connect { .. }
                | StoreError::WatchTransport { .. }
                | StoreError::EventIndexCleared { .. }
                | StoreError::Decode { .. }
        )
    }
}

/// Distributed key/value service used for channels and liveness keys.
///
/// Implementations must be safe for concurrent use by every watch task.
pub trait CoordinationStore: Send + Sync {
    /// Create the directory if it is missing and return the current store index.
    fn ensure_dir(&self, key: &str) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Append `value` under `dir` with a store-assigned, monotonically ordered key.
    fn append(
        &self,
        dir: &str,
        value: &str,
    ) -> impl Future<Output = Result<StoreEntry, StoreError>> + Send;

    /// Block until a change at index `>= wait_index` appears under `dir`.
    fn watch(
        &self,
        dir: &str,
        wait_index: u64,
    ) -> impl Future<Output = Result<WatchEvent, StoreError>> + Send;

    /// Set `key` to `value`, expiring after `ttl` unless refreshed.
    fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}
