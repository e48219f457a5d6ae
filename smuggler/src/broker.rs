//! Pull-request channels over the coordination store.
//!
//! Publishing appends a bare `name:tag` value under the channel directory.
//! Watching follows the directory by store index, so a watcher that hits a
//! transport error and retries picks up where it stopped. Errors are handed
//! back to the caller; reconnect policy lives in the daemon.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::core::channel::ChannelPath;
use crate::core::types::PullRequest;
use crate::io::store::{CoordinationStore, StoreEntry, StoreError};

/// Publish/watch front end shared by the build CLI and the daemon.
#[derive(Debug)]
pub struct SubscriptionBroker<S> {
    store: Arc<S>,
}

impl<S> Clone for SubscriptionBroker<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: CoordinationStore> SubscriptionBroker<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Append `value` to the channel, creating the channel directory first.
    #[instrument(skip(self), fields(channel = %channel))]
    pub async fn publish(&self, channel: &ChannelPath, value: &str) -> Result<StoreEntry, StoreError> {
        let key = channel.key();
        self.store.ensure_dir(&key).await?;
        let entry = self.store.append(&key, value).await?;
        debug!(entry = %entry.key, index = entry.index, "published");
        Ok(entry)
    }

    /// Announce every image on every channel.
    ///
    /// Channels are visited in order and images are appended in order, so a
    /// watcher sees the images of one build in the order given. Stops at the
    /// first store error and returns the number of values published.
    pub async fn publish_pull_request(
        &self,
        images: &[String],
        channels: &[ChannelPath],
    ) -> Result<usize, StoreError> {
        let mut published = 0;
        for channel in channels {
            let key = channel.key();
            self.store.ensure_dir(&key).await?;
            for image in images {
                let entry = self.store.append(&key, image).await?;
                debug!(channel = %channel, image = %image, index = entry.index, "pull request published");
                published += 1;
            }
            info!(channel = %channel, images = images.len(), "announced images");
        }
        Ok(published)
    }

    /// Open a watcher that delivers values published after this call.
    #[instrument(skip(self), fields(channel = %channel))]
    pub async fn subscribe(&self, channel: ChannelPath) -> Result<ChannelWatcher<S>, StoreError> {
        let index = self.store.ensure_dir(&channel.key()).await?;
        debug!(index, "subscribed");
        Ok(ChannelWatcher {
            store: Arc::clone(&self.store),
            key: channel.key(),
            channel,
            next_index: index + 1,
        })
    }

    /// Write a key that expires after `ttl` unless written again.
    pub async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.store.set_with_ttl(key, value, ttl).await
    }
}

/// Cursor over one channel; owns the store index to resume from.
#[derive(Debug)]
pub struct ChannelWatcher<S> {
    store: Arc<S>,
    channel: ChannelPath,
    key: String,
    next_index: u64,
}

impl<S: CoordinationStore> ChannelWatcher<S> {
    pub fn channel(&self) -> &ChannelPath {
        &self.channel
    }

    /// Store index the next watch starts at.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Check the store is reachable again without moving the cursor.
    pub async fn reconnect(&self) -> Result<(), StoreError> {
        self.store.ensure_dir(&self.key).await.map(|_| ())
    }

    /// Wait for the next published value.
    ///
    /// Directory and removal events are skipped. When the store has compacted
    /// past the cursor, the watcher jumps to the store's current index and
    /// carries on. Values published in the gap are lost and the value at the
    /// current index may be delivered twice.
    pub async fn next(&mut self) -> Result<PullRequest, StoreError> {
        loop {
            let event = match self.store.watch(&self.key, self.next_index).await {
                Ok(event) => event,
                Err(StoreError::EventIndexCleared {
                    requested, current, ..
                }) => {
                    warn!(
                        channel = %self.channel,
                        requested,
                        current,
                        "watch history compacted, resuming from current index"
                    );
                    self.next_index = current;
                    continue;
                }
                Err(err) => return Err(err),
            };
            self.next_index = self.next_index.max(event.index + 1);
            match event.value {
                Some(image) if event.is_new_value() => {
                    return Ok(PullRequest {
                        image,
                        channel: self.channel.name().to_string(),
                    });
                }
                _ => debug!(action = %event.action, key = %event.key, "skipping event"),
            }
        }
    }
}
