//! End-to-end daemon behavior against the in-process store and runtime.

use std::sync::Arc;
use std::time::Duration;

use smuggler::broker::SubscriptionBroker;
use smuggler::core::channel::ChannelPath;
use smuggler::core::lifecycle::DaemonState;
use smuggler::core::retry::RetryPolicy;
use smuggler::daemon::{ClusterDaemon, DaemonHandle};
use smuggler::io::store::StoreError;
use smuggler::test_support::{MemoryStore, ScriptedRuntime, cluster_config};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn channel(name: &str) -> ChannelPath {
    ChannelPath::new("prod", name).expect("channel")
}

fn start(
    store: &Arc<MemoryStore>,
    runtime: &Arc<ScriptedRuntime>,
    subscriptions: &[&str],
    queue_capacity: usize,
) -> DaemonHandle {
    let mut config = cluster_config("prod", subscriptions);
    config.queue_capacity = queue_capacity;
    ClusterDaemon::new(config, Arc::clone(store), Arc::clone(runtime))
        .expect("daemon")
        .start()
}

async fn wait_for_state(handle: &DaemonHandle, wanted: DaemonState) {
    let mut rx = handle.subscribe_state();
    timeout(WAIT, rx.wait_for(|status| status.state() == wanted))
        .await
        .expect("state change in time")
        .expect("state sender alive");
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn publish(store: &Arc<MemoryStore>, channel_name: &str, images: &[&str]) {
    let broker = SubscriptionBroker::new(Arc::clone(store));
    for image in images {
        broker
            .publish(&channel(channel_name), image)
            .await
            .expect("publish");
    }
}

#[tokio::test]
async fn pulls_every_published_image_in_order() {
    let store = Arc::new(MemoryStore::new());
    let runtime = Arc::new(ScriptedRuntime::new());
    let handle = start(&store, &runtime, &["web"], 50);
    wait_for_state(&handle, DaemonState::Watching).await;

    publish(&store, "web", &["api:1", "api:2", "api:3", "api:4"]).await;
    eventually("four pulls", || runtime.pulled().len() == 4).await;

    let report = handle.stop().await;
    assert_eq!(runtime.pulled(), vec!["api:1", "api:2", "api:3", "api:4"]);
    assert_eq!(report.pulled, 4);
    assert_eq!(report.dropped, 0);
}

#[tokio::test]
async fn failing_pull_is_dropped_and_later_requests_proceed() {
    let store = Arc::new(MemoryStore::new());
    let runtime = Arc::new(
        ScriptedRuntime::new()
            .fail_pull_always("api:broken")
            .fail_pull_times("api:flaky", 2),
    );
    let handle = start(&store, &runtime, &["web"], 50);
    wait_for_state(&handle, DaemonState::Watching).await;

    publish(&store, "web", &["api:broken", "api:flaky", "not:a:reference", "api:ok"]).await;
    eventually("good pulls", || runtime.pulled().len() == 2).await;

    let report = handle.stop().await;
    assert_eq!(runtime.pulled(), vec!["api:flaky", "api:ok"]);
    assert_eq!(runtime.pull_attempts("api:broken"), 3);
    assert_eq!(runtime.pull_attempts("api:flaky"), 3);
    assert_eq!(report.pulled, 2);
    assert_eq!(report.dropped, 1);
    assert_eq!(report.rejected, 1);
}

#[tokio::test]
async fn full_queue_holds_back_the_watcher() {
    let store = Arc::new(MemoryStore::new());
    let runtime = Arc::new(ScriptedRuntime::gated());
    let handle = start(&store, &runtime, &["web"], 2);
    wait_for_state(&handle, DaemonState::Watching).await;

    publish(&store, "web", &["api:1", "api:2", "api:3", "api:4", "api:5"]).await;
    // One request in the dispatcher, two queued, one held by the watcher.
    eventually("watcher blocked on the queue", || store.watch_calls() == 4).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.watch_calls(), 4);
    assert!(runtime.pulled().is_empty());

    runtime.release(5);
    eventually("all pulls", || runtime.pulled().len() == 5).await;
    assert_eq!(
        runtime.pulled(),
        vec!["api:1", "api:2", "api:3", "api:4", "api:5"]
    );
    handle.stop().await;
}

#[tokio::test]
async fn unreachable_store_is_retried_until_it_recovers() {
    let store = Arc::new(MemoryStore::new());
    store.set_unreachable(true);
    let runtime = Arc::new(ScriptedRuntime::new());
    let handle = start(&store, &runtime, &["web"], 50);

    eventually("reconnect attempts", || store.connect_calls() >= 3).await;
    assert_eq!(handle.state(), DaemonState::Connecting);

    store.set_unreachable(false);
    wait_for_state(&handle, DaemonState::Watching).await;
    publish(&store, "web", &["api:1"]).await;
    eventually("pull after recovery", || runtime.pulled().len() == 1).await;
    handle.stop().await;
}

#[tokio::test]
async fn watch_error_resumes_without_losing_or_repeating_values() {
    let store = Arc::new(MemoryStore::new());
    let runtime = Arc::new(ScriptedRuntime::new());
    let handle = start(&store, &runtime, &["web"], 50);
    wait_for_state(&handle, DaemonState::Watching).await;

    publish(&store, "web", &["api:1"]).await;
    eventually("first pull", || runtime.pulled().len() == 1).await;

    store.fail_next_watch(StoreError::WatchTransport {
        key: "prod/subscriptions/web".to_string(),
        reason: "connection reset by peer".to_string(),
    });
    publish(&store, "web", &["api:2", "api:3"]).await;
    eventually("later pulls", || runtime.pulled().len() == 3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    handle.stop().await;
    assert_eq!(runtime.pulled(), vec!["api:1", "api:2", "api:3"]);
}

// Repeated watch failures back off exponentially instead of rewatching
// immediately, even while the store keeps accepting the reconnect.
#[tokio::test]
async fn failing_watches_back_off_instead_of_rewatching_immediately() {
    let store = Arc::new(MemoryStore::new());
    for _ in 0..3 {
        store.fail_next_watch(StoreError::Api {
            key: "prod/subscriptions/web".to_string(),
            code: 400,
            message: "long-poll refused by proxy".to_string(),
        });
    }
    let runtime = Arc::new(ScriptedRuntime::new());
    let mut config = cluster_config("prod", &["web"]);
    config.retry.reconnect = RetryPolicy {
        max_attempts: None,
        base_delay_ms: 100,
        max_delay_ms: 1_000,
        jitter_ms: 0,
    };
    let handle = ClusterDaemon::new(config, Arc::clone(&store), Arc::clone(&runtime))
        .expect("daemon")
        .start();

    eventually("first watch", || store.watch_calls() >= 1).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(store.watch_calls() <= 2, "watched {} times", store.watch_calls());
    assert_ne!(handle.state(), DaemonState::Watching);

    // Delays of 100, 200 and 400 ms; the fourth watch succeeds.
    publish(&store, "web", &["api:1"]).await;
    eventually("pull after the faults", || runtime.pulled().len() == 1).await;
    wait_for_state(&handle, DaemonState::Watching).await;
    eventually("blocked on the next watch", || store.watch_calls() == 5).await;
    handle.stop().await;
}

#[tokio::test]
async fn each_channel_is_watched_independently() {
    let store = Arc::new(MemoryStore::new());
    let runtime = Arc::new(ScriptedRuntime::new());
    let handle = start(&store, &runtime, &["web", "jobs"], 50);
    eventually("both channels subscribed", || store.connect_calls() >= 2).await;

    publish(&store, "jobs", &["worker:7"]).await;
    publish(&store, "web", &["api:7"]).await;
    publish(&store, "other", &["ignored:1"]).await;
    eventually("two pulls", || runtime.pulled().len() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    handle.stop().await;
    let mut pulled = runtime.pulled();
    pulled.sort();
    assert_eq!(pulled, vec!["api:7", "worker:7"]);
}

#[tokio::test]
async fn stop_joins_tasks_and_reports_discarded_work() {
    let store = Arc::new(MemoryStore::new());
    let runtime = Arc::new(ScriptedRuntime::gated());
    let handle = start(&store, &runtime, &["web"], 50);
    wait_for_state(&handle, DaemonState::Watching).await;
    let mut states = handle.subscribe_state();

    publish(&store, "web", &["api:1", "api:2", "api:3"]).await;
    eventually("all values watched", || store.watch_calls() >= 4).await;

    let report = timeout(WAIT, handle.stop()).await.expect("stop in time");
    assert_eq!(report.pulled, 0);
    assert_eq!(report.discarded, 3);
    assert_eq!(states.borrow_and_update().state(), DaemonState::Stopped);
    assert!(runtime.pulled().is_empty());
}
