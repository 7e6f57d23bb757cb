//! Polling observer: tail-reads the commit log from a checkpoint and fans
//! newly persisted commits out to subscribers.
//!
//! One background task per observer. Subscribers are delivered on that task
//! and must not block; a failing subscriber loses its subscription, the
//! others keep receiving. Delivery is at-least-once across restarts, so
//! subscribers deduplicate by checkpoint or stay idempotent.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use annal_core::error::{AnnalError, Result};
use annal_core::observe;
use annal_core::persistence::CommitStore;
use annal_core::types::{Checkpoint, Commit};

/// Receives the observer's notifications.
///
/// `on_next` runs on the observer's task; returning an error terminates this
/// subscription only.
pub trait Observer: Send + Sync {
    fn on_next(&self, commit: Commit) -> Result<()>;

    fn on_error(&self, _error: &AnnalError) {}

    fn on_completed(&self) {}
}

#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Sleep between tail reads.
    pub interval: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
        }
    }
}

#[derive(Default)]
struct SubscriberSet {
    entries: RwLock<Vec<(u64, Arc<dyn Observer>)>>,
    next_id: AtomicU64,
}

impl SubscriberSet {
    fn add(&self, observer: Arc<dyn Observer>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries.write().push((id, observer));
        id
    }

    fn remove(&self, id: u64) {
        self.entries.write().retain(|(entry_id, _)| *entry_id != id);
    }

    fn deliver(&self, commit: &Commit) {
        let snapshot: Vec<(u64, Arc<dyn Observer>)> = self.entries.read().clone();
        for (id, observer) in snapshot {
            if let Err(e) = observer.on_next(commit.clone()) {
                warn!(
                    subscriber = id,
                    checkpoint = commit.checkpoint(),
                    "subscriber failed, dropping its subscription: {e}"
                );
                self.remove(id);
            }
        }
    }

    fn error(&self, error: &AnnalError) {
        for (_, observer) in self.entries.read().iter() {
            observer.on_error(error);
        }
    }

    fn complete(&self) {
        let drained = std::mem::take(&mut *self.entries.write());
        for (_, observer) in drained {
            observer.on_completed();
        }
    }
}

/// RAII registration handle; dropping it unsubscribes.
pub struct Subscription {
    set: Arc<SubscriberSet>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.set.remove(self.id);
    }
}

/// Tail-reads commits after a starting checkpoint at a fixed interval.
pub struct PollingObserver {
    persistence: Arc<dyn CommitStore>,
    config: PollingConfig,
    from_checkpoint: Checkpoint,
    subscribers: Arc<SubscriberSet>,
    started: AtomicBool,
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PollingObserver {
    /// Observe commits with checkpoints strictly greater than
    /// `from_checkpoint`.
    pub fn new(
        persistence: Arc<dyn CommitStore>,
        config: PollingConfig,
        from_checkpoint: Checkpoint,
    ) -> Self {
        Self {
            persistence,
            config,
            from_checkpoint,
            subscribers: Arc::new(SubscriberSet::default()),
            started: AtomicBool::new(false),
            stop: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            worker: Mutex::new(None),
        }
    }

    /// Register a subscriber. Valid before or after `start`.
    pub fn subscribe(&self, observer: Arc<dyn Observer>) -> Subscription {
        let id = self.subscribers.add(observer);
        Subscription {
            set: self.subscribers.clone(),
            id,
        }
    }

    /// Launch the polling task. Idempotent; must be called within a tokio
    /// runtime.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let persistence = self.persistence.clone();
        let subscribers = self.subscribers.clone();
        let stop = self.stop.clone();
        let wake = self.wake.clone();
        let interval = self.config.interval;
        let mut last = self.from_checkpoint;

        let handle = tokio::spawn(async move {
            debug!(from_checkpoint = last, "polling observer started");
            loop {
                tokio::select! {
                    _ = wake.notified() => {}
                    _ = tokio::time::sleep(interval) => {}
                }
                if stop.load(Ordering::SeqCst) {
                    break;
                }

                match persistence.get_from_checkpoint(last) {
                    Ok(commits) => {
                        let mut delivered = 0usize;
                        for item in commits {
                            match item {
                                Ok(commit) => {
                                    if commit.checkpoint() <= last {
                                        continue;
                                    }
                                    let checkpoint = commit.checkpoint();
                                    subscribers.deliver(&commit);
                                    last = checkpoint;
                                    delivered += 1;
                                }
                                Err(e) => {
                                    warn!("tail read failed mid-page: {e}");
                                    subscribers.error(&e);
                                    break;
                                }
                            }
                            if stop.load(Ordering::SeqCst) {
                                break;
                            }
                        }
                        observe::record_poll(delivered);
                    }
                    Err(e) => {
                        warn!("tail read failed: {e}");
                        subscribers.error(&e);
                    }
                }
            }
            subscribers.complete();
            debug!(last_checkpoint = last, "polling observer stopped");
        });

        *self.worker.lock() = Some(handle);
    }

    /// Cancel the polling task, wait for it to drain, and complete every
    /// remaining subscription.
    pub async fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("polling task panicked: {e}");
            }
        }
    }
}

impl Drop for PollingObserver {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryCommitStore;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use std::collections::HashMap;
    use uuid::Uuid;

    use annal_core::persistence::CommitIterator;
    use annal_core::types::{EventMessage, Snapshot, StreamHead};

    #[derive(Default)]
    struct Collecting {
        seen: Mutex<Vec<Checkpoint>>,
        completed: AtomicBool,
        fail_on: Option<Checkpoint>,
    }

    impl Observer for Collecting {
        fn on_next(&self, commit: Commit) -> Result<()> {
            if self.fail_on == Some(commit.checkpoint()) {
                return Err(AnnalError::Storage("subscriber broke".into()));
            }
            self.seen.lock().push(commit.checkpoint());
            Ok(())
        }

        fn on_completed(&self) {
            self.completed.store(true, Ordering::SeqCst);
        }
    }

    /// Store whose checkpoint reads replay a fixed page, including commits
    /// at or below the requested checkpoint.
    struct Misordered {
        checkpoints: Vec<Checkpoint>,
    }

    fn stamped(checkpoint: Checkpoint) -> Commit {
        Commit::new(
            "s",
            checkpoint,
            Uuid::new_v4(),
            checkpoint,
            Utc::now(),
            HashMap::new(),
            vec![EventMessage::new(json!("e"))],
        )
        .unwrap()
        .with_checkpoint(checkpoint)
    }

    impl CommitStore for Misordered {
        fn initialize(&self) -> Result<()> {
            Ok(())
        }

        fn get_from(
            &self,
            _stream_id: &str,
            _min: u64,
            _max: u64,
        ) -> Result<Box<dyn CommitIterator>> {
            Ok(Box::new(std::iter::empty()))
        }

        fn get_from_instant(&self, _start: DateTime<Utc>) -> Result<Box<dyn CommitIterator>> {
            Ok(Box::new(std::iter::empty()))
        }

        fn get_from_to(
            &self,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<Box<dyn CommitIterator>> {
            Ok(Box::new(std::iter::empty()))
        }

        fn get_from_checkpoint(&self, _checkpoint: Checkpoint) -> Result<Box<dyn CommitIterator>> {
            let page: Vec<Commit> = self.checkpoints.iter().map(|cp| stamped(*cp)).collect();
            Ok(Box::new(page.into_iter().map(Ok)))
        }

        fn commit(&self, _attempt: Commit) -> Result<Commit> {
            unimplemented!("read-only fixture")
        }

        fn get_undispatched_commits(&self) -> Result<Box<dyn CommitIterator>> {
            Ok(Box::new(std::iter::empty()))
        }

        fn mark_commit_as_dispatched(&self, _commit: &Commit) -> Result<()> {
            Ok(())
        }

        fn get_streams_to_snapshot(&self, _threshold: u64) -> Result<Vec<StreamHead>> {
            Ok(Vec::new())
        }

        fn get_snapshot(&self, _stream_id: &str, _max: u64) -> Result<Option<Snapshot>> {
            Ok(None)
        }

        fn add_snapshot(&self, _snapshot: Snapshot) -> Result<bool> {
            Ok(false)
        }
    }

    fn fast_config() -> PollingConfig {
        PollingConfig {
            interval: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn skips_checkpoints_at_or_below_the_cursor() {
        let store = Arc::new(Misordered {
            checkpoints: vec![9, 11, 12],
        });
        let observer = PollingObserver::new(store, fast_config(), 10);
        let subscriber = Arc::new(Collecting::default());
        let _subscription = observer.subscribe(subscriber.clone());

        observer.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        observer.stop().await;

        assert_eq!(*subscriber.seen.lock(), vec![11, 12]);
        assert!(subscriber.completed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn delivers_live_commits_in_checkpoint_order() {
        let store = Arc::new(InMemoryCommitStore::new());
        let observer = PollingObserver::new(store.clone(), fast_config(), 0);
        let subscriber = Arc::new(Collecting::default());
        let _subscription = observer.subscribe(subscriber.clone());
        observer.start();

        for sequence in 1..=3u64 {
            let attempt = Commit::new(
                "s",
                sequence,
                Uuid::new_v4(),
                sequence,
                Utc::now(),
                HashMap::new(),
                vec![EventMessage::new(json!("e"))],
            )
            .unwrap();
            store.commit(attempt).unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        observer.stop().await;

        assert_eq!(*subscriber.seen.lock(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn failing_subscriber_loses_only_its_own_subscription() {
        let store = Arc::new(Misordered {
            checkpoints: vec![1, 2],
        });
        let observer = PollingObserver::new(store, fast_config(), 0);

        let fragile = Arc::new(Collecting {
            fail_on: Some(1),
            ..Collecting::default()
        });
        let steady = Arc::new(Collecting::default());
        let _a = observer.subscribe(fragile.clone());
        let _b = observer.subscribe(steady.clone());

        observer.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        observer.stop().await;

        assert!(fragile.seen.lock().is_empty());
        let steady_seen = steady.seen.lock();
        assert!(steady_seen.contains(&1) && steady_seen.contains(&2));
    }

    #[tokio::test]
    async fn dropping_the_subscription_unsubscribes() {
        let store = Arc::new(InMemoryCommitStore::new());
        let observer = PollingObserver::new(store.clone(), fast_config(), 0);
        let subscriber = Arc::new(Collecting::default());
        let subscription = observer.subscribe(subscriber.clone());
        observer.start();

        drop(subscription);
        let attempt = Commit::new(
            "s",
            1,
            Uuid::new_v4(),
            1,
            Utc::now(),
            HashMap::new(),
            vec![EventMessage::new(json!("e"))],
        )
        .unwrap();
        store.commit(attempt).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        observer.stop().await;
        assert!(subscriber.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let store = Arc::new(InMemoryCommitStore::new());
        let observer = PollingObserver::new(store, fast_config(), 0);
        observer.start();
        observer.start();
        observer.stop().await;
    }
}
