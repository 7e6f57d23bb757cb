//! Dispatch scheduling: delivery of persisted commits to a consumer.
//!
//! Both schedulers share one contract: every persisted commit is handed to
//! the [`Dispatcher`] exactly once and marked dispatched on success. Commits
//! left unmarked (process death, dispatch failure) are caught up at the next
//! scheduler construction.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use annal_core::error::{AnnalError, Result};
use annal_core::observe;
use annal_core::persistence::CommitStore;
use annal_core::types::Commit;

/// Downstream consumer of persisted commits.
///
/// Implementations must tolerate redelivery: a commit whose dispatch
/// succeeded but whose mark did not will be seen again after restart.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, commit: &Commit) -> Result<()>;
}

/// Scheduling strategy the event store hands persisted commits to.
pub trait DispatchScheduler: Send + Sync {
    fn schedule(&self, commit: Commit) -> Result<()>;
}

fn deliver(
    dispatcher: &dyn Dispatcher,
    persistence: &dyn CommitStore,
    commit: &Commit,
) -> Result<()> {
    let outcome = dispatcher
        .dispatch(commit)
        .and_then(|()| persistence.mark_commit_as_dispatched(commit));
    observe::record_dispatch(outcome.is_ok());
    outcome
}

/// Dispatches on the committing task.
///
/// Construction catches up every undispatched commit; afterwards each
/// scheduled commit is delivered inline, so a dispatch failure propagates to
/// the caller of `commit` while the commit itself stays durable and
/// unmarked for the next startup to retry.
pub struct SyncDispatchScheduler {
    dispatcher: Arc<dyn Dispatcher>,
    persistence: Arc<dyn CommitStore>,
}

impl SyncDispatchScheduler {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, persistence: Arc<dyn CommitStore>) -> Result<Self> {
        persistence.initialize()?;

        let mut caught_up = 0usize;
        for commit in persistence.get_undispatched_commits()? {
            let commit = commit?;
            deliver(&*dispatcher, &*persistence, &commit)?;
            caught_up += 1;
        }
        if caught_up > 0 {
            info!(commits = caught_up, "caught up undispatched commits");
        }

        Ok(Self {
            dispatcher,
            persistence,
        })
    }
}

impl DispatchScheduler for SyncDispatchScheduler {
    fn schedule(&self, commit: Commit) -> Result<()> {
        deliver(&*self.dispatcher, &*self.persistence, &commit)
    }
}

/// Dispatches from a single background worker.
///
/// `schedule` enqueues onto an unbounded queue; the worker dequeues and
/// performs dispatch-then-mark. Per-stream ordering holds because the event
/// store enqueues in commit order and the worker is alone. Dispatch failures
/// are logged and the commit stays unmarked for restart catch-up.
pub struct AsyncDispatchScheduler {
    tx: Mutex<Option<mpsc::UnboundedSender<Commit>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncDispatchScheduler {
    /// Spawn the worker. Must be called within a tokio runtime.
    ///
    /// Undispatched commits found at startup are enqueued ahead of anything
    /// scheduled later, preserving checkpoint order.
    pub fn start(
        dispatcher: Arc<dyn Dispatcher>,
        persistence: Arc<dyn CommitStore>,
    ) -> Result<Self> {
        persistence.initialize()?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Commit>();
        for commit in persistence.get_undispatched_commits()? {
            let commit = commit?;
            tx.send(commit)
                .map_err(|e| AnnalError::Storage(format!("dispatch queue closed: {e}")))?;
        }

        let worker = tokio::spawn(async move {
            debug!("dispatch worker started");
            while let Some(commit) = rx.recv().await {
                if let Err(e) = deliver(&*dispatcher, &*persistence, &commit) {
                    error!(
                        stream_id = commit.stream_id(),
                        checkpoint = commit.checkpoint(),
                        "dispatch failed, commit left undispatched: {e}"
                    );
                }
            }
            debug!("dispatch worker drained");
        });

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Close the queue and wait for the worker to drain it.
    pub async fn shutdown(&self) {
        self.tx.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("dispatch worker panicked: {e}");
            }
        }
    }
}

impl DispatchScheduler for AsyncDispatchScheduler {
    fn schedule(&self, commit: Commit) -> Result<()> {
        let tx = self.tx.lock();
        match tx.as_ref() {
            Some(tx) => tx
                .send(commit)
                .map_err(|e| AnnalError::Storage(format!("dispatch queue closed: {e}"))),
            None => Err(AnnalError::Storage("dispatch scheduler stopped".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryCommitStore;
    use chrono::Utc;
    use parking_lot::Mutex as PlMutex;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use uuid::Uuid;

    use annal_core::persistence::CommitIterator;
    use annal_core::types::EventMessage;

    #[derive(Default)]
    struct Recording {
        seen: PlMutex<Vec<u64>>,
        fail: AtomicBool,
    }

    impl Dispatcher for Recording {
        fn dispatch(&self, commit: &Commit) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(AnnalError::Storage("consumer offline".into()));
            }
            self.seen.lock().push(commit.checkpoint());
            Ok(())
        }
    }

    fn persisted(store: &InMemoryCommitStore, stream: &str, revision: u64, sequence: u64) -> Commit {
        let attempt = Commit::new(
            stream,
            revision,
            Uuid::new_v4(),
            sequence,
            Utc::now(),
            HashMap::new(),
            vec![EventMessage::new(json!("e"))],
        )
        .unwrap();
        store.commit(attempt).unwrap()
    }

    fn undispatched(store: &InMemoryCommitStore) -> Vec<Commit> {
        let iter: Box<dyn CommitIterator> = store.get_undispatched_commits().unwrap();
        iter.collect::<Result<Vec<_>>>().unwrap()
    }

    #[test]
    fn sync_scheduler_catches_up_at_construction() {
        let store = Arc::new(InMemoryCommitStore::new());
        persisted(&store, "a", 1, 1);
        persisted(&store, "b", 1, 1);

        let dispatcher = Arc::new(Recording::default());
        SyncDispatchScheduler::new(dispatcher.clone(), store.clone()).unwrap();

        assert_eq!(*dispatcher.seen.lock(), vec![1, 2]);
        assert!(undispatched(&store).is_empty());
    }

    #[test]
    fn sync_scheduler_propagates_dispatch_failure_and_leaves_mark_unset() {
        let store = Arc::new(InMemoryCommitStore::new());
        let dispatcher = Arc::new(Recording::default());
        let scheduler = SyncDispatchScheduler::new(dispatcher.clone(), store.clone()).unwrap();

        let commit = persisted(&store, "a", 1, 1);
        dispatcher.fail.store(true, Ordering::SeqCst);

        assert!(scheduler.schedule(commit).is_err());
        assert_eq!(undispatched(&store).len(), 1);

        // Next startup retries.
        dispatcher.fail.store(false, Ordering::SeqCst);
        SyncDispatchScheduler::new(dispatcher.clone(), store.clone()).unwrap();
        assert!(undispatched(&store).is_empty());
    }

    #[tokio::test]
    async fn async_scheduler_delivers_in_order_and_drains_on_shutdown() {
        let store = Arc::new(InMemoryCommitStore::new());
        persisted(&store, "a", 1, 1); // undispatched at startup

        let dispatcher = Arc::new(Recording::default());
        let scheduler = AsyncDispatchScheduler::start(dispatcher.clone(), store.clone()).unwrap();

        let second = persisted(&store, "a", 2, 2);
        let third = persisted(&store, "a", 3, 3);
        scheduler.schedule(second).unwrap();
        scheduler.schedule(third).unwrap();

        scheduler.shutdown().await;

        assert_eq!(*dispatcher.seen.lock(), vec![1, 2, 3]);
        assert!(undispatched(&store).is_empty());
    }

    #[tokio::test]
    async fn async_scheduler_rejects_schedule_after_shutdown() {
        let store = Arc::new(InMemoryCommitStore::new());
        let dispatcher = Arc::new(Recording::default());
        let scheduler = AsyncDispatchScheduler::start(dispatcher, store.clone()).unwrap();
        scheduler.shutdown().await;

        let commit = persisted(&store, "a", 1, 1);
        assert!(scheduler.schedule(commit).is_err());
    }

    #[tokio::test]
    async fn async_scheduler_keeps_failed_commits_undispatched() {
        let store = Arc::new(InMemoryCommitStore::new());
        let dispatcher = Arc::new(Recording::default());
        dispatcher.fail.store(true, Ordering::SeqCst);

        let scheduler = AsyncDispatchScheduler::start(dispatcher.clone(), store.clone()).unwrap();
        let commit = persisted(&store, "a", 1, 1);
        scheduler.schedule(commit).unwrap();
        scheduler.shutdown().await;

        assert_eq!(undispatched(&store).len(), 1);
        assert!(dispatcher.seen.lock().is_empty());
    }
}
