//! In-memory commit store.
//!
//! A fully conforming [`CommitStore`] over process memory. Useful as a test
//! double and for ephemeral deployments; the semantics (ordering, conflict
//! detection, checkpoint allocation) match the durable adapters.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use annal_core::error::{AnnalError, Result};
use annal_core::persistence::{CommitIterator, CommitStore};
use annal_core::types::{Checkpoint, Commit, Snapshot, StreamHead};

#[derive(Default)]
struct Inner {
    /// All commits in checkpoint (= insertion) order.
    commits: Vec<Commit>,
    heads: HashMap<String, StreamHead>,
    /// Snapshots per stream, kept sorted by revision.
    snapshots: HashMap<String, Vec<Snapshot>>,
    undispatched: BTreeSet<Checkpoint>,
    next_checkpoint: Checkpoint,
}

/// Process-memory reference implementation of the persistence contract.
#[derive(Default)]
pub struct InMemoryCommitStore {
    inner: RwLock<Inner>,
    init_calls: AtomicUsize,
}

impl InMemoryCommitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Administrative wipe. Not part of the core contract.
    pub fn purge(&self) {
        let mut inner = self.inner.write();
        *inner = Inner::default();
    }

    fn boxed(commits: Vec<Commit>) -> Box<dyn CommitIterator> {
        Box::new(commits.into_iter().map(Ok))
    }
}

impl CommitStore for InMemoryCommitStore {
    fn initialize(&self) -> Result<()> {
        // Nothing to prepare in memory; the guard keeps the call idempotent
        // in the same sense the durable adapters are.
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get_from(
        &self,
        stream_id: &str,
        min_revision: u64,
        max_revision: u64,
    ) -> Result<Box<dyn CommitIterator>> {
        let inner = self.inner.read();
        let matching: Vec<Commit> = inner
            .commits
            .iter()
            .filter(|c| {
                c.stream_id() == stream_id
                    && c.stream_revision() >= min_revision
                    && c.first_event_revision() <= max_revision
            })
            .cloned()
            .collect();
        // Insertion order within one stream is commit_sequence order.
        Ok(Self::boxed(matching))
    }

    fn get_from_instant(&self, start: DateTime<Utc>) -> Result<Box<dyn CommitIterator>> {
        let inner = self.inner.read();
        let mut matching: Vec<Commit> = inner
            .commits
            .iter()
            .filter(|c| c.commit_stamp() >= start)
            .cloned()
            .collect();
        matching.sort_by_key(|c| (c.commit_stamp(), c.checkpoint()));
        Ok(Self::boxed(matching))
    }

    fn get_from_to(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Box<dyn CommitIterator>> {
        let inner = self.inner.read();
        let mut matching: Vec<Commit> = inner
            .commits
            .iter()
            .filter(|c| c.commit_stamp() >= start && c.commit_stamp() < end)
            .cloned()
            .collect();
        matching.sort_by_key(|c| (c.commit_stamp(), c.checkpoint()));
        Ok(Self::boxed(matching))
    }

    fn get_from_checkpoint(&self, checkpoint: Checkpoint) -> Result<Box<dyn CommitIterator>> {
        let inner = self.inner.read();
        let matching: Vec<Commit> = inner
            .commits
            .iter()
            .filter(|c| c.checkpoint() > checkpoint)
            .cloned()
            .collect();
        Ok(Self::boxed(matching))
    }

    fn commit(&self, attempt: Commit) -> Result<Commit> {
        let mut inner = self.inner.write();

        for existing in inner.commits.iter().filter(|c| c.stream_id() == attempt.stream_id()) {
            if existing.commit_id() == attempt.commit_id() {
                return Err(AnnalError::DuplicateCommit {
                    stream_id: attempt.stream_id().to_string(),
                    commit_id: attempt.commit_id(),
                });
            }
            if existing.commit_sequence() == attempt.commit_sequence() {
                return Err(AnnalError::Concurrency {
                    stream_id: attempt.stream_id().to_string(),
                    commits: Vec::new(),
                });
            }
        }

        inner.next_checkpoint += 1;
        let checkpoint = inner.next_checkpoint;
        let persisted = attempt.with_checkpoint(checkpoint);

        let head_revision = persisted.stream_revision();
        let snapshot_revision = inner
            .heads
            .get(persisted.stream_id())
            .map(|h| h.snapshot_revision())
            .unwrap_or(0);
        inner.heads.insert(
            persisted.stream_id().to_string(),
            StreamHead::new(persisted.stream_id(), None, head_revision, snapshot_revision),
        );

        inner.undispatched.insert(checkpoint);
        inner.commits.push(persisted.clone());
        Ok(persisted)
    }

    fn get_undispatched_commits(&self) -> Result<Box<dyn CommitIterator>> {
        let inner = self.inner.read();
        let matching: Vec<Commit> = inner
            .commits
            .iter()
            .filter(|c| inner.undispatched.contains(&c.checkpoint()))
            .cloned()
            .collect();
        Ok(Self::boxed(matching))
    }

    fn mark_commit_as_dispatched(&self, commit: &Commit) -> Result<()> {
        let mut inner = self.inner.write();
        if commit.checkpoint() > 0 {
            inner.undispatched.remove(&commit.checkpoint());
            return Ok(());
        }
        // An unstamped reference: resolve through the stream identity.
        let checkpoint = inner
            .commits
            .iter()
            .find(|c| c.stream_id() == commit.stream_id() && c.commit_id() == commit.commit_id())
            .map(|c| c.checkpoint());
        if let Some(cp) = checkpoint {
            inner.undispatched.remove(&cp);
        }
        Ok(())
    }

    fn get_streams_to_snapshot(&self, threshold: u64) -> Result<Vec<StreamHead>> {
        let inner = self.inner.read();
        Ok(inner
            .heads
            .values()
            .filter(|h| h.unsnapshotted() >= threshold)
            .cloned()
            .collect())
    }

    fn get_snapshot(&self, stream_id: &str, max_revision: u64) -> Result<Option<Snapshot>> {
        let inner = self.inner.read();
        Ok(inner
            .snapshots
            .get(stream_id)
            .and_then(|all| {
                all.iter()
                    .rev()
                    .find(|s| s.stream_revision() <= max_revision)
            })
            .cloned())
    }

    fn add_snapshot(&self, snapshot: Snapshot) -> Result<bool> {
        let mut inner = self.inner.write();

        let entries = inner
            .snapshots
            .entry(snapshot.stream_id().to_string())
            .or_default();
        if entries
            .iter()
            .any(|s| s.stream_revision() == snapshot.stream_revision())
        {
            return Ok(false);
        }
        let position = entries
            .iter()
            .position(|s| s.stream_revision() > snapshot.stream_revision())
            .unwrap_or(entries.len());
        entries.insert(position, snapshot.clone());

        let head_revision = inner
            .heads
            .get(snapshot.stream_id())
            .map(|h| h.head_revision())
            .unwrap_or(0)
            .max(snapshot.stream_revision());
        let snapshot_revision = inner
            .heads
            .get(snapshot.stream_id())
            .map(|h| h.snapshot_revision())
            .unwrap_or(0)
            .max(snapshot.stream_revision());
        inner.heads.insert(
            snapshot.stream_id().to_string(),
            StreamHead::new(snapshot.stream_id(), None, head_revision, snapshot_revision),
        );
        Ok(true)
    }
}
