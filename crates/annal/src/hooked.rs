//! Hook-aware persistence decorator.
//!
//! Wraps a [`CommitStore`] and runs the `select` hook chain over the
//! instant/range read paths. Writes are deliberately not intercepted here:
//! pre-/post-commit hooks belong to the event store so that duplicate and
//! concurrency failures never fire them.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use annal_core::error::Result;
use annal_core::persistence::{CommitIterator, CommitStore};
use annal_core::pipeline::{select_chain, PipelineHook};
use annal_core::types::{Checkpoint, Commit, Snapshot, StreamHead};

/// Decorator that filters cross-stream reads through the hook chain.
pub struct HookedCommitStore {
    inner: Arc<dyn CommitStore>,
    hooks: Arc<Vec<Arc<dyn PipelineHook>>>,
}

impl HookedCommitStore {
    pub fn new(inner: Arc<dyn CommitStore>, hooks: Arc<Vec<Arc<dyn PipelineHook>>>) -> Self {
        Self { inner, hooks }
    }

    fn filtered(&self, commits: Box<dyn CommitIterator>) -> Box<dyn CommitIterator> {
        let hooks = self.hooks.clone();
        Box::new(commits.filter_map(move |item| match item {
            Ok(commit) => select_chain(&hooks, commit).map(Ok),
            Err(e) => Some(Err(e)),
        }))
    }
}

impl CommitStore for HookedCommitStore {
    fn initialize(&self) -> Result<()> {
        self.inner.initialize()
    }

    fn get_from(
        &self,
        stream_id: &str,
        min_revision: u64,
        max_revision: u64,
    ) -> Result<Box<dyn CommitIterator>> {
        self.inner.get_from(stream_id, min_revision, max_revision)
    }

    fn get_from_instant(&self, start: DateTime<Utc>) -> Result<Box<dyn CommitIterator>> {
        Ok(self.filtered(self.inner.get_from_instant(start)?))
    }

    fn get_from_to(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Box<dyn CommitIterator>> {
        Ok(self.filtered(self.inner.get_from_to(start, end)?))
    }

    fn get_from_checkpoint(&self, checkpoint: Checkpoint) -> Result<Box<dyn CommitIterator>> {
        self.inner.get_from_checkpoint(checkpoint)
    }

    fn commit(&self, attempt: Commit) -> Result<Commit> {
        self.inner.commit(attempt)
    }

    fn get_undispatched_commits(&self) -> Result<Box<dyn CommitIterator>> {
        self.inner.get_undispatched_commits()
    }

    fn mark_commit_as_dispatched(&self, commit: &Commit) -> Result<()> {
        self.inner.mark_commit_as_dispatched(commit)
    }

    fn get_streams_to_snapshot(&self, threshold: u64) -> Result<Vec<StreamHead>> {
        self.inner.get_streams_to_snapshot(threshold)
    }

    fn get_snapshot(&self, stream_id: &str, max_revision: u64) -> Result<Option<Snapshot>> {
        self.inner.get_snapshot(stream_id, max_revision)
    }

    fn add_snapshot(&self, snapshot: Snapshot) -> Result<bool> {
        self.inner.add_snapshot(snapshot)
    }
}
