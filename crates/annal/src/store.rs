//! Event store façade: the composition root applications talk to.
//!
//! Owns the persistence adapter, the pipeline-hook chain, the hook-aware
//! read decorator and (optionally) a dispatch scheduler. Streams opened here
//! write through the commit pipeline so every durable commit passes the
//! pre-/post-commit chains and reaches the scheduler, while duplicate and
//! concurrency failures never fire a hook.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::debug;

use annal_core::error::{AnnalError, Result};
use annal_core::observe;
use annal_core::persistence::{CommitIterator, CommitStore};
use annal_core::pipeline::{post_commit_chain, pre_commit_chain, PipelineHook};
use annal_core::types::{Checkpoint, Commit, Snapshot, StreamHead};

use crate::dispatch::DispatchScheduler;
use crate::hooked::HookedCommitStore;
use crate::stream::OptimisticEventStream;

/// Write path shared by streams and the low-level `commit` entry point.
///
/// Reads pass through to the adapter untouched; `commit` wraps the adapter
/// with hook invocation, conflict upgrading and dispatch scheduling.
pub struct CommitPipeline {
    inner: Arc<dyn CommitStore>,
    hooks: Arc<Vec<Arc<dyn PipelineHook>>>,
    scheduler: Option<Arc<dyn DispatchScheduler>>,
}

impl CommitPipeline {
    fn new(
        inner: Arc<dyn CommitStore>,
        hooks: Arc<Vec<Arc<dyn PipelineHook>>>,
        scheduler: Option<Arc<dyn DispatchScheduler>>,
    ) -> Self {
        Self {
            inner,
            hooks,
            scheduler,
        }
    }

    /// Whether `attempt`'s commit id is already persisted on its stream.
    ///
    /// Only consulted after a concurrency failure: a straight retry of an
    /// attempt that actually persisted collides on its own revision span, so
    /// scanning from the attempt's first event revision is sufficient.
    fn commit_id_already_persisted(&self, attempt: &Commit) -> Result<bool> {
        let commits = self
            .inner
            .get_from(attempt.stream_id(), attempt.first_event_revision(), u64::MAX)?;
        for commit in commits {
            if commit?.commit_id() == attempt.commit_id() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl CommitStore for CommitPipeline {
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
        self.inner.get_from_instant(start)
    }

    fn get_from_to(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Box<dyn CommitIterator>> {
        self.inner.get_from_to(start, end)
    }

    fn get_from_checkpoint(&self, checkpoint: Checkpoint) -> Result<Box<dyn CommitIterator>> {
        self.inner.get_from_checkpoint(checkpoint)
    }

    fn commit(&self, attempt: Commit) -> Result<Commit> {
        if !pre_commit_chain(&self.hooks, &attempt) {
            debug!(
                stream_id = attempt.stream_id(),
                commit_sequence = attempt.commit_sequence(),
                "commit vetoed by pre-commit hook"
            );
            return Ok(attempt);
        }

        let started = Instant::now();
        match self.inner.commit(attempt.clone()) {
            Ok(persisted) => {
                observe::record_commit(started.elapsed(), persisted.events().len());
                post_commit_chain(&self.hooks, &persisted);
                if let Some(scheduler) = &self.scheduler {
                    scheduler.schedule(persisted.clone())?;
                }
                Ok(persisted)
            }
            Err(AnnalError::Concurrency { stream_id, commits }) => {
                if self.commit_id_already_persisted(&attempt)? {
                    observe::record_conflict(true);
                    return Err(AnnalError::DuplicateCommit {
                        stream_id,
                        commit_id: attempt.commit_id(),
                    });
                }
                observe::record_conflict(false);
                Err(AnnalError::Concurrency { stream_id, commits })
            }
            Err(e @ AnnalError::DuplicateCommit { .. }) => {
                observe::record_conflict(true);
                Err(e)
            }
            Err(e) => Err(e),
        }
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

/// The entry point applications hold on to.
pub struct EventStore {
    raw: Arc<dyn CommitStore>,
    pipeline: Arc<CommitPipeline>,
    advanced: HookedCommitStore,
}

impl EventStore {
    pub fn builder(persistence: Arc<dyn CommitStore>) -> EventStoreBuilder {
        EventStoreBuilder::new(persistence)
    }

    /// A fresh stream with no prior history.
    pub fn create_stream(&self, stream_id: impl Into<String>) -> OptimisticEventStream {
        OptimisticEventStream::create(self.pipeline.clone(), stream_id)
    }

    /// Open a stream from persisted history; `StreamNotFound` when
    /// `min_revision > 0` and nothing is stored.
    pub fn open_stream(
        &self,
        stream_id: impl Into<String>,
        min_revision: u64,
        max_revision: u64,
    ) -> Result<OptimisticEventStream> {
        OptimisticEventStream::open(self.pipeline.clone(), stream_id, min_revision, max_revision)
    }

    /// Open a stream from a snapshot, replaying only the later events.
    pub fn open_stream_from_snapshot(
        &self,
        snapshot: &Snapshot,
        max_revision: u64,
    ) -> Result<OptimisticEventStream> {
        OptimisticEventStream::open_from_snapshot(self.pipeline.clone(), snapshot, max_revision)
    }

    /// Low-level write path for callers that build their own commits.
    pub fn commit(&self, attempt: Commit) -> Result<Commit> {
        self.pipeline.commit(attempt)
    }

    /// Stream-level read, hook-free by design.
    pub fn get_from(
        &self,
        stream_id: &str,
        min_revision: u64,
        max_revision: u64,
    ) -> Result<Box<dyn CommitIterator>> {
        self.raw.get_from(stream_id, min_revision, max_revision)
    }

    /// Hook-aware persistence for cross-stream queries.
    pub fn advanced(&self) -> &HookedCommitStore {
        &self.advanced
    }

    /// The underlying adapter, for snapshot and maintenance operations.
    pub fn persistence(&self) -> &Arc<dyn CommitStore> {
        &self.raw
    }
}

/// Assembles an [`EventStore`] over an adapter, a hook chain and an optional
/// dispatch scheduler.
pub struct EventStoreBuilder {
    persistence: Arc<dyn CommitStore>,
    hooks: Vec<Arc<dyn PipelineHook>>,
    scheduler: Option<Arc<dyn DispatchScheduler>>,
}

impl EventStoreBuilder {
    fn new(persistence: Arc<dyn CommitStore>) -> Self {
        Self {
            persistence,
            hooks: Vec::new(),
            scheduler: None,
        }
    }

    /// Append a hook; hooks run in registration order.
    pub fn hook(mut self, hook: Arc<dyn PipelineHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn DispatchScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn build(self) -> Result<EventStore> {
        self.persistence.initialize()?;

        let hooks = Arc::new(self.hooks);
        let pipeline = Arc::new(CommitPipeline::new(
            self.persistence.clone(),
            hooks.clone(),
            self.scheduler,
        ));
        let advanced = HookedCommitStore::new(self.persistence.clone(), hooks);

        Ok(EventStore {
            raw: self.persistence,
            pipeline,
            advanced,
        })
    }
}
