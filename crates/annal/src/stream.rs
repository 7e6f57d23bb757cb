//! Optimistic event stream: the per-stream working copy.
//!
//! A stream object is owned by one logical task at a time; it is not
//! thread-safe. All persistence access goes through the [`CommitStore`] it
//! was opened with, which is the only place it blocks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use annal_core::error::{AnnalError, Result};
use annal_core::persistence::CommitStore;
use annal_core::types::{Commit, EventMessage, Snapshot};

/// In-memory working copy of a single stream.
///
/// Reads load the committed history; writes stage events locally until
/// [`commit_changes`](Self::commit_changes) persists them as one commit
/// under optimistic-concurrency rules. On conflict the stream rebases onto
/// the newly discovered commits and re-raises, keeping the staged events so
/// the caller can retry at the advanced head.
pub struct OptimisticEventStream {
    stream_id: String,
    persistence: Arc<dyn CommitStore>,
    committed: Vec<EventMessage>,
    uncommitted: Vec<EventMessage>,
    uncommitted_headers: HashMap<String, Value>,
    stream_revision: u64,
    commit_sequence: u64,
    /// Commit ids observed in this stream's history, for duplicate detection.
    identifiers: HashSet<Uuid>,
}

impl std::fmt::Debug for OptimisticEventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticEventStream")
            .field("stream_id", &self.stream_id)
            .field("committed", &self.committed)
            .field("uncommitted", &self.uncommitted)
            .field("uncommitted_headers", &self.uncommitted_headers)
            .field("stream_revision", &self.stream_revision)
            .field("commit_sequence", &self.commit_sequence)
            .field("identifiers", &self.identifiers)
            .finish()
    }
}

impl OptimisticEventStream {
    /// A fresh stream with no prior history. Revision 0, sequence 0.
    pub fn create(persistence: Arc<dyn CommitStore>, stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            persistence,
            committed: Vec::new(),
            uncommitted: Vec::new(),
            uncommitted_headers: HashMap::new(),
            stream_revision: 0,
            commit_sequence: 0,
            identifiers: HashSet::new(),
        }
    }

    /// Load the stream from persisted history.
    ///
    /// Fails with `StreamNotFound` when `min_revision > 0` and the store
    /// yields nothing for the range.
    pub fn open(
        persistence: Arc<dyn CommitStore>,
        stream_id: impl Into<String>,
        min_revision: u64,
        max_revision: u64,
    ) -> Result<Self> {
        let mut stream = Self::create(persistence, stream_id);
        let commits = stream
            .persistence
            .get_from(&stream.stream_id, min_revision, max_revision)?;
        let loaded = stream.populate(commits, min_revision, max_revision)?;

        if min_revision > 0 && loaded == 0 {
            return Err(AnnalError::StreamNotFound {
                stream_id: stream.stream_id,
                min_revision,
                max_revision,
            });
        }
        Ok(stream)
    }

    /// Load the stream from a snapshot, replaying only the events persisted
    /// after the snapshot's revision.
    pub fn open_from_snapshot(
        persistence: Arc<dyn CommitStore>,
        snapshot: &Snapshot,
        max_revision: u64,
    ) -> Result<Self> {
        let mut stream = Self::create(persistence, snapshot.stream_id());
        stream.stream_revision = snapshot.stream_revision();

        let commits = stream.persistence.get_from(
            &stream.stream_id,
            snapshot.stream_revision(),
            max_revision,
        )?;
        stream.populate(commits, snapshot.stream_revision() + 1, max_revision)?;
        Ok(stream)
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Latest revision this working copy has observed.
    pub fn stream_revision(&self) -> u64 {
        self.stream_revision
    }

    /// Latest commit sequence this working copy has observed.
    pub fn commit_sequence(&self) -> u64 {
        self.commit_sequence
    }

    /// Events loaded from persisted history.
    pub fn committed_events(&self) -> &[EventMessage] {
        &self.committed
    }

    /// Events staged for the next commit.
    pub fn uncommitted_events(&self) -> &[EventMessage] {
        &self.uncommitted
    }

    /// Headers staged for the next commit.
    pub fn uncommitted_headers(&self) -> &HashMap<String, Value> {
        &self.uncommitted_headers
    }

    /// Mutable access to the staged headers.
    pub fn uncommitted_headers_mut(&mut self) -> &mut HashMap<String, Value> {
        &mut self.uncommitted_headers
    }

    /// Stage an event for the next commit. Events without a body are
    /// silently ignored.
    pub fn add(&mut self, event: EventMessage) {
        if event.is_empty() {
            return;
        }
        self.uncommitted.push(event);
    }

    /// Drop all staged events and headers.
    pub fn clear_changes(&mut self) {
        self.uncommitted.clear();
        self.uncommitted_headers.clear();
    }

    /// Persist the staged events as one commit identified by `commit_id`.
    ///
    /// No-op when nothing is staged. On a concurrency conflict the stream
    /// rebases its committed view onto the winning commits, keeps the staged
    /// events, and re-raises `Concurrency` carrying what it discovered; a
    /// subsequent call retries at the advanced sequence and revision.
    pub fn commit_changes(&mut self, commit_id: Uuid) -> Result<()> {
        if self.identifiers.contains(&commit_id) {
            return Err(AnnalError::DuplicateCommit {
                stream_id: self.stream_id.clone(),
                commit_id,
            });
        }
        if self.uncommitted.is_empty() {
            return Ok(());
        }

        debug!(
            stream_id = %self.stream_id,
            %commit_id,
            events = self.uncommitted.len(),
            "committing staged events"
        );

        let attempt = self.build_attempt(commit_id)?;
        match self.persistence.commit(attempt) {
            Ok(persisted) => {
                let min = self.stream_revision + 1;
                self.populate(std::iter::once(Ok(persisted)), min, u64::MAX)?;
                self.clear_changes();
                Ok(())
            }
            Err(AnnalError::Concurrency { .. }) => {
                let discovered = self.rebase()?;
                Err(AnnalError::Concurrency {
                    stream_id: self.stream_id.clone(),
                    commits: discovered,
                })
            }
            Err(other) => Err(other),
        }
    }

    fn build_attempt(&self, commit_id: Uuid) -> Result<Commit> {
        Commit::new(
            self.stream_id.clone(),
            self.stream_revision + self.uncommitted.len() as u64,
            commit_id,
            self.commit_sequence + 1,
            Utc::now(),
            self.uncommitted_headers.clone(),
            self.uncommitted.clone(),
        )
    }

    /// Pull the commits another writer got in ahead of us and fold them into
    /// the committed view. Staged events are untouched.
    fn rebase(&mut self) -> Result<Vec<Commit>> {
        let min = self.stream_revision + 1;
        let newer = self.persistence.get_from(&self.stream_id, min, u64::MAX)?;
        let discovered: Vec<Commit> = newer.collect::<Result<_>>()?;

        debug!(
            stream_id = %self.stream_id,
            commits = discovered.len(),
            "rebasing onto newer commits after conflict"
        );

        self.populate(discovered.iter().cloned().map(Ok), min, u64::MAX)?;
        Ok(discovered)
    }

    /// Fold `commits` into the committed view, honoring the revision window.
    ///
    /// Commits may straddle the window; events below `min_revision` are
    /// skipped, and the first event above `max_revision` stops consumption
    /// entirely. The working revision tracks the highest applied event
    /// revision, and the working sequence tracks every commit seen, whether
    /// or not its events land inside the window. Returns the number of
    /// commits consumed.
    fn populate(
        &mut self,
        commits: impl IntoIterator<Item = Result<Commit>>,
        min_revision: u64,
        max_revision: u64,
    ) -> Result<usize> {
        let mut consumed = 0;
        for commit in commits {
            let commit = commit?;
            consumed += 1;

            self.identifiers.insert(commit.commit_id());
            self.commit_sequence = commit.commit_sequence();

            let mut current = commit.first_event_revision();
            for event in commit.events() {
                if current > max_revision {
                    return Ok(consumed);
                }
                if current >= min_revision {
                    self.committed.push(event.clone());
                    self.stream_revision = current;
                }
                current += 1;
            }
        }
        Ok(consumed)
    }
}
