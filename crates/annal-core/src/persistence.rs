//! Persistence contract for commit storage backends.
//!
//! Defines the interface adapters implement (SQLite, in-memory, etc.) plus
//! the lazy iterator shape all read operations share.

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{Checkpoint, Commit, Snapshot, StreamHead};

/// Iterator over commits.
///
/// All read operations return these lazily and single-pass: callers must not
/// assume the sequence can be restarted, and adapters must not buffer the
/// whole result set up front.
pub trait CommitIterator: Iterator<Item = Result<Commit>> + Send {}

impl<T: Iterator<Item = Result<Commit>> + Send> CommitIterator for T {}

/// Commit storage backend.
///
/// One instance serves many concurrent callers; implementations must be safe
/// under parallel use. Writes are strongly consistent. Reads may be slightly
/// stale on eventually-consistent backends, except that a stream's own
/// commits always come back in strict `commit_sequence` order.
pub trait CommitStore: Send + Sync {
    /// Prepare storage. Idempotent; concurrent calls from multiple processes
    /// must not corrupt state, and repeat calls in-process are no-ops.
    fn initialize(&self) -> Result<()>;

    /// Commits of `stream_id` whose event-revision span intersects
    /// `[min_revision, max_revision]`, ordered by `commit_sequence`.
    fn get_from(
        &self,
        stream_id: &str,
        min_revision: u64,
        max_revision: u64,
    ) -> Result<Box<dyn CommitIterator>>;

    /// All commits stamped at or after `start`, ordered by commit stamp then
    /// checkpoint.
    fn get_from_instant(&self, start: DateTime<Utc>) -> Result<Box<dyn CommitIterator>>;

    /// All commits stamped within `[start, end)`, ordered by commit stamp
    /// then checkpoint.
    fn get_from_to(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Box<dyn CommitIterator>>;

    /// All commits with a checkpoint strictly greater than `checkpoint`,
    /// ordered by checkpoint. This is the polling observer's tail read.
    fn get_from_checkpoint(&self, checkpoint: Checkpoint) -> Result<Box<dyn CommitIterator>>;

    /// Durably append `attempt` and return the persisted commit with its
    /// checkpoint assigned.
    ///
    /// Failure taxonomy:
    /// - same `(stream_id, commit_id)` already stored → `DuplicateCommit`
    /// - same `(stream_id, commit_sequence)` under a different id → `Concurrency`
    /// - transport failure → `StorageUnavailable`
    /// - anything else → `Storage`
    fn commit(&self, attempt: Commit) -> Result<Commit>;

    /// All commits not yet marked dispatched, ordered by checkpoint.
    fn get_undispatched_commits(&self) -> Result<Box<dyn CommitIterator>>;

    /// Flag `commit` as delivered to downstream consumers. Idempotent.
    fn mark_commit_as_dispatched(&self, commit: &Commit) -> Result<()>;

    /// Heads that have accumulated at least `threshold` events since their
    /// last snapshot.
    fn get_streams_to_snapshot(&self, threshold: u64) -> Result<Vec<StreamHead>>;

    /// Most recent snapshot of `stream_id` taken at or before `max_revision`.
    fn get_snapshot(&self, stream_id: &str, max_revision: u64) -> Result<Option<Snapshot>>;

    /// Store a snapshot. Returns true iff it was newly stored; a second call
    /// for the same `(stream_id, stream_revision)` returns false.
    fn add_snapshot(&self, snapshot: Snapshot) -> Result<bool>;
}
