//! SQL dialect abstraction.
//!
//! The store is written against this trait so another relational backend
//! only has to supply its statement text, its paging clause and its way of
//! recognizing unique-key violations.

use uuid::Uuid;

/// Which unique constraint a violated write ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// `(stream_id, commit_id)` collision: the same commit was stored before.
    DuplicateCommit,
    /// `(stream_id, commit_sequence)` collision: another writer won the head.
    Concurrency,
}

pub trait SqlDialect: Send + Sync {
    fn initialize_storage(&self) -> &str;

    fn persist_commit(&self) -> &str;

    fn update_stream_head(&self) -> &str;

    fn get_commits_from_revision(&self) -> &str;

    fn get_commits_from_instant(&self) -> &str;

    fn get_commits_from_to(&self) -> &str;

    fn get_commits_from_checkpoint(&self) -> &str;

    fn get_undispatched_commits(&self) -> &str;

    fn mark_commit_as_dispatched(&self) -> &str;

    fn append_snapshot(&self) -> &str;

    fn update_snapshot_head(&self) -> &str;

    fn get_snapshot(&self) -> &str;

    fn get_streams_requiring_snapshots(&self) -> &str;

    fn purge_storage(&self) -> &str;

    /// Appended to every read statement; binds `:limit` and `:offset`.
    fn paging_clause(&self) -> &str;

    /// Stored form of a commit id.
    fn coalesce_commit_id(&self, commit_id: Uuid) -> String;

    /// Classify a backend error as one of the two write conflicts, if it is
    /// a unique-key violation at all.
    fn classify_unique_violation(&self, error: &rusqlite::Error) -> Option<ConflictKind>;

    /// True for transport-level failures the caller may retry (translated to
    /// `StorageUnavailable`).
    fn is_transient(&self, error: &rusqlite::Error) -> bool;
}

/// Dialect for SQLite.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn initialize_storage(&self) -> &str {
        crate::schema::INITIALIZE_STORAGE
    }

    fn persist_commit(&self) -> &str {
        "INSERT INTO commits (stream_id, stream_revision, commit_id, commit_sequence, \
                              commit_stamp, headers, events, event_count, dispatched) \
         VALUES (:stream_id, :stream_revision, :commit_id, :commit_sequence, \
                 :commit_stamp, :headers, :events, :event_count, 0)"
    }

    fn update_stream_head(&self) -> &str {
        "INSERT INTO stream_heads (stream_id, stream_name, head_revision, snapshot_revision) \
         VALUES (:stream_id, NULL, :head_revision, 0) \
         ON CONFLICT (stream_id) DO UPDATE SET \
             head_revision = MAX(head_revision, excluded.head_revision)"
    }

    fn get_commits_from_revision(&self) -> &str {
        "SELECT checkpoint, stream_id, stream_revision, commit_id, commit_sequence, \
                commit_stamp, headers, events \
         FROM commits \
         WHERE stream_id = :stream_id \
           AND stream_revision >= :min_revision \
           AND stream_revision - event_count + 1 <= :max_revision \
         ORDER BY commit_sequence"
    }

    fn get_commits_from_instant(&self) -> &str {
        "SELECT checkpoint, stream_id, stream_revision, commit_id, commit_sequence, \
                commit_stamp, headers, events \
         FROM commits \
         WHERE commit_stamp >= :start \
         ORDER BY commit_stamp, checkpoint"
    }

    fn get_commits_from_to(&self) -> &str {
        "SELECT checkpoint, stream_id, stream_revision, commit_id, commit_sequence, \
                commit_stamp, headers, events \
         FROM commits \
         WHERE commit_stamp >= :start AND commit_stamp < :end \
         ORDER BY commit_stamp, checkpoint"
    }

    fn get_commits_from_checkpoint(&self) -> &str {
        "SELECT checkpoint, stream_id, stream_revision, commit_id, commit_sequence, \
                commit_stamp, headers, events \
         FROM commits \
         WHERE checkpoint > :checkpoint \
         ORDER BY checkpoint"
    }

    fn get_undispatched_commits(&self) -> &str {
        "SELECT checkpoint, stream_id, stream_revision, commit_id, commit_sequence, \
                commit_stamp, headers, events \
         FROM commits \
         WHERE dispatched = 0 \
         ORDER BY checkpoint"
    }

    fn mark_commit_as_dispatched(&self) -> &str {
        "UPDATE commits SET dispatched = 1 \
         WHERE stream_id = :stream_id AND commit_id = :commit_id"
    }

    fn append_snapshot(&self) -> &str {
        "INSERT OR IGNORE INTO snapshots (stream_id, stream_revision, payload) \
         VALUES (:stream_id, :stream_revision, :payload)"
    }

    fn update_snapshot_head(&self) -> &str {
        "INSERT INTO stream_heads (stream_id, stream_name, head_revision, snapshot_revision) \
         VALUES (:stream_id, NULL, :stream_revision, :stream_revision) \
         ON CONFLICT (stream_id) DO UPDATE SET \
             head_revision = MAX(head_revision, excluded.head_revision), \
             snapshot_revision = MAX(snapshot_revision, excluded.snapshot_revision)"
    }

    fn get_snapshot(&self) -> &str {
        "SELECT stream_revision, payload FROM snapshots \
         WHERE stream_id = :stream_id AND stream_revision <= :max_revision \
         ORDER BY stream_revision DESC \
         LIMIT 1"
    }

    fn get_streams_requiring_snapshots(&self) -> &str {
        "SELECT stream_id, stream_name, head_revision, snapshot_revision \
         FROM stream_heads \
         WHERE head_revision - snapshot_revision >= :threshold"
    }

    fn purge_storage(&self) -> &str {
        crate::schema::PURGE_STORAGE
    }

    fn paging_clause(&self) -> &str {
        " LIMIT :limit OFFSET :offset"
    }

    fn coalesce_commit_id(&self, commit_id: Uuid) -> String {
        commit_id.as_hyphenated().to_string()
    }

    fn classify_unique_violation(&self, error: &rusqlite::Error) -> Option<ConflictKind> {
        let rusqlite::Error::SqliteFailure(failure, message) = error else {
            return None;
        };
        if failure.code != rusqlite::ErrorCode::ConstraintViolation {
            return None;
        }
        // SQLite names the violated columns in the message, e.g.
        // "UNIQUE constraint failed: commits.stream_id, commits.commit_id".
        let message = message.as_deref().unwrap_or("");
        if message.contains("commits.commit_id") {
            Some(ConflictKind::DuplicateCommit)
        } else if message.contains("commits.commit_sequence") {
            Some(ConflictKind::Concurrency)
        } else {
            None
        }
    }

    fn is_transient(&self, error: &rusqlite::Error) -> bool {
        matches!(
            error,
            rusqlite::Error::SqliteFailure(failure, _)
                if failure.code == rusqlite::ErrorCode::DatabaseBusy
                    || failure.code == rusqlite::ErrorCode::DatabaseLocked
        )
    }
}
