//! SQLite-backed commit store.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{named_params, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info};
use uuid::Uuid;

use annal_core::error::{AnnalError, Result};
use annal_core::persistence::{CommitIterator, CommitStore};
use annal_core::serialize::{JsonSerializer, Serializer};
use annal_core::types::{Checkpoint, Commit, EventMessage, Snapshot, StreamHead};

use crate::dialect::{ConflictKind, SqlDialect, SqliteDialect};

/// `PRAGMA synchronous` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynchronousMode {
    Full,
    Normal,
    Off,
}

#[derive(Debug, Clone)]
pub struct SqliteConfig {
    pub path: PathBuf,

    /// Enable WAL mode. Readers then never block the writer.
    pub wal_mode: bool,

    pub synchronous: SynchronousMode,

    /// `PRAGMA cache_size` value (negative means KiB).
    pub cache_size: i64,

    /// Rows fetched per page on lazy reads.
    pub page_size: usize,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/annal.db"),
            wal_mode: true,
            synchronous: SynchronousMode::Normal,
            cache_size: -16_000, // 16MB
            page_size: 512,
        }
    }
}

/// SQLite implementation of the persistence contract.
///
/// A single writer connection is shared behind a mutex; every operation
/// acquires it for the duration of one statement or transaction, so the
/// store is safe under concurrent callers. Lazy reads page through the
/// result set and re-acquire the connection per page.
pub struct SqliteCommitStore {
    conn: Arc<Mutex<Connection>>,
    dialect: Arc<dyn SqlDialect>,
    serializer: JsonSerializer,
    config: SqliteConfig,
    init_guard: AtomicUsize,
}

impl SqliteCommitStore {
    /// Open (or create) the database at `config.path`.
    pub fn open(config: SqliteConfig) -> Result<Self> {
        Self::open_with_dialect(config, Arc::new(SqliteDialect))
    }

    /// Open with a custom dialect. The dialect supplies every statement the
    /// store runs, so a compatible backend only needs this entry point.
    pub fn open_with_dialect(config: SqliteConfig, dialect: Arc<dyn SqlDialect>) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open_with_flags(
            &config.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(|e| AnnalError::StorageUnavailable(e.to_string()))?;
        Self::configure_connection(&conn, &config)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            dialect,
            serializer: JsonSerializer,
            config,
            init_guard: AtomicUsize::new(0),
        })
    }

    /// An ephemeral store for tests and scratch use.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AnnalError::StorageUnavailable(e.to_string()))?;
        let config = SqliteConfig {
            wal_mode: false,
            ..SqliteConfig::default()
        };
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            dialect: Arc::new(SqliteDialect),
            serializer: JsonSerializer,
            config,
            init_guard: AtomicUsize::new(0),
        })
    }

    fn configure_connection(conn: &Connection, config: &SqliteConfig) -> Result<()> {
        if config.wal_mode {
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(|e| AnnalError::Storage(e.to_string()))?;
        }
        let sync_mode = match config.synchronous {
            SynchronousMode::Full => "FULL",
            SynchronousMode::Normal => "NORMAL",
            SynchronousMode::Off => "OFF",
        };
        conn.pragma_update(None, "synchronous", sync_mode)
            .map_err(|e| AnnalError::Storage(e.to_string()))?;
        conn.pragma_update(None, "cache_size", config.cache_size)
            .map_err(|e| AnnalError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Administrative wipe. Checkpoints keep counting across a purge.
    pub fn purge(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(self.dialect.purge_storage())
            .map_err(|e| self.translate(e))
    }

    fn translate(&self, error: rusqlite::Error) -> AnnalError {
        if self.dialect.is_transient(&error) {
            AnnalError::StorageUnavailable(error.to_string())
        } else {
            AnnalError::Storage(error.to_string())
        }
    }

    fn paged(&self, statement: &str, query: PageQuery) -> Box<dyn CommitIterator> {
        Box::new(PagedCommits {
            conn: self.conn.clone(),
            dialect: self.dialect.clone(),
            serializer: self.serializer,
            sql: format!("{}{}", statement, self.dialect.paging_clause()),
            query,
            page_size: self.config.page_size.max(1),
            offset: 0,
            buffer: VecDeque::new(),
            exhausted: false,
            failed: false,
        })
    }
}

/// SQLite integers are signed; clamp the open-ended u64 bounds the core
/// uses so they stay open-ended in SQL.
fn clamp(value: u64) -> i64 {
    value.min(i64::MAX as u64) as i64
}

impl CommitStore for SqliteCommitStore {
    fn initialize(&self) -> Result<()> {
        if self.init_guard.fetch_add(1, Ordering::SeqCst) > 0 {
            return Ok(());
        }
        info!(path = %self.config.path.display(), "initializing commit storage");
        let conn = self.conn.lock();
        conn.execute_batch(self.dialect.initialize_storage())
            .map_err(|e| self.translate(e))
    }

    fn get_from(
        &self,
        stream_id: &str,
        min_revision: u64,
        max_revision: u64,
    ) -> Result<Box<dyn CommitIterator>> {
        Ok(self.paged(
            self.dialect.get_commits_from_revision(),
            PageQuery::Revision {
                stream_id: stream_id.to_string(),
                min_revision: clamp(min_revision),
                max_revision: clamp(max_revision),
            },
        ))
    }

    fn get_from_instant(&self, start: DateTime<Utc>) -> Result<Box<dyn CommitIterator>> {
        Ok(self.paged(
            self.dialect.get_commits_from_instant(),
            PageQuery::Instant {
                start: start.timestamp_micros(),
            },
        ))
    }

    fn get_from_to(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Box<dyn CommitIterator>> {
        Ok(self.paged(
            self.dialect.get_commits_from_to(),
            PageQuery::Window {
                start: start.timestamp_micros(),
                end: end.timestamp_micros(),
            },
        ))
    }

    fn get_from_checkpoint(&self, checkpoint: Checkpoint) -> Result<Box<dyn CommitIterator>> {
        Ok(self.paged(
            self.dialect.get_commits_from_checkpoint(),
            PageQuery::CheckpointTail {
                checkpoint: clamp(checkpoint),
            },
        ))
    }

    fn commit(&self, attempt: Commit) -> Result<Commit> {
        let headers = self.serializer.serialize(attempt.headers())?;
        let events = self.serializer.serialize(&attempt.events())?;

        let mut conn = self.conn.lock();
        let txn = conn.transaction().map_err(|e| self.translate(e))?;

        let inserted = txn.execute(
            self.dialect.persist_commit(),
            named_params! {
                ":stream_id": attempt.stream_id(),
                ":stream_revision": attempt.stream_revision() as i64,
                ":commit_id": self.dialect.coalesce_commit_id(attempt.commit_id()),
                ":commit_sequence": attempt.commit_sequence() as i64,
                ":commit_stamp": attempt.commit_stamp().timestamp_micros(),
                ":headers": headers,
                ":events": events,
                ":event_count": attempt.events().len() as i64,
            },
        );
        if let Err(error) = inserted {
            // The open transaction rolls back on drop.
            return Err(match self.dialect.classify_unique_violation(&error) {
                Some(ConflictKind::DuplicateCommit) => AnnalError::DuplicateCommit {
                    stream_id: attempt.stream_id().to_string(),
                    commit_id: attempt.commit_id(),
                },
                Some(ConflictKind::Concurrency) => AnnalError::Concurrency {
                    stream_id: attempt.stream_id().to_string(),
                    commits: Vec::new(),
                },
                None => self.translate(error),
            });
        }

        let checkpoint = txn.last_insert_rowid() as u64;
        txn.execute(
            self.dialect.update_stream_head(),
            named_params! {
                ":stream_id": attempt.stream_id(),
                ":head_revision": attempt.stream_revision() as i64,
            },
        )
        .map_err(|e| self.translate(e))?;
        txn.commit().map_err(|e| self.translate(e))?;

        debug!(
            stream_id = attempt.stream_id(),
            commit_sequence = attempt.commit_sequence(),
            checkpoint,
            "persisted commit"
        );
        Ok(attempt.with_checkpoint(checkpoint))
    }

    fn get_undispatched_commits(&self) -> Result<Box<dyn CommitIterator>> {
        Ok(self.paged(
            self.dialect.get_undispatched_commits(),
            PageQuery::Undispatched,
        ))
    }

    fn mark_commit_as_dispatched(&self, commit: &Commit) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            self.dialect.mark_commit_as_dispatched(),
            named_params! {
                ":stream_id": commit.stream_id(),
                ":commit_id": self.dialect.coalesce_commit_id(commit.commit_id()),
            },
        )
        .map_err(|e| self.translate(e))?;
        Ok(())
    }

    fn get_streams_to_snapshot(&self, threshold: u64) -> Result<Vec<StreamHead>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(self.dialect.get_streams_requiring_snapshots())
            .map_err(|e| self.translate(e))?;
        let heads = stmt
            .query_map(
                named_params! { ":threshold": clamp(threshold) },
                |row| {
                    Ok(StreamHead::new(
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, i64>(2)? as u64,
                        row.get::<_, i64>(3)? as u64,
                    ))
                },
            )
            .map_err(|e| self.translate(e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| self.translate(e))?;
        Ok(heads)
    }

    fn get_snapshot(&self, stream_id: &str, max_revision: u64) -> Result<Option<Snapshot>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                self.dialect.get_snapshot(),
                named_params! {
                    ":stream_id": stream_id,
                    ":max_revision": clamp(max_revision),
                },
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)),
            )
            .optional()
            .map_err(|e| self.translate(e))?;

        match row {
            Some((revision, payload)) => {
                let payload = self.serializer.deserialize(&payload)?;
                Ok(Some(Snapshot::new(stream_id, revision as u64, payload)?))
            }
            None => Ok(None),
        }
    }

    fn add_snapshot(&self, snapshot: Snapshot) -> Result<bool> {
        let payload = self.serializer.serialize(snapshot.payload())?;

        let mut conn = self.conn.lock();
        let txn = conn.transaction().map_err(|e| self.translate(e))?;

        let inserted = txn
            .execute(
                self.dialect.append_snapshot(),
                named_params! {
                    ":stream_id": snapshot.stream_id(),
                    ":stream_revision": snapshot.stream_revision() as i64,
                    ":payload": payload,
                },
            )
            .map_err(|e| self.translate(e))?;
        if inserted == 0 {
            return Ok(false);
        }

        txn.execute(
            self.dialect.update_snapshot_head(),
            named_params! {
                ":stream_id": snapshot.stream_id(),
                ":stream_revision": snapshot.stream_revision() as i64,
            },
        )
        .map_err(|e| self.translate(e))?;
        txn.commit().map_err(|e| self.translate(e))?;
        Ok(true)
    }
}

enum PageQuery {
    Revision {
        stream_id: String,
        min_revision: i64,
        max_revision: i64,
    },
    Instant {
        start: i64,
    },
    Window {
        start: i64,
        end: i64,
    },
    CheckpointTail {
        checkpoint: i64,
    },
    Undispatched,
}

struct RawCommit {
    checkpoint: i64,
    stream_id: String,
    stream_revision: i64,
    commit_id: String,
    commit_sequence: i64,
    commit_stamp: i64,
    headers: Vec<u8>,
    events: Vec<u8>,
}

impl RawCommit {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            checkpoint: row.get(0)?,
            stream_id: row.get(1)?,
            stream_revision: row.get(2)?,
            commit_id: row.get(3)?,
            commit_sequence: row.get(4)?,
            commit_stamp: row.get(5)?,
            headers: row.get(6)?,
            events: row.get(7)?,
        })
    }

    fn into_commit(self, serializer: &JsonSerializer) -> Result<Commit> {
        let commit_id = Uuid::parse_str(&self.commit_id)
            .map_err(|e| AnnalError::Storage(format!("malformed commit id: {e}")))?;
        let commit_stamp = DateTime::from_timestamp_micros(self.commit_stamp)
            .ok_or_else(|| AnnalError::Storage("commit stamp out of range".into()))?;
        let headers = serializer.deserialize(&self.headers)?;
        let events: Vec<EventMessage> = serializer.deserialize(&self.events)?;

        Ok(Commit::new(
            self.stream_id,
            self.stream_revision as u64,
            commit_id,
            self.commit_sequence as u64,
            commit_stamp,
            headers,
            events,
        )?
        .with_checkpoint(self.checkpoint as u64))
    }
}

/// Lazy single-pass iterator that fetches one page per connection
/// acquisition.
struct PagedCommits {
    conn: Arc<Mutex<Connection>>,
    dialect: Arc<dyn SqlDialect>,
    serializer: JsonSerializer,
    sql: String,
    query: PageQuery,
    page_size: usize,
    offset: i64,
    buffer: VecDeque<Commit>,
    exhausted: bool,
    failed: bool,
}

impl PagedCommits {
    fn fill(&mut self) -> Result<()> {
        let raw = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare_cached(&self.sql)
                .map_err(|e| self.translate(e))?;
            let limit = self.page_size as i64;
            let offset = self.offset;

            let rows = match &self.query {
                PageQuery::Revision {
                    stream_id,
                    min_revision,
                    max_revision,
                } => stmt.query_map(
                    named_params! {
                        ":stream_id": stream_id,
                        ":min_revision": min_revision,
                        ":max_revision": max_revision,
                        ":limit": limit,
                        ":offset": offset,
                    },
                    RawCommit::from_row,
                ),
                PageQuery::Instant { start } => stmt.query_map(
                    named_params! {
                        ":start": start,
                        ":limit": limit,
                        ":offset": offset,
                    },
                    RawCommit::from_row,
                ),
                PageQuery::Window { start, end } => stmt.query_map(
                    named_params! {
                        ":start": start,
                        ":end": end,
                        ":limit": limit,
                        ":offset": offset,
                    },
                    RawCommit::from_row,
                ),
                PageQuery::CheckpointTail { checkpoint } => stmt.query_map(
                    named_params! {
                        ":checkpoint": checkpoint,
                        ":limit": limit,
                        ":offset": offset,
                    },
                    RawCommit::from_row,
                ),
                PageQuery::Undispatched => stmt.query_map(
                    named_params! {
                        ":limit": limit,
                        ":offset": offset,
                    },
                    RawCommit::from_row,
                ),
            }
            .map_err(|e| self.translate(e))?
            .collect::<rusqlite::Result<Vec<RawCommit>>>()
            .map_err(|e| self.translate(e))?;
            rows
        };

        self.offset += raw.len() as i64;
        if raw.len() < self.page_size {
            self.exhausted = true;
        }
        for row in raw {
            self.buffer.push_back(row.into_commit(&self.serializer)?);
        }
        Ok(())
    }

    fn translate(&self, error: rusqlite::Error) -> AnnalError {
        if self.dialect.is_transient(&error) {
            AnnalError::StorageUnavailable(error.to_string())
        } else {
            AnnalError::Storage(error.to_string())
        }
    }
}

impl Iterator for PagedCommits {
    type Item = Result<Commit>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.failed = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
