//! SQLite DDL for the commit store.

/// Idempotent schema setup. Safe to run from multiple processes; every
/// statement is `IF NOT EXISTS`.
pub const INITIALIZE_STORAGE: &str = "
CREATE TABLE IF NOT EXISTS commits (
    checkpoint      INTEGER PRIMARY KEY AUTOINCREMENT,
    stream_id       TEXT    NOT NULL,
    stream_revision INTEGER NOT NULL,
    commit_id       TEXT    NOT NULL,
    commit_sequence INTEGER NOT NULL,
    commit_stamp    INTEGER NOT NULL,
    headers         BLOB    NOT NULL,
    events          BLOB    NOT NULL,
    event_count     INTEGER NOT NULL,
    dispatched      INTEGER NOT NULL DEFAULT 0
);

CREATE UNIQUE INDEX IF NOT EXISTS ux_commits_stream_sequence
    ON commits (stream_id, commit_sequence);

CREATE UNIQUE INDEX IF NOT EXISTS ux_commits_stream_commit_id
    ON commits (stream_id, commit_id);

CREATE INDEX IF NOT EXISTS ix_commits_stream_revision
    ON commits (stream_id, stream_revision);

CREATE INDEX IF NOT EXISTS ix_commits_stamp
    ON commits (commit_stamp);

CREATE INDEX IF NOT EXISTS ix_commits_undispatched
    ON commits (checkpoint) WHERE dispatched = 0;

CREATE TABLE IF NOT EXISTS snapshots (
    stream_id       TEXT    NOT NULL,
    stream_revision INTEGER NOT NULL,
    payload         BLOB    NOT NULL,
    PRIMARY KEY (stream_id, stream_revision)
);

CREATE TABLE IF NOT EXISTS stream_heads (
    stream_id         TEXT PRIMARY KEY,
    stream_name       TEXT,
    head_revision     INTEGER NOT NULL,
    snapshot_revision INTEGER NOT NULL DEFAULT 0
);
";

/// Administrative wipe. The AUTOINCREMENT sequence is kept so checkpoints
/// never regress across a purge.
pub const PURGE_STORAGE: &str = "
DELETE FROM commits;
DELETE FROM snapshots;
DELETE FROM stream_heads;
";
