//! SQLite persistence adapter for the annal commit store.
//!
//! Implements [`annal_core::CommitStore`] over a single SQLite database:
//! - checkpoint allocation via `INTEGER PRIMARY KEY AUTOINCREMENT`
//! - optimistic concurrency via unique indexes on
//!   `(stream_id, commit_sequence)` and `(stream_id, commit_id)`, with the
//!   violation translated through the [`dialect::SqlDialect`]
//! - lazy single-pass reads that page through result sets
//!
//! The dialect trait carries every statement the store runs, so porting to
//! another relational backend is a matter of implementing it.

pub mod dialect;
pub mod schema;
pub mod store;

pub use dialect::{ConflictKind, SqlDialect, SqliteDialect};
pub use store::{SqliteCommitStore, SqliteConfig, SynchronousMode};
