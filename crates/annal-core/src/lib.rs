//! Annal Core: traits and types for the annal commit store
//!
//! This crate defines the core abstractions for an event-sourcing commit
//! store:
//! - Domain model: [`Commit`], [`EventMessage`], [`Snapshot`], [`StreamHead`]
//! - Persistence contract: [`CommitStore`] with lazy single-pass reads
//! - Pipeline hooks: middleware filtering/observing commits on read and write
//! - Serializer contract with a JSON default
//!
//! Key properties:
//! - Optimistic concurrency: writes declare the expected head via
//!   `commit_sequence` and fail when another writer advanced it
//! - Global ordering: persistence assigns a strictly monotonic checkpoint
//!   to every commit across all streams
//! - Idempotent writes: a commit id is persisted at most once per stream

pub mod error;
pub mod observe;
pub mod persistence;
pub mod pipeline;
pub mod serialize;
pub mod types;

pub use error::{AnnalError, Result};
pub use persistence::{CommitIterator, CommitStore};
pub use pipeline::PipelineHook;
pub use serialize::{JsonSerializer, Serializer};
pub use types::{Checkpoint, Commit, EventMessage, Snapshot, StreamHead};
