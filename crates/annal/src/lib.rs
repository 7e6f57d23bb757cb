//! Annal: an event-sourcing commit store
//!
//! Annal persists the history of domain aggregates as append-only streams of
//! commits:
//! - **Optimistic event stream**: per-stream working copy with staging,
//!   duplicate detection and rebase-on-conflict
//! - **Event store façade**: stream lifecycle plus a pipeline-hook chain
//!   around every read and write
//! - **Dispatch schedulers**: sync and async delivery of persisted commits
//!   to a consumer, with restart catch-up
//! - **Polling observer**: checkpoint-tailing fan-out for projections
//! - **In-memory adapter**: a conforming [`CommitStore`] for tests and
//!   ephemeral use (the `annal-sqlite` crate ships the durable one)
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use annal::{EventStore, EventMessage, InMemoryCommitStore, Result};
//! use serde_json::json;
//! use uuid::Uuid;
//!
//! # fn main() -> Result<()> {
//! let store = EventStore::builder(Arc::new(InMemoryCommitStore::new())).build()?;
//!
//! let mut stream = store.create_stream("order-42");
//! stream.add(EventMessage::new(json!({"placed": true})));
//! stream.commit_changes(Uuid::new_v4())?;
//! # Ok(())
//! # }
//! ```

pub mod dispatch;
pub mod hooked;
pub mod memory;
pub mod polling;
pub mod store;
pub mod stream;

// Re-export core types
pub use annal_core::{
    error::{AnnalError, Result},
    persistence::{CommitIterator, CommitStore},
    pipeline::PipelineHook,
    serialize::{JsonSerializer, Serializer},
    types::{Checkpoint, Commit, EventMessage, Snapshot, StreamHead},
};

// Re-export main types from this crate
pub use dispatch::{AsyncDispatchScheduler, DispatchScheduler, Dispatcher, SyncDispatchScheduler};
pub use hooked::HookedCommitStore;
pub use memory::InMemoryCommitStore;
pub use polling::{Observer, PollingConfig, PollingObserver, Subscription};
pub use store::{CommitPipeline, EventStore, EventStoreBuilder};
pub use stream::OptimisticEventStream;
