pub mod commit;
pub mod event;
pub mod snapshot;
pub mod stream_head;

pub use commit::Commit;
pub use event::EventMessage;
pub use snapshot::Snapshot;
pub use stream_head::StreamHead;

/// Checkpoint position - strictly monotonic u64 assigned by persistence.
///
/// `0` is the sentinel for "not yet persisted"; every stored commit gets a
/// checkpoint of 1 or greater.
pub type Checkpoint = u64;
