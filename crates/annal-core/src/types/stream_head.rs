use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Advisory pointer to the latest persisted revision of a stream.
///
/// Heads are updated on every persisted commit and on snapshot add; they are
/// never a source of truth for reads. Equality and hashing are by
/// `stream_id` alone so a set of heads holds one entry per stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamHead {
    stream_id: String,
    stream_name: Option<String>,
    head_revision: u64,
    /// 0 when the stream has never been snapshotted.
    snapshot_revision: u64,
}

impl StreamHead {
    pub fn new(
        stream_id: impl Into<String>,
        stream_name: Option<String>,
        head_revision: u64,
        snapshot_revision: u64,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            stream_name,
            head_revision,
            snapshot_revision,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn stream_name(&self) -> Option<&str> {
        self.stream_name.as_deref()
    }

    pub fn head_revision(&self) -> u64 {
        self.head_revision
    }

    pub fn snapshot_revision(&self) -> u64 {
        self.snapshot_revision
    }

    /// Events accumulated since the last snapshot.
    pub fn unsnapshotted(&self) -> u64 {
        self.head_revision.saturating_sub(self.snapshot_revision)
    }
}

impl PartialEq for StreamHead {
    fn eq(&self, other: &Self) -> bool {
        self.stream_id == other.stream_id
    }
}

impl Eq for StreamHead {}

impl Hash for StreamHead {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.stream_id.hash(state);
    }
}
