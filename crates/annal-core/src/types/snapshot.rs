use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AnnalError, Result};

/// A materialization of stream state at a given revision, used to bound
/// replay. Created out-of-band and never mutated; persistence keeps at most
/// one snapshot per `(stream_id, stream_revision)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    stream_id: String,
    stream_revision: u64,
    payload: Value,
}

impl Snapshot {
    pub fn new(stream_id: impl Into<String>, stream_revision: u64, payload: Value) -> Result<Self> {
        let stream_id = stream_id.into();
        if stream_id.is_empty() {
            return Err(AnnalError::InvalidArgument(
                "stream id must not be empty".into(),
            ));
        }
        if stream_revision < 1 {
            return Err(AnnalError::InvalidArgument(
                "a snapshot summarizes at least one event".into(),
            ));
        }
        Ok(Self {
            stream_id,
            stream_revision,
            payload,
        })
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// The revision as of which this snapshot summarizes state.
    pub fn stream_revision(&self) -> u64 {
        self.stream_revision
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }
}
