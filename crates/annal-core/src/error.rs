use std::io;

use thiserror::Error;
use uuid::Uuid;

use crate::types::Commit;

#[derive(Error, Debug)]
pub enum AnnalError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("stream '{stream_id}' has no commits between revisions {min_revision} and {max_revision}")]
    StreamNotFound {
        stream_id: String,
        min_revision: u64,
        max_revision: u64,
    },

    /// Another writer advanced the stream head first.
    ///
    /// `commits` holds the commits discovered during rebase so the caller
    /// can inspect what it lost the race to. Adapters raise this variant
    /// with an empty list; the event stream fills it in before re-raising.
    #[error("concurrent write detected on stream '{stream_id}'")]
    Concurrency {
        stream_id: String,
        commits: Vec<Commit>,
    },

    #[error("commit {commit_id} was already persisted to stream '{stream_id}'")]
    DuplicateCommit { stream_id: String, commit_id: Uuid },

    /// Transport-level failure. Retryable with backoff.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Any other persistence fault.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AnnalError>;

impl AnnalError {
    /// True for failures a caller may retry after backing off.
    pub fn is_transient(&self) -> bool {
        matches!(self, AnnalError::StorageUnavailable(_))
    }

    /// True for the two write conflicts optimistic concurrency can surface.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            AnnalError::Concurrency { .. } | AnnalError::DuplicateCommit { .. }
        )
    }
}
