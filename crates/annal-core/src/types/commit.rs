use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{AnnalError, Result};
use crate::types::{Checkpoint, EventMessage};

/// A durable batch of events appended atomically against a stream's head.
///
/// Commits are created by the event stream, persisted exactly once and never
/// mutated afterwards. There is deliberately no `PartialEq` impl: compare by
/// `(stream_id, commit_sequence)` or by `commit_id`, whichever the call site
/// actually means.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    stream_id: String,
    /// Count of events in the stream including this commit, 1-based.
    stream_revision: u64,
    commit_id: Uuid,
    /// Count of commits on this stream including this one, 1-based and dense.
    commit_sequence: u64,
    commit_stamp: DateTime<Utc>,
    headers: HashMap<String, Value>,
    events: Vec<EventMessage>,
    /// Global position assigned by persistence. 0 until persisted.
    checkpoint: Checkpoint,
}

impl Commit {
    /// Build a commit attempt, validating the model invariants.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream_id: impl Into<String>,
        stream_revision: u64,
        commit_id: Uuid,
        commit_sequence: u64,
        commit_stamp: DateTime<Utc>,
        headers: HashMap<String, Value>,
        events: Vec<EventMessage>,
    ) -> Result<Self> {
        let stream_id = stream_id.into();
        if stream_id.is_empty() {
            return Err(AnnalError::InvalidArgument(
                "stream id must not be empty".into(),
            ));
        }
        if commit_id.is_nil() {
            return Err(AnnalError::InvalidArgument(
                "commit id must not be nil".into(),
            ));
        }
        if commit_sequence < 1 {
            return Err(AnnalError::InvalidArgument(
                "commit sequence starts at 1".into(),
            ));
        }
        if stream_revision < 1 {
            return Err(AnnalError::InvalidArgument(
                "stream revision starts at 1".into(),
            ));
        }
        if stream_revision < commit_sequence {
            return Err(AnnalError::InvalidArgument(format!(
                "stream revision {} cannot be below commit sequence {}",
                stream_revision, commit_sequence
            )));
        }
        if events.is_empty() {
            return Err(AnnalError::InvalidArgument(
                "a commit carries at least one event".into(),
            ));
        }
        if stream_revision < events.len() as u64 {
            return Err(AnnalError::InvalidArgument(format!(
                "stream revision {} is below the event count {}",
                stream_revision,
                events.len()
            )));
        }

        Ok(Self {
            stream_id,
            stream_revision,
            commit_id,
            commit_sequence,
            commit_stamp,
            headers,
            events,
            checkpoint: 0,
        })
    }

    /// Stamp the checkpoint assigned by persistence. Adapter-side only.
    pub fn with_checkpoint(mut self, checkpoint: Checkpoint) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn stream_revision(&self) -> u64 {
        self.stream_revision
    }

    pub fn commit_id(&self) -> Uuid {
        self.commit_id
    }

    pub fn commit_sequence(&self) -> u64 {
        self.commit_sequence
    }

    pub fn commit_stamp(&self) -> DateTime<Utc> {
        self.commit_stamp
    }

    pub fn headers(&self) -> &HashMap<String, Value> {
        &self.headers
    }

    pub fn events(&self) -> &[EventMessage] {
        &self.events
    }

    pub fn checkpoint(&self) -> Checkpoint {
        self.checkpoint
    }

    /// Revision of the first event in this commit.
    ///
    /// A commit carrying n events spans revisions
    /// `[first_event_revision, stream_revision]`.
    pub fn first_event_revision(&self) -> u64 {
        self.stream_revision - self.events.len() as u64 + 1
    }

    /// True once persistence has assigned a checkpoint.
    pub fn is_persisted(&self) -> bool {
        self.checkpoint > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event() -> EventMessage {
        EventMessage::new(json!("e"))
    }

    fn commit(revision: u64, sequence: u64, events: Vec<EventMessage>) -> Result<Commit> {
        Commit::new(
            "stream-1",
            revision,
            Uuid::new_v4(),
            sequence,
            Utc::now(),
            HashMap::new(),
            events,
        )
    }

    #[test]
    fn valid_commit_passes() {
        let c = commit(3, 2, vec![event(), event()]).unwrap();
        assert_eq!(c.first_event_revision(), 2);
        assert_eq!(c.checkpoint(), 0);
        assert!(!c.is_persisted());
    }

    #[test]
    fn rejects_nil_commit_id() {
        let err = Commit::new(
            "s",
            1,
            Uuid::nil(),
            1,
            Utc::now(),
            HashMap::new(),
            vec![event()],
        )
        .unwrap_err();
        assert!(matches!(err, AnnalError::InvalidArgument(_)));
    }

    #[test]
    fn rejects_zero_sequence_and_revision() {
        assert!(commit(1, 0, vec![event()]).is_err());
        assert!(commit(0, 1, vec![event()]).is_err());
    }

    #[test]
    fn rejects_revision_below_sequence() {
        assert!(commit(1, 2, vec![event()]).is_err());
    }

    #[test]
    fn rejects_empty_events() {
        assert!(commit(1, 1, vec![]).is_err());
    }

    #[test]
    fn rejects_revision_below_event_count() {
        // Two events ending at revision 1 would give the first event revision 0.
        assert!(commit(1, 1, vec![event(), event()]).is_err());
    }

    #[test]
    fn checkpoint_stamp() {
        let c = commit(1, 1, vec![event()]).unwrap().with_checkpoint(7);
        assert_eq!(c.checkpoint(), 7);
        assert!(c.is_persisted());
    }
}
