//! End-to-end scenarios over the event store, streams and observer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use annal::{
    AnnalError, Checkpoint, Commit, CommitIterator, CommitStore, EventMessage, EventStore,
    InMemoryCommitStore, Observer, PollingConfig, PollingObserver, Result, Snapshot, StreamHead,
};

fn event(tag: &str) -> EventMessage {
    EventMessage::new(json!(tag))
}

fn bodies(events: &[EventMessage]) -> Vec<Value> {
    events.iter().map(|e| e.body().clone()).collect()
}

fn all_commits(store: &dyn CommitStore, stream_id: &str) -> Vec<Commit> {
    store
        .get_from(stream_id, 0, u64::MAX)
        .unwrap()
        .collect::<Result<Vec<_>>>()
        .unwrap()
}

#[test]
fn fresh_commit_lands_at_revision_one() {
    let persistence = Arc::new(InMemoryCommitStore::new());
    let store = EventStore::builder(persistence.clone()).build().unwrap();

    let mut stream = store.create_stream("S");
    stream.add(event("a"));
    stream.commit_changes(Uuid::new_v4()).unwrap();

    let persisted = all_commits(&*persistence, "S");
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].stream_revision(), 1);
    assert_eq!(persisted[0].commit_sequence(), 1);
    assert_eq!(bodies(persisted[0].events()), vec![json!("a")]);

    assert!(stream.uncommitted_events().is_empty());
    assert_eq!(bodies(stream.committed_events()), vec![json!("a")]);
    assert_eq!(stream.stream_revision(), 1);
}

#[test]
fn opening_an_empty_stream_with_min_revision_fails() {
    let store = EventStore::builder(Arc::new(InMemoryCommitStore::new()))
        .build()
        .unwrap();

    let err = store.open_stream("S", 1, u64::MAX).unwrap_err();
    match err {
        AnnalError::StreamNotFound { stream_id, .. } => assert_eq!(stream_id, "S"),
        other => panic!("expected StreamNotFound, got {other}"),
    }
}

#[test]
fn losing_writer_rebases_and_retries_at_the_advanced_head() {
    let persistence = Arc::new(InMemoryCommitStore::new());
    let store = EventStore::builder(persistence.clone()).build().unwrap();

    let mut seed = store.create_stream("S");
    seed.add(event("a"));
    seed.commit_changes(Uuid::new_v4()).unwrap();

    // Two working copies both open at revision 1.
    let mut loser = store.open_stream("S", 1, u64::MAX).unwrap();
    let mut winner = store.open_stream("S", 1, u64::MAX).unwrap();

    winner.add(event("w"));
    winner.commit_changes(Uuid::new_v4()).unwrap();

    loser.add(event("b"));
    let err = loser.commit_changes(Uuid::new_v4()).unwrap_err();
    match &err {
        AnnalError::Concurrency { commits, .. } => {
            assert_eq!(commits.len(), 1);
            assert_eq!(commits[0].stream_revision(), 2);
            assert_eq!(commits[0].commit_sequence(), 2);
        }
        other => panic!("expected Concurrency, got {other}"),
    }

    // The retained staged event goes through on retry at (rev 3, seq 3).
    loser.commit_changes(Uuid::new_v4()).unwrap();
    let persisted = all_commits(&*persistence, "S");
    let last = persisted.last().unwrap();
    assert_eq!(last.stream_revision(), 3);
    assert_eq!(last.commit_sequence(), 3);
    assert_eq!(bodies(last.events()), vec![json!("b")]);
}

/// Counts writes so a test can assert the stream short-circuited.
struct CountingWrites {
    inner: InMemoryCommitStore,
    commits: AtomicUsize,
}

impl CommitStore for CountingWrites {
    fn initialize(&self) -> Result<()> {
        self.inner.initialize()
    }

    fn get_from(&self, stream_id: &str, min: u64, max: u64) -> Result<Box<dyn CommitIterator>> {
        self.inner.get_from(stream_id, min, max)
    }

    fn get_from_instant(&self, start: DateTime<Utc>) -> Result<Box<dyn CommitIterator>> {
        self.inner.get_from_instant(start)
    }

    fn get_from_to(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Box<dyn CommitIterator>> {
        self.inner.get_from_to(start, end)
    }

    fn get_from_checkpoint(&self, checkpoint: Checkpoint) -> Result<Box<dyn CommitIterator>> {
        self.inner.get_from_checkpoint(checkpoint)
    }

    fn commit(&self, attempt: Commit) -> Result<Commit> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.inner.commit(attempt)
    }

    fn get_undispatched_commits(&self) -> Result<Box<dyn CommitIterator>> {
        self.inner.get_undispatched_commits()
    }

    fn mark_commit_as_dispatched(&self, commit: &Commit) -> Result<()> {
        self.inner.mark_commit_as_dispatched(commit)
    }

    fn get_streams_to_snapshot(&self, threshold: u64) -> Result<Vec<StreamHead>> {
        self.inner.get_streams_to_snapshot(threshold)
    }

    fn get_snapshot(&self, stream_id: &str, max: u64) -> Result<Option<Snapshot>> {
        self.inner.get_snapshot(stream_id, max)
    }

    fn add_snapshot(&self, snapshot: Snapshot) -> Result<bool> {
        self.inner.add_snapshot(snapshot)
    }
}

#[test]
fn staging_under_a_known_commit_id_never_reaches_persistence() {
    let persistence = Arc::new(CountingWrites {
        inner: InMemoryCommitStore::new(),
        commits: AtomicUsize::new(0),
    });
    let store = EventStore::builder(persistence.clone()).build().unwrap();

    let mut seed = store.create_stream("S");
    let reused = Uuid::new_v4();
    seed.add(event("a"));
    seed.commit_changes(reused).unwrap();
    assert_eq!(persistence.commits.load(Ordering::SeqCst), 1);

    let mut stream = store.open_stream("S", 1, u64::MAX).unwrap();
    stream.add(event("x"));
    let err = stream.commit_changes(reused).unwrap_err();

    assert!(matches!(err, AnnalError::DuplicateCommit { .. }));
    assert_eq!(persistence.commits.load(Ordering::SeqCst), 1);
}

/// Hands out a preset page once; a second read or a restarted iteration
/// trips the counters.
struct SinglePass {
    page: Mutex<Option<Vec<Commit>>>,
    reads: AtomicUsize,
}

impl CommitStore for SinglePass {
    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    fn get_from(&self, _stream_id: &str, _min: u64, _max: u64) -> Result<Box<dyn CommitIterator>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let page = self.page.lock().take().unwrap_or_default();
        Ok(Box::new(page.into_iter().map(Ok)))
    }

    fn get_from_instant(&self, _start: DateTime<Utc>) -> Result<Box<dyn CommitIterator>> {
        Ok(Box::new(std::iter::empty()))
    }

    fn get_from_to(
        &self,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Box<dyn CommitIterator>> {
        Ok(Box::new(std::iter::empty()))
    }

    fn get_from_checkpoint(&self, _checkpoint: Checkpoint) -> Result<Box<dyn CommitIterator>> {
        Ok(Box::new(std::iter::empty()))
    }

    fn commit(&self, _attempt: Commit) -> Result<Commit> {
        Err(AnnalError::Storage("read-only fixture".into()))
    }

    fn get_undispatched_commits(&self) -> Result<Box<dyn CommitIterator>> {
        Ok(Box::new(std::iter::empty()))
    }

    fn mark_commit_as_dispatched(&self, _commit: &Commit) -> Result<()> {
        Ok(())
    }

    fn get_streams_to_snapshot(&self, _threshold: u64) -> Result<Vec<StreamHead>> {
        Ok(Vec::new())
    }

    fn get_snapshot(&self, _stream_id: &str, _max: u64) -> Result<Option<Snapshot>> {
        Ok(None)
    }

    fn add_snapshot(&self, _snapshot: Snapshot) -> Result<bool> {
        Ok(false)
    }
}

#[test]
fn opening_from_a_snapshot_at_head_reads_the_history_once() {
    // One commit at the snapshot's own revision; nothing newer to replay.
    let head_commit = Commit::new(
        "S",
        42,
        Uuid::new_v4(),
        15,
        Utc::now(),
        HashMap::new(),
        vec![event("head")],
    )
    .unwrap()
    .with_checkpoint(99);

    let persistence = Arc::new(SinglePass {
        page: Mutex::new(Some(vec![head_commit])),
        reads: AtomicUsize::new(0),
    });
    let store = EventStore::builder(persistence.clone()).build().unwrap();

    let snapshot = Snapshot::new("S", 42, json!({"state": "caught-up"})).unwrap();
    let stream = store.open_stream_from_snapshot(&snapshot, u64::MAX).unwrap();

    assert_eq!(stream.stream_revision(), 42);
    assert_eq!(stream.commit_sequence(), 15);
    assert!(stream.committed_events().is_empty());
    assert_eq!(persistence.reads.load(Ordering::SeqCst), 1);
}

#[derive(Default)]
struct Collecting {
    seen: Mutex<Vec<Checkpoint>>,
}

impl Observer for Collecting {
    fn on_next(&self, commit: Commit) -> Result<()> {
        self.seen.lock().push(commit.checkpoint());
        Ok(())
    }
}

#[tokio::test]
async fn observer_only_sees_checkpoints_past_its_cursor() {
    let persistence = Arc::new(InMemoryCommitStore::new());
    for sequence in 1..=12u64 {
        let attempt = Commit::new(
            "S",
            sequence,
            Uuid::new_v4(),
            sequence,
            Utc::now(),
            HashMap::new(),
            vec![event("e")],
        )
        .unwrap();
        persistence.commit(attempt).unwrap();
    }

    let observer = PollingObserver::new(
        persistence,
        PollingConfig {
            interval: Duration::from_millis(5),
        },
        10,
    );
    let subscriber = Arc::new(Collecting::default());
    let _subscription = observer.subscribe(subscriber.clone());

    observer.start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    observer.stop().await;

    assert_eq!(*subscriber.seen.lock(), vec![11, 12]);
}
