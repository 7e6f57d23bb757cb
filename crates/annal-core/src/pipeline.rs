//! Pipeline hooks: user-supplied middleware around the read and write paths.

use tracing::warn;

use crate::error::Result;
use crate::types::Commit;

/// Middleware invoked around reads and writes.
///
/// Hooks run in configured order. All three operations default to
/// pass-through so implementors override only what they need.
pub trait PipelineHook: Send + Sync {
    /// Transform or drop a commit on the read path. Returning `None` removes
    /// the commit from the delivered sequence.
    fn select(&self, commit: Commit) -> Option<Commit> {
        Some(commit)
    }

    /// Inspect an attempt before it reaches persistence. Returning `false`
    /// vetoes the write.
    fn pre_commit(&self, _attempt: &Commit) -> bool {
        true
    }

    /// Best-effort side effect after the commit is durable. Errors are
    /// logged and swallowed by the caller.
    fn post_commit(&self, _committed: &Commit) -> Result<()> {
        Ok(())
    }
}

/// Run `commit` through every hook's `select`, short-circuiting the first
/// time a hook drops it.
pub fn select_chain(hooks: &[std::sync::Arc<dyn PipelineHook>], commit: Commit) -> Option<Commit> {
    let mut current = commit;
    for hook in hooks {
        current = hook.select(current)?;
    }
    Some(current)
}

/// Run `attempt` through every hook's `pre_commit`; the first veto wins.
pub fn pre_commit_chain(hooks: &[std::sync::Arc<dyn PipelineHook>], attempt: &Commit) -> bool {
    hooks.iter().all(|hook| hook.pre_commit(attempt))
}

/// Run `committed` through every hook's `post_commit`. Every hook is visited
/// regardless of earlier failures; failures are logged and swallowed.
pub fn post_commit_chain(hooks: &[std::sync::Arc<dyn PipelineHook>], committed: &Commit) {
    for hook in hooks {
        if let Err(e) = hook.post_commit(committed) {
            warn!(
                stream_id = committed.stream_id(),
                commit_sequence = committed.commit_sequence(),
                "post-commit hook failed: {e}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AnnalError;
    use crate::types::EventMessage;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use uuid::Uuid;

    fn commit() -> Commit {
        Commit::new(
            "stream-1",
            1,
            Uuid::new_v4(),
            1,
            Utc::now(),
            HashMap::new(),
            vec![EventMessage::new(serde_json::json!("e"))],
        )
        .unwrap()
    }

    struct Counting {
        selects: AtomicUsize,
        posts: AtomicUsize,
        drop_on_select: bool,
        veto: bool,
        fail_post: bool,
    }

    impl Counting {
        fn new() -> Self {
            Self {
                selects: AtomicUsize::new(0),
                posts: AtomicUsize::new(0),
                drop_on_select: false,
                veto: false,
                fail_post: false,
            }
        }
    }

    impl PipelineHook for Counting {
        fn select(&self, commit: Commit) -> Option<Commit> {
            self.selects.fetch_add(1, Ordering::SeqCst);
            if self.drop_on_select {
                None
            } else {
                Some(commit)
            }
        }

        fn pre_commit(&self, _attempt: &Commit) -> bool {
            !self.veto
        }

        fn post_commit(&self, _committed: &Commit) -> Result<()> {
            self.posts.fetch_add(1, Ordering::SeqCst);
            if self.fail_post {
                Err(AnnalError::Storage("boom".into()))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn select_short_circuits_after_first_drop() {
        let first = Arc::new(Counting {
            drop_on_select: true,
            ..Counting::new()
        });
        let second = Arc::new(Counting::new());
        let hooks: Vec<Arc<dyn PipelineHook>> = vec![first.clone(), second.clone()];

        assert!(select_chain(&hooks, commit()).is_none());
        assert_eq!(first.selects.load(Ordering::SeqCst), 1);
        assert_eq!(second.selects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pre_commit_first_veto_wins() {
        let hooks: Vec<Arc<dyn PipelineHook>> = vec![
            Arc::new(Counting::new()),
            Arc::new(Counting {
                veto: true,
                ..Counting::new()
            }),
        ];
        assert!(!pre_commit_chain(&hooks, &commit()));

        let hooks: Vec<Arc<dyn PipelineHook>> = vec![Arc::new(Counting::new())];
        assert!(pre_commit_chain(&hooks, &commit()));
    }

    #[test]
    fn post_commit_visits_every_hook_despite_failures() {
        let failing = Arc::new(Counting {
            fail_post: true,
            ..Counting::new()
        });
        let after = Arc::new(Counting::new());
        let hooks: Vec<Arc<dyn PipelineHook>> = vec![failing.clone(), after.clone()];

        post_commit_chain(&hooks, &commit());
        assert_eq!(failing.posts.load(Ordering::SeqCst), 1);
        assert_eq!(after.posts.load(Ordering::SeqCst), 1);
    }
}
