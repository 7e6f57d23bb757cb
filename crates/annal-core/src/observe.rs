//! Optional metrics instrumentation.
//!
//! With the `observe` feature enabled, key operations emit counters and
//! histograms via the [`metrics`] crate; a downstream application installs
//! the recorder. Without the feature every function here is a zero-cost
//! no-op.

/// Record a persisted commit (counter + latency histogram).
///
/// - `annal.commit.total` – incremented per durable commit
/// - `annal.commit.duration_seconds` – commit latency
#[inline]
pub fn record_commit(duration: std::time::Duration, events: usize) {
    #[cfg(feature = "observe")]
    {
        metrics::counter!("annal.commit.total").increment(1);
        metrics::counter!("annal.commit.events_total").increment(events as u64);
        metrics::histogram!("annal.commit.duration_seconds").record(duration.as_secs_f64());
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = (duration, events);
    }
}

/// Record a write conflict.
///
/// - `annal.commit.conflicts_total` – counter with `kind` label
///   (`concurrency` / `duplicate`)
#[inline]
pub fn record_conflict(duplicate: bool) {
    #[cfg(feature = "observe")]
    {
        let kind = if duplicate { "duplicate" } else { "concurrency" };
        metrics::counter!("annal.commit.conflicts_total", "kind" => kind).increment(1);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = duplicate;
    }
}

/// Record a dispatched commit.
///
/// - `annal.dispatch.total` – counter with `outcome` label (`ok` / `fail`)
#[inline]
pub fn record_dispatch(success: bool) {
    #[cfg(feature = "observe")]
    {
        let outcome = if success { "ok" } else { "fail" };
        metrics::counter!("annal.dispatch.total", "outcome" => outcome).increment(1);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = success;
    }
}

/// Record one polling-observer page.
///
/// - `annal.polling.pages_total` – counter
/// - `annal.polling.commits_delivered_total` – counter
#[inline]
pub fn record_poll(delivered: usize) {
    #[cfg(feature = "observe")]
    {
        metrics::counter!("annal.polling.pages_total").increment(1);
        metrics::counter!("annal.polling.commits_delivered_total").increment(delivered as u64);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = delivered;
    }
}
