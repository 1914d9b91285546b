//! Coalesce concurrent callers onto one spawned attempt.
//!
//! The first caller starts the work on its own task; everyone who arrives
//! while it runs joins the same [`Flight`] and observes the same outcome. The
//! slot is released when the attempt resolves or its timeout fires, whichever
//! comes first. A timed-out attempt keeps running in the background; its
//! [`FlightTicket`] tells it whether a newer attempt has started since, so it
//! can drop a result nobody should see.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

use crate::error::{Result, SyncError};

/// The shared outcome of one attempt.
pub(crate) type Flight<V> = Shared<BoxFuture<'static, Result<V>>>;

/// Identifies one attempt.
#[derive(Debug, Clone)]
pub(crate) struct FlightTicket {
    seq: u64,
    latest: Arc<AtomicU64>,
}

impl FlightTicket {
    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    /// `false` once a newer attempt has started or the flight was reset.
    pub(crate) fn is_current(&self) -> bool {
        self.latest.load(Ordering::Acquire) == self.seq
    }
}

struct InFlight<V> {
    seq: u64,
    outcome: Flight<V>,
}

pub(crate) struct SingleFlight<V> {
    slot: Arc<Mutex<Option<InFlight<V>>>>,
    latest: Arc<AtomicU64>,
    timeout: Option<Duration>,
}

impl<V> Clone for SingleFlight<V> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            latest: Arc::clone(&self.latest),
            timeout: self.timeout,
        }
    }
}

impl<V> SingleFlight<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// A flight whose waiters wait as long as the work takes.
    pub(crate) fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            latest: Arc::new(AtomicU64::new(0)),
            timeout: None,
        }
    }

    /// A flight whose waiters give up with [`SyncError::Timeout`] after `timeout`.
    pub(crate) fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::new()
        }
    }

    /// Join the attempt in flight, or start one with `start`.
    ///
    /// Returns the shared outcome and whether this call started the attempt.
    /// Must be called from within a Tokio runtime.
    pub(crate) fn run<F, Fut>(&self, start: F) -> (Flight<V>, bool)
    where
        F: FnOnce(FlightTicket) -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let mut slot = self.lock_slot();
        if let Some(in_flight) = slot.as_ref() {
            return (in_flight.outcome.clone(), false);
        }

        let seq = self.latest.fetch_add(1, Ordering::AcqRel) + 1;
        let ticket = FlightTicket {
            seq,
            latest: Arc::clone(&self.latest),
        };
        let task = tokio::spawn(start(ticket));

        let release = Arc::clone(&self.slot);
        let timeout = self.timeout;
        let outcome = async move {
            let joined = match timeout {
                Some(limit) => match tokio::time::timeout(limit, task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        debug!(attempt = seq, "flight timed out, leaving the attempt to finish");
                        Self::release(&release, seq);
                        return Err(SyncError::Timeout);
                    }
                },
                None => task.await,
            };
            Self::release(&release, seq);
            joined.unwrap_or_else(|err| Err(SyncError::TaskFailed(err.to_string())))
        }
        .boxed()
        .shared();

        // Drive the outcome even if every caller stops waiting, so the slot
        // is always released.
        tokio::spawn(outcome.clone());

        *slot = Some(InFlight {
            seq,
            outcome: outcome.clone(),
        });
        (outcome, true)
    }

    /// `true` while an attempt occupies the slot.
    pub(crate) fn in_flight(&self) -> bool {
        self.lock_slot().is_some()
    }

    /// Forget the attempt in flight. Its ticket stops being current and the
    /// next [`run`](Self::run) starts fresh.
    pub(crate) fn reset(&self) {
        let mut slot = self.lock_slot();
        self.latest.fetch_add(1, Ordering::AcqRel);
        *slot = None;
    }

    fn release(slot: &Mutex<Option<InFlight<V>>>, seq: u64) {
        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|f| f.seq == seq) {
            *slot = None;
        }
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Option<InFlight<V>>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn concurrent_callers_share_one_attempt() {
        let flight = SingleFlight::<u32>::new();
        let starts = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let mut outcomes = Vec::new();
        for _ in 0..5 {
            let starts = Arc::clone(&starts);
            let gate = Arc::clone(&gate);
            let (outcome, _) = flight.run(move |_| async move {
                starts.fetch_add(1, Ordering::SeqCst);
                gate.notified().await;
                Ok(42)
            });
            outcomes.push(outcome);
        }
        tokio::task::yield_now().await;
        gate.notify_one();

        for outcome in outcomes {
            assert_eq!(outcome.await, Ok(42));
        }
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert!(!flight.in_flight());
    }

    #[tokio::test]
    async fn failure_is_shared_and_slot_released() {
        let flight = SingleFlight::<u32>::new();
        let (a, started_a) = flight.run(|_| async { Err(SyncError::Transport("reset".into())) });
        let (b, started_b) = flight.run(|_| async { Ok(1) });
        assert!(started_a);
        assert!(!started_b);
        assert_eq!(a.await, Err(SyncError::Transport("reset".into())));
        assert_eq!(b.await, Err(SyncError::Transport("reset".into())));

        let (c, started_c) = flight.run(|_| async { Ok(7) });
        assert!(started_c);
        assert_eq!(c.await, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_releases_slot_and_supersedes_late_result() {
        let flight = SingleFlight::<u32>::with_timeout(Duration::from_secs(10));
        let (late_tx, late_rx) = tokio::sync::oneshot::channel();

        let (first, _) = flight.run(|ticket| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            let _ = late_tx.send(ticket.is_current());
            Ok(1)
        });
        assert_eq!(first.await, Err(SyncError::Timeout));
        assert!(!flight.in_flight());

        let (second, started) = flight.run(|_| async { Ok(2) });
        assert!(started);
        assert_eq!(second.await, Ok(2));

        // The first attempt finishes on its own and learns it was superseded.
        assert!(!late_rx.await.unwrap());
    }

    #[tokio::test]
    async fn reset_makes_ticket_stale() {
        let flight = SingleFlight::<u32>::new();
        let gate = Arc::new(Notify::new());
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();

        let wait = Arc::clone(&gate);
        let (_outcome, _) = flight.run(move |ticket| async move {
            wait.notified().await;
            let _ = seen_tx.send(ticket.is_current());
            Ok(0)
        });
        flight.reset();
        assert!(!flight.in_flight());
        gate.notify_one();

        assert!(!seen_rx.await.unwrap());
    }

    #[tokio::test]
    async fn panicking_attempt_reports_task_failure() {
        let flight = SingleFlight::<u32>::new();
        let (outcome, _) = flight.run(|_| async {
            let missing: Option<u32> = None;
            Ok(missing.expect("boom"))
        });
        assert!(matches!(outcome.await, Err(SyncError::TaskFailed(_))));
    }

    #[tokio::test]
    async fn joined_caller_stays_pending_until_attempt_resolves() {
        let flight = SingleFlight::<u32>::new();
        let gate = Arc::new(Notify::new());

        let wait = Arc::clone(&gate);
        let (first, _) = flight.run(move |_| async move {
            wait.notified().await;
            Ok(9)
        });
        let (joined, started) = flight.run(|_| async { Ok(0) });
        assert!(!started);

        let mut joined = tokio_test::task::spawn(joined);
        tokio_test::assert_pending!(joined.poll());

        gate.notify_one();
        assert_eq!(first.await, Ok(9));
        assert!(joined.is_woken());
        assert_eq!(tokio_test::assert_ready!(joined.poll()), Ok(9));
    }
}
