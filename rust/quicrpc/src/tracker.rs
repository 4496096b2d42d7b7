//! In-flight handler accounting for one connection.
//!
//! Every accepted stream holds an [`InFlightGuard`] until its handler is done.
//! Draining waits for the count to reach zero using a single [`Notify`]: the
//! drainer publishes a `draining` flag, and whichever guard takes the count to
//! zero after that wakes it. The count is re-checked after publishing, since
//! the last guard may have dropped between the first check and the publish.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::Notify;

pub(crate) struct InFlight {
    count: AtomicUsize,
    draining: AtomicBool,
    done: Notify,
}

/// Where the drainer currently is, for tests that need to interleave with it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DrainStep {
    /// First check saw handlers in flight; the flag is not yet published.
    BeforePublish,
    /// Flag published; the re-check has not run yet.
    AfterPublish,
}

impl InFlight {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(InFlight {
            count: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            done: Notify::new(),
        })
    }

    pub(crate) fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            tracker: Arc::clone(self),
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait until no handler is in flight.
    pub(crate) async fn wait(&self) {
        self.wait_inner(|_| {}).await
    }

    pub(crate) async fn wait_inner(&self, mut hook: impl FnMut(DrainStep)) {
        if self.count() == 0 {
            return;
        }

        hook(DrainStep::BeforePublish);
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::trace!("drain already published");
        }
        hook(DrainStep::AfterPublish);

        while self.count() != 0 {
            self.done.notified().await;
        }
    }
}

/// Decrements the in-flight count when dropped, including on panic unwinds.
pub(crate) struct InFlightGuard {
    tracker: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let prev = self.tracker.count.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 && self.tracker.draining.load(Ordering::SeqCst) {
            // notify_one stores a permit if the drainer is not parked yet.
            self.tracker.done.notify_one();
        }
    }
}
