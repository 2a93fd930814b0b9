// Refresh coordination state
// One instance per gateway; always accessed under the gateway's mutex, never across an await

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

use crate::error::RefreshError;

/// What a queued request receives when the refresh settles
pub type RefreshOutcome = Result<String, RefreshError>;

/// A request parked behind the in-flight refresh
///
/// The request itself stays with its caller; the queue only holds the
/// completion channel and enough context to log it.
pub(crate) struct PendingRequest {
    request_id: String,
    path: String,
    settle: oneshot::Sender<RefreshOutcome>,
}

impl PendingRequest {
    pub(crate) fn settle(self, outcome: RefreshOutcome) {
        if self.settle.send(outcome).is_err() {
            tracing::debug!(
                request_id = %self.request_id,
                path = %self.path,
                "Queued request was abandoned before the refresh settled"
            );
        }
    }
}

/// `is_refreshing` flag plus the FIFO queue of waiters
///
/// The queue is only non-empty while a refresh is in flight.
#[derive(Default)]
pub(crate) struct RefreshState {
    is_refreshing: bool,
    queue: VecDeque<PendingRequest>,
}

impl RefreshState {
    pub(crate) fn is_refreshing(&self) -> bool {
        self.is_refreshing
    }

    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Mark a refresh as started; the caller becomes the leader
    pub(crate) fn begin(&mut self) {
        debug_assert!(!self.is_refreshing);
        debug_assert!(self.queue.is_empty());
        self.is_refreshing = true;
    }

    /// Park a request behind the in-flight refresh
    pub(crate) fn enqueue(
        &mut self,
        request_id: &str,
        path: &str,
    ) -> oneshot::Receiver<RefreshOutcome> {
        debug_assert!(self.is_refreshing);
        let (tx, rx) = oneshot::channel();
        self.queue.push_back(PendingRequest {
            request_id: request_id.to_string(),
            path: path.to_string(),
            settle: tx,
        });
        rx
    }

    /// End the refresh: hand back every waiter in arrival order and clear the flag
    pub(crate) fn finish(&mut self) -> VecDeque<PendingRequest> {
        self.is_refreshing = false;
        std::mem::take(&mut self.queue)
    }
}

/// Lock the refresh state, recovering it if a holder panicked
pub(crate) fn lock(state: &Mutex<RefreshState>) -> MutexGuard<'_, RefreshState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ends the refresh it was created for, however the refresh task exits
///
/// `settle` hands the outcome to every waiter. If the guard is dropped
/// unsettled (the refresh panicked), the waiters are dropped instead, which
/// fails their receivers, and the flag is cleared so later 401s can lead.
pub(crate) struct RefreshGuard {
    state: Arc<Mutex<RefreshState>>,
    settled: bool,
}

impl RefreshGuard {
    pub(crate) fn new(state: Arc<Mutex<RefreshState>>) -> Self {
        Self {
            state,
            settled: false,
        }
    }

    pub(crate) fn settle(mut self, outcome: &RefreshOutcome) {
        self.settled = true;
        let waiters = lock(&self.state).finish();
        tracing::debug!(queued = waiters.len(), "Settling requests queued behind refresh");
        for waiter in waiters {
            waiter.settle(outcome.clone());
        }
    }
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let waiters = lock(&self.state).finish();
        tracing::warn!(
            queued = waiters.len(),
            "Refresh ended without an outcome, failing queued requests"
        );
    }
}
