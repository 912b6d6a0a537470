//! Request/response correlation.
//!
//! Every outbound request gets an id from [`Correlator::allocate_id`] and a
//! pending entry from [`Correlator::register`]. The entry owns the sending
//! half of a `oneshot` channel and the abort handle of its timeout task.
//!
//! Three paths can complete an entry: a matching response
//! ([`Correlator::resolve`] / [`Correlator::reject`]), the timer
//! ([`Correlator::expire`]), or a bulk [`Correlator::drain_all`]. Each path
//! first removes the entry from the table under the one table lock; the path
//! that removed it completes it and the others find nothing and do nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::rpc::message::RequestId;
use crate::{AppError, Result};

/// Outcome delivered to a waiting caller.
type Outcome = Result<Value>;

/// Bookkeeping for one in-flight request.
#[derive(Debug)]
struct PendingEntry {
    method: String,
    timeout: Duration,
    slot: oneshot::Sender<Outcome>,
    timer: Option<AbortHandle>,
}

impl PendingEntry {
    /// Complete the entry, cancelling its timer.
    fn complete(self, outcome: Outcome) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The receiver is gone when the caller stopped waiting; nothing to do.
        let _ = self.slot.send(outcome);
    }
}

#[derive(Debug, Default)]
struct Table {
    entries: HashMap<RequestId, PendingEntry>,
    /// Set once the connection is torn down; new registrations fail with it.
    closed: Option<AppError>,
}

/// Pending-request table shared by callers and the reader loop.
#[derive(Debug)]
pub struct Correlator {
    next_id: AtomicU64,
    table: Mutex<Table>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    /// Empty table; the first allocated id is 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            table: Mutex::new(Table::default()),
        }
    }

    /// Return a fresh identifier, never handed out before.
    #[must_use]
    pub fn allocate_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert a pending entry for `id` and start its timeout.
    ///
    /// Must be called before the request frame is written so a fast response
    /// always finds its entry. On a closed correlator the returned handle
    /// resolves immediately with the closing cause.
    ///
    /// Requires a running tokio runtime for the timer task.
    #[must_use]
    pub fn register(
        self: &Arc<Self>,
        id: RequestId,
        method: &str,
        timeout: Duration,
    ) -> PendingHandle {
        let (slot, rx) = oneshot::channel();
        let mut table = self.lock();

        if let Some(cause) = &table.closed {
            let _ = slot.send(Err(cause.clone()));
            return PendingHandle { id, rx };
        }

        // The timer cannot observe the table before this lock is released,
        // so even a zero timeout finds the entry in place.
        let timer = spawn_timer(Arc::downgrade(self), id, timeout);
        let entry = PendingEntry {
            method: method.to_owned(),
            timeout,
            slot,
            timer: Some(timer),
        };

        if let Some(previous) = table.entries.insert(id, entry) {
            warn!(id, "correlator: id registered twice, rejecting the older entry");
            previous.complete(Err(AppError::Protocol(format!(
                "request id {id} was registered again"
            ))));
        }

        PendingHandle { id, rx }
    }

    /// Complete the entry for `id` with a result.
    ///
    /// Returns `false` when no entry exists (unknown, already completed, or
    /// timed out); that case is a no-op.
    pub fn resolve(&self, id: RequestId, result: Value) -> bool {
        self.complete(id, Ok(result))
    }

    /// Complete the entry for `id` with an error.
    ///
    /// Returns `false` when no entry exists; that case is a no-op.
    pub fn reject(&self, id: RequestId, error: AppError) -> bool {
        self.complete(id, Err(error))
    }

    /// Timer path: reject `id` with [`AppError::Timeout`] if still pending.
    pub fn expire(&self, id: RequestId) -> bool {
        let Some(mut entry) = self.take(id) else {
            return false;
        };
        // This is the timer's own task; aborting it here would be pointless.
        entry.timer = None;
        debug!(id, method = %entry.method, "correlator: request timed out");
        let error = AppError::Timeout {
            id,
            method: entry.method.clone(),
            after: entry.timeout,
        };
        entry.complete(Err(error));
        true
    }

    /// Reject every pending entry with `cause` and empty the table.
    ///
    /// Returns the number of entries rejected.
    pub fn drain_all(&self, cause: &AppError) -> usize {
        let entries = std::mem::take(&mut self.lock().entries);
        let count = entries.len();
        for (_, entry) in entries {
            entry.complete(Err(cause.clone()));
        }
        if count > 0 {
            debug!(count, cause = %cause, "correlator: drained pending requests");
        }
        count
    }

    /// Drain with `cause` and refuse all later registrations with it.
    ///
    /// Only the first close records its cause; later calls still drain.
    pub fn close(&self, cause: &AppError) -> usize {
        let entries = {
            let mut table = self.lock();
            if table.closed.is_none() {
                table.closed = Some(cause.clone());
            }
            std::mem::take(&mut table.entries)
        };
        let count = entries.len();
        for (_, entry) in entries {
            entry.complete(Err(cause.clone()));
        }
        count
    }

    /// Whether [`Correlator::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    /// Number of entries currently waiting.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock().entries.len()
    }

    fn complete(&self, id: RequestId, outcome: Outcome) -> bool {
        match self.take(id) {
            Some(entry) => {
                entry.complete(outcome);
                true
            }
            None => {
                debug!(id, "correlator: no pending entry, dropping completion");
                false
            }
        }
    }

    fn take(&self, id: RequestId) -> Option<PendingEntry> {
        self.lock().entries.remove(&id)
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        // Critical sections never panic while mutating; a poisoned lock
        // still guards a consistent table.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn spawn_timer(correlator: Weak<Correlator>, id: RequestId, timeout: Duration) -> AbortHandle {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if let Some(correlator) = correlator.upgrade() {
            correlator.expire(id);
        }
    })
    .abort_handle()
}

/// Caller's side of a pending entry.
#[derive(Debug)]
pub struct PendingHandle {
    id: RequestId,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingHandle {
    /// Id of the request this handle waits on.
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Wait for the entry to be resolved, rejected, expired, or drained.
    ///
    /// # Errors
    ///
    /// Returns the rejection cause: a peer error, a timeout, or the
    /// connection-level failure that drained the table.
    pub async fn wait(self) -> Result<Value> {
        let Self { id, rx } = self;
        rx.await.unwrap_or_else(|_| {
            Err(AppError::Stopped(format!(
                "pending entry for request {id} was discarded"
            )))
        })
    }
}
