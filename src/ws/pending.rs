//! Lock-free correlation table for in-flight requests using `scc::HashMap`.

use tokio::sync::oneshot;
use tracing::debug;

use crate::codec::HubResponse;
use crate::core::{HubError, HubResult};

pub(crate) type ResponseReceiver = oneshot::Receiver<HubResult<HubResponse>>;
type ResponseSender = oneshot::Sender<HubResult<HubResponse>>;

/// Maps a request identifier to the single waiter for its response.
pub struct PendingRequests {
    requests: scc::HashMap<u64, ResponseSender>,
    max_pending: usize,
}

impl PendingRequests {
    pub fn new(max_pending: usize) -> Self {
        Self {
            requests: scc::HashMap::new(),
            max_pending,
        }
    }

    /// Register a waiter for `id`.
    ///
    /// An identifier that is already pending is a protocol invariant violation.
    pub(crate) fn register(&self, id: u64) -> HubResult<ResponseReceiver> {
        if self.requests.len() >= self.max_pending {
            return Err(HubError::TooManyPending {
                max: self.max_pending,
            });
        }
        let (tx, rx) = oneshot::channel();
        if self.requests.insert_sync(id, tx).is_err() {
            return Err(HubError::InvalidOperation(format!(
                "request id {id} is already pending"
            )));
        }
        Ok(rx)
    }

    /// Deliver a response to its waiter exactly once.
    ///
    /// Returns `false` when no waiter is registered (late, cancelled or unknown id).
    pub fn resolve(&self, response: HubResponse) -> bool {
        match self.requests.remove_sync(&response.id) {
            Some((_, tx)) => {
                // The waiter may have been dropped between removal and send.
                let _ = tx.send(Ok(response));
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: u64) -> bool {
        self.requests.remove_sync(&id).is_some()
    }

    /// Fail every waiter with a cancellation outcome. Returns how many were failed.
    pub fn fail_all(&self, reason: &str) -> usize {
        let mut ids = Vec::new();
        self.requests.retain_sync(|id, _| {
            ids.push(*id);
            true
        });

        let mut failed = 0;
        for id in ids {
            if let Some((_, tx)) = self.requests.remove_sync(&id) {
                let _ = tx.send(Err(HubError::cancelled(reason)));
                failed += 1;
            }
        }
        if failed > 0 {
            debug!(failed, reason, "failed pending requests");
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// Removes its entry on drop unless disarmed, so a cancelled or dropped `send` future never
/// leaves a waiter behind.
pub(crate) struct PendingGuard<'a> {
    table: &'a PendingRequests,
    id: u64,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(table: &'a PendingRequests, id: u64) -> Self {
        Self {
            table,
            id,
            armed: true,
        }
    }

    /// The entry was consumed by resolution or teardown.
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.table.remove(self.id);
        }
    }
}
