//! Correlation of outstanding message acknowledgements.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

/// Returned by [`AckRegistry::wait`] when the acknowledgement did not arrive
/// within the configured timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("timed out waiting for message acknowledgement")]
pub struct AckTimeout;

/// A handle to one outstanding acknowledgement.
pub struct AckWaiter(oneshot::Receiver<()>);

/// Tracks acknowledgement ids handed out by one endpoint.
///
/// Ids are `ack-{n}` with a process-local monotonic counter. An entry lives
/// from [`generate`](Self::generate) until it is acknowledged, cancelled, or
/// its waiter times out.
pub struct AckRegistry {
    entries: Mutex<HashMap<String, oneshot::Sender<()>>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl AckRegistry {
    /// Creates a registry with the given wait timeout. A zero timeout
    /// disables acknowledgements entirely: callers get `None` and neither
    /// request nor require acks.
    pub fn new(timeout: Duration) -> Option<Arc<Self>> {
        if timeout.is_zero() {
            return None;
        }
        Some(Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            timeout,
        }))
    }

    /// Allocates a fresh id and returns it with the waiter that resolves
    /// when the matching acknowledgement arrives.
    pub fn generate(&self) -> (String, AckWaiter) {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("ack-{n}");
        let (tx, rx) = oneshot::channel();
        self.entries.lock().unwrap().insert(id.clone(), tx);
        (id, AckWaiter(rx))
    }

    /// Resolves the waiter for `id`. Returns false if the id is unknown, so
    /// the caller can report a protocol error to the peer.
    pub fn acknowledge(&self, id: &str) -> bool {
        match self.entries.lock().unwrap().remove(id) {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    /// Drops the entry for `id` without resolving it.
    pub fn cancel(&self, id: &str) {
        self.entries.lock().unwrap().remove(id);
    }

    /// Blocks until the waiter resolves or the configured timeout elapses.
    pub async fn wait(&self, waiter: AckWaiter) -> Result<(), AckTimeout> {
        match tokio::time::timeout(self.timeout, waiter.0).await {
            Ok(Ok(())) => Ok(()),
            // Sender dropped: the entry was cancelled out from under us.
            Ok(Err(_)) => Err(AckTimeout),
            Err(_) => Err(AckTimeout),
        }
    }
}
