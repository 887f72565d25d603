use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// How long a caller waits for the matching response envelope by default.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(25);

/// Request envelope ferried between execution contexts (for example from
/// a page-level interception point into the context holding the runtime).
/// The response envelope echoes the correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub enum RelayError {
    /// No reply arrived before the timeout.
    TimedOut { id: u64 },
    /// The mailbox dropped the pending entry before a reply arrived.
    Abandoned { id: u64 },
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::TimedOut { id } => write!(f, "relay request {id} timed out"),
            RelayError::Abandoned { id } => write!(f, "relay request {id} was abandoned"),
        }
    }
}

impl std::error::Error for RelayError {}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Vec<u8>>>>>;

/// Correlation-id mailbox pairing posted request envelopes with their
/// replies.
#[derive(Default)]
pub struct Mailbox {
    next_id: AtomicU64,
    pending: PendingMap,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Posts a payload: returns the envelope to ship to the other context
    /// and the handle to await the reply on.
    pub fn post(&self, payload: Vec<u8>) -> (Envelope, PendingReply) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        (
            Envelope { id, payload },
            PendingReply {
                id,
                rx,
                pending: Arc::clone(&self.pending),
            },
        )
    }

    /// Resolves the waiter for `id`. Returns false when no such request
    /// is pending (already resolved, timed out, or never posted).
    pub fn respond(&self, id: u64, payload: Vec<u8>) -> bool {
        let sender = lock(&self.pending).remove(&id);
        match sender {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}

pub struct PendingReply {
    id: u64,
    rx: oneshot::Receiver<Vec<u8>>,
    pending: PendingMap,
}

impl PendingReply {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Races the reply against a timeout (the default when `None`). A
    /// timed-out request is removed from the mailbox so a late reply is
    /// discarded instead of leaking.
    pub async fn wait(self, timeout: Option<Duration>) -> Result<Vec<u8>, RelayError> {
        let deadline = timeout.unwrap_or(DEFAULT_REPLY_TIMEOUT);
        match tokio::time::timeout(deadline, self.rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(RelayError::Abandoned { id: self.id }),
            Err(_) => {
                lock(&self.pending).remove(&self.id);
                Err(RelayError::TimedOut { id: self.id })
            }
        }
    }
}

fn lock(map: &Mutex<HashMap<u64, oneshot::Sender<Vec<u8>>>>) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Vec<u8>>>> {
    match map.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
