use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::events::{ListenerGuard, StreamEvent};

/// Outcome of waiting on a suspended poll operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollVerdict {
    /// One of the watched conditions fired.
    Ready,
    /// The deadline elapsed before any condition fired.
    TimedOut,
    /// The host cancelled the operation.
    Cancelled,
}

/// A suspended interpreter call awaiting a host event.
///
/// Holds the wake channel, the listener registrations backing it, and an
/// optional deadline. Only the host resolves, times out, or cancels a
/// pending operation; the interpreter cannot. An operation never outlives
/// the call that created it.
pub struct PendingOperation {
    id: u64,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    cancel_rx: oneshot::Receiver<()>,
    cancel_tx: Option<oneshot::Sender<()>>,
    guards: Vec<ListenerGuard>,
    deadline: Option<Duration>,
}

impl PendingOperation {
    pub(crate) fn new(
        id: u64,
        rx: mpsc::UnboundedReceiver<StreamEvent>,
        guards: Vec<ListenerGuard>,
        deadline: Option<Duration>,
    ) -> Self {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        Self {
            id,
            rx,
            cancel_rx,
            cancel_tx: Some(cancel_tx),
            guards,
            deadline,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Detaches a handle the host can use to cancel this operation while
    /// another task is blocked in [`PendingOperation::wait`]. Returns
    /// `None` after the first call.
    pub fn take_cancel_handle(&mut self) -> Option<CancelHandle> {
        self.cancel_tx.take().map(|tx| CancelHandle { tx })
    }

    /// Waits for the first watched event, the deadline, or cancellation.
    /// All listeners are unregistered on every exit path.
    pub async fn wait(mut self) -> PollVerdict {
        let cancel_rx = &mut self.cancel_rx;
        let cancelled = async move {
            match cancel_rx.await {
                Ok(()) => (),
                // Handle dropped without cancelling: never resolves.
                Err(_) => std::future::pending::<()>().await,
            }
        };

        let verdict = if let Some(deadline) = self.deadline {
            tokio::select! {
                received = self.rx.recv() => match received {
                    Some(_) => PollVerdict::Ready,
                    None => PollVerdict::Cancelled,
                },
                () = cancelled => PollVerdict::Cancelled,
                () = tokio::time::sleep(deadline) => PollVerdict::TimedOut,
            }
        } else {
            tokio::select! {
                received = self.rx.recv() => match received {
                    Some(_) => PollVerdict::Ready,
                    None => PollVerdict::Cancelled,
                },
                () = cancelled => PollVerdict::Cancelled,
            }
        };
        self.guards.clear();
        verdict
    }
}

/// Cancels a pending operation. Listener registrations die with the
/// operation's guards; the blocked waiter is woken on the next host tick
/// rather than synchronously, giving callers room to detach their own
/// handlers first.
pub struct CancelHandle {
    tx: oneshot::Sender<()>,
}

impl CancelHandle {
    pub fn cancel(self) {
        let tx = self.tx;
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            let _ = tx.send(());
        });
    }
}
