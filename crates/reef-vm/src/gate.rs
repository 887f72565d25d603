use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;

/// Counting mutex with concurrency 1: at most one in-flight request may
/// execute against a given interpreter instance.
///
/// Release is tied to the returned guard, so it happens exactly once on
/// every exit path. The gate is not reentrant: code already holding a
/// guard must not acquire again on the same logical request (self-issued
/// requests are rejected upstream instead of queued, see the dispatcher).
#[derive(Clone)]
pub struct Gate {
    sem: Arc<Semaphore>,
    running: Arc<AtomicUsize>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    pub fn new() -> Self {
        Self {
            sem: Arc::new(Semaphore::new(1)),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Waits until no other holder is active. Queued waiters are admitted
    /// in FIFO order.
    pub async fn acquire(&self) -> GateGuard {
        let permit = match Arc::clone(&self.sem).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => unreachable!("gate semaphore is never closed"),
        };
        self.running.fetch_add(1, Ordering::SeqCst);
        GateGuard {
            _permit: permit,
            running: Arc::clone(&self.running),
        }
    }

    /// Whether any holder is currently active. Observers use this to
    /// answer "is a request in flight" without racing the permit.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }
}

pub struct GateGuard {
    _permit: tokio::sync::OwnedSemaphorePermit,
    running: Arc<AtomicUsize>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn only_one_holder_at_a_time() {
        let gate = Gate::new();
        let guard = gate.acquire().await;
        assert_eq!(gate.running(), 1);

        let second = gate.clone();
        let waiter = tokio::spawn(async move {
            let _guard = second.acquire().await;
            second.running()
        });
        tokio::task::yield_now().await;
        assert_eq!(gate.running(), 1);

        drop(guard);
        assert_eq!(waiter.await.unwrap(), 1);
        assert_eq!(gate.running(), 0);
    }
}
