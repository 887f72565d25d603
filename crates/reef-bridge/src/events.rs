use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

/// The closed set of events a socket peer or process stream can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    Spawned,
    Exited,
    DataReceived,
    Connected,
    Closed,
    ErrorRaised,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// One-shot listener registry for a single event source.
///
/// A listener fires at most once and is removed when it does. Listeners
/// that never fire are removed by dropping their [`ListenerGuard`], so a
/// poll that raced several sources never leaks handlers on the losers.
#[derive(Clone, Default)]
pub struct EventSink {
    inner: Arc<Mutex<SinkInner>>,
}

#[derive(Default)]
struct SinkInner {
    next_id: u64,
    listeners: Vec<Listener>,
}

struct Listener {
    id: ListenerId,
    event: StreamEvent,
    notify: mpsc::UnboundedSender<StreamEvent>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SinkInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Registers a one-shot listener for `event`. The returned id is only
    /// needed to unregister a listener that never fired.
    pub fn listen(&self, event: StreamEvent, notify: mpsc::UnboundedSender<StreamEvent>) -> ListenerId {
        let mut inner = self.lock();
        let id = ListenerId(inner.next_id);
        inner.next_id += 1;
        inner.listeners.push(Listener { id, event, notify });
        id
    }

    pub fn unlisten(&self, id: ListenerId) {
        let mut inner = self.lock();
        inner.listeners.retain(|l| l.id != id);
    }

    /// Fires `event`: every matching listener is notified and removed.
    pub fn fire(&self, event: StreamEvent) {
        let fired: Vec<Listener> = {
            let mut inner = self.lock();
            let (fired, kept) = inner
                .listeners
                .drain(..)
                .partition(|l| l.event == event);
            inner.listeners = kept;
            fired
        };
        for listener in fired {
            // The waiter may already have gone away; that is not an error.
            let _ = listener.notify.send(event);
        }
    }

    /// RAII wrapper that unregisters the listener on drop.
    pub fn guard(&self, id: ListenerId) -> ListenerGuard {
        ListenerGuard {
            sink: self.clone(),
            id,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }
}

pub struct ListenerGuard {
    sink: EventSink,
    id: ListenerId,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.sink.unlisten(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fire_removes_only_matching_listeners() {
        let sink = EventSink::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        sink.listen(StreamEvent::DataReceived, tx.clone());
        sink.listen(StreamEvent::Closed, tx);

        sink.fire(StreamEvent::DataReceived);
        assert_eq!(rx.try_recv().unwrap(), StreamEvent::DataReceived);
        assert_eq!(sink.listener_count(), 1);
    }

    #[test]
    fn guard_unregisters_on_drop() {
        let sink = EventSink::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = sink.listen(StreamEvent::ErrorRaised, tx);
        {
            let _guard = sink.guard(id);
        }
        assert_eq!(sink.listener_count(), 0);
    }
}
