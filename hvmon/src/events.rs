//! Event broadcast: one bounded queue shared by every subscriber.
//!
//! There is no per-subscriber fan-out. Concurrent [`EventStream`]s compete
//! for the same entries, and the read loop only queues events while at
//! least one stream is alive.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use hvmon_proto::Event;
use tokio::sync::{Mutex, mpsc};

/// Number of live subscribers.
#[derive(Debug, Default)]
pub(crate) struct Listeners(AtomicU32);

impl Listeners {
    /// Registers one subscriber.
    pub(crate) fn join(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    /// Unregisters one subscriber, never going below zero.
    pub(crate) fn leave(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Forgets every subscriber.
    pub(crate) fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }

    /// Current subscriber count.
    pub(crate) fn count(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

/// Receiving end of the queue, shared by all streams.
pub(crate) type SharedReceiver = Arc<Mutex<mpsc::Receiver<Event>>>;

/// Handle on the monitor's event queue.
///
/// Obtained from [`Monitor::events`](crate::Monitor::events). Dropping the
/// last handle stops the read loop from queueing events. Cloning registers
/// another subscriber on the same queue.
#[derive(Debug)]
pub struct EventStream {
    /// Shared queue.
    rx: SharedReceiver,
    /// Subscriber counter the read loop consults.
    listeners: Arc<Listeners>,
}

impl EventStream {
    /// Subscribes to `rx`.
    pub(crate) fn subscribe(rx: &SharedReceiver, listeners: &Arc<Listeners>) -> Self {
        listeners.join();
        Self {
            rx: Arc::clone(rx),
            listeners: Arc::clone(listeners),
        }
    }

    /// Waits for the next event. Returns `None` once the connection is gone
    /// and the queue is drained.
    pub async fn recv(&self) -> Option<Event> {
        self.rx.lock().await.recv().await
    }
}

impl Clone for EventStream {
    fn clone(&self) -> Self {
        Self::subscribe(&self.rx, &self.listeners)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.listeners.leave();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::Value;

    use super::*;

    #[test]
    fn counter_saturates_at_zero() {
        let l = Listeners::default();
        l.leave();
        assert_eq!(l.count(), 0);
        l.join();
        l.join();
        l.reset();
        l.leave();
        assert_eq!(l.count(), 0);
    }

    #[tokio::test]
    async fn streams_share_one_queue() {
        let (tx, rx) = mpsc::channel(4);
        let rx: SharedReceiver = Arc::new(Mutex::new(rx));
        let listeners = Arc::new(Listeners::default());

        let a = EventStream::subscribe(&rx, &listeners);
        let b = a.clone();
        assert_eq!(listeners.count(), 2);

        tx.send(Event::new("STOP", Value::Null)).await.unwrap();
        tx.send(Event::new("RESUME", Value::Null)).await.unwrap();
        assert_eq!(a.recv().await.unwrap().event, "STOP");
        assert_eq!(b.recv().await.unwrap().event, "RESUME");

        drop(a);
        assert_eq!(listeners.count(), 1);
        drop(tx);
        assert!(b.recv().await.is_none());
        drop(b);
        assert_eq!(listeners.count(), 0);
    }
}
