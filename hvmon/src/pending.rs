//! Correlation table: request id → the caller waiting for its reply.
//!
//! Every slot is consumed exactly once, either by the read loop delivering
//! the peer's reply or by [`Pending::fail_all`] on teardown. A [`Slot`]
//! whose owner goes away before delivery removes itself.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hvmon_proto::Reply;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// One-shot delivery target for a reply or a teardown error.
type Sender = oneshot::Sender<Result<Reply>>;

/// Outstanding requests keyed by id. `None` once torn down.
#[derive(Debug)]
pub(crate) struct Pending {
    /// Waiting callers.
    slots: Mutex<Option<HashMap<u32, Sender>>>,
}

impl Default for Pending {
    fn default() -> Self {
        Self {
            slots: Mutex::new(Some(HashMap::new())),
        }
    }
}

impl Pending {
    /// Registers a waiter for `id`.
    ///
    /// Fails with [`Error::Disconnected`] after [`fail_all`](Self::fail_all),
    /// so a late caller can never wait on a table nobody will fill.
    pub(crate) fn register(self: &Arc<Self>, id: NonZeroU32) -> Result<Slot> {
        let (tx, rx) = oneshot::channel();
        let mut guard = self.lock();
        let slots = guard.as_mut().ok_or(Error::Disconnected)?;
        if slots.insert(id.get(), tx).is_some() {
            tracing::warn!(id = id.get(), "replaced an outstanding request with the same id");
        }
        drop(guard);
        Ok(Slot {
            id: id.get(),
            rx,
            table: Arc::clone(self),
        })
    }

    /// Hands `reply` to its waiter. Returns `false` if nobody was waiting.
    pub(crate) fn deliver(&self, reply: Reply) -> bool {
        let Some(tx) = self.lock().as_mut().and_then(|s| s.remove(&reply.id)) else {
            return false;
        };
        // The receiver may have given up in the meantime; nothing to do then.
        let _ = tx.send(Ok(reply));
        true
    }

    /// Fails every outstanding request with [`Error::Closed`] and closes the
    /// table for good. Returns how many waiters were notified.
    pub(crate) fn fail_all(&self, reason: &str) -> usize {
        let drained = self.lock().take().unwrap_or_default();
        let n = drained.len();
        for tx in drained.into_values() {
            let _ = tx.send(Err(Error::Closed(reason.to_owned())));
        }
        n
    }

    /// Number of outstanding requests.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().as_ref().map_or(0, HashMap::len)
    }

    /// Returns `true` once the table has been torn down.
    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    /// Drops the waiter for `id` without notifying it.
    fn remove(&self, id: u32) {
        if let Some(slots) = self.lock().as_mut() {
            slots.remove(&id);
        }
    }

    /// Locks the table, ignoring poisoning.
    fn lock(&self) -> MutexGuard<'_, Option<HashMap<u32, Sender>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Receiving side of a registered request.
#[derive(Debug)]
pub(crate) struct Slot {
    /// Request id this slot answers.
    id: u32,
    /// Reply channel.
    rx: oneshot::Receiver<Result<Reply>>,
    /// Table to clean up on drop.
    table: Arc<Pending>,
}

impl Slot {
    /// Waits for the reply or the teardown error.
    pub(crate) async fn wait(mut self) -> Result<Reply> {
        match (&mut self.rx).await {
            Ok(delivery) => delivery,
            Err(_) => Err(Error::Closed("reply channel dropped".to_owned())),
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn id(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    #[tokio::test]
    async fn delivers_to_the_matching_slot() {
        let table = Arc::new(Pending::default());
        let a = table.register(id(1)).unwrap();
        let b = table.register(id(2)).unwrap();

        assert!(table.deliver(Reply::ok(2, json!("two"))));
        assert!(table.deliver(Reply::ok(1, json!("one"))));
        assert_eq!(a.wait().await.unwrap().ret, json!("one"));
        assert_eq!(b.wait().await.unwrap().ret, json!("two"));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn second_delivery_for_same_id_is_discarded() {
        let table = Arc::new(Pending::default());
        let slot = table.register(id(9)).unwrap();
        assert!(table.deliver(Reply::ok(9, json!(1))));
        assert!(!table.deliver(Reply::ok(9, json!(2))));
        assert_eq!(slot.wait().await.unwrap().ret, json!(1));
    }

    #[test]
    fn unknown_id_is_discarded() {
        let table = Arc::new(Pending::default());
        assert!(!table.deliver(Reply::ok(42, json!({}))));
    }

    #[tokio::test]
    async fn fail_all_unblocks_every_waiter() {
        let table = Arc::new(Pending::default());
        let slots: Vec<_> = (1..=3).map(|n| table.register(id(n)).unwrap()).collect();

        assert_eq!(table.fail_all("monitor has exited"), 3);
        assert_eq!(table.len(), 0);
        assert!(table.is_closed());
        for slot in slots {
            let err = slot.wait().await.unwrap_err();
            assert!(matches!(err, Error::Closed(ref r) if r == "monitor has exited"));
        }
    }

    #[test]
    fn register_after_teardown_fails_fast() {
        let table = Arc::new(Pending::default());
        assert_eq!(table.fail_all("gone"), 0);
        assert!(matches!(table.register(id(1)), Err(Error::Disconnected)));
    }

    #[test]
    fn dropped_slot_unregisters() {
        let table = Arc::new(Pending::default());
        let slot = table.register(id(5)).unwrap();
        assert_eq!(table.len(), 1);
        drop(slot);
        assert_eq!(table.len(), 0);
        assert!(!table.deliver(Reply::ok(5, json!({}))));
    }
}
