use std::collections::HashMap;
use std::num::NonZeroU16;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{CancelReason, MqttError, Result};

pub type Completion<T> = std::result::Result<T, CancelReason>;
pub type Waiter<T> = oneshot::Receiver<Completion<T>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no pending entry for packet id {0}")]
pub struct NotFound(pub NonZeroU16);

/// Callers waiting for an acknowledgment, keyed by packet identifier.
///
/// Once `cancel_all` has run the table is closed and every later `register` fails with the
/// same reason. An entry whose caller went away before the acknowledgment arrived stays in
/// the table as abandoned, so its identifier is not handed out again while the server still
/// owns it.
pub struct PendingTable<T> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    waiters: HashMap<NonZeroU16, Slot<T>>,
    closed: Option<CancelReason>,
}

enum Slot<T> {
    Waiting(oneshot::Sender<Completion<T>>),
    Abandoned,
}

/// Outcome of a successful `resolve`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    Delivered,
    /// Nobody waits any more, the caller of `resolve` owns the identifier now.
    Abandoned,
}

impl<T> Default for PendingTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingTable<T> {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner { waiters: HashMap::new(), closed: None }) }
    }

    pub fn register(&self, id: NonZeroU16) -> Result<Waiter<T>> {
        let mut inner = self.inner.lock();
        if let Some(reason) = inner.closed.as_ref() {
            return Err(MqttError::Disconnected(reason.clone()));
        }
        if inner.waiters.contains_key(&id) {
            return Err(MqttError::PacketIdInUse(id));
        }
        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(id, Slot::Waiting(tx));
        Ok(rx)
    }

    /// Completes the waiter for `id`, at most once.
    pub fn resolve(&self, id: NonZeroU16, value: T) -> std::result::Result<Resolved, NotFound> {
        let slot = self.inner.lock().waiters.remove(&id).ok_or(NotFound(id))?;
        match slot {
            Slot::Waiting(tx) => {
                if tx.send(Ok(value)).is_err() {
                    log::debug!("waiter for packet id {} is gone", id);
                }
                Ok(Resolved::Delivered)
            }
            Slot::Abandoned => Ok(Resolved::Abandoned),
        }
    }

    /// Marks a still waiting entry as abandoned. Returns false when there is nothing left
    /// to wait for, the entry was resolved or cancelled already.
    pub fn abandon(&self, id: NonZeroU16) -> bool {
        let mut inner = self.inner.lock();
        match inner.waiters.get_mut(&id) {
            Some(slot) if matches!(slot, Slot::Waiting(_)) => {
                *slot = Slot::Abandoned;
                true
            }
            _ => false,
        }
    }

    #[inline]
    pub fn remove(&self, id: NonZeroU16) {
        self.inner.lock().waiters.remove(&id);
    }

    /// Fails every waiter with `reason` and closes the table. Returns the abandoned
    /// identifiers, which nobody else will release.
    pub fn cancel_all(&self, reason: CancelReason) -> Vec<NonZeroU16> {
        let waiters = {
            let mut inner = self.inner.lock();
            if inner.closed.is_none() {
                inner.closed = Some(reason.clone());
            }
            std::mem::take(&mut inner.waiters)
        };
        let mut abandoned = Vec::new();
        for (id, slot) in waiters {
            match slot {
                Slot::Waiting(tx) => {
                    let _ = tx.send(Err(reason.clone()));
                }
                Slot::Abandoned => abandoned.push(id),
            }
        }
        abandoned
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed.is_some()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
