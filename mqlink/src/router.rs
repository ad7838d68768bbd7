use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU16;
use std::sync::Arc;

use bytes::Bytes;
use bytestring::ByteString;
use parking_lot::{Mutex, RwLock};

use mqlink_codec::{Publish, QoS};

/// Inbound application message handed to a subscription handler.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: ByteString,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub packet_id: Option<NonZeroU16>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("topic", &self.topic)
            .field("payload", &format_args!("{} bytes", self.payload.len()))
            .field("qos", &self.qos)
            .field("retain", &self.retain)
            .field("dup", &self.dup)
            .field("packet_id", &self.packet_id)
            .finish()
    }
}

impl From<Publish> for Message {
    fn from(p: Publish) -> Self {
        Message {
            topic: p.topic,
            payload: p.payload,
            qos: p.qos,
            retain: p.retain,
            dup: p.dup,
            packet_id: p.packet_id,
        }
    }
}

pub type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

#[derive(Clone)]
struct Subscription {
    qos: QoS,
    handler: Handler,
}

/// Exact-topic subscription table.
///
/// A subscription is staged under its SUBSCRIBE packet id and only becomes routable once the
/// SUBACK grant is committed.
#[derive(Default)]
pub(crate) struct Router {
    staged: Mutex<HashMap<NonZeroU16, (ByteString, Handler)>>,
    subs: RwLock<HashMap<ByteString, Subscription>>,
}

impl Router {
    pub(crate) fn stage(&self, id: NonZeroU16, filter: ByteString, handler: Handler) {
        self.staged.lock().insert(id, (filter, handler));
    }

    /// Returns false if nothing was staged under `id`.
    pub(crate) fn commit(&self, id: NonZeroU16, qos: QoS) -> bool {
        let staged = self.staged.lock().remove(&id);
        if let Some((filter, handler)) = staged {
            log::debug!("subscription committed, filter: {}, granted qos: {:?}", filter, qos);
            self.subs.write().insert(filter, Subscription { qos, handler });
            true
        } else {
            false
        }
    }

    #[inline]
    pub(crate) fn discard(&self, id: NonZeroU16) {
        self.staged.lock().remove(&id);
    }

    /// Runs the handler registered for `msg.topic`, returns false when none matched.
    pub(crate) fn dispatch(&self, msg: &Message) -> bool {
        let handler = self.subs.read().get(&msg.topic).map(|s| s.handler.clone());
        match handler {
            Some(handler) => {
                handler(msg);
                true
            }
            None => false,
        }
    }

    #[inline]
    pub(crate) fn granted_qos(&self, filter: &str) -> Option<QoS> {
        self.subs.read().get(filter).map(|s| s.qos)
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.subs.read().len()
    }
}
