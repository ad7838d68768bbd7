use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use bytestring::ByteString;
use futures::SinkExt;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use mqlink_codec::error::EncodeError;
use mqlink_codec::{
    Connect, ConnectAck, ConnectAckReason, Disconnect, DisconnectReasonCode, Packet, Publish, PublishAck, QoS,
    Subscribe, SubscribeAck, SubscribeAckReason,
};
use mqlink_conf::Client as ClientConfig;

use crate::framed::{ClientCodec, Reader, Writer};
use crate::packet_id::PacketIdAllocator;
use crate::pending::{Completion, PendingTable};
use crate::router::{Message, Router};
use crate::{dispatcher, CancelReason, MqttError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// State shared between the session handle and its dispatcher task.
pub(crate) struct Shared {
    state: Mutex<State>,
    writer: tokio::sync::Mutex<Writer>,
    pub(crate) packet_ids: PacketIdAllocator,
    pub(crate) publishes: PendingTable<PublishAck>,
    pub(crate) subscribes: PendingTable<SubscribeAck>,
    pub(crate) router: Router,
    pub(crate) connack: Mutex<Option<oneshot::Sender<Completion<ConnectAck>>>>,
    //QoS 1 publishes allowed in flight, sized from the server's Receive Maximum
    pub(crate) window: Semaphore,
    pub(crate) keep_alive: AtomicU16,
    pub(crate) ping_outstanding: AtomicBool,
    closed: Mutex<Option<CancelReason>>,
}

impl Shared {
    fn new(writer: Writer) -> Self {
        Self {
            state: Mutex::new(State::Disconnected),
            writer: tokio::sync::Mutex::new(writer),
            packet_ids: PacketIdAllocator::new(),
            publishes: PendingTable::new(),
            subscribes: PendingTable::new(),
            router: Router::default(),
            connack: Mutex::new(None),
            window: Semaphore::new(0),
            keep_alive: AtomicU16::new(0),
            ping_outstanding: AtomicBool::new(false),
            closed: Mutex::new(None),
        }
    }

    /// Encodes and flushes one packet under the write lock.
    pub(crate) async fn send(&self, packet: Packet) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.send(packet).await.map_err(|e| match e {
            EncodeError::Io(e) => MqttError::Io(e),
            e => MqttError::Encode(e),
        })
    }

    /// Fails every waiter and leaves the session `Disconnected`. Safe to call more than once.
    pub(crate) fn teardown(&self, reason: CancelReason) {
        *self.state.lock() = State::Disconnected;
        {
            let mut closed = self.closed.lock();
            if closed.is_none() {
                log::debug!("session teardown, reason: {}", reason);
                *closed = Some(reason.clone());
            }
        }
        let abandoned = self.publishes.cancel_all(reason.clone());
        for id in abandoned.into_iter().chain(self.subscribes.cancel_all(reason.clone())) {
            self.packet_ids.release(id);
        }
        if let Some(tx) = self.connack.lock().take() {
            let _ = tx.send(Err(reason));
        }
        self.window.close();
    }

    #[inline]
    fn cancel_reason(&self) -> CancelReason {
        self.closed.lock().clone().unwrap_or(CancelReason::TransportClosed)
    }

    #[inline]
    fn state(&self) -> State {
        *self.state.lock()
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.state() {
            State::Connected => Ok(()),
            state => Err(MqttError::NotConnected(state)),
        }
    }

    /// I/O failures end the session and surface as `Disconnected`.
    async fn send_or_teardown(&self, packet: Packet) -> Result<()> {
        match self.send(packet).await {
            Err(MqttError::Io(e)) => {
                let reason = CancelReason::Transport(e.to_string());
                self.teardown(reason.clone());
                Err(MqttError::Disconnected(reason))
            }
            res => res,
        }
    }
}

/// One MQTT v5 client session over a caller supplied byte stream.
///
/// ```no_run
/// # async fn run(stream: tokio::net::TcpStream) -> mqlink::Result<()> {
/// use mqlink::{QoS, Session};
///
/// let session = Session::new(stream, mqlink_conf::Client::default());
/// session.connect("test-client", 30).await?;
/// session.publish("topic/a", "hello", QoS::AtLeastOnce).await?;
/// session.disconnect(mqlink::DisconnectReasonCode::NormalDisconnection).await?;
/// # Ok(())
/// # }
/// ```
pub struct Session {
    shared: Arc<Shared>,
    cfg: ClientConfig,
    reader: Mutex<Option<Reader>>,
    task: Mutex<Option<JoinHandle<()>>>,
    client_id: Mutex<ByteString>,
    connect_ack: Mutex<Option<ConnectAck>>,
}

impl Session {
    pub fn new<Io>(io: Io, cfg: ClientConfig) -> Self
    where
        Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (r, w) = tokio::io::split(io);
        let r: Box<dyn AsyncRead + Send + Unpin> = Box::new(r);
        let w: Box<dyn AsyncWrite + Send + Unpin> = Box::new(w);
        let reader = FramedRead::new(r, ClientCodec::new(cfg.max_packet_size.as_u32(), 0));
        let writer = FramedWrite::new(w, ClientCodec::default());
        Session {
            shared: Arc::new(Shared::new(writer)),
            cfg,
            reader: Mutex::new(Some(reader)),
            task: Mutex::new(None),
            client_id: Mutex::new(ByteString::new()),
            connect_ack: Mutex::new(None),
        }
    }

    /// Performs the CONNECT / CONNACK handshake. Only valid once per session.
    pub async fn connect(&self, client_id: &str, keep_alive: u16) -> Result<ConnectAck> {
        let reader = {
            let mut state = self.shared.state.lock();
            if *state != State::Disconnected {
                return Err(MqttError::InvalidState(*state));
            }
            let reader = self.reader.lock().take().ok_or(MqttError::InvalidState(*state))?;
            *state = State::Connecting;
            reader
        };

        let (tx, rx) = oneshot::channel();
        *self.shared.connack.lock() = Some(tx);
        self.shared.keep_alive.store(keep_alive, Ordering::SeqCst);
        *self.client_id.lock() = ByteString::from(client_id.to_owned());
        *self.task.lock() = Some(tokio::spawn(dispatcher::run(self.shared.clone(), reader)));

        let connect = self.connect_packet(client_id, keep_alive);
        log::debug!("{} connecting, keep_alive: {}s", client_id, keep_alive);
        if let Err(e) = self.shared.send(Packet::Connect(Box::new(connect))).await {
            self.shared.teardown(CancelReason::Transport(e.to_string()));
            return Err(e);
        }

        let ack = match with_timeout(self.cfg.connect_timeout, rx).await {
            None => {
                log::warn!("{} no CONNACK within {:?}", client_id, self.cfg.connect_timeout);
                self.shared.teardown(CancelReason::Timeout);
                self.abort();
                return Err(MqttError::ConnectTimeout);
            }
            Some(Err(_)) => return Err(MqttError::Disconnected(self.shared.cancel_reason())),
            Some(Ok(Err(reason))) => return Err(MqttError::Disconnected(reason)),
            Some(Ok(Ok(ack))) => ack,
        };

        if ack.reason_code != ConnectAckReason::Success {
            log::warn!("{} connection refused, {:?}", client_id, ack.reason_code);
            self.shared.teardown(CancelReason::Disconnected);
            self.abort();
            return Err(MqttError::ConnectRejected { reason_code: ack.reason_code });
        }

        self.apply_connect_ack(&ack).await;

        let mut state = self.shared.state.lock();
        if *state != State::Connecting {
            drop(state);
            return Err(MqttError::Disconnected(self.shared.cancel_reason()));
        }
        *state = State::Connected;
        log::debug!("{} connected, session_present: {}", self.client_id(), ack.session_present);
        Ok(ack)
    }

    fn connect_packet(&self, client_id: &str, keep_alive: u16) -> Connect {
        Connect {
            clean_start: self.cfg.clean_start,
            keep_alive,
            session_expiry_interval_secs: u32::try_from(self.cfg.session_expiry_interval.as_secs())
                .unwrap_or(u32::MAX),
            max_packet_size: std::num::NonZeroU32::new(self.cfg.max_packet_size.as_u32()),
            username: self.cfg.username.clone().map(ByteString::from),
            password: self.cfg.password.clone().map(Bytes::from),
            ..Default::default()
        }
        .client_id(client_id.to_owned())
        .receive_max(self.cfg.receive_max)
    }

    async fn apply_connect_ack(&self, ack: &ConnectAck) {
        self.shared.window.add_permits(ack.receive_max.get() as usize);
        if let Some(max) = ack.max_packet_size {
            self.shared.writer.lock().await.encoder_mut().set_max_outbound_size(max);
        }
        if let Some(keep_alive) = ack.server_keepalive_sec {
            self.shared.keep_alive.store(keep_alive, Ordering::SeqCst);
        }
        if let Some(id) = ack.assigned_client_id.as_ref() {
            *self.client_id.lock() = id.clone();
        }
        *self.connect_ack.lock() = Some(ack.clone());
    }

    /// QoS 0 returns once written, QoS 1 once the matching PUBACK arrives.
    pub async fn publish<T, P>(&self, topic: T, payload: P, qos: QoS) -> Result<()>
    where
        T: Into<ByteString>,
        P: Into<Bytes>,
    {
        self.shared.ensure_connected()?;
        match qos {
            QoS::AtMostOnce => {
                let publish = Publish::new(topic, payload.into(), QoS::AtMostOnce);
                self.shared.send_or_teardown(publish.into()).await.map_err(|e| match e {
                    MqttError::Disconnected(reason) => MqttError::PublishFailed { reason },
                    e => e,
                })
            }
            QoS::AtLeastOnce => self.publish_qos1(topic.into(), payload.into()).await,
            QoS::ExactlyOnce => Err(MqttError::UnsupportedQoS(qos)),
        }
    }

    async fn publish_qos1(&self, topic: ByteString, payload: Bytes) -> Result<()> {
        let shared = &self.shared;
        let permit = match shared.window.acquire().await {
            Ok(permit) => permit,
            Err(_) => return Err(MqttError::PublishFailed { reason: shared.cancel_reason() }),
        };

        let id = shared.packet_ids.allocate()?;
        //(id, window permit, written)
        let mut inflight = scopeguard::guard((id, permit, false), |(id, permit, written)| {
            if written && shared.publishes.abandon(id) {
                //the server still owns the id and its window slot until the PUBACK arrives
                permit.forget();
                log::debug!("publish abandoned, packet id {} held until its PUBACK", id);
            } else {
                shared.publishes.remove(id);
                shared.packet_ids.release(id);
            }
        });
        let rx = shared.publishes.register(id).map_err(|e| match e {
            MqttError::Disconnected(reason) => MqttError::PublishFailed { reason },
            e => e,
        })?;

        let mut publish = Publish::new(topic, payload, QoS::AtLeastOnce);
        publish.packet_id = Some(id);
        let size = publish.payload.len();
        shared.send_or_teardown(publish.into()).await.map_err(|e| match e {
            MqttError::Disconnected(reason) => MqttError::PublishFailed { reason },
            e => e,
        })?;
        inflight.2 = true;
        log::trace!("publish sent, packet id: {}, payload: {} bytes", id, size);

        match with_timeout(self.cfg.publish_timeout, rx).await {
            None => {
                log::warn!("no PUBACK for packet id {} within {:?}", id, self.cfg.publish_timeout);
                shared.teardown(CancelReason::Timeout);
                self.abort();
                Err(MqttError::PublishFailed { reason: CancelReason::Timeout })
            }
            Some(Err(_)) => Err(MqttError::PublishFailed { reason: shared.cancel_reason() }),
            Some(Ok(Err(reason))) => Err(MqttError::PublishFailed { reason }),
            Some(Ok(Ok(ack))) if ack.reason_code.is_success() => Ok(()),
            Some(Ok(Ok(ack))) => Err(MqttError::PublishFailed { reason: CancelReason::Rejected(ack.reason_code) }),
        }
    }

    /// Subscribes to one exact topic. `handler` runs on the dispatcher task for every match.
    ///
    /// Returns the granted QoS. A failure reason code in the SUBACK gives
    /// `SubscriptionRejected`, and a session torn down before the SUBACK arrives gives
    /// `Disconnected` with the teardown reason.
    pub async fn subscribe<T, F>(&self, filter: T, qos: QoS, handler: F) -> Result<QoS>
    where
        T: Into<ByteString>,
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.shared.ensure_connected()?;
        if qos == QoS::ExactlyOnce {
            return Err(MqttError::UnsupportedQoS(qos));
        }
        let shared = &self.shared;
        let filter = filter.into();

        let id = shared.packet_ids.allocate()?;
        //(id, written)
        let mut pending = scopeguard::guard((id, false), |(id, written)| {
            shared.router.discard(id);
            if written && shared.subscribes.abandon(id) {
                log::debug!("subscribe abandoned, packet id {} held until its SUBACK", id);
            } else {
                shared.subscribes.remove(id);
                shared.packet_ids.release(id);
            }
        });
        shared.router.stage(id, filter.clone(), Arc::new(handler));
        let rx = shared.subscribes.register(id)?;

        log::debug!("subscribe {}, qos: {:?}, packet id: {}", filter, qos, id);
        shared.send_or_teardown(Subscribe::new(id, filter, qos).into()).await?;
        pending.1 = true;

        let ack = match rx.await {
            Err(_) => return Err(MqttError::Disconnected(shared.cancel_reason())),
            Ok(Err(reason)) => return Err(MqttError::Disconnected(reason)),
            Ok(Ok(ack)) => ack,
        };
        let reason_code = ack.status.first().copied().unwrap_or(SubscribeAckReason::UnspecifiedError);
        reason_code.granted_qos().ok_or(MqttError::SubscriptionRejected { reason_code })
    }

    /// Best effort DISCONNECT, then teardown. Calling it again does nothing.
    pub async fn disconnect(&self, reason_code: DisconnectReasonCode) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            match *state {
                State::Disconnected | State::Disconnecting => return Ok(()),
                State::Connecting | State::Connected => *state = State::Disconnecting,
            }
        }

        let shared = &self.shared;
        let goodbye = async {
            let mut writer = shared.writer.lock().await;
            if let Err(e) = writer.send(Disconnect::new(reason_code).into()).await {
                log::debug!("DISCONNECT not sent, {}", e);
            }
            if let Err(e) = writer.get_mut().shutdown().await {
                log::debug!("writer shutdown failed, {}", e);
            }
        };
        if with_timeout(self.cfg.write_timeout, goodbye).await.is_none() {
            log::debug!("{}", MqttError::WriteTimeout);
        }

        self.abort();
        shared.teardown(CancelReason::Disconnected);
        log::debug!("{} disconnected, reason: {:?}", self.client_id(), reason_code);
        Ok(())
    }

    #[inline]
    pub fn state(&self) -> State {
        self.shared.state()
    }

    /// Number of packet identifiers currently in use.
    #[inline]
    pub fn inflight(&self) -> usize {
        self.shared.packet_ids.len()
    }

    /// Client identifier in use, the server assigned one if it sent one.
    #[inline]
    pub fn client_id(&self) -> ByteString {
        self.client_id.lock().clone()
    }

    #[inline]
    pub fn connect_ack(&self) -> Option<ConnectAck> {
        self.connect_ack.lock().clone()
    }

    /// QoS granted for `filter`, if subscribed.
    #[inline]
    pub fn subscription(&self, filter: &str) -> Option<QoS> {
        self.shared.router.granted_qos(filter)
    }

    #[inline]
    pub fn subscriptions(&self) -> usize {
        self.shared.router.len()
    }

    fn abort(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.abort();
    }
}

/// `Duration::ZERO` waits without a limit. Returns `None` when the limit elapsed.
async fn with_timeout<F: Future>(limit: Duration, f: F) -> Option<F::Output> {
    if limit.is_zero() {
        Some(f.await)
    } else {
        tokio::time::timeout(limit, f).await.ok()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::num::NonZeroU16;
    use std::sync::atomic::AtomicUsize;

    use futures::StreamExt;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio_util::codec::Framed;

    use mqlink_codec::{Codec, PublishAckReason};

    use super::*;

    type Broker = Framed<DuplexStream, Codec>;

    const WAIT: Duration = Duration::from_secs(5);

    fn cfg() -> ClientConfig {
        ClientConfig { connect_timeout: Duration::from_secs(2), ..Default::default() }
    }

    async fn recv(broker: &mut Broker) -> Packet {
        let next = tokio::time::timeout(WAIT, broker.next()).await.expect("broker read timed out");
        next.expect("client closed").expect("undecodable packet").0
    }

    fn init_log() {
        let _ = simple_logger::SimpleLogger::new().with_level(log::LevelFilter::Debug).init();
    }

    async fn connected_with(ack: ConnectAck, keep_alive: u16) -> (Arc<Session>, Broker) {
        connected_cfg(cfg(), ack, keep_alive).await
    }

    async fn connected_cfg(cfg: ClientConfig, ack: ConnectAck, keep_alive: u16) -> (Arc<Session>, Broker) {
        init_log();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let session = Arc::new(Session::new(client, cfg));
        let mut broker = Framed::new(server, Codec::default());
        let s = session.clone();
        let connecting = tokio::spawn(async move { s.connect("c1", keep_alive).await });
        match recv(&mut broker).await {
            Packet::Connect(c) => {
                assert_eq!(c.client_id, "c1");
                assert_eq!(c.keep_alive, keep_alive);
            }
            p => panic!("expected CONNECT, got {:?}", p),
        }
        broker.send(Packet::ConnectAck(Box::new(ack))).await.unwrap();
        connecting.await.unwrap().unwrap();
        assert_eq!(session.state(), State::Connected);
        (session, broker)
    }

    async fn connected() -> (Arc<Session>, Broker) {
        connected_with(ConnectAck::default(), 0).await
    }

    fn expect_publish(p: Packet) -> Publish {
        match p {
            Packet::Publish(p) => *p,
            p => panic!("expected PUBLISH, got {:?}", p),
        }
    }

    fn spawn_publish(session: &Arc<Session>, topic: &'static str) -> JoinHandle<Result<()>> {
        let s = session.clone();
        tokio::spawn(async move { s.publish(topic, "hello", QoS::AtLeastOnce).await })
    }

    #[tokio::test]
    async fn test_publish_waits_for_puback() {
        let (session, mut broker) = connected().await;
        let publishing = spawn_publish(&session, "topic/a");

        let publish = expect_publish(recv(&mut broker).await);
        assert_eq!(publish.topic, "topic/a");
        assert_eq!(publish.payload, Bytes::from_static(b"hello"));
        assert_eq!(publish.qos, QoS::AtLeastOnce);
        let id = publish.packet_id.unwrap();
        assert_eq!(session.inflight(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!publishing.is_finished());

        broker.send(PublishAck::new(id).into()).await.unwrap();
        publishing.await.unwrap().unwrap();
        assert_eq!(session.inflight(), 0);
    }

    #[tokio::test]
    async fn test_publish_timeout_ends_session() {
        let cfg = ClientConfig { publish_timeout: Duration::from_millis(100), ..cfg() };
        let (session, mut broker) = connected_cfg(cfg, ConnectAck::default(), 0).await;
        let first = spawn_publish(&session, "topic/slow");
        let id1 = expect_publish(recv(&mut broker).await).packet_id.unwrap();
        let second = spawn_publish(&session, "topic/slow");
        let id2 = expect_publish(recv(&mut broker).await).packet_id.unwrap();
        assert_ne!(id1, id2);

        match tokio::time::timeout(WAIT, first).await.unwrap().unwrap() {
            Err(MqttError::PublishFailed { reason }) => assert_eq!(reason, CancelReason::Timeout),
            res => panic!("unexpected {:?}", res),
        }
        assert_eq!(session.state(), State::Disconnected);

        //a late PUBACK for the first id must not complete anything
        let _ = broker.send(PublishAck::new(id1).into()).await;
        match tokio::time::timeout(WAIT, second).await.unwrap().unwrap() {
            Err(MqttError::PublishFailed { reason }) => assert_eq!(reason, CancelReason::Timeout),
            res => panic!("unexpected {:?}", res),
        }
        assert_eq!(session.inflight(), 0);
        assert!(matches!(
            session.publish("topic/slow", "x", QoS::AtLeastOnce).await,
            Err(MqttError::NotConnected(State::Disconnected))
        ));
    }

    #[tokio::test]
    async fn test_dropped_publish_keeps_id_until_puback() {
        let (session, mut broker) = connected().await;
        let first = spawn_publish(&session, "topic/drop");
        let id1 = expect_publish(recv(&mut broker).await).packet_id.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        first.abort();
        let _ = first.await;
        assert_eq!(session.inflight(), 1);

        let second = spawn_publish(&session, "topic/drop");
        let id2 = expect_publish(recv(&mut broker).await).packet_id.unwrap();
        assert_ne!(id1, id2);

        broker.send(PublishAck::new(id1).into()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());
        assert_eq!(session.inflight(), 1);

        broker.send(PublishAck::new(id2).into()).await.unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(session.inflight(), 0);

        let third = spawn_publish(&session, "topic/drop");
        assert_eq!(expect_publish(recv(&mut broker).await).packet_id, Some(id1));
        broker.send(PublishAck::new(id1).into()).await.unwrap();
        third.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dropped_publish_keeps_window_slot() {
        let ack = ConnectAck { receive_max: NonZeroU16::new(1).unwrap(), ..Default::default() };
        let (session, mut broker) = connected_with(ack, 0).await;
        let first = spawn_publish(&session, "topic/w");
        let id1 = expect_publish(recv(&mut broker).await).packet_id.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        first.abort();
        let _ = first.await;

        let second = spawn_publish(&session, "topic/w");
        assert!(tokio::time::timeout(Duration::from_millis(100), broker.next()).await.is_err());
        broker.send(PublishAck::new(id1).into()).await.unwrap();
        let id2 = expect_publish(recv(&mut broker).await).packet_id.unwrap();
        broker.send(PublishAck::new(id2).into()).await.unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(session.inflight(), 0);
    }

    #[tokio::test]
    async fn test_qos0_publish_has_no_id() {
        let (session, mut broker) = connected().await;
        session.publish("topic/b", "x", QoS::AtMostOnce).await.unwrap();
        let publish = expect_publish(recv(&mut broker).await);
        assert_eq!(publish.qos, QoS::AtMostOnce);
        assert_eq!(publish.packet_id, None);
        assert_eq!(session.inflight(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_publishes_get_distinct_ids() {
        let (session, mut broker) = connected().await;
        let handles: Vec<_> = (0..100).map(|_| spawn_publish(&session, "topic/c")).collect();

        let mut ids = HashSet::new();
        for _ in 0..100 {
            let id = expect_publish(recv(&mut broker).await).packet_id.unwrap();
            assert!(ids.insert(id), "duplicate packet id {}", id);
        }
        assert_eq!(session.inflight(), 100);
        for id in ids {
            broker.send(PublishAck::new(id).into()).await.unwrap();
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(session.inflight(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_callback_and_auto_puback() {
        let (session, mut broker) = connected().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let s = session.clone();
        let subscribing = tokio::spawn(async move {
            s.subscribe("sensors/1", QoS::AtLeastOnce, move |msg: &Message| {
                assert_eq!(msg.payload, Bytes::from_static(b"21.5"));
                h.fetch_add(1, Ordering::SeqCst);
            })
            .await
        });

        let id = match recv(&mut broker).await {
            Packet::Subscribe(sub) => {
                assert_eq!(sub.topic_filters[0].0, "sensors/1");
                assert_eq!(sub.topic_filters[0].1.qos, QoS::AtLeastOnce);
                sub.packet_id
            }
            p => panic!("expected SUBSCRIBE, got {:?}", p),
        };
        let suback = SubscribeAck {
            packet_id: id,
            properties: Vec::new(),
            reason_string: None,
            status: vec![SubscribeAckReason::GrantedQos1],
        };
        broker.send(suback.into()).await.unwrap();
        assert_eq!(subscribing.await.unwrap().unwrap(), QoS::AtLeastOnce);
        assert_eq!(session.subscription("sensors/1"), Some(QoS::AtLeastOnce));
        assert_eq!(session.inflight(), 0);

        let inbound_id = NonZeroU16::new(7).unwrap();
        let mut publish = Publish::new("sensors/1", Bytes::from_static(b"21.5"), QoS::AtLeastOnce);
        publish.packet_id = Some(inbound_id);
        broker.send(publish.into()).await.unwrap();

        match recv(&mut broker).await {
            Packet::PublishAck(ack) => assert_eq!(ack.packet_id, inbound_id),
            p => panic!("expected PUBACK, got {:?}", p),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unmatched_qos1_is_still_acknowledged() {
        let (_session, mut broker) = connected().await;
        let id = NonZeroU16::new(3).unwrap();
        let mut publish = Publish::new("nobody/listens", Bytes::new(), QoS::AtLeastOnce);
        publish.packet_id = Some(id);
        broker.send(publish.into()).await.unwrap();
        match recv(&mut broker).await {
            Packet::PublishAck(ack) => assert_eq!(ack.packet_id, id),
            p => panic!("expected PUBACK, got {:?}", p),
        }
    }

    #[tokio::test]
    async fn test_transport_close_fails_pending_publishes() {
        let (session, mut broker) = connected().await;
        let handles: Vec<_> = (0..3).map(|_| spawn_publish(&session, "topic/d")).collect();
        for _ in 0..3 {
            expect_publish(recv(&mut broker).await);
        }
        drop(broker);

        for h in handles {
            let res = tokio::time::timeout(WAIT, h).await.expect("publish did not fail in time").unwrap();
            assert!(matches!(res, Err(MqttError::PublishFailed { .. })), "{:?}", res);
        }
        assert_eq!(session.state(), State::Disconnected);
        assert_eq!(session.inflight(), 0);
        assert!(matches!(
            session.publish("topic/d", "late", QoS::AtLeastOnce).await,
            Err(MqttError::NotConnected(State::Disconnected))
        ));
    }

    #[tokio::test]
    async fn test_unknown_and_duplicate_puback_ignored() {
        let (session, mut broker) = connected().await;
        let publishing = spawn_publish(&session, "topic/e");
        let id = expect_publish(recv(&mut broker).await).packet_id.unwrap();

        broker.send(PublishAck::new(NonZeroU16::new(999).unwrap()).into()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!publishing.is_finished());

        broker.send(PublishAck::new(id).into()).await.unwrap();
        broker.send(PublishAck::new(id).into()).await.unwrap();
        publishing.await.unwrap().unwrap();

        let publishing = spawn_publish(&session, "topic/e");
        let id = expect_publish(recv(&mut broker).await).packet_id.unwrap();
        broker.send(PublishAck::new(id).into()).await.unwrap();
        publishing.await.unwrap().unwrap();
        assert_eq!(session.state(), State::Connected);
    }

    #[tokio::test]
    async fn test_puback_error_code() {
        let (session, mut broker) = connected().await;
        let publishing = spawn_publish(&session, "topic/f");
        let id = expect_publish(recv(&mut broker).await).packet_id.unwrap();
        let ack = PublishAck { reason_code: PublishAckReason::NotAuthorized, ..PublishAck::new(id) };
        broker.send(ack.into()).await.unwrap();
        match publishing.await.unwrap() {
            Err(MqttError::PublishFailed { reason: CancelReason::Rejected(code) }) => {
                assert_eq!(code, PublishAckReason::NotAuthorized)
            }
            res => panic!("unexpected {:?}", res),
        }
        assert_eq!(session.inflight(), 0);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_survived() {
        let (session, mut broker) = connected().await;
        //PUBACK whose packet id is cut short
        broker.get_mut().write_all(b"\x40\x01\x00").await.unwrap();

        let publishing = spawn_publish(&session, "topic/g");
        let id = expect_publish(recv(&mut broker).await).packet_id.unwrap();
        broker.send(PublishAck::new(id).into()).await.unwrap();
        publishing.await.unwrap().unwrap();
        assert_eq!(session.state(), State::Connected);
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let (client, server) = tokio::io::duplex(4096);
        let cfg = ClientConfig { connect_timeout: Duration::from_millis(100), ..Default::default() };
        let session = Session::new(client, cfg);
        let mut broker = Framed::new(server, Codec::default());
        let (res, _) = tokio::join!(session.connect("c1", 0), recv(&mut broker));
        assert!(matches!(res, Err(MqttError::ConnectTimeout)), "{:?}", res);
        assert_eq!(session.state(), State::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_rejected() {
        let (client, server) = tokio::io::duplex(4096);
        let session = Session::new(client, cfg());
        let mut broker = Framed::new(server, Codec::default());
        let refuse = async {
            recv(&mut broker).await;
            let ack = ConnectAck { reason_code: ConnectAckReason::NotAuthorized, ..Default::default() };
            broker.send(Packet::ConnectAck(Box::new(ack))).await.unwrap();
        };
        let (res, _) = tokio::join!(session.connect("c1", 0), refuse);
        match res {
            Err(MqttError::ConnectRejected { reason_code }) => assert_eq!(reason_code, ConnectAckReason::NotAuthorized),
            res => panic!("unexpected {:?}", res),
        }
        assert_eq!(session.state(), State::Disconnected);
        assert!(matches!(session.connect("c1", 0).await, Err(MqttError::InvalidState(State::Disconnected))));
    }

    #[tokio::test]
    async fn test_connect_applies_connack() {
        let ack = ConnectAck {
            receive_max: NonZeroU16::new(2).unwrap(),
            max_packet_size: Some(64),
            assigned_client_id: Some("assigned-1".into()),
            ..Default::default()
        };
        let (session, mut broker) = connected_with(ack, 0).await;
        assert_eq!(session.client_id(), "assigned-1");
        assert_eq!(session.connect_ack().map(|a| a.receive_max.get()), Some(2));
        assert!(matches!(session.connect("c1", 0).await, Err(MqttError::InvalidState(State::Connected))));

        let big = vec![b'x'; 100];
        assert!(matches!(
            session.publish("topic/h", big, QoS::AtLeastOnce).await,
            Err(MqttError::Encode(EncodeError::OverMaxPacketSize(_)))
        ));
        assert_eq!(session.inflight(), 0);
        assert_eq!(session.state(), State::Connected);

        //window of two
        let handles: Vec<_> = (0..3).map(|_| spawn_publish(&session, "topic/h")).collect();
        let first = expect_publish(recv(&mut broker).await).packet_id.unwrap();
        expect_publish(recv(&mut broker).await);
        assert!(tokio::time::timeout(Duration::from_millis(100), broker.next()).await.is_err());
        broker.send(PublishAck::new(first).into()).await.unwrap();
        let third = expect_publish(recv(&mut broker).await).packet_id.unwrap();
        assert_eq!(third, first);
        drop(broker);
        for h in handles {
            let _ = h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_subscription_rejected() {
        let (session, mut broker) = connected().await;
        let s = session.clone();
        let subscribing = tokio::spawn(async move { s.subscribe("secret", QoS::AtLeastOnce, |_: &Message| {}).await });
        let id = match recv(&mut broker).await {
            Packet::Subscribe(sub) => sub.packet_id,
            p => panic!("expected SUBSCRIBE, got {:?}", p),
        };
        let suback = SubscribeAck {
            packet_id: id,
            properties: Vec::new(),
            reason_string: None,
            status: vec![SubscribeAckReason::NotAuthorized],
        };
        broker.send(suback.into()).await.unwrap();
        match subscribing.await.unwrap() {
            Err(MqttError::SubscriptionRejected { reason_code }) => {
                assert_eq!(reason_code, SubscribeAckReason::NotAuthorized)
            }
            res => panic!("unexpected {:?}", res),
        }
        assert_eq!(session.subscriptions(), 0);
        assert_eq!(session.inflight(), 0);
    }

    #[tokio::test]
    async fn test_dropped_subscribe_keeps_id_until_suback() {
        let (session, mut broker) = connected().await;
        let s = session.clone();
        let subscribing =
            tokio::spawn(async move { s.subscribe("gone/1", QoS::AtLeastOnce, |_: &Message| {}).await });
        let id = match recv(&mut broker).await {
            Packet::Subscribe(sub) => sub.packet_id,
            p => panic!("expected SUBSCRIBE, got {:?}", p),
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        subscribing.abort();
        let _ = subscribing.await;
        assert_eq!(session.inflight(), 1);

        let suback = SubscribeAck {
            packet_id: id,
            properties: Vec::new(),
            reason_string: None,
            status: vec![SubscribeAckReason::GrantedQos1],
        };
        broker.send(suback.into()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.inflight(), 0);
        assert_eq!(session.subscriptions(), 0);
        assert_eq!(session.state(), State::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_publish_and_subscribe() {
        let (session, mut broker) = connected().await;
        let publishing = spawn_publish(&session, "topic/p");
        let s = session.clone();
        let subscribing =
            tokio::spawn(async move { s.subscribe("topic/s", QoS::AtLeastOnce, |_: &Message| {}).await });
        for _ in 0..2 {
            match recv(&mut broker).await {
                Packet::Publish(_) | Packet::Subscribe(_) => {}
                p => panic!("unexpected {:?}", p),
            }
        }

        session.disconnect(DisconnectReasonCode::NormalDisconnection).await.unwrap();
        match tokio::time::timeout(WAIT, publishing).await.unwrap().unwrap() {
            Err(MqttError::PublishFailed { reason }) => assert_eq!(reason, CancelReason::Disconnected),
            res => panic!("unexpected {:?}", res),
        }
        match tokio::time::timeout(WAIT, subscribing).await.unwrap().unwrap() {
            Err(MqttError::Disconnected(reason)) => assert_eq!(reason, CancelReason::Disconnected),
            res => panic!("unexpected {:?}", res),
        }
        assert_eq!(session.inflight(), 0);
        assert_eq!(session.state(), State::Disconnected);
    }

    #[tokio::test]
    async fn test_transport_close_fails_pending_subscribe() {
        let (session, mut broker) = connected().await;
        let s = session.clone();
        let subscribing =
            tokio::spawn(async move { s.subscribe("topic/s", QoS::AtLeastOnce, |_: &Message| {}).await });
        assert!(matches!(recv(&mut broker).await, Packet::Subscribe(_)));
        drop(broker);

        match tokio::time::timeout(WAIT, subscribing).await.unwrap().unwrap() {
            Err(MqttError::Disconnected(reason)) => assert_eq!(reason, CancelReason::TransportClosed),
            res => panic!("unexpected {:?}", res),
        }
        assert_eq!(session.inflight(), 0);
        assert_eq!(session.subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_keep_alive() {
        let ack = ConnectAck { server_keepalive_sec: Some(1), ..Default::default() };
        let (session, mut broker) = connected_with(ack, 30).await;
        assert!(matches!(recv(&mut broker).await, Packet::PingRequest));
        broker.send(Packet::PingResponse).await.unwrap();
        assert!(matches!(recv(&mut broker).await, Packet::PingRequest));

        //second ping left unanswered
        let publishing = spawn_publish(&session, "topic/i");
        expect_publish(recv(&mut broker).await);
        match tokio::time::timeout(WAIT, publishing).await.unwrap().unwrap() {
            Err(MqttError::PublishFailed { reason }) => assert_eq!(reason, CancelReason::KeepAliveTimeout),
            res => panic!("unexpected {:?}", res),
        }
        assert_eq!(session.state(), State::Disconnected);
    }

    #[tokio::test]
    async fn test_server_disconnect() {
        let (session, mut broker) = connected().await;
        let publishing = spawn_publish(&session, "topic/j");
        expect_publish(recv(&mut broker).await);
        broker.send(Disconnect::new(DisconnectReasonCode::ServerShuttingDown).into()).await.unwrap();
        match publishing.await.unwrap() {
            Err(MqttError::PublishFailed { reason }) => {
                assert_eq!(reason, CancelReason::ServerDisconnected(DisconnectReasonCode::ServerShuttingDown))
            }
            res => panic!("unexpected {:?}", res),
        }
        assert_eq!(session.state(), State::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (session, mut broker) = connected().await;
        session.disconnect(DisconnectReasonCode::NormalDisconnection).await.unwrap();
        match recv(&mut broker).await {
            Packet::Disconnect(d) => assert_eq!(d.reason_code, DisconnectReasonCode::NormalDisconnection),
            p => panic!("expected DISCONNECT, got {:?}", p),
        }
        assert!(broker.next().await.is_none());
        session.disconnect(DisconnectReasonCode::NormalDisconnection).await.unwrap();
        assert_eq!(session.state(), State::Disconnected);
        assert!(matches!(
            session.publish("topic/k", "x", QoS::AtMostOnce).await,
            Err(MqttError::NotConnected(State::Disconnected))
        ));
    }

    #[tokio::test]
    async fn test_not_connected_and_qos2() {
        let (client, _server) = tokio::io::duplex(1024);
        let session = Session::new(client, cfg());
        assert!(matches!(
            session.publish("t", "x", QoS::AtLeastOnce).await,
            Err(MqttError::NotConnected(State::Disconnected))
        ));
        session.disconnect(DisconnectReasonCode::NormalDisconnection).await.unwrap();

        let (session, _broker) = connected().await;
        assert!(matches!(
            session.publish("t", "x", QoS::ExactlyOnce).await,
            Err(MqttError::UnsupportedQoS(QoS::ExactlyOnce))
        ));
        assert!(matches!(
            session.subscribe("t", QoS::ExactlyOnce, |_: &Message| {}).await,
            Err(MqttError::UnsupportedQoS(QoS::ExactlyOnce))
        ));
    }
}
