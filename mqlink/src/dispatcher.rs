use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use mqlink_codec::error::DecodeError;
use mqlink_codec::{ConnectAck, ConnectAckReason, Packet, Publish, PublishAck, QoS, SubscribeAck};

use crate::framed::Reader;
use crate::pending::Resolved;
use crate::router::Message;
use crate::session::Shared;
use crate::CancelReason;

enum Event {
    Inbound(Option<Result<Result<Packet, DecodeError>, DecodeError>>),
    KeepAlive,
}

/// Sole reader of the transport. Returns after tearing the session down.
pub(crate) async fn run(shared: Arc<Shared>, mut reader: Reader) {
    let mut keep_alive: Option<Interval> = None;
    let reason = loop {
        let event = tokio::select! {
            item = reader.next() => Event::Inbound(item),
            _ = tick(&mut keep_alive) => Event::KeepAlive,
        };

        match event {
            Event::Inbound(None) => {
                log::debug!("transport closed by peer");
                break CancelReason::TransportClosed;
            }
            Event::Inbound(Some(Err(e))) => {
                log::warn!("read failed, {}", e);
                break CancelReason::Transport(e.to_string());
            }
            Event::Inbound(Some(Ok(Err(e)))) => {
                log::warn!("malformed packet dropped, {}", e);
            }
            Event::Inbound(Some(Ok(Ok(packet)))) => {
                log::trace!("recv {}", packet.name());
                if let Err(reason) = handle(&shared, packet, &mut keep_alive).await {
                    break reason;
                }
            }
            Event::KeepAlive => {
                if shared.ping_outstanding.swap(true, Ordering::SeqCst) {
                    log::warn!("no PINGRESP within the keep alive interval");
                    break CancelReason::KeepAliveTimeout;
                }
                if let Err(e) = shared.send(Packet::PingRequest).await {
                    break CancelReason::Transport(e.to_string());
                }
            }
        }
    };
    shared.teardown(reason);
}

async fn tick(keep_alive: &mut Option<Interval>) {
    match keep_alive {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn handle(shared: &Shared, packet: Packet, keep_alive: &mut Option<Interval>) -> Result<(), CancelReason> {
    match packet {
        Packet::PublishAck(ack) => on_publish_ack(shared, ack),
        Packet::Publish(publish) => on_publish(shared, *publish).await?,
        Packet::ConnectAck(ack) => on_connect_ack(shared, *ack, keep_alive),
        Packet::SubscribeAck(ack) => on_subscribe_ack(shared, ack),
        Packet::PingResponse => {
            shared.ping_outstanding.store(false, Ordering::SeqCst);
        }
        Packet::Disconnect(d) => {
            log::info!("server disconnected, reason: {:?}, {:?}", d.reason_code, d.reason_string);
            return Err(CancelReason::ServerDisconnected(d.reason_code));
        }
        Packet::Connect(_) | Packet::Subscribe(_) | Packet::PingRequest => {
            log::warn!("unexpected {} from server, ignored", packet.name());
        }
    }
    Ok(())
}

fn on_publish_ack(shared: &Shared, ack: PublishAck) {
    let id = ack.packet_id;
    match shared.publishes.resolve(id, ack) {
        Ok(Resolved::Delivered) => {}
        Ok(Resolved::Abandoned) => {
            log::debug!("late PUBACK for abandoned packet id {}", id);
            shared.packet_ids.release(id);
            shared.window.add_permits(1);
        }
        Err(e) => log::debug!("PUBACK ignored, {}", e),
    }
}

async fn on_publish(shared: &Shared, publish: Publish) -> Result<(), CancelReason> {
    let msg = Message::from(publish);
    match msg.qos {
        QoS::ExactlyOnce => {
            log::warn!("QoS 2 publish dropped, topic: {}", msg.topic);
            return Ok(());
        }
        QoS::AtMostOnce | QoS::AtLeastOnce => {}
    }

    if !shared.router.dispatch(&msg) {
        log::debug!("no subscription for topic {}, message dropped", msg.topic);
    }

    if let (QoS::AtLeastOnce, Some(id)) = (msg.qos, msg.packet_id) {
        if let Err(e) = shared.send(PublishAck::new(id).into()).await {
            return Err(CancelReason::Transport(e.to_string()));
        }
    }
    Ok(())
}

fn on_connect_ack(shared: &Shared, ack: ConnectAck, keep_alive: &mut Option<Interval>) {
    let tx = shared.connack.lock().take();
    let Some(tx) = tx else {
        log::debug!("unexpected CONNACK ignored");
        return;
    };

    if ack.reason_code == ConnectAckReason::Success {
        let secs = ack.server_keepalive_sec.unwrap_or_else(|| shared.keep_alive.load(Ordering::SeqCst));
        if secs > 0 {
            let period = Duration::from_secs(u64::from(secs));
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            *keep_alive = Some(interval);
        }
    }

    if tx.send(Ok(ack)).is_err() {
        log::debug!("connect waiter is gone");
    }
}

fn on_subscribe_ack(shared: &Shared, ack: SubscribeAck) {
    let id = ack.packet_id;
    match ack.status.first().and_then(|s| s.granted_qos()) {
        Some(qos) => {
            shared.router.commit(id, qos);
        }
        None => shared.router.discard(id),
    }
    match shared.subscribes.resolve(id, ack) {
        Ok(Resolved::Delivered) => {}
        Ok(Resolved::Abandoned) => {
            log::debug!("late SUBACK for abandoned packet id {}", id);
            shared.packet_ids.release(id);
        }
        Err(e) => log::debug!("SUBACK ignored, {}", e),
    }
}
