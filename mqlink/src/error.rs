use std::io;
use std::num::NonZeroU16;

use mqlink_codec::error::{DecodeError, EncodeError};
use mqlink_codec::{ConnectAckReason, DisconnectReasonCode, PublishAckReason, QoS, SubscribeAckReason};

use crate::session::State;

pub type Result<T, E = MqttError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    /// Inbound bytes could not be decoded
    #[error("Malformed packet: {0}")]
    MalformedPacket(#[from] DecodeError),
    /// Outbound packet could not be encoded
    #[error("Encoding error: {0}")]
    Encode(#[from] EncodeError),
    #[error("all 65535 packet identifiers are in use")]
    IdentifierSpaceExhausted,
    #[error("Provided packet id is in use, {0}")]
    PacketIdInUse(NonZeroU16),
    #[error("Connect timeout")]
    ConnectTimeout,
    #[error("Connection refused, {}", reason_code.reason())]
    ConnectRejected { reason_code: ConnectAckReason },
    #[error("Publish failed, {reason}")]
    PublishFailed { reason: CancelReason },
    #[error("Subscription rejected, {reason_code:?}")]
    SubscriptionRejected { reason_code: SubscribeAckReason },
    #[error("Not connected, state: {0:?}")]
    NotConnected(State),
    #[error("Operation not allowed in state {0:?}")]
    InvalidState(State),
    #[error("Disconnected, {0}")]
    Disconnected(CancelReason),
    #[error("Unsupported QoS, {0:?}")]
    UnsupportedQoS(QoS),
    #[error("Write timeout")]
    WriteTimeout,
    #[error("io error, {0:?}")]
    Io(#[from] io::Error),
}

/// Why a waiter was completed without its acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CancelReason {
    /// Local `disconnect`
    #[error("disconnected")]
    Disconnected,
    /// Peer closed the stream
    #[error("transport closed")]
    TransportClosed,
    /// Read or write failed, or the byte stream lost framing
    #[error("transport error, {0}")]
    Transport(String),
    #[error("server disconnected, {0:?}")]
    ServerDisconnected(DisconnectReasonCode),
    #[error("keep alive timeout")]
    KeepAliveTimeout,
    #[error("timeout")]
    Timeout,
    #[error("rejected by server, {0:?}")]
    Rejected(PublishAckReason),
}
