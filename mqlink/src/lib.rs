#![deny(unsafe_code)]

//! MQTT v5 client engine
//!
//! A [`Session`] drives one connection to a broker over any `AsyncRead + AsyncWrite` stream:
//! - the CONNECT / CONNACK handshake with server limits applied afterwards
//! - QoS 0 and QoS 1 publishing, QoS 1 calls return once the PUBACK for their packet id arrives
//! - exact-topic subscriptions delivered to a callback, inbound QoS 1 acknowledged automatically
//! - keep-alive pings
//!
//! A single dispatcher task reads the transport. When it stops, every pending call fails.

mod dispatcher;
mod error;
mod framed;
pub mod logger;
pub mod packet_id;
pub mod pending;
mod router;
mod session;

pub use self::error::{CancelReason, MqttError, Result};
pub use self::router::{Handler, Message};
pub use self::session::{Session, State};

pub use mqlink_codec::{
    self as codec, ConnectAck, ConnectAckReason, DisconnectReasonCode, PublishAckReason, QoS,
    SubscribeAckReason,
};
