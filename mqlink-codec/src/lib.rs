#![deny(unsafe_code)]

//! MQTT v5.0 packet codec for the client side of a connection
//!
//! ## Supported packets:
//! - CONNECT / CONNACK for the session handshake
//! - PUBLISH / PUBACK for QoS 0 and QoS 1 delivery
//! - SUBSCRIBE / SUBACK for exact-topic subscriptions
//! - PINGREQ / PINGRESP for keep-alive
//! - DISCONNECT in both directions
//!
//! ## Architecture Components:
//! - [`Codec`]: `tokio_util::codec` encoder/decoder with inbound and outbound size limits
//! - [`Packet`]: the decoded control packet
//! - [`error`]: dedicated `EncodeError`/`DecodeError` types
//!
//! ```
//! use bytes::BytesMut;
//! use mqlink_codec::{Codec, Packet};
//! use tokio_util::codec::{Decoder, Encoder};
//!
//! let mut codec = Codec::default();
//! let mut buf = BytesMut::new();
//! codec.encode(Packet::PingRequest, &mut buf).unwrap();
//! assert_eq!(&buf[..], b"\xc0\x00");
//! let (packet, _) = codec.decode(&mut buf).unwrap().unwrap();
//! assert_eq!(packet, Packet::PingRequest);
//! ```

#[macro_use]
mod utils;

/// Error types for encoding/decoding operations
pub mod error;

/// Shared types and constants for MQTT protocol
pub mod types;

mod codec;
mod decode;
mod encode;
mod packet;

pub use self::codec::{Codec, Frame};
pub use self::packet::*;
pub use self::types::QoS;

pub type UserProperty = (bytestring::ByteString, bytestring::ByteString);
pub type UserProperties = Vec<UserProperty>;

const RECEIVE_MAX_DEFAULT: std::num::NonZeroU16 = nonzero_ext::nonzero!(65535u16);
