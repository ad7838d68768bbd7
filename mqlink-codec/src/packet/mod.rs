use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytestring::ByteString;

pub use crate::types::{ConnectAckFlags, ConnectFlags, QoS};

use crate::error::{DecodeError, EncodeError};
use crate::types::packet_type;
use crate::utils::{decode_variable_length_cursor, take_properties, Decode, Encode, Property};
use crate::{UserProperties, UserProperty};

mod connack;
mod connect;
mod disconnect;
mod puback;
mod publish;
mod subscribe;

pub use connack::*;
pub use connect::*;
pub use disconnect::*;
pub use puback::*;
pub use publish::*;
pub use subscribe::*;

/// MQTT Control Packets exchanged by a client session
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Packet {
    /// Client request to connect to Server
    Connect(Box<Connect>),
    /// Connect acknowledgment
    ConnectAck(Box<ConnectAck>),
    /// Publish message
    Publish(Box<Publish>),
    /// Publish acknowledgment
    PublishAck(PublishAck),
    /// Client subscribe request
    Subscribe(Subscribe),
    /// Subscribe acknowledgment
    SubscribeAck(SubscribeAck),
    /// PING request
    PingRequest,
    /// PING response
    PingResponse,
    /// Disconnection is advertised
    Disconnect(Disconnect),
}

impl Packet {
    pub fn packet_type(&self) -> u8 {
        match self {
            Packet::Connect(_) => packet_type::CONNECT,
            Packet::ConnectAck(_) => packet_type::CONNACK,
            Packet::Publish(_) => packet_type::PUBLISH_START,
            Packet::PublishAck(_) => packet_type::PUBACK,
            Packet::Subscribe(_) => packet_type::SUBSCRIBE,
            Packet::SubscribeAck(_) => packet_type::SUBACK,
            Packet::PingRequest => packet_type::PINGREQ,
            Packet::PingResponse => packet_type::PINGRESP,
            Packet::Disconnect(_) => packet_type::DISCONNECT,
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnectAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PublishAck(_) => "PUBACK",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubscribeAck(_) => "SUBACK",
            Packet::PingRequest => "PINGREQ",
            Packet::PingResponse => "PINGRESP",
            Packet::Disconnect(_) => "DISCONNECT",
        }
    }
}

impl From<Connect> for Packet {
    fn from(pkt: Connect) -> Self {
        Self::Connect(Box::new(pkt))
    }
}

impl From<ConnectAck> for Packet {
    fn from(pkt: ConnectAck) -> Self {
        Self::ConnectAck(Box::new(pkt))
    }
}

impl From<Publish> for Packet {
    fn from(pkt: Publish) -> Self {
        Self::Publish(Box::new(pkt))
    }
}

impl From<PublishAck> for Packet {
    fn from(pkt: PublishAck) -> Self {
        Self::PublishAck(pkt)
    }
}

impl From<Subscribe> for Packet {
    fn from(pkt: Subscribe) -> Self {
        Self::Subscribe(pkt)
    }
}

impl From<SubscribeAck> for Packet {
    fn from(pkt: SubscribeAck) -> Self {
        Self::SubscribeAck(pkt)
    }
}

impl From<Disconnect> for Packet {
    fn from(pkt: Disconnect) -> Self {
        Self::Disconnect(pkt)
    }
}

pub(crate) mod property_type {
    pub(crate) const UTF8_PAYLOAD: u8 = 0x01;
    pub(crate) const MSG_EXPIRY_INT: u8 = 0x02;
    pub(crate) const CONTENT_TYPE: u8 = 0x03;
    pub(crate) const RESP_TOPIC: u8 = 0x08;
    pub(crate) const CORR_DATA: u8 = 0x09;
    pub(crate) const SUB_ID: u8 = 0x0B;
    pub(crate) const SESS_EXPIRY_INT: u8 = 0x11;
    pub(crate) const ASSND_CLIENT_ID: u8 = 0x12;
    pub(crate) const SERVER_KA: u8 = 0x13;
    pub(crate) const AUTH_METHOD: u8 = 0x15;
    pub(crate) const AUTH_DATA: u8 = 0x16;
    pub(crate) const REQ_PROB_INFO: u8 = 0x17;
    pub(crate) const WILL_DELAY_INT: u8 = 0x18;
    pub(crate) const REQ_RESP_INFO: u8 = 0x19;
    pub(crate) const RESP_INFO: u8 = 0x1A;
    pub(crate) const SERVER_REF: u8 = 0x1C;
    pub(crate) const REASON_STRING: u8 = 0x1F;
    pub(crate) const RECEIVE_MAX: u8 = 0x21;
    pub(crate) const TOPIC_ALIAS_MAX: u8 = 0x22;
    pub(crate) const TOPIC_ALIAS: u8 = 0x23;
    pub(crate) const MAX_QOS: u8 = 0x24;
    pub(crate) const RETAIN_AVAIL: u8 = 0x25;
    pub(crate) const USER: u8 = 0x26;
    pub(crate) const MAX_PACKET_SIZE: u8 = 0x27;
    pub(crate) const WILDCARD_SUB_AVAIL: u8 = 0x28;
    pub(crate) const SUB_IDS_AVAIL: u8 = 0x29;
    pub(crate) const SHARED_SUB_AVAIL: u8 = 0x2A;
}

/// Consumes the value of a property the client does not keep.
///
/// Every identifier defined by MQTT v5 is accepted, anything else is `MalformedPacket`.
pub(crate) fn skip_property(prop_id: u8, src: &mut Bytes) -> Result<(), DecodeError> {
    use property_type as pt;

    let width = match prop_id {
        pt::UTF8_PAYLOAD
        | pt::REQ_PROB_INFO
        | pt::REQ_RESP_INFO
        | pt::MAX_QOS
        | pt::RETAIN_AVAIL
        | pt::WILDCARD_SUB_AVAIL
        | pt::SUB_IDS_AVAIL
        | pt::SHARED_SUB_AVAIL => 1,
        pt::SERVER_KA | pt::RECEIVE_MAX | pt::TOPIC_ALIAS_MAX | pt::TOPIC_ALIAS => 2,
        pt::MSG_EXPIRY_INT | pt::SESS_EXPIRY_INT | pt::WILL_DELAY_INT | pt::MAX_PACKET_SIZE => 4,
        pt::SUB_ID => {
            decode_variable_length_cursor(src)?;
            return Ok(());
        }
        pt::CONTENT_TYPE
        | pt::RESP_TOPIC
        | pt::CORR_DATA
        | pt::ASSND_CLIENT_ID
        | pt::AUTH_METHOD
        | pt::AUTH_DATA
        | pt::RESP_INFO
        | pt::SERVER_REF
        | pt::REASON_STRING => {
            Bytes::decode(src)?;
            return Ok(());
        }
        pt::USER => {
            UserProperty::decode(src)?;
            return Ok(());
        }
        _ => return Err(DecodeError::MalformedPacket),
    };
    ensure!(src.remaining() >= width, DecodeError::InvalidLength);
    src.advance(width);
    Ok(())
}

/// Reason String and User Property block shared by PUBACK, SUBACK and DISCONNECT
pub(crate) mod ack_props {
    use super::*;
    use crate::utils::{var_int_len, write_variable_length};

    pub(crate) fn properties_len(properties: &[UserProperty], reason_string: &Option<ByteString>) -> usize {
        properties.iter().map(|p| 1 + p.encoded_size()).sum::<usize>()
            + reason_string.as_ref().map_or(0, |r| 1 + r.encoded_size())
    }

    pub(crate) fn encoded_size(properties: &[UserProperty], reason_string: &Option<ByteString>) -> usize {
        let len = properties_len(properties, reason_string);
        var_int_len(len) + len
    }

    pub(crate) fn encode(
        properties: &[UserProperty],
        reason_string: &Option<ByteString>,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        write_variable_length(properties_len(properties, reason_string) as u32, buf)?;
        if let Some(reason) = reason_string {
            buf.put_u8(property_type::REASON_STRING);
            reason.encode(buf)?;
        }
        for up in properties {
            buf.put_u8(property_type::USER);
            up.encode(buf)?;
        }
        Ok(())
    }

    /// Parses the ACK property block, other property types are rejected.
    pub(crate) fn decode(src: &mut Bytes) -> Result<(UserProperties, Option<ByteString>), DecodeError> {
        let prop_src = &mut take_properties(src)?;
        let mut reason_string = None;
        let mut user_props = Vec::new();
        while prop_src.has_remaining() {
            match prop_src.get_u8() {
                property_type::REASON_STRING => reason_string.read_value(prop_src)?,
                property_type::USER => user_props.push(UserProperty::decode(prop_src)?),
                _ => return Err(DecodeError::MalformedPacket),
            }
        }
        Ok((user_props, reason_string))
    }
}
