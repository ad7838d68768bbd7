use bytes::{BufMut, BytesMut};

use crate::error::EncodeError;
use crate::packet::{property_type as pt, Packet};
use crate::types::packet_type;
use crate::utils::{write_variable_length, Encode};
use crate::UserProperties;

/// Variable header and payload of a control packet, the fixed header is written by `Packet`.
pub(crate) trait EncodeBody {
    fn encoded_size(&self) -> usize;

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError>;
}

impl Packet {
    fn first_byte(&self) -> u8 {
        match self {
            Packet::Publish(publish) => {
                packet_type::PUBLISH_START
                    | (u8::from(publish.qos) << 1)
                    | (u8::from(publish.dup) << 3)
                    | u8::from(publish.retain)
            }
            _ => self.packet_type(),
        }
    }
}

impl EncodeBody for Packet {
    fn encoded_size(&self) -> usize {
        match self {
            Packet::Connect(connect) => connect.encoded_size(),
            Packet::ConnectAck(ack) => ack.encoded_size(),
            Packet::Publish(publish) => publish.encoded_size(),
            Packet::PublishAck(ack) => ack.encoded_size(),
            Packet::Subscribe(sub) => sub.encoded_size(),
            Packet::SubscribeAck(ack) => ack.encoded_size(),
            Packet::PingRequest | Packet::PingResponse => 0,
            Packet::Disconnect(disconnect) => disconnect.encoded_size(),
        }
    }

    /// Writes the whole packet, `encoded_size` must have been checked against the size limit.
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let size = self.encoded_size();
        buf.put_u8(self.first_byte());
        write_variable_length(u32::try_from(size).map_err(|_| EncodeError::InvalidLength)?, buf)?;
        let start = buf.len();
        match self {
            Packet::Connect(connect) => connect.encode(buf)?,
            Packet::ConnectAck(ack) => ack.encode(buf)?,
            Packet::Publish(publish) => publish.encode(buf)?,
            Packet::PublishAck(ack) => ack.encode(buf)?,
            Packet::Subscribe(sub) => sub.encode(buf)?,
            Packet::SubscribeAck(ack) => ack.encode(buf)?,
            Packet::PingRequest | Packet::PingResponse => {}
            Packet::Disconnect(disconnect) => disconnect.encode(buf)?,
        }
        debug_assert_eq!(buf.len() - start, size, "{} body size mismatch", self.name());
        Ok(())
    }
}

pub(crate) fn encoded_property_size<T: Encode>(v: &Option<T>) -> usize {
    v.as_ref().map_or(0, |v| 1 + v.encoded_size()) // 1 - property type byte
}

pub(crate) fn encoded_property_size_default<T: Encode + PartialEq>(v: &T, default: T) -> usize {
    if *v == default {
        0
    } else {
        1 + v.encoded_size()
    }
}

pub(crate) fn encode_property<T: Encode>(
    v: &Option<T>,
    prop_type: u8,
    buf: &mut BytesMut,
) -> Result<(), EncodeError> {
    if let Some(v) = v {
        buf.put_u8(prop_type);
        v.encode(buf)
    } else {
        Ok(())
    }
}

pub(crate) fn encode_property_default<T: Encode + PartialEq>(
    v: &T,
    default: T,
    prop_type: u8,
    buf: &mut BytesMut,
) -> Result<(), EncodeError> {
    if *v != default {
        buf.put_u8(prop_type);
        v.encode(buf)
    } else {
        Ok(())
    }
}

impl Encode for UserProperties {
    fn encoded_size(&self) -> usize {
        self.iter().map(|prop| 1 + prop.encoded_size()).sum()
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        for prop in self {
            buf.put_u8(pt::USER);
            prop.encode(buf)?;
        }
        Ok(())
    }
}
