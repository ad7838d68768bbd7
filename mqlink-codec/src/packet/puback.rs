use std::num::NonZeroU16;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytestring::ByteString;

use super::ack_props;
use crate::encode::EncodeBody;
use crate::error::{DecodeError, EncodeError};
use crate::utils::{Decode, Encode};
use crate::UserProperties;

/// PUBACK message content
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PublishAck {
    /// Packet Identifier
    pub packet_id: NonZeroU16,
    pub reason_code: PublishAckReason,
    pub properties: UserProperties,
    pub reason_string: Option<ByteString>,
}

prim_enum! {
    /// PUBACK reason codes
    pub enum PublishAckReason {
        Success = 0,
        NoMatchingSubscribers = 16,
        UnspecifiedError = 128,
        ImplementationSpecificError = 131,
        NotAuthorized = 135,
        TopicNameInvalid = 144,
        PacketIdentifierInUse = 145,
        QuotaExceeded = 151,
        PayloadFormatInvalid = 153
    }
}

impl PublishAckReason {
    /// Codes below 0x80 mean the message was accepted.
    #[inline]
    pub fn is_success(&self) -> bool {
        u8::from(*self) < 0x80
    }
}

impl PublishAck {
    pub fn new(packet_id: NonZeroU16) -> Self {
        Self {
            packet_id,
            reason_code: PublishAckReason::Success,
            properties: UserProperties::default(),
            reason_string: None,
        }
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let packet_id = NonZeroU16::decode(src)?;

        let ack = if src.has_remaining() {
            let reason_code = src.get_u8().try_into()?;
            if src.has_remaining() {
                let (properties, reason_string) = ack_props::decode(src)?;
                ensure!(!src.has_remaining(), DecodeError::InvalidLength); // no data should be left in src
                Self { packet_id, reason_code, properties, reason_string }
            } else {
                Self { reason_code, ..Self::new(packet_id) }
            }
        } else {
            Self::new(packet_id)
        };

        Ok(ack)
    }

    fn has_properties(&self) -> bool {
        !self.properties.is_empty() || self.reason_string.is_some()
    }
}

impl EncodeBody for PublishAck {
    fn encoded_size(&self) -> usize {
        if self.has_properties() {
            2 + 1 + ack_props::encoded_size(&self.properties, &self.reason_string)
        } else if self.reason_code != PublishAckReason::Success {
            2 + 1
        } else {
            2
        }
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.packet_id.encode(buf)?;
        if self.has_properties() {
            buf.put_u8(self.reason_code.into());
            ack_props::encode(&self.properties, &self.reason_string, buf)?;
        } else if self.reason_code != PublishAckReason::Success {
            buf.put_u8(self.reason_code.into());
        }
        Ok(())
    }
}
