use bytes::{Buf, Bytes};

use crate::error::DecodeError;
use crate::packet::*;
use crate::types::packet_type;

/// Parses the body of a frame whose fixed header byte is `first_byte`.
pub(crate) fn decode_packet(mut src: Bytes, first_byte: u8) -> Result<Packet, DecodeError> {
    match first_byte {
        packet_type::PUBLISH_START..=packet_type::PUBLISH_END => {
            Ok(Packet::Publish(Box::new(Publish::decode(src, first_byte & 0b0000_1111)?)))
        }
        packet_type::PUBACK => Ok(Packet::PublishAck(PublishAck::decode(&mut src)?)),
        packet_type::PINGREQ => {
            ensure!(!src.has_remaining(), DecodeError::MalformedPacket);
            Ok(Packet::PingRequest)
        }
        packet_type::PINGRESP => {
            ensure!(!src.has_remaining(), DecodeError::MalformedPacket);
            Ok(Packet::PingResponse)
        }
        packet_type::SUBSCRIBE => Ok(Packet::Subscribe(Subscribe::decode(&mut src)?)),
        packet_type::SUBACK => Ok(Packet::SubscribeAck(SubscribeAck::decode(&mut src)?)),
        packet_type::CONNECT => Ok(Packet::Connect(Box::new(Connect::decode(&mut src)?))),
        packet_type::CONNACK => Ok(Packet::ConnectAck(Box::new(ConnectAck::decode(&mut src)?))),
        packet_type::DISCONNECT => Ok(Packet::Disconnect(Disconnect::decode(&mut src)?)),
        _ => Err(DecodeError::UnsupportedPacketType(first_byte)),
    }
}

#[cfg(test)]
mod tests {
    use std::num::{NonZeroU16, NonZeroU32};

    use bytes::BytesMut;
    use bytestring::ByteString;
    use tokio_util::codec::{Decoder, Encoder};

    use super::*;
    use crate::codec::Codec;
    use crate::utils::decode_variable_length;

    fn packet_id(v: u16) -> NonZeroU16 {
        NonZeroU16::new(v).unwrap()
    }

    fn assert_decode_packet<B: AsRef<[u8]>>(bytes: B, res: Packet) {
        let bytes = bytes.as_ref();
        let fixed = bytes[0];
        let (_len, consumed) = decode_variable_length(&bytes[1..]).unwrap().unwrap();
        let cur = Bytes::copy_from_slice(&bytes[consumed + 1..]);
        let decoded = decode_packet(cur, fixed);
        match decoded {
            Ok(ref p) if *p == res => {}
            _ => panic!("decoded packet does not match expectations.\nexpected: {:?}\nactual: {:?}", res, decoded),
        }
    }

    /// Encodes through the codec and reads the bytes back as a single frame.
    fn round_trip(packet: Packet) {
        let mut codec = Codec::default();
        let mut buf = BytesMut::new();
        codec.encode(packet.clone(), &mut buf).unwrap();
        let encoded_len = buf.len();
        let (decoded, size) = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, packet);
        assert!(buf.is_empty());
        assert!((size as usize) < encoded_len);
    }

    #[test]
    fn test_decode_connect_packets() {
        assert_decode_packet(
            b"\x10\x1E\x00\x04MQTT\x05\xC0\x00\x3C\x00\x00\x0512345\x00\x04user\x00\x04pass",
            Packet::Connect(Box::new(Connect {
                keep_alive: 60,
                client_id: ByteString::from_static("12345"),
                username: Some(ByteString::from_static("user")),
                password: Some(Bytes::from_static(b"pass")),
                ..Connect::default()
            })),
        );

        assert_decode_packet(
            b"\x10\x28\x00\x04MQTT\x05\x2C\x00\x3C\x00\x00\x0512345\x05\x18\x00\x00\x00\x05\x00\x05topic\x00\x07message",
            Packet::Connect(Box::new(Connect {
                keep_alive: 60,
                client_id: ByteString::from_static("12345"),
                last_will: Some(LastWill {
                    qos: QoS::AtLeastOnce,
                    retain: true,
                    topic: ByteString::from_static("topic"),
                    message: Bytes::from_static(b"message"),
                    will_delay_interval_sec: Some(5),
                    user_properties: vec![],
                }),
                ..Connect::default()
            })),
        );

        assert_eq!(
            decode_packet(Bytes::from_static(b"\x00\x02MQ00000000000000000000"), 0x10).unwrap_err().to_string(),
            DecodeError::InvalidProtocol.to_string()
        );
        assert_eq!(
            decode_packet(Bytes::from_static(b"\x00\x04MQTT\x05\x01\x00\x3C\x00\x00\x02c1"), 0x10)
                .unwrap_err()
                .to_string(),
            DecodeError::ConnectReservedFlagSet.to_string()
        );
    }

    #[test]
    fn test_decode_connack_packets() {
        assert_decode_packet(
            b"\x20\x03\x01\x86\x00",
            Packet::ConnectAck(Box::new(ConnectAck {
                session_present: true,
                reason_code: ConnectAckReason::BadUserNameOrPassword,
                ..ConnectAck::default()
            })),
        );
    }

    #[test]
    fn test_decode_publish_packets() {
        assert_decode_packet(
            b"\x3d\x0E\x00\x05topic\x43\x21\x00data",
            Packet::Publish(Box::new(Publish {
                dup: true,
                retain: true,
                qos: QoS::ExactlyOnce,
                topic: ByteString::from_static("topic"),
                packet_id: Some(packet_id(0x4321)),
                payload: Bytes::from_static(b"data"),
                properties: PublishProperties::default(),
            })),
        );
        assert_decode_packet(
            b"\x30\x0c\x00\x05topic\x00data",
            Packet::Publish(Box::new(Publish::new("topic", Bytes::from_static(b"data"), QoS::AtMostOnce))),
        );
        assert_decode_packet(
            b"\x30\x0e\x00\x05topic\x02\x0b\x01data",
            Packet::Publish(Box::new(Publish {
                properties: PublishProperties {
                    subscription_ids: vec![NonZeroU32::new(1).unwrap()],
                    ..Default::default()
                },
                ..Publish::new("topic", Bytes::from_static(b"data"), QoS::AtMostOnce)
            })),
        );
        assert_decode_packet(b"\x40\x02\x43\x21", Packet::PublishAck(PublishAck::new(packet_id(0x4321))));
    }

    #[test]
    fn test_decode_subscribe_packets() {
        assert_decode_packet(
            b"\x82\x13\x12\x34\x00\x00\x04test\x01\x00\x06filter\x02",
            Packet::Subscribe(Subscribe {
                packet_id: packet_id(0x1234),
                id: None,
                user_properties: Vec::new(),
                topic_filters: vec![
                    (
                        ByteString::from_static("test"),
                        SubscriptionOptions { qos: QoS::AtLeastOnce, ..Default::default() },
                    ),
                    (
                        ByteString::from_static("filter"),
                        SubscriptionOptions { qos: QoS::ExactlyOnce, ..Default::default() },
                    ),
                ],
            }),
        );
        assert_decode_packet(
            b"\x90\x06\x12\x34\x00\x01\x80\x02",
            Packet::SubscribeAck(SubscribeAck {
                packet_id: packet_id(0x1234),
                properties: Vec::new(),
                reason_string: None,
                status: vec![
                    SubscribeAckReason::GrantedQos1,
                    SubscribeAckReason::UnspecifiedError,
                    SubscribeAckReason::GrantedQos2,
                ],
            }),
        );
    }

    #[test]
    fn test_decode_ping_packets() {
        assert_decode_packet(b"\xc0\x00", Packet::PingRequest);
        assert_decode_packet(b"\xd0\x00", Packet::PingResponse);
        assert!(matches!(
            decode_packet(Bytes::from_static(b"\x00"), 0xd0),
            Err(DecodeError::MalformedPacket)
        ));
    }

    #[test]
    fn test_decode_unsupported_packet_types() {
        // PUBREC, UNSUBSCRIBE and AUTH are not part of the client session
        for first_byte in [0x50u8, 0xa2, 0xf0, 0x80] {
            assert!(matches!(
                decode_packet(Bytes::new(), first_byte),
                Err(DecodeError::UnsupportedPacketType(b)) if b == first_byte
            ));
        }
    }

    #[test]
    fn test_round_trip_connect() {
        round_trip(
            Connect {
                clean_start: true,
                keep_alive: 30,
                session_expiry_interval_secs: 120,
                receive_max: NonZeroU16::new(20),
                user_properties: vec![("k".into(), "v".into())],
                username: Some("user".into()),
                password: Some(Bytes::from_static(b"secret")),
                ..Connect::default().client_id("t1")
            }
            .into(),
        );
    }

    #[test]
    fn test_round_trip_publish() {
        round_trip(Publish::new("topic/a", Bytes::from_static(b"hello"), QoS::AtMostOnce).into());
        round_trip(
            Publish {
                packet_id: Some(packet_id(1)),
                ..Publish::new("topic/a", Bytes::from_static(b"hello"), QoS::AtLeastOnce)
            }
            .into(),
        );
        // payload big enough for a two byte remaining length
        round_trip(
            Publish {
                packet_id: Some(packet_id(65535)),
                ..Publish::new("topic/b", Bytes::from(vec![7u8; 300]), QoS::AtLeastOnce)
            }
            .into(),
        );
    }

    #[test]
    fn test_round_trip_subscribe() {
        round_trip(Subscribe::new(packet_id(9), "topic/#", QoS::AtLeastOnce).into());
    }

    #[test]
    fn test_round_trip_disconnect() {
        round_trip(Disconnect::default().into());
        round_trip(
            Disconnect {
                reason_string: Some("bye".into()),
                session_expiry_interval_secs: Some(0),
                ..Disconnect::new(DisconnectReasonCode::ServerShuttingDown)
            }
            .into(),
        );
    }
}
