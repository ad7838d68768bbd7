use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::decode::decode_packet;
use crate::encode::EncodeBody;
use crate::error::{DecodeError, EncodeError};
use crate::packet::Packet;
use crate::types::{FixedHeader, MAX_PACKET_SIZE};
use crate::utils::{decode_variable_length, var_int_len};

/// MQTT v5 codec.
///
/// Size limits count the whole control packet (fixed header included), `0` means unlimited.
#[derive(Debug, Clone)]
pub struct Codec {
    state: DecodeState,
    max_in_size: u32,
    max_out_size: u32,
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    FrameHeader,
    Frame(FixedHeader),
}

/// One complete frame taken off the input buffer.
///
/// The frame bytes are consumed even when the body fails to parse, so the stream stays aligned
/// and the next frame can still be read.
#[derive(Debug)]
pub struct Frame {
    pub packet: Result<Packet, DecodeError>,
    /// remaining length of the frame
    pub size: u32,
}

impl Codec {
    /// Create `Codec` instance
    pub fn new(max_in_size: u32, max_out_size: u32) -> Self {
        Codec { state: DecodeState::FrameHeader, max_in_size, max_out_size }
    }

    #[inline]
    pub fn max_inbound_size(&self) -> u32 {
        self.max_in_size
    }

    #[inline]
    pub fn max_outbound_size(&self) -> u32 {
        self.max_out_size
    }

    /// Set max inbound packet size.
    pub fn set_max_inbound_size(&mut self, size: u32) {
        self.max_in_size = size;
    }

    /// Set max outbound packet size, usually the Maximum Packet Size announced by the peer.
    pub fn set_max_outbound_size(&mut self, size: u32) {
        self.max_out_size = size;
    }

    /// Reads the next frame.
    ///
    /// `Err` is returned only for framing failures (bad remaining length, frame over the
    /// inbound limit), after which the input can no longer be trusted.
    pub fn decode_frame(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, DecodeError> {
        loop {
            match self.state {
                DecodeState::FrameHeader => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    let first_byte = src[0];
                    let (remaining_length, consumed) = match decode_variable_length(&src[1..])? {
                        Some(res) => res,
                        None => return Ok(None),
                    };
                    let packet_size = 1 + consumed as u64 + u64::from(remaining_length);
                    if self.max_in_size != 0 && u64::from(self.max_in_size) < packet_size {
                        log::debug!(
                            "MaxSizeExceeded max-size: {}, packet size: {}",
                            self.max_in_size,
                            packet_size
                        );
                        return Err(DecodeError::MaxSizeExceeded {
                            max: self.max_in_size,
                            remaining: remaining_length,
                        });
                    }
                    src.advance(consumed + 1);
                    self.state = DecodeState::Frame(FixedHeader { first_byte, remaining_length });
                }
                DecodeState::Frame(fixed) => {
                    let remaining_length = fixed.remaining_length as usize;
                    if src.len() < remaining_length {
                        src.reserve(remaining_length - src.len());
                        return Ok(None);
                    }
                    let packet_buf = src.split_to(remaining_length).freeze();
                    self.state = DecodeState::FrameHeader;
                    // 1 fixed header byte + up to 4 bytes of remaining length
                    src.reserve(5);
                    return Ok(Some(Frame {
                        packet: decode_packet(packet_buf, fixed.first_byte),
                        size: fixed.remaining_length,
                    }));
                }
            }
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl Decoder for Codec {
    type Item = (Packet, u32);
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, DecodeError> {
        match self.decode_frame(src)? {
            Some(frame) => Ok(Some((frame.packet?, frame.size))),
            None => Ok(None),
        }
    }
}

impl Encoder<Packet> for Codec {
    type Error = EncodeError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), EncodeError> {
        let max_size = if self.max_out_size != 0 { self.max_out_size } else { MAX_PACKET_SIZE };
        let content_size = item.encoded_size();
        let packet_size = 1 + var_int_len(content_size) + content_size;
        if packet_size > max_size as usize {
            return Err(EncodeError::OverMaxPacketSize(packet_size));
        }
        dst.reserve(packet_size);
        let start = dst.len();
        if let Err(e) = item.encode(dst) {
            dst.truncate(start);
            return Err(e);
        }
        Ok(())
    }
}
