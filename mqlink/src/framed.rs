use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

use mqlink_codec::error::{DecodeError, EncodeError};
use mqlink_codec::{Codec, Packet};

pub(crate) type Reader = FramedRead<Box<dyn AsyncRead + Send + Unpin>, ClientCodec>;
pub(crate) type Writer = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, ClientCodec>;

/// Yields malformed frame bodies as items so the read stream survives them.
///
/// Only framing failures end the stream.
#[derive(Debug, Clone, Default)]
pub(crate) struct ClientCodec(Codec);

impl ClientCodec {
    pub(crate) fn new(max_in_size: u32, max_out_size: u32) -> Self {
        ClientCodec(Codec::new(max_in_size, max_out_size))
    }

    #[inline]
    pub(crate) fn set_max_outbound_size(&mut self, size: u32) {
        self.0.set_max_outbound_size(size)
    }
}

impl Decoder for ClientCodec {
    type Item = Result<Packet, DecodeError>;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, DecodeError> {
        Ok(self.0.decode_frame(src)?.map(|frame| frame.packet))
    }
}

impl Encoder<Packet> for ClientCodec {
    type Error = EncodeError;

    #[inline]
    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), EncodeError> {
        self.0.encode(item, dst)
    }
}
