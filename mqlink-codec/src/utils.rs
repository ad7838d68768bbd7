use std::{io::Cursor, num::NonZeroU16, num::NonZeroU32};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytestring::ByteString;

use crate::error::{DecodeError, EncodeError};
use crate::types::MAX_REMAINING_LENGTH;

macro_rules! ensure {
    ($cond:expr, $e:expr) => {
        if !($cond) {
            return Err($e);
        }
    };
}

/// Declares a `#[repr(u8)]` enum together with its checked `u8` conversions.
macro_rules! prim_enum {
    (
        $( #[$enum_attr:meta] )*
        pub enum $name:ident {
            $(
                $( #[$enum_item_attr:meta] )*
                $var:ident=$val:expr
            ),+
        }) => {
        $( #[$enum_attr] )*
        #[repr(u8)]
        #[derive(Debug, Eq, PartialEq, Copy, Clone)]
        pub enum $name {
            $(
                $( #[$enum_item_attr] )*
                $var = $val
            ),+
        }
        impl std::convert::TryFrom<u8> for $name {
            type Error = $crate::error::DecodeError;
            fn try_from(v: u8) -> Result<Self, Self::Error> {
                match v {
                    $($val => Ok($name::$var)),+
                    ,_ => Err($crate::error::DecodeError::MalformedPacket)
                }
            }
        }
        impl From<$name> for u8 {
            #[inline]
            fn from(v: $name) -> Self {
                v as u8
            }
        }
    };
}

pub(crate) trait Decode: Sized {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError>;
}

pub(crate) trait Property {
    fn read_value(&mut self, src: &mut Bytes) -> Result<(), DecodeError>;
}

impl<T: Decode> Property for Option<T> {
    fn read_value(&mut self, src: &mut Bytes) -> Result<(), DecodeError> {
        ensure!(self.is_none(), DecodeError::MalformedPacket); // property is set twice while not allowed
        *self = Some(T::decode(src)?);
        Ok(())
    }
}

impl Decode for bool {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure!(src.has_remaining(), DecodeError::InvalidLength);
        match src.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(DecodeError::MalformedPacket),
        }
    }
}

impl Decode for u8 {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure!(src.has_remaining(), DecodeError::InvalidLength);
        Ok(src.get_u8())
    }
}

impl Decode for u16 {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure!(src.remaining() >= 2, DecodeError::InvalidLength);
        Ok(src.get_u16())
    }
}

impl Decode for u32 {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure!(src.remaining() >= 4, DecodeError::InvalidLength);
        Ok(src.get_u32())
    }
}

impl Decode for NonZeroU16 {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        NonZeroU16::new(u16::decode(src)?).ok_or(DecodeError::MalformedPacket)
    }
}

impl Decode for NonZeroU32 {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        NonZeroU32::new(u32::decode(src)?).ok_or(DecodeError::MalformedPacket)
    }
}

impl Decode for Bytes {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let len = u16::decode(src)? as usize;
        ensure!(src.remaining() >= len, DecodeError::InvalidLength);
        Ok(src.split_to(len))
    }
}

impl Decode for ByteString {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ByteString::try_from(Bytes::decode(src)?).map_err(|_| DecodeError::Utf8Error)
    }
}

impl Decode for (ByteString, ByteString) {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let key = ByteString::decode(src)?;
        let val = ByteString::decode(src)?;
        Ok((key, val))
    }
}

/// Splits the property block (length prefix included) off the front of `src`.
pub(crate) fn take_properties(src: &mut Bytes) -> Result<Bytes, DecodeError> {
    let prop_len = decode_variable_length_cursor(src)? as usize;
    ensure!(src.remaining() >= prop_len, DecodeError::InvalidLength);
    Ok(src.split_to(prop_len))
}

/// Returns `Ok(None)` while the length field is still incomplete.
pub(crate) fn decode_variable_length(src: &[u8]) -> Result<Option<(u32, usize)>, DecodeError> {
    let mut cur = Cursor::new(src);
    match decode_variable_length_cursor(&mut cur) {
        Ok(len) => Ok(Some((len, cur.position() as usize))),
        Err(DecodeError::MalformedPacket) => Ok(None),
        Err(e) => Err(e),
    }
}

pub(crate) fn decode_variable_length_cursor<B: Buf>(src: &mut B) -> Result<u32, DecodeError> {
    let mut shift: u32 = 0;
    let mut len: u32 = 0;
    loop {
        ensure!(src.has_remaining(), DecodeError::MalformedPacket);
        let val = src.get_u8();
        len += u32::from(val & 0b0111_1111) << shift;
        if val & 0b1000_0000 == 0 {
            return Ok(len);
        }
        ensure!(shift < 21, DecodeError::InvalidLength);
        shift += 7;
    }
}

pub(crate) fn write_variable_length(len: u32, dst: &mut BytesMut) -> Result<(), EncodeError> {
    ensure!(len <= MAX_REMAINING_LENGTH, EncodeError::InvalidLength);
    let mut rest = len;
    loop {
        let mut byte = (rest & 0b0111_1111) as u8;
        rest >>= 7;
        if rest > 0 {
            byte |= 0b1000_0000;
        }
        dst.put_u8(byte);
        if rest == 0 {
            return Ok(());
        }
    }
}

/// Number of bytes `write_variable_length` emits for `val`
#[inline]
pub(crate) fn var_int_len(val: usize) -> usize {
    match val {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

pub(crate) trait Encode {
    fn encoded_size(&self) -> usize;

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError>;
}

impl Encode for bool {
    fn encoded_size(&self) -> usize {
        1
    }
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(u8::from(*self));
        Ok(())
    }
}

impl Encode for u16 {
    fn encoded_size(&self) -> usize {
        2
    }
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u16(*self);
        Ok(())
    }
}

impl Encode for NonZeroU16 {
    fn encoded_size(&self) -> usize {
        2
    }
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.get().encode(buf)
    }
}

impl Encode for u32 {
    fn encoded_size(&self) -> usize {
        4
    }
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u32(*self);
        Ok(())
    }
}

impl Encode for NonZeroU32 {
    fn encoded_size(&self) -> usize {
        4
    }
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.get().encode(buf)
    }
}

impl Encode for [u8] {
    fn encoded_size(&self) -> usize {
        2 + self.len()
    }
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let len = u16::try_from(self.len()).map_err(|_| EncodeError::InvalidLength)?;
        buf.put_u16(len);
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl Encode for Bytes {
    fn encoded_size(&self) -> usize {
        self.as_ref().encoded_size()
    }
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.as_ref().encode(buf)
    }
}

impl Encode for ByteString {
    fn encoded_size(&self) -> usize {
        self.as_bytes().encoded_size()
    }
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.as_bytes().encode(buf)
    }
}

impl Encode for (ByteString, ByteString) {
    fn encoded_size(&self) -> usize {
        self.0.encoded_size() + self.1.encoded_size()
    }
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.0.encode(buf)?;
        self.1.encode(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(b"\x00", 0, 1; "zero")]
    #[test_case(b"\x7f", 127, 1; "one_byte_max")]
    #[test_case(b"\x7f\x7f", 127, 1; "trailing_data_ignored")]
    #[test_case(b"\x80\x01", 128, 2; "two_byte_min")]
    #[test_case(b"\xff\x7f", 16_383, 2; "two_byte_max")]
    #[test_case(b"\x80\x80\x01", 16_384, 3; "three_byte_min")]
    #[test_case(b"\xff\xff\x7f", 2_097_151, 3; "three_byte_max")]
    #[test_case(b"\x80\x80\x80\x01", 2_097_152, 4; "four_byte_min")]
    #[test_case(b"\xff\xff\xff\x7f", 268_435_455, 4; "four_byte_max")]
    fn test_decode_variable_length(input: &'static [u8], len: u32, consumed: usize) {
        assert_eq!(decode_variable_length(input).unwrap(), Some((len, consumed)));
    }

    #[test]
    fn test_decode_variable_length_incomplete() {
        assert_eq!(decode_variable_length(b"").unwrap(), None);
        assert_eq!(decode_variable_length(b"\xff\xff\xff").unwrap(), None);
        assert!(matches!(
            decode_variable_length(b"\xff\xff\xff\xff\xff\xff"),
            Err(DecodeError::InvalidLength)
        ));
    }

    #[test_case(123, b"\x7b"; "one_byte")]
    #[test_case(129, b"\x81\x01"; "two_bytes")]
    #[test_case(16_383, b"\xff\x7f"; "two_byte_max")]
    #[test_case(2_097_151, b"\xff\xff\x7f"; "three_byte_max")]
    #[test_case(268_435_455, b"\xff\xff\xff\x7f"; "four_byte_max")]
    fn test_encode_variable_length(len: u32, expected: &'static [u8]) {
        let mut v = BytesMut::new();
        write_variable_length(len, &mut v).unwrap();
        assert_eq!(&v[..], expected);
        assert_eq!(var_int_len(len as usize), expected.len());
    }

    #[test]
    fn test_encode_variable_length_too_big() {
        let mut v = BytesMut::new();
        assert!(matches!(
            write_variable_length(MAX_REMAINING_LENGTH + 1, &mut v),
            Err(EncodeError::InvalidLength)
        ));
        assert!(v.is_empty());
    }

    #[test]
    fn test_property_set_twice() {
        let mut src = Bytes::from_static(b"\x00\x00\x00\x01\x00\x00\x00\x02");
        let mut prop: Option<u32> = None;
        prop.read_value(&mut src).unwrap();
        assert!(matches!(prop.read_value(&mut src), Err(DecodeError::MalformedPacket)));
    }
}
