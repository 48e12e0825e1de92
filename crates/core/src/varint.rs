//! Varint encoding and decoding functions.
//!
//! Base-128 varints, least-significant chunk first: each byte carries seven
//! value bits, and a set high bit means more bytes follow. Signed values go
//! through the usual zigzag mapping first so that small negative numbers
//! (pre-epoch timestamps) stay short.

use crate::buf::{DecodeError, Reader};

#[inline]
pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        if value < 0x80 {
            out.push(value as u8);
            break;
        } else {
            out.push(((value & 0x7f) | 0x80) as u8);
            value >>= 7;
        }
    }
}

#[inline]
pub fn decode_varint(reader: &mut Reader<'_>) -> Result<u64, DecodeError> {
    let mut result: u64 = 0;
    let mut shift = 0;
    loop {
        if shift >= 64 {
            return Err(DecodeError::VarintOverflow);
        }
        let byte = reader.get_u8()?;
        let bits = (byte & 0x7f) as u64;
        if shift == 63 && bits > 1 {
            return Err(DecodeError::VarintOverflow);
        }
        result |= bits << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}

#[inline]
pub fn encode_varint_signed(value: i64, out: &mut Vec<u8>) {
    encode_varint(zigzag(value), out);
}

#[inline]
pub fn decode_varint_signed(reader: &mut Reader<'_>) -> Result<i64, DecodeError> {
    decode_varint(reader).map(unzigzag)
}

#[inline]
fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

#[inline]
fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn varint_roundtrip(val in any::<u64>()) {
            let mut buf = Vec::new();
            encode_varint(val, &mut buf);
            prop_assert_eq!(val, decode_varint(&mut Reader::new(&buf)).unwrap());
        }

        #[test]
        fn signed_roundtrip(val in any::<i64>()) {
            let mut buf = Vec::new();
            encode_varint_signed(val, &mut buf);
            prop_assert_eq!(val, decode_varint_signed(&mut Reader::new(&buf)).unwrap());
        }
    }

    #[test]
    fn single_byte_values() {
        for val in [0u64, 1, 0x7f] {
            let mut buf = Vec::new();
            encode_varint(val, &mut buf);
            assert_eq!(buf.len(), 1);
        }
    }

    #[test]
    fn small_negatives_stay_short() {
        let mut buf = Vec::new();
        encode_varint_signed(-1, &mut buf);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn rejects_overlong_encodings() {
        // Eleven continuation bytes exceed 64 bits of payload.
        let buf = [0xff; 11];
        assert_eq!(
            decode_varint(&mut Reader::new(&buf)),
            Err(DecodeError::VarintOverflow)
        );
    }
}
