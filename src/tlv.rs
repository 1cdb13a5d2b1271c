//! NDEF TLV envelope (spec.md §4.H). NDEF message bytes themselves are
//! treated as an opaque byte container here — this module only wraps and
//! unwraps the tag-level TLV frame around them.

use crate::error::ErrorKind;

pub const TLV_TYPE_NDEF: u8 = 0x03;
pub const TLV_TERMINATOR: u8 = 0xFE;
const TLV_PADDING: u8 = 0x00;

/// `TLV{type, length, value, 0xFE}`. `length` is one byte when `value.len() <
/// 0xFF`, else `0xFF` followed by a 2-byte big-endian length.
pub fn encode(value: &[u8], tlv_type: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 6);
    out.push(tlv_type);
    if value.len() < 0xFF {
        out.push(value.len() as u8);
    } else {
        out.push(0xFF);
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    }
    out.extend_from_slice(value);
    out.push(TLV_TERMINATOR);
    out
}

/// Decodes the first non-padding TLV entry, returning `(value, type)`.
/// Skips leading `0x00` padding bytes; stops at `0xFE`; all length fields
/// are bounds-checked so malformed input fails rather than panics.
pub fn decode(buffer: &[u8]) -> Result<(Vec<u8>, u8), ErrorKind> {
    let mut i = 0;
    while i < buffer.len() && buffer[i] == TLV_PADDING {
        i += 1;
    }
    if i >= buffer.len() {
        return Err(ErrorKind::InvalidData("no TLV entry found".into()));
    }
    if buffer[i] == TLV_TERMINATOR {
        return Err(ErrorKind::InvalidData("TLV terminator with no preceding entry".into()));
    }
    let tlv_type = buffer[i];
    i += 1;
    if i >= buffer.len() {
        return Err(ErrorKind::InvalidData("truncated TLV length".into()));
    }
    let (len, value_start) = if buffer[i] == 0xFF {
        if i + 2 >= buffer.len() {
            return Err(ErrorKind::InvalidData("truncated 3-byte TLV length".into()));
        }
        let len = u16::from_be_bytes([buffer[i + 1], buffer[i + 2]]) as usize;
        (len, i + 3)
    } else {
        (buffer[i] as usize, i + 1)
    };
    let value_end = value_start
        .checked_add(len)
        .ok_or_else(|| ErrorKind::InvalidData("TLV length overflow".into()))?;
    if value_end > buffer.len() {
        return Err(ErrorKind::InvalidData("TLV value runs past end of buffer".into()));
    }
    Ok((buffer[value_start..value_end].to_vec(), tlv_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_short_value() {
        let value = b"example.com".to_vec();
        let encoded = encode(&value, TLV_TYPE_NDEF);
        assert_eq!(decode(&encoded).unwrap(), (value, TLV_TYPE_NDEF));
    }

    #[test]
    fn round_trip_long_value_uses_three_byte_length() {
        let value = vec![0xAB; 400];
        let encoded = encode(&value, 0xFD);
        assert_eq!(encoded[1], 0xFF);
        assert_eq!(decode(&encoded).unwrap(), (value, 0xFD));
    }

    #[test]
    fn round_trip_empty_value() {
        let value: Vec<u8> = Vec::new();
        let encoded = encode(&value, TLV_TYPE_NDEF);
        assert_eq!(decode(&encoded).unwrap(), (value, TLV_TYPE_NDEF));
    }

    #[test]
    fn decode_skips_leading_padding() {
        let mut buffer = vec![0x00, 0x00, 0x00];
        buffer.extend(encode(b"hi", TLV_TYPE_NDEF));
        assert_eq!(decode(&buffer).unwrap(), (b"hi".to_vec(), TLV_TYPE_NDEF));
    }

    #[test]
    fn decode_rejects_truncated_buffer() {
        let encoded = encode(b"hello world", TLV_TYPE_NDEF);
        let truncated = &encoded[..encoded.len() - 3];
        assert!(decode(truncated).is_err());
    }

    #[test]
    fn decode_rejects_all_padding() {
        let buffer = vec![0x00; 8];
        assert!(decode(&buffer).is_err());
    }

    #[test]
    fn decode_never_panics_on_garbage() {
        for seed in 0u8..=255 {
            let buffer = vec![seed, seed.wrapping_mul(3), 0xFF, 0xFF];
            let _ = decode(&buffer);
        }
    }
}
