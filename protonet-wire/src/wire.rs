//! Wire-level primitives.
//!
//! Field header layout:
//!
//! ```text
//! tag = (field_number << 3) | wire_type        encoded as a varint
//!
//! wire_type  0 Varint      base-128 integer, 1..=10 bytes
//!            1 Fixed64     8 bytes little-endian
//!            2 String      varint length, then that many bytes
//!            3 StartGroup  nested fields until EndGroup
//!            4 EndGroup    same field number as its StartGroup
//!            5 Fixed32     4 bytes little-endian
//! ```

use crate::error::ProtoError;
use std::fmt;

/// Maximum encoded length of a 64-bit varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Largest legal field number (2^29 - 1).
pub const MAX_FIELD_NUMBER: u32 = (1 << 29) - 1;

/// How a field's payload is physically encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WireType {
    Varint = 0,
    Fixed64 = 1,
    /// Length-delimited: strings, bytes, sub-messages and packed arrays.
    String = 2,
    StartGroup = 3,
    EndGroup = 4,
    Fixed32 = 5,
}

impl WireType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for WireType {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(WireType::Varint),
            1 => Ok(WireType::Fixed64),
            2 => Ok(WireType::String),
            3 => Ok(WireType::StartGroup),
            4 => Ok(WireType::EndGroup),
            5 => Ok(WireType::Fixed32),
            _ => Err(ProtoError::InvalidWireType(value)),
        }
    }
}

impl fmt::Display for WireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireType::Varint => write!(f, "varint"),
            WireType::Fixed64 => write!(f, "fixed64"),
            WireType::String => write!(f, "string"),
            WireType::StartGroup => write!(f, "start group"),
            WireType::EndGroup => write!(f, "end group"),
            WireType::Fixed32 => write!(f, "fixed32"),
        }
    }
}

/// A decoded field header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldHeader {
    pub field_number: u32,
    pub wire_type: WireType,
}

impl FieldHeader {
    /// Creates a header, validating the field number.
    pub fn new(field_number: u32, wire_type: WireType) -> Result<Self, ProtoError> {
        if field_number == 0 || field_number > MAX_FIELD_NUMBER {
            return Err(ProtoError::InvalidFieldNumber(field_number as u64));
        }
        Ok(Self {
            field_number,
            wire_type,
        })
    }

    /// Returns the combined tag value.
    pub fn tag(&self) -> u32 {
        (self.field_number << 3) | self.wire_type.as_u8() as u32
    }

    /// Splits a raw tag into field number and wire type.
    pub fn from_tag(tag: u64) -> Result<Self, ProtoError> {
        let wire_type = WireType::try_from((tag & 0x07) as u8)?;
        let field_number = tag >> 3;
        if field_number == 0 || field_number > MAX_FIELD_NUMBER as u64 {
            return Err(ProtoError::InvalidFieldNumber(field_number));
        }
        Ok(Self {
            field_number: field_number as u32,
            wire_type,
        })
    }
}

/// Identifies an open sub-item.
///
/// Returned by `start_sub_item`; it must be handed back unchanged to the
/// matching `end_sub_item`, which rejects any token that is not the most
/// recently opened one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "pass the token to end_sub_item"]
pub struct SubItemToken {
    depth: usize,
    start: u64,
}

impl SubItemToken {
    pub(crate) fn new(depth: usize, start: u64) -> Self {
        Self { depth, start }
    }

    /// Nesting depth of the sub-item (1 for a top-level sub-item).
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub(crate) fn start(&self) -> u64 {
        self.start
    }
}

/// Encodes an unsigned 64-bit integer as a varint into the buffer.
/// Returns the number of bytes written.
#[inline]
pub fn encode_varint(mut value: u64, buf: &mut [u8; MAX_VARINT_LEN]) -> usize {
    let mut i = 0;
    while value >= 0x80 {
        buf[i] = (value as u8) | 0x80;
        value >>= 7;
        i += 1;
    }
    buf[i] = value as u8;
    i + 1
}

/// Number of bytes `value` occupies as a varint.
#[inline]
pub const fn varint_len(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    (bits + 6) / 7
}

/// Decodes a varint from the front of `buf`.
///
/// Returns `Ok(None)` if `buf` ends before the varint does, or
/// `Ok(Some((value, consumed)))`.
pub fn decode_varint(buf: &[u8]) -> Result<Option<(u64, usize)>, ProtoError> {
    let mut value = 0u64;
    for (i, &byte) in buf.iter().enumerate() {
        if i == MAX_VARINT_LEN {
            return Err(ProtoError::MalformedVarint { position: 0 });
        }
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= MAX_VARINT_LEN {
        return Err(ProtoError::MalformedVarint { position: 0 });
    }
    Ok(None)
}

/// Zig-zag encodes a signed 32-bit integer to unsigned.
#[inline]
pub const fn zigzag_encode_32(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

/// Zig-zag encodes a signed 64-bit integer to unsigned.
#[inline]
pub const fn zigzag_encode_64(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

/// Zig-zag decodes an unsigned 32-bit integer to signed.
#[inline]
pub const fn zigzag_decode_32(value: u32) -> i32 {
    ((value >> 1) as i32) ^ (-((value & 1) as i32))
}

/// Zig-zag decodes an unsigned 64-bit integer to signed.
#[inline]
pub const fn zigzag_decode_64(value: u64) -> i64 {
    ((value >> 1) as i64) ^ (-((value & 1) as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn varint(value: u64) -> Vec<u8> {
        let mut buf = [0u8; MAX_VARINT_LEN];
        let len = encode_varint(value, &mut buf);
        buf[..len].to_vec()
    }

    #[test]
    fn test_varint_exact_bytes() {
        assert_eq!(varint(0), vec![0x00]);
        assert_eq!(varint(1), vec![0x01]);
        assert_eq!(varint(127), vec![0x7F]);
        assert_eq!(varint(128), vec![0x80, 0x01]);
        assert_eq!(varint(150), vec![0x96, 0x01]);
        assert_eq!(varint(300), vec![0xAC, 0x02]);
        assert_eq!(varint(u64::MAX).len(), MAX_VARINT_LEN);
    }

    #[test]
    fn test_negative_int32_sign_extends_to_ten_bytes() {
        // Twos-complement varints sign-extend through bit 63; this is the
        // standard protobuf encoding for negative int32 values.
        let encoded = varint(-1i32 as i64 as u64);
        assert_eq!(
            encoded,
            vec![0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]
        );
    }

    #[test]
    fn test_varint_len_boundaries() {
        assert_eq!(varint_len(0), 1);
        assert_eq!(varint_len(127), 1);
        assert_eq!(varint_len(128), 2);
        assert_eq!(varint_len(16_383), 2);
        assert_eq!(varint_len(16_384), 3);
        assert_eq!(varint_len(u32::MAX as u64), 5);
        assert_eq!(varint_len(u64::MAX), 10);
    }

    #[test]
    fn test_decode_varint_incomplete_and_malformed() {
        assert_eq!(decode_varint(&[]).unwrap(), None);
        assert_eq!(decode_varint(&[0x80]).unwrap(), None);
        assert_eq!(decode_varint(&[0x96, 0x01, 0xFF]).unwrap(), Some((150, 2)));

        let eleven = [0xFFu8; 11];
        assert!(matches!(
            decode_varint(&eleven),
            Err(ProtoError::MalformedVarint { .. })
        ));
    }

    #[test]
    fn test_zigzag_values() {
        assert_eq!(zigzag_encode_32(0), 0);
        assert_eq!(zigzag_encode_32(-1), 1);
        assert_eq!(zigzag_encode_32(1), 2);
        assert_eq!(zigzag_encode_32(-2), 3);
        assert_eq!(zigzag_encode_32(i32::MAX), u32::MAX - 1);
        assert_eq!(zigzag_encode_32(i32::MIN), u32::MAX);
        assert_eq!(zigzag_encode_64(-1), 1);
        assert_eq!(zigzag_encode_64(i64::MIN), u64::MAX);
        assert_eq!(zigzag_decode_32(u32::MAX), i32::MIN);
        assert_eq!(zigzag_decode_64(3), -2);
    }

    #[test]
    fn test_wire_type_conversion() {
        for raw in 0u8..=5 {
            assert_eq!(WireType::try_from(raw).unwrap().as_u8(), raw);
        }
        assert!(matches!(
            WireType::try_from(6),
            Err(ProtoError::InvalidWireType(6))
        ));
        assert!(matches!(
            WireType::try_from(7),
            Err(ProtoError::InvalidWireType(7))
        ));
    }

    #[test]
    fn test_field_header() {
        let header = FieldHeader::new(1, WireType::Varint).unwrap();
        assert_eq!(header.tag(), 0x08);

        let header = FieldHeader::new(3, WireType::StartGroup).unwrap();
        assert_eq!(header.tag(), 0x1B);
        assert_eq!(FieldHeader::from_tag(0x1B).unwrap(), header);

        assert!(matches!(
            FieldHeader::new(0, WireType::Varint),
            Err(ProtoError::InvalidFieldNumber(0))
        ));
        assert!(FieldHeader::new(MAX_FIELD_NUMBER, WireType::Fixed32).is_ok());
        assert!(FieldHeader::new(MAX_FIELD_NUMBER + 1, WireType::Fixed32).is_err());
        assert!(matches!(
            FieldHeader::from_tag(0x02),
            Err(ProtoError::InvalidFieldNumber(0))
        ));
    }

    proptest! {
        #[test]
        fn prop_varint_roundtrip(value in any::<u64>()) {
            let encoded = varint(value);
            prop_assert_eq!(encoded.len(), varint_len(value));
            prop_assert_eq!(decode_varint(&encoded).unwrap(), Some((value, encoded.len())));
        }

        #[test]
        fn prop_zigzag_roundtrip(a in any::<i32>(), b in any::<i64>()) {
            prop_assert_eq!(zigzag_decode_32(zigzag_encode_32(a)), a);
            prop_assert_eq!(zigzag_decode_64(zigzag_encode_64(b)), b);
        }

        #[test]
        fn prop_zigzag_is_compact_for_small_negatives(value in -64i32..0) {
            let zigzag = varint(zigzag_encode_32(value) as u64);
            let twos = varint(value as i64 as u64);
            prop_assert_eq!(zigzag.len(), 1);
            prop_assert_eq!(twos.len(), MAX_VARINT_LEN);
        }
    }
}
