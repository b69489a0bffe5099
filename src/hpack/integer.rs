//! Prefix-coded integers, RFC 7541 §5.1.

use super::HpackError;
use bytes::BufMut;

/// Decoded values are capped here; RFC 7541 only demands that
/// "excessively large" encodings fail, and nothing on a connection needs
/// more than 32 bits.
const VALUE_LIMIT: u64 = u32::MAX as u64;

/// Longest acceptable encoding: prefix octet plus five continuation octets
/// covers every value up to the limit.
const OCTET_LIMIT: usize = 6;

/// Encodes `value` with an N-bit prefix, merging the prefix octet into
/// `pattern` (the representation's leading bits).
pub(super) fn encode(value: usize, prefix_bits: u8, pattern: u8, out: &mut impl BufMut) {
    debug_assert!((1..=8).contains(&prefix_bits));
    let mask = if prefix_bits == 8 {
        0xff
    } else {
        (1_u8 << prefix_bits) - 1
    };
    if value < usize::from(mask) {
        out.put_u8(pattern | value as u8);
        return;
    }
    out.put_u8(pattern | mask);
    let mut rest = value - usize::from(mask);
    while rest >= 128 {
        out.put_u8((rest & 0x7f) as u8 | 0x80);
        rest >>= 7;
    }
    out.put_u8(rest as u8);
}

/// Decodes an N-bit-prefix integer from the front of `buf`, returning the
/// value and the number of octets consumed.
pub(super) fn decode(buf: &[u8], prefix_bits: u8) -> Result<(usize, usize), HpackError> {
    debug_assert!((1..=8).contains(&prefix_bits));
    let mask = if prefix_bits == 8 {
        0xff
    } else {
        (1_u8 << prefix_bits) - 1
    };
    let first = *buf.first().ok_or(HpackError::IntegerTruncated)?;
    let mut value = u64::from(first & mask);
    if value < u64::from(mask) {
        return Ok((value as usize, 1));
    }

    let mut shift = 0_u32;
    let mut consumed = 1;
    for &octet in &buf[1..] {
        consumed += 1;
        if consumed > OCTET_LIMIT {
            return Err(HpackError::IntegerOverflow);
        }
        value += u64::from(octet & 0x7f) << shift;
        if value > VALUE_LIMIT {
            return Err(HpackError::IntegerOverflow);
        }
        shift += 7;
        if octet & 0x80 == 0 {
            return Ok((value as usize, consumed));
        }
    }
    Err(HpackError::IntegerTruncated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn roundtrip(value: usize, prefix_bits: u8) -> usize {
        let mut buf = BytesMut::new();
        encode(value, prefix_bits, 0, &mut buf);
        assert!(buf.len() <= OCTET_LIMIT);
        let (decoded, consumed) = decode(&buf, prefix_bits).unwrap();
        assert_eq!(consumed, buf.len());
        decoded
    }

    #[test]
    fn rfc_examples() {
        // https://httpwg.org/specs/rfc7541.html#integer.representation.examples
        let mut buf = BytesMut::new();
        encode(10, 5, 0, &mut buf);
        assert_eq!(&buf[..], &[0b0000_1010]);

        buf.clear();
        encode(1337, 5, 0, &mut buf);
        assert_eq!(&buf[..], &[0b0001_1111, 0b1001_1010, 0b0000_1010]);

        buf.clear();
        encode(42, 8, 0, &mut buf);
        assert_eq!(&buf[..], &[0b0010_1010]);
    }

    #[test]
    fn boundaries_roundtrip() {
        for prefix_bits in 1..=8 {
            let mask = (1_u32 << prefix_bits) as usize - 1;
            for value in [0, 1, mask - 1, mask, mask + 1, 127, 128, 16_383, u32::MAX as usize] {
                assert_eq!(roundtrip(value, prefix_bits), value);
            }
        }
    }

    #[test]
    fn pattern_bits_survive() {
        let mut buf = BytesMut::new();
        encode(2, 7, 0x80, &mut buf);
        assert_eq!(&buf[..], &[0x82]);
    }

    #[test]
    fn overflow_is_rejected() {
        // seven continuation octets, far past any 32-bit value
        let buf = [0xff, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x01];
        assert_eq!(decode(&buf, 8), Err(HpackError::IntegerOverflow));
    }

    #[test]
    fn truncation_is_rejected() {
        assert_eq!(decode(&[], 5), Err(HpackError::IntegerTruncated));
        assert_eq!(decode(&[0x1f, 0x80], 5), Err(HpackError::IntegerTruncated));
    }
}
