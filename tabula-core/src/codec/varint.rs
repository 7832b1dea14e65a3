//! LEB128 varints and zig-zag mapping

use bytes::BufMut;

use crate::error::{Error, Result};

/// Append an unsigned LEB128 varint
pub fn put_uvarint(buf: &mut impl BufMut, mut v: u64) {
    while v >= 0x80 {
        buf.put_u8((v as u8) | 0x80);
        v >>= 7;
    }
    buf.put_u8(v as u8);
}

/// Read an unsigned LEB128 varint, advancing `input`
pub fn get_uvarint(input: &mut &[u8]) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        let (&byte, rest) = input
            .split_first()
            .ok_or_else(|| Error::corrupt("truncated varint"))?;
        *input = rest;
        if shift >= 64 {
            return Err(Error::corrupt("varint overflow"));
        }
        result |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}

/// Zig-zag map a signed integer so small magnitudes encode short
pub fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

/// Inverse of [`zigzag`]
pub fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

/// Append a zig-zag varint
pub fn put_ivarint(buf: &mut impl BufMut, v: i64) {
    put_uvarint(buf, zigzag(v));
}

/// Read a zig-zag varint
pub fn get_ivarint(input: &mut &[u8]) -> Result<i64> {
    get_uvarint(input).map(unzigzag)
}

/// Split `len` bytes off the front of `input`
pub fn take<'a>(input: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if input.len() < len {
        return Err(Error::corrupt(format!(
            "need {} bytes, {} remaining",
            len,
            input.len()
        )));
    }
    let (head, rest) = input.split_at(len);
    *input = rest;
    Ok(head)
}

/// Read a length-prefixed byte string
pub fn get_len_prefixed<'a>(input: &mut &'a [u8]) -> Result<&'a [u8]> {
    let len = get_uvarint(input)? as usize;
    take(input, len)
}

/// Append a length-prefixed byte string
pub fn put_len_prefixed(buf: &mut impl BufMut, data: &[u8]) {
    put_uvarint(buf, data.len() as u64);
    buf.put_slice(data);
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_zigzag_small_values() {
        assert_eq!(zigzag(0), 0);
        assert_eq!(zigzag(-1), 1);
        assert_eq!(zigzag(1), 2);
        assert_eq!(unzigzag(zigzag(i64::MIN)), i64::MIN);
    }

    #[test]
    fn test_truncated_varint_is_corrupt() {
        let mut input: &[u8] = &[0x80, 0x80];
        assert!(matches!(
            get_uvarint(&mut input),
            Err(Error::CorruptBlock { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_ivarint_roundtrip(values in prop::collection::vec(any::<i64>(), 0..64)) {
            let mut buf = Vec::new();
            for &v in &values {
                put_ivarint(&mut buf, v);
            }
            let mut input = &buf[..];
            for &v in &values {
                prop_assert_eq!(get_ivarint(&mut input).unwrap(), v);
            }
            prop_assert!(input.is_empty());
        }
    }
}
