//! Big-endian marshaling helpers
//!
//! Every integer persisted by the index is big-endian so that byte order
//! on the table equals logical order. Marshal functions append to a caller
//! owned buffer; unmarshal functions return the decoded value plus the
//! remaining tail, so parsers chain them with `?`.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder};

/// Append a big-endian u16 to `dst`
pub fn marshal_u16(dst: &mut Vec<u8>, v: u16) {
    let mut buf = [0u8; 2];
    BigEndian::write_u16(&mut buf, v);
    dst.extend_from_slice(&buf);
}

/// Append a big-endian u32 to `dst`
pub fn marshal_u32(dst: &mut Vec<u8>, v: u32) {
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, v);
    dst.extend_from_slice(&buf);
}

/// Append a big-endian u64 to `dst`
pub fn marshal_u64(dst: &mut Vec<u8>, v: u64) {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, v);
    dst.extend_from_slice(&buf);
}

/// Decode a big-endian u16, returning the value and the remaining tail
pub fn unmarshal_u16(src: &[u8]) -> Result<(u16, &[u8])> {
    if src.len() < 2 {
        return Err(Error::corruption(format!(
            "cannot unmarshal u16 from {} bytes; need at least 2",
            src.len()
        )));
    }
    Ok((BigEndian::read_u16(src), &src[2..]))
}

/// Decode a big-endian u32, returning the value and the remaining tail
pub fn unmarshal_u32(src: &[u8]) -> Result<(u32, &[u8])> {
    if src.len() < 4 {
        return Err(Error::corruption(format!(
            "cannot unmarshal u32 from {} bytes; need at least 4",
            src.len()
        )));
    }
    Ok((BigEndian::read_u32(src), &src[4..]))
}

/// Decode a big-endian u64, returning the value and the remaining tail
pub fn unmarshal_u64(src: &[u8]) -> Result<(u64, &[u8])> {
    if src.len() < 8 {
        return Err(Error::corruption(format!(
            "cannot unmarshal u64 from {} bytes; need at least 8",
            src.len()
        )));
    }
    Ok((BigEndian::read_u64(src), &src[8..]))
}

/// Maximum length of a length-prefixed byte slice
pub const MAX_BYTES_LEN: usize = u16::MAX as usize;

/// Append a length-prefixed byte slice (u16 length) to `dst`
///
/// Used for metric-name components. Lengths above [`MAX_BYTES_LEN`] are a
/// caller bug; the limit is enforced at metric-name construction.
pub fn marshal_bytes(dst: &mut Vec<u8>, b: &[u8]) {
    debug_assert!(b.len() <= MAX_BYTES_LEN);
    marshal_u16(dst, b.len() as u16);
    dst.extend_from_slice(b);
}

/// Decode a length-prefixed byte slice, returning the slice and the tail
pub fn unmarshal_bytes(src: &[u8]) -> Result<(&[u8], &[u8])> {
    let (len, tail) = unmarshal_u16(src)?;
    let len = len as usize;
    if tail.len() < len {
        return Err(Error::corruption(format!(
            "cannot unmarshal {} prefixed bytes from {} bytes",
            len,
            tail.len()
        )));
    }
    Ok((&tail[..len], &tail[len..]))
}
