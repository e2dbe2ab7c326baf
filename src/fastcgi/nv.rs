//! FastCGI name-value pairs.
//!
//! Each pair is `nameLength valueLength name value`. A length below 128 is a
//! single byte; anything larger takes four big-endian bytes with the high bit
//! of the first one set, leaving 31 bits for the length.

use bytes::{BufMut, BytesMut};

use super::FastCgiError;

/// Largest length that fits the one-byte form.
pub const SHORT_LEN_MAX: usize = 0x7f;

/// Largest length representable at all.
pub const LONG_LEN_MAX: usize = 0x7fff_ffff;

const LONG_LEN_FLAG: u32 = 0x8000_0000;

/// Number of bytes `len` occupies on the wire.
pub fn len_size(len: usize) -> usize {
    if len <= SHORT_LEN_MAX { 1 } else { 4 }
}

/// Writes a length in the one- or four-byte form.
///
/// # Panics
///
/// Panics if `len` exceeds [`LONG_LEN_MAX`].
pub fn write_len(len: usize, out: &mut BytesMut) {
    assert!(len <= LONG_LEN_MAX, "name-value length {len} exceeds 31 bits");
    if len <= SHORT_LEN_MAX {
        out.put_u8(len as u8);
    } else {
        out.put_u32(len as u32 | LONG_LEN_FLAG);
    }
}

/// Reads a length from the front of `buf`.
///
/// Returns the length and the number of bytes it took, or `None` if `buf`
/// ends before the length does.
pub fn read_len(buf: &[u8]) -> Option<(usize, usize)> {
    let first = *buf.first()?;
    if first & 0x80 == 0 {
        return Some((first as usize, 1));
    }
    let raw: [u8; 4] = buf.get(..4)?.try_into().ok()?;
    Some(((u32::from_be_bytes(raw) & !LONG_LEN_FLAG) as usize, 4))
}

/// Appends one encoded pair.
pub fn write_pair(name: &[u8], value: &[u8], out: &mut BytesMut) {
    out.reserve(len_size(name.len()) + len_size(value.len()) + name.len() + value.len());
    write_len(name.len(), out);
    write_len(value.len(), out);
    out.put_slice(name);
    out.put_slice(value);
}

/// Reads one pair from the front of `buf`.
///
/// Returns `(name, value)` and the bytes consumed, or `None` if the pair is
/// not complete yet.
pub fn read_pair(buf: &[u8]) -> Option<((&[u8], &[u8]), usize)> {
    let (name_len, a) = read_len(buf)?;
    let (value_len, b) = read_len(&buf[a..])?;
    let start = a + b;
    let end = start.checked_add(name_len)?.checked_add(value_len)?;
    if buf.len() < end {
        return None;
    }
    let name = &buf[start..start + name_len];
    let value = &buf[start + name_len..end];
    Some(((name, value), end))
}

/// Decodes a buffer that must hold only complete pairs.
///
/// # Errors
///
/// [`FastCgiError::MalformedParams`] if trailing bytes do not form a pair.
pub fn decode_all(mut buf: &[u8]) -> Result<Vec<(String, String)>, FastCgiError> {
    let mut pairs = Vec::new();
    while !buf.is_empty() {
        let ((name, value), used) = read_pair(buf).ok_or(FastCgiError::MalformedParams)?;
        pairs.push((
            String::from_utf8_lossy(name).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        ));
        buf = &buf[used..];
    }
    Ok(pairs)
}

/// Encodes a list of pairs back to back.
pub fn encode_all<'a, I>(pairs: I, out: &mut BytesMut)
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    for (name, value) in pairs {
        write_pair(name.as_bytes(), value.as_bytes(), out);
    }
}
