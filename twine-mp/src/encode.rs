//! Minimal-length encoders and their size functions.

/// Encoded size of an unsigned integer.
pub fn sizeof_uint(v: u64) -> usize {
    if v < 0x80 {
        1
    } else if v <= u64::from(u8::MAX) {
        2
    } else if v <= u64::from(u16::MAX) {
        3
    } else if v <= u64::from(u32::MAX) {
        5
    } else {
        9
    }
}

/// Append an unsigned integer.
pub fn write_uint(buf: &mut Vec<u8>, v: u64) {
    if v < 0x80 {
        buf.push(v as u8);
    } else if v <= u64::from(u8::MAX) {
        buf.push(0xcc);
        buf.push(v as u8);
    } else if v <= u64::from(u16::MAX) {
        buf.push(0xcd);
        buf.extend_from_slice(&(v as u16).to_be_bytes());
    } else if v <= u64::from(u32::MAX) {
        buf.push(0xce);
        buf.extend_from_slice(&(v as u32).to_be_bytes());
    } else {
        buf.push(0xcf);
        buf.extend_from_slice(&v.to_be_bytes());
    }
}

/// Encoded size of a negative integer. Non-negative values take the
/// unsigned encoding; callers with mixed signs should branch on the sign.
pub fn sizeof_int(v: i64) -> usize {
    if v >= 0 {
        return sizeof_uint(v as u64);
    }
    if v >= -32 {
        1
    } else if v >= i64::from(i8::MIN) {
        2
    } else if v >= i64::from(i16::MIN) {
        3
    } else if v >= i64::from(i32::MIN) {
        5
    } else {
        9
    }
}

/// Append a signed integer; non-negative values use the unsigned family.
pub fn write_int(buf: &mut Vec<u8>, v: i64) {
    if v >= 0 {
        return write_uint(buf, v as u64);
    }
    if v >= -32 {
        buf.push(v as u8);
    } else if v >= i64::from(i8::MIN) {
        buf.push(0xd0);
        buf.push(v as u8);
    } else if v >= i64::from(i16::MIN) {
        buf.push(0xd1);
        buf.extend_from_slice(&(v as i16).to_be_bytes());
    } else if v >= i64::from(i32::MIN) {
        buf.push(0xd2);
        buf.extend_from_slice(&(v as i32).to_be_bytes());
    } else {
        buf.push(0xd3);
        buf.extend_from_slice(&v.to_be_bytes());
    }
}

/// Encoded size of a 32-bit float.
pub fn sizeof_float(_v: f32) -> usize {
    5
}

/// Append a 32-bit float.
pub fn write_float(buf: &mut Vec<u8>, v: f32) {
    buf.push(0xca);
    buf.extend_from_slice(&v.to_bits().to_be_bytes());
}

/// Encoded size of a 64-bit float.
pub fn sizeof_double(_v: f64) -> usize {
    9
}

/// Append a 64-bit float.
pub fn write_double(buf: &mut Vec<u8>, v: f64) {
    buf.push(0xcb);
    buf.extend_from_slice(&v.to_bits().to_be_bytes());
}

/// Encoded size of a string of `len` bytes, header included.
pub fn sizeof_str(len: usize) -> usize {
    let header = if len < 32 {
        1
    } else if len <= usize::from(u8::MAX) {
        2
    } else if len <= usize::from(u16::MAX) {
        3
    } else {
        5
    };
    header + len
}

/// Append only the header of a string of `len` bytes; the caller
/// appends the bytes itself (splice-style scatter writes).
pub fn write_str_header(buf: &mut Vec<u8>, len: usize) {
    if len < 32 {
        buf.push(0xa0 | len as u8);
    } else if len <= usize::from(u8::MAX) {
        buf.push(0xd9);
        buf.push(len as u8);
    } else if len <= usize::from(u16::MAX) {
        buf.push(0xda);
        buf.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        buf.push(0xdb);
        buf.extend_from_slice(&(len as u32).to_be_bytes());
    }
}

/// Append a string value.
pub fn write_str(buf: &mut Vec<u8>, s: &[u8]) {
    write_str_header(buf, s.len());
    buf.extend_from_slice(s);
}

/// Encoded size of an array header for `n` elements.
pub fn sizeof_array(n: u32) -> usize {
    if n < 16 {
        1
    } else if n <= u32::from(u16::MAX) {
        3
    } else {
        5
    }
}

/// Append an array header.
pub fn write_array(buf: &mut Vec<u8>, n: u32) {
    if n < 16 {
        buf.push(0x90 | n as u8);
    } else if n <= u32::from(u16::MAX) {
        buf.push(0xdc);
        buf.extend_from_slice(&(n as u16).to_be_bytes());
    } else {
        buf.push(0xdd);
        buf.extend_from_slice(&n.to_be_bytes());
    }
}

/// Encoded size of a map header for `n` pairs.
pub fn sizeof_map(n: u32) -> usize {
    if n < 16 {
        1
    } else if n <= u32::from(u16::MAX) {
        3
    } else {
        5
    }
}

/// Append a map header.
pub fn write_map(buf: &mut Vec<u8>, n: u32) {
    if n < 16 {
        buf.push(0x80 | n as u8);
    } else if n <= u32::from(u16::MAX) {
        buf.push(0xde);
        buf.extend_from_slice(&(n as u16).to_be_bytes());
    } else {
        buf.push(0xdf);
        buf.extend_from_slice(&n.to_be_bytes());
    }
}

/// Encoded size of an extension value with a `len`-byte payload.
pub fn sizeof_ext(len: usize) -> usize {
    match len {
        1 | 2 | 4 | 8 | 16 => 2 + len,
        _ if len <= usize::from(u8::MAX) => 3 + len,
        _ if len <= usize::from(u16::MAX) => 4 + len,
        _ => 6 + len,
    }
}

/// Append an extension value.
pub fn write_ext(buf: &mut Vec<u8>, ext_type: i8, payload: &[u8]) {
    let len = payload.len();
    match len {
        1 => buf.push(0xd4),
        2 => buf.push(0xd5),
        4 => buf.push(0xd6),
        8 => buf.push(0xd7),
        16 => buf.push(0xd8),
        _ if len <= usize::from(u8::MAX) => {
            buf.push(0xc7);
            buf.push(len as u8);
        }
        _ if len <= usize::from(u16::MAX) => {
            buf.push(0xc8);
            buf.extend_from_slice(&(len as u16).to_be_bytes());
        }
        _ => {
            buf.push(0xc9);
            buf.extend_from_slice(&(len as u32).to_be_bytes());
        }
    }
    buf.push(ext_type as u8);
    buf.extend_from_slice(payload);
}

/// Encoded size of nil.
pub fn sizeof_nil() -> usize {
    1
}

/// Append nil.
pub fn write_nil(buf: &mut Vec<u8>) {
    buf.push(0xc0);
}

/// Encoded size of a boolean.
pub fn sizeof_bool(_v: bool) -> usize {
    1
}

/// Append a boolean.
pub fn write_bool(buf: &mut Vec<u8>, v: bool) {
    buf.push(if v { 0xc3 } else { 0xc2 });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{read_array, read_ext, read_map};

    #[test]
    fn header_sizes_match_writers() {
        for n in [0u32, 15, 16, 65535, 65536] {
            let mut buf = Vec::new();
            write_array(&mut buf, n);
            assert_eq!(buf.len(), sizeof_array(n));
            let mut cur = &buf[..];
            assert_eq!(read_array(&mut cur).unwrap(), n);

            buf.clear();
            write_map(&mut buf, n);
            assert_eq!(buf.len(), sizeof_map(n));
            let mut cur = &buf[..];
            assert_eq!(read_map(&mut cur).unwrap(), n);
        }
    }

    #[test]
    fn ext_roundtrip() {
        for len in [1usize, 2, 3, 4, 8, 16, 17, 300] {
            let payload = vec![0xabu8; len];
            let mut buf = Vec::new();
            write_ext(&mut buf, 1, &payload);
            assert_eq!(buf.len(), sizeof_ext(len));
            let mut cur = &buf[..];
            let (t, body) = read_ext(&mut cur).unwrap();
            assert_eq!(t, 1);
            assert_eq!(body, &payload[..]);
        }
    }

    #[test]
    fn int_boundary_sizes() {
        assert_eq!(sizeof_int(-32), 1);
        assert_eq!(sizeof_int(-33), 2);
        assert_eq!(sizeof_int(127), 1);
        assert_eq!(sizeof_uint(127), 1);
        assert_eq!(sizeof_uint(128), 2);
    }
}
