//! Cursor-style decoders.
//!
//! Every reader takes `&mut &[u8]` and advances it past the value on
//! success. On error the cursor position is unspecified and the caller is
//! expected to abandon the buffer.

use crate::error::{MpError, Result};
use crate::types::{type_of, MpType};

fn take<'a>(cur: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if cur.len() < n {
        return Err(MpError::Eof);
    }
    let (head, rest) = cur.split_at(n);
    *cur = rest;
    Ok(head)
}

fn take_u8(cur: &mut &[u8]) -> Result<u8> {
    Ok(take(cur, 1)?[0])
}

fn take_u16(cur: &mut &[u8]) -> Result<u16> {
    let b = take(cur, 2)?;
    Ok(u16::from_be_bytes([b[0], b[1]]))
}

fn take_u32(cur: &mut &[u8]) -> Result<u32> {
    let b = take(cur, 4)?;
    Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn take_u64(cur: &mut &[u8]) -> Result<u64> {
    let b = take(cur, 8)?;
    Ok(u64::from_be_bytes([
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
    ]))
}

fn mismatch(expected: &'static str, data: &[u8]) -> MpError {
    match type_of(data) {
        Ok(found) => MpError::Type { expected, found },
        Err(e) => e,
    }
}

/// Read an unsigned integer.
pub fn read_uint(cur: &mut &[u8]) -> Result<u64> {
    let saved = *cur;
    let marker = take_u8(cur)?;
    match marker {
        0x00..=0x7f => Ok(u64::from(marker)),
        0xcc => Ok(u64::from(take_u8(cur)?)),
        0xcd => Ok(u64::from(take_u16(cur)?)),
        0xce => Ok(u64::from(take_u32(cur)?)),
        0xcf => take_u64(cur),
        _ => {
            *cur = saved;
            Err(mismatch("unsigned", saved))
        }
    }
}

/// Read a negative integer. Values in the unsigned family are rejected;
/// use [`read_int32`] when either sign is acceptable.
pub fn read_int(cur: &mut &[u8]) -> Result<i64> {
    let saved = *cur;
    let marker = take_u8(cur)?;
    match marker {
        0xe0..=0xff => Ok(i64::from(marker as i8)),
        0xd0 => Ok(i64::from(take_u8(cur)? as i8)),
        0xd1 => Ok(i64::from(take_u16(cur)? as i16)),
        0xd2 => Ok(i64::from(take_u32(cur)? as i32)),
        0xd3 => Ok(take_u64(cur)? as i64),
        _ => {
            *cur = saved;
            Err(mismatch("integer", saved))
        }
    }
}

/// Read an integer of either sign that fits `i32`.
pub fn read_int32(cur: &mut &[u8]) -> Result<i32> {
    match type_of(cur)? {
        MpType::Uint => {
            let v = read_uint(cur)?;
            i32::try_from(v).map_err(|_| MpError::OutOfRange)
        }
        MpType::Int => {
            let v = read_int(cur)?;
            i32::try_from(v).map_err(|_| MpError::OutOfRange)
        }
        found => Err(MpError::Type {
            expected: "integer",
            found,
        }),
    }
}

/// Read a 32-bit float.
pub fn read_float(cur: &mut &[u8]) -> Result<f32> {
    let saved = *cur;
    let marker = take_u8(cur)?;
    if marker != 0xca {
        *cur = saved;
        return Err(mismatch("float", saved));
    }
    Ok(f32::from_bits(take_u32(cur)?))
}

/// Read a 64-bit float.
pub fn read_double(cur: &mut &[u8]) -> Result<f64> {
    let saved = *cur;
    let marker = take_u8(cur)?;
    if marker != 0xcb {
        *cur = saved;
        return Err(mismatch("double", saved));
    }
    Ok(f64::from_bits(take_u64(cur)?))
}

/// Read a string value, returning the raw bytes.
pub fn read_str<'a>(cur: &mut &'a [u8]) -> Result<&'a [u8]> {
    let saved = *cur;
    let marker = take_u8(cur)?;
    let len = match marker {
        0xa0..=0xbf => usize::from(marker & 0x1f),
        0xd9 => usize::from(take_u8(cur)?),
        0xda => usize::from(take_u16(cur)?),
        0xdb => take_u32(cur)? as usize,
        _ => {
            *cur = saved;
            return Err(mismatch("string", saved));
        }
    };
    take(cur, len)
}

/// Read a string value and validate it as UTF-8.
pub fn read_str_utf8<'a>(cur: &mut &'a [u8]) -> Result<&'a str> {
    std::str::from_utf8(read_str(cur)?).map_err(|_| MpError::Utf8)
}

/// Read a binary value.
pub fn read_bin<'a>(cur: &mut &'a [u8]) -> Result<&'a [u8]> {
    let saved = *cur;
    let marker = take_u8(cur)?;
    let len = match marker {
        0xc4 => usize::from(take_u8(cur)?),
        0xc5 => usize::from(take_u16(cur)?),
        0xc6 => take_u32(cur)? as usize,
        _ => {
            *cur = saved;
            return Err(mismatch("binary", saved));
        }
    };
    take(cur, len)
}

/// Read an array header, returning the element count.
pub fn read_array(cur: &mut &[u8]) -> Result<u32> {
    let saved = *cur;
    let marker = take_u8(cur)?;
    match marker {
        0x90..=0x9f => Ok(u32::from(marker & 0x0f)),
        0xdc => Ok(u32::from(take_u16(cur)?)),
        0xdd => take_u32(cur),
        _ => {
            *cur = saved;
            Err(mismatch("array", saved))
        }
    }
}

/// Read a map header, returning the pair count.
pub fn read_map(cur: &mut &[u8]) -> Result<u32> {
    let saved = *cur;
    let marker = take_u8(cur)?;
    match marker {
        0x80..=0x8f => Ok(u32::from(marker & 0x0f)),
        0xde => Ok(u32::from(take_u16(cur)?)),
        0xdf => take_u32(cur),
        _ => {
            *cur = saved;
            Err(mismatch("map", saved))
        }
    }
}

/// Read an extension value, returning `(ext_type, payload)`.
pub fn read_ext<'a>(cur: &mut &'a [u8]) -> Result<(i8, &'a [u8])> {
    let saved = *cur;
    let marker = take_u8(cur)?;
    let len = match marker {
        0xd4 => 1,
        0xd5 => 2,
        0xd6 => 4,
        0xd7 => 8,
        0xd8 => 16,
        0xc7 => usize::from(take_u8(cur)?),
        0xc8 => usize::from(take_u16(cur)?),
        0xc9 => take_u32(cur)? as usize,
        _ => {
            *cur = saved;
            return Err(mismatch("extension", saved));
        }
    };
    let ext_type = take_u8(cur)? as i8;
    Ok((ext_type, take(cur, len)?))
}

/// Read a nil value.
pub fn read_nil(cur: &mut &[u8]) -> Result<()> {
    let saved = *cur;
    if take_u8(cur)? != 0xc0 {
        *cur = saved;
        return Err(mismatch("nil", saved));
    }
    Ok(())
}

/// Read a boolean value.
pub fn read_bool(cur: &mut &[u8]) -> Result<bool> {
    let saved = *cur;
    match take_u8(cur)? {
        0xc2 => Ok(false),
        0xc3 => Ok(true),
        _ => {
            *cur = saved;
            Err(mismatch("boolean", saved))
        }
    }
}

/// Skip exactly one value, including nested containers.
///
/// Containers are unrolled iteratively: an array of `n` adds `n` pending
/// values, a map of `n` adds `2n`.
pub fn skip(cur: &mut &[u8]) -> Result<()> {
    let mut pending: u64 = 1;
    while pending > 0 {
        pending -= 1;
        let marker = take_u8(cur)?;
        match marker {
            0x00..=0x7f | 0xe0..=0xff | 0xc0 | 0xc2 | 0xc3 => {}
            0x80..=0x8f => pending += 2 * u64::from(marker & 0x0f),
            0x90..=0x9f => pending += u64::from(marker & 0x0f),
            0xa0..=0xbf => {
                take(cur, usize::from(marker & 0x1f))?;
            }
            0xc4 | 0xd9 => {
                let len = usize::from(take_u8(cur)?);
                take(cur, len)?;
            }
            0xc5 | 0xda => {
                let len = usize::from(take_u16(cur)?);
                take(cur, len)?;
            }
            0xc6 | 0xdb => {
                let len = take_u32(cur)? as usize;
                take(cur, len)?;
            }
            0xc7 => {
                let len = usize::from(take_u8(cur)?);
                take(cur, len + 1)?;
            }
            0xc8 => {
                let len = usize::from(take_u16(cur)?);
                take(cur, len + 1)?;
            }
            0xc9 => {
                let len = take_u32(cur)? as usize;
                take(cur, len + 1)?;
            }
            0xca => {
                take(cur, 4)?;
            }
            0xcb => {
                take(cur, 8)?;
            }
            0xcc | 0xd0 => {
                take(cur, 1)?;
            }
            0xcd | 0xd1 => {
                take(cur, 2)?;
            }
            0xce | 0xd2 => {
                take(cur, 4)?;
            }
            0xcf | 0xd3 => {
                take(cur, 8)?;
            }
            0xd4 => {
                take(cur, 2)?;
            }
            0xd5 => {
                take(cur, 3)?;
            }
            0xd6 => {
                take(cur, 5)?;
            }
            0xd7 => {
                take(cur, 9)?;
            }
            0xd8 => {
                take(cur, 17)?;
            }
            0xdc => {
                pending += u64::from(take_u16(cur)?);
            }
            0xdd => {
                pending += u64::from(take_u32(cur)?);
            }
            0xde => {
                pending += 2 * u64::from(take_u16(cur)?);
            }
            0xdf => {
                pending += 2 * u64::from(take_u32(cur)?);
            }
            0xc1 => return Err(MpError::InvalidMarker(marker)),
        }
    }
    Ok(())
}
