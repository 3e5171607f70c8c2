//! Decimal extension values.
//!
//! Decimals travel as extension type [`MP_DECIMAL`]. The payload is one
//! scale byte followed by the mantissa as a minimal-length big-endian
//! two's-complement integer, so `1.5` packs as `scale=1, mantissa=15` in
//! two payload bytes.

use crate::decode::read_ext;
use crate::encode::{sizeof_ext, write_ext};
use crate::error::{MpError, Result};
use rust_decimal::Decimal;

/// Extension type id of decimal values.
pub const MP_DECIMAL: i8 = 1;

/// The widest scale `rust_decimal` can represent.
const MAX_SCALE: u8 = 28;

/// Minimal big-endian two's-complement encoding of a mantissa.
fn mantissa_bytes(m: i128) -> Vec<u8> {
    let full = m.to_be_bytes();
    let sign_fill = if m < 0 { 0xff } else { 0x00 };
    let mut start = 0;
    // Trim redundant sign bytes, keeping one byte that still carries the
    // sign bit.
    while start < full.len() - 1
        && full[start] == sign_fill
        && (full[start + 1] & 0x80) == (sign_fill & 0x80)
    {
        start += 1;
    }
    full[start..].to_vec()
}

fn mantissa_len(m: i128) -> usize {
    mantissa_bytes(m).len()
}

/// Encoded size of a decimal value.
pub fn sizeof_decimal(d: &Decimal) -> usize {
    sizeof_ext(1 + mantissa_len(d.mantissa()))
}

/// Append a decimal value as an extension.
pub fn write_decimal(buf: &mut Vec<u8>, d: &Decimal) {
    let mut payload = Vec::with_capacity(17);
    payload.push(d.scale() as u8);
    payload.extend_from_slice(&mantissa_bytes(d.mantissa()));
    write_ext(buf, MP_DECIMAL, &payload);
}

/// Read a decimal extension value.
pub fn read_decimal(cur: &mut &[u8]) -> Result<Decimal> {
    let (ext_type, payload) = read_ext(cur)?;
    if ext_type != MP_DECIMAL {
        return Err(MpError::Type {
            expected: "decimal",
            found: crate::MpType::Ext,
        });
    }
    let (&scale, mantissa) = payload.split_first().ok_or(MpError::Eof)?;
    if scale > MAX_SCALE || mantissa.is_empty() || mantissa.len() > 16 {
        return Err(MpError::OutOfRange);
    }
    let sign_fill = if mantissa[0] & 0x80 != 0 { 0xffu8 } else { 0 };
    let mut full = [sign_fill; 16];
    full[16 - mantissa.len()..].copy_from_slice(mantissa);
    let m = i128::from_be_bytes(full);
    Ok(Decimal::from_i128_with_scale(m, u32::from(scale)))
}
