//! Widening arithmetic over update operands.
//!
//! `+` and `-` accept integers, floats, doubles and decimals. The result
//! type is the *least expressive* operand type, with
//! decimal ≺ double ≺ float ≺ integer on the expressiveness ladder:
//! adding a double to an integer yields a double, adding a decimal to
//! anything yields a decimal.
//!
//! Integers compute in a wide signed accumulator; the result must fit
//! either `u64` or a negative `i64`, anything else is an integer
//! overflow. Float results are computed in double precision and lowered
//! afterwards.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use twine_mp as mp;

/// Type tag of an arithmetic value, ordered by expressiveness
/// (lowest = most expressive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ArithKind {
    Decimal = 0,
    Double = 1,
    Float = 2,
    Int = 3,
}

/// One arithmetic operand or result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArithVal {
    /// Integer family, widened into i128.
    Int(i128),
    /// 32-bit float.
    Float(f32),
    /// 64-bit float.
    Double(f64),
    /// Arbitrary-precision decimal.
    Decimal(Decimal),
}

/// Arithmetic opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    /// `+`
    Add,
    /// `-`
    Sub,
}

/// Failures of [`arith_op`]; the caller attaches operation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithError {
    /// Result left the (-2^63, 2^64) integer window.
    IntOverflow,
    /// Decimal add/sub overflowed.
    DecimalOverflow,
    /// An operand cannot be converted to decimal.
    BadDecimal,
}

impl ArithVal {
    /// Read a numeric value from the wire.
    pub fn read(cur: &mut &[u8]) -> Result<ArithVal, mp::MpError> {
        match mp::type_of(cur)? {
            mp::MpType::Uint => Ok(ArithVal::Int(i128::from(mp::read_uint(cur)?))),
            mp::MpType::Int => Ok(ArithVal::Int(i128::from(mp::read_int(cur)?))),
            mp::MpType::Float => Ok(ArithVal::Float(mp::read_float(cur)?)),
            mp::MpType::Double => Ok(ArithVal::Double(mp::read_double(cur)?)),
            mp::MpType::Ext => Ok(ArithVal::Decimal(mp::read_decimal(cur)?)),
            found => Err(mp::MpError::Type {
                expected: "a number",
                found,
            }),
        }
    }

    fn kind(&self) -> ArithKind {
        match self {
            ArithVal::Int(_) => ArithKind::Int,
            ArithVal::Float(_) => ArithKind::Float,
            ArithVal::Double(_) => ArithKind::Double,
            ArithVal::Decimal(_) => ArithKind::Decimal,
        }
    }

    fn to_double(&self) -> f64 {
        match self {
            ArithVal::Int(v) => *v as f64,
            ArithVal::Float(v) => f64::from(*v),
            ArithVal::Double(v) => *v,
            ArithVal::Decimal(_) => unreachable!("decimal never lowers to double"),
        }
    }

    fn to_decimal(&self) -> Option<Decimal> {
        match self {
            ArithVal::Decimal(d) => Some(*d),
            ArithVal::Double(v) => Decimal::from_f64(*v),
            ArithVal::Float(v) => Decimal::from_f64(f64::from(*v)),
            ArithVal::Int(v) => Decimal::try_from_i128_with_scale(*v, 0).ok(),
        }
    }

    /// Negate the value; fails only on integer window overflow.
    pub fn negate(&self) -> Result<ArithVal, ArithError> {
        match self {
            ArithVal::Int(v) => {
                let neg = -*v;
                if int_in_window(neg) {
                    Ok(ArithVal::Int(neg))
                } else {
                    Err(ArithError::IntOverflow)
                }
            }
            ArithVal::Float(v) => Ok(ArithVal::Float(-*v)),
            ArithVal::Double(v) => Ok(ArithVal::Double(-*v)),
            ArithVal::Decimal(d) => Ok(ArithVal::Decimal(-*d)),
        }
    }

    /// Exact encoded size of the value.
    pub fn sizeof(&self) -> usize {
        match self {
            ArithVal::Int(v) => {
                if *v >= 0 {
                    mp::sizeof_uint(*v as u64)
                } else {
                    mp::sizeof_int(*v as i64)
                }
            }
            ArithVal::Float(v) => mp::sizeof_float(*v),
            ArithVal::Double(v) => mp::sizeof_double(*v),
            ArithVal::Decimal(d) => mp::sizeof_decimal(d),
        }
    }

    /// Encode the value.
    pub fn store(&self, out: &mut Vec<u8>) {
        match self {
            ArithVal::Int(v) => {
                if *v >= 0 {
                    mp::write_uint(out, *v as u64);
                } else {
                    mp::write_int(out, *v as i64);
                }
            }
            ArithVal::Float(v) => mp::write_float(out, *v),
            ArithVal::Double(v) => mp::write_double(out, *v),
            ArithVal::Decimal(d) => mp::write_decimal(out, d),
        }
    }
}

fn int_in_window(v: i128) -> bool {
    (v >= 0 && v <= i128::from(u64::MAX)) || (v < 0 && v >= i128::from(i64::MIN))
}

/// Compute `left op right` under the promotion rules above.
pub fn arith_op(op: ArithOp, left: &ArithVal, right: &ArithVal) -> Result<ArithVal, ArithError> {
    let lowest = left.kind().min(right.kind());
    match lowest {
        ArithKind::Int => {
            let (ArithVal::Int(a), ArithVal::Int(b)) = (left, right) else {
                unreachable!("both operands are integers when the lowest kind is Int");
            };
            let r = match op {
                ArithOp::Add => a + b,
                ArithOp::Sub => a - b,
            };
            if int_in_window(r) {
                Ok(ArithVal::Int(r))
            } else {
                Err(ArithError::IntOverflow)
            }
        }
        ArithKind::Double | ArithKind::Float => {
            let a = left.to_double();
            let b = right.to_double();
            let c = match op {
                ArithOp::Add => a + b,
                ArithOp::Sub => a - b,
            };
            if lowest == ArithKind::Double {
                Ok(ArithVal::Double(c))
            } else {
                // Float results deliberately compute in double and lower.
                Ok(ArithVal::Float(c as f32))
            }
        }
        ArithKind::Decimal => {
            let a = left.to_decimal().ok_or(ArithError::BadDecimal)?;
            let b = right.to_decimal().ok_or(ArithError::BadDecimal)?;
            let c = match op {
                ArithOp::Add => a.checked_add(b),
                ArithOp::Sub => a.checked_sub(b),
            };
            c.map(ArithVal::Decimal).ok_or(ArithError::DecimalOverflow)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn int_plus_int() {
        let r = arith_op(ArithOp::Add, &ArithVal::Int(2), &ArithVal::Int(10)).unwrap();
        assert_eq!(r, ArithVal::Int(12));
    }

    #[test]
    fn uint_overflow_detected() {
        let max = ArithVal::Int(i128::from(u64::MAX));
        let err = arith_op(ArithOp::Add, &max, &ArithVal::Int(1)).unwrap_err();
        assert_eq!(err, ArithError::IntOverflow);
    }

    #[test]
    fn negative_underflow_detected() {
        let min = ArithVal::Int(i128::from(i64::MIN));
        let err = arith_op(ArithOp::Sub, &min, &ArithVal::Int(1)).unwrap_err();
        assert_eq!(err, ArithError::IntOverflow);
    }

    #[test]
    fn crossing_zero_is_fine() {
        let r = arith_op(
            ArithOp::Sub,
            &ArithVal::Int(1),
            &ArithVal::Int(i128::from(u64::MAX)),
        )
        .unwrap_err();
        // 1 - u64::MAX is far below i64::MIN.
        assert_eq!(r, ArithError::IntOverflow);

        let r = arith_op(ArithOp::Sub, &ArithVal::Int(2), &ArithVal::Int(5)).unwrap();
        assert_eq!(r, ArithVal::Int(-3));
    }

    #[test]
    fn int_plus_double_is_double() {
        let r = arith_op(ArithOp::Add, &ArithVal::Int(1), &ArithVal::Double(0.5)).unwrap();
        assert_eq!(r, ArithVal::Double(1.5));
    }

    #[test]
    fn int_plus_float_is_float() {
        let r = arith_op(ArithOp::Add, &ArithVal::Float(1.5), &ArithVal::Int(1)).unwrap();
        assert_eq!(r, ArithVal::Float(2.5));
    }

    #[test]
    fn float_plus_double_is_double() {
        let r = arith_op(ArithOp::Add, &ArithVal::Float(0.5), &ArithVal::Double(1.0)).unwrap();
        assert_eq!(r, ArithVal::Double(1.5));
    }

    #[test]
    fn decimal_wins_over_everything() {
        let d = Decimal::from_str("1.1").unwrap();
        let r = arith_op(ArithOp::Add, &ArithVal::Decimal(d), &ArithVal::Int(1)).unwrap();
        assert_eq!(r, ArithVal::Decimal(Decimal::from_str("2.1").unwrap()));
    }

    #[test]
    fn decimal_overflow_detected() {
        let max = ArithVal::Decimal(Decimal::MAX);
        let err = arith_op(ArithOp::Add, &max, &ArithVal::Decimal(Decimal::MAX)).unwrap_err();
        assert_eq!(err, ArithError::DecimalOverflow);
    }

    #[test]
    fn sizeof_matches_store() {
        for v in [
            ArithVal::Int(0),
            ArithVal::Int(300),
            ArithVal::Int(-300),
            ArithVal::Int(i128::from(u64::MAX)),
            ArithVal::Float(1.5),
            ArithVal::Double(-2.5),
            ArithVal::Decimal(Decimal::from_str("12.34").unwrap()),
        ] {
            let mut buf = Vec::new();
            v.store(&mut buf);
            assert_eq!(buf.len(), v.sizeof(), "value {v:?}");
        }
    }
}
