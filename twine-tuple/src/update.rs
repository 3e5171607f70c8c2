//! UPDATE/UPSERT drivers.
//!
//! An update is a sequence of field operations applied to one tuple.
//! Operations are decoded and checked first (building the column mask
//! on the way), then applied one by one to the field tree rooted in the
//! tuple's top-level array, and finally the tree is flattened into a
//! single freshly allocated buffer: exact size first, one store pass
//! after. Nothing is materialized in between, so the cost is
//! O(tuple length) + O(k log k) in the operation count k.

use crate::array::ArrayUpdate;
use crate::arith::{arith_op, ArithVal};
use crate::dict::TupleDict;
use crate::error::{Result, UpdateError};
use crate::field::{self, UpdateField};
use crate::mask::{column_mask_set_fieldno, column_mask_set_range, COLUMN_MASK_FULL};
use crate::op::{decode_op, OpArg, Opcode, Ops, UpdateOp, OP_COUNT_MAX};
use twine_core::Region;
use twine_mp as mp;

/// Outcome of a successful update.
#[derive(Debug)]
pub struct UpdateResult {
    /// The new tuple, serialized into one contiguous buffer.
    pub tuple: Vec<u8>,
    /// Saturating bitmap of the top-level columns this update may have
    /// touched.
    pub column_mask: u64,
}

struct Request<'a> {
    ops: Ops<'a>,
    column_mask: u64,
}

/// Decode and check the operation array, accumulating the column mask.
///
/// `field_count_hint` resolves negative field numbers; when the tuple
/// is unknown (upsert against a missing record) zero is acceptable and
/// only makes the mask conservative.
fn read_ops<'a>(
    expr: &'a [u8],
    dict: &TupleDict,
    index_base: i32,
    mut field_count_hint: i32,
) -> Result<Request<'a>> {
    let mut cur = expr;
    if !matches!(mp::type_of(cur), Ok(mp::MpType::Array)) {
        return Err(UpdateError::illegal(
            "update operations must be an array {{op,..}, {op,..}}",
        ));
    }
    let op_count =
        mp::read_array(&mut cur).map_err(|_| UpdateError::illegal("truncated operations"))?;
    if op_count > OP_COUNT_MAX {
        return Err(UpdateError::illegal("too many operations for update"));
    }

    let mut list: Vec<UpdateOp<'a>> = Vec::with_capacity(op_count as usize);
    let mut column_mask = 0u64;
    for _ in 0..op_count {
        let op = decode_op(&mut cur, index_base, dict)?;
        // Keep collecting changed columns only while the mask still has
        // unset bits.
        if column_mask != COLUMN_MASK_FULL {
            let field_no = if op.field_no >= 0 {
                op.field_no
            } else if op.opcode != Opcode::Insert {
                field_count_hint + op.field_no
            } else {
                // '!' with a negative number inserts after the
                // position: [1,2,3] with {'!',-1,4} creates a new
                // field 4, so the affected column is one past it.
                field_count_hint + op.field_no + 1
            };
            if field_no < 0 {
                // A tail-relative number beyond the hint; the update
                // will fail or the hint is unknown. Give up on the mask.
                column_mask_set_range(&mut column_mask, 0);
            } else {
                // Track the running field count so later negative
                // numbers translate correctly.
                if op.opcode == Opcode::Insert {
                    field_count_hint += 1;
                } else if op.opcode == Opcode::Delete {
                    if let OpArg::Del(count) = op.arg {
                        field_count_hint -= count as i32;
                    }
                }
                if op.opcode.changes_field_count() {
                    // Insertions and deletions shift every column
                    // behind them.
                    column_mask_set_range(&mut column_mask, field_no as u32);
                } else {
                    column_mask_set_fieldno(&mut column_mask, field_no as u32);
                }
            }
        }
        list.push(op);
    }
    if !cur.is_empty() {
        return Err(UpdateError::illegal("can't unpack update operations"));
    }
    Ok(Request {
        ops: Ops { list, index_base },
        column_mask,
    })
}

fn build_root<'a>(tuple: &'a [u8]) -> Result<(UpdateField<'a>, u32)> {
    let mut cur = tuple;
    let field_count = mp::read_array(&mut cur).map_err(field::mp_corrupt)?;
    Ok((
        UpdateField::Array(ArrayUpdate::new(cur, field_count)),
        field_count,
    ))
}

fn finish(region: &Region, ops: &Ops<'_>, root: &UpdateField<'_>, column_mask: u64) -> UpdateResult {
    let len = field::field_sizeof(ops, root);
    let mut out = region.alloc(len);
    out.clear();
    field::field_store(ops, root, &mut out);
    assert_eq!(out.len(), len, "size pass and store pass disagree");
    UpdateResult {
        tuple: out,
        column_mask,
    }
}

/// Apply update operations to a tuple; any failing operation aborts the
/// whole request.
pub fn update_execute(
    region: &Region,
    expr: &[u8],
    tuple: &[u8],
    dict: &TupleDict,
    index_base: i32,
) -> Result<UpdateResult> {
    let (mut root, field_count) = build_root(tuple)?;
    let mut req = read_ops(expr, dict, index_base, field_count as i32)?;
    for idx in 0..req.ops.list.len() {
        field::do_op(&mut req.ops, idx, &mut root)?;
    }
    Ok(finish(region, &req.ops, &root, req.column_mask))
}

/// Apply upsert operations to a tuple. A failing operation is skipped
/// (and logged, unless `suppress_error`), the rest still apply.
pub fn upsert_execute(
    region: &Region,
    expr: &[u8],
    tuple: &[u8],
    dict: &TupleDict,
    index_base: i32,
    suppress_error: bool,
) -> Result<UpdateResult> {
    let (mut root, field_count) = build_root(tuple)?;
    let mut req = read_ops(expr, dict, index_base, field_count as i32)?;
    for idx in 0..req.ops.list.len() {
        if let Err(e) = field::do_op(&mut req.ops, idx, &mut root) {
            if !suppress_error {
                tracing::error!(err = %e, "UPSERT operation failed, skipped");
            }
        }
    }
    Ok(finish(region, &req.ops, &root, req.column_mask))
}

/// Decode-check an operation array without a tuple at hand.
pub fn update_check_ops(expr: &[u8], dict: &TupleDict, index_base: i32) -> Result<()> {
    read_ops(expr, dict, index_base, 0).map(|_| ())
}

/// Fold two upsert operation lists into one list whose application
/// equals applying both in order.
///
/// Only `=`, `+` and `-` over plain, strictly increasing field numbers
/// qualify; anything else — including arithmetic folds that overflow —
/// returns `Ok(None)`, meaning the caller must keep both lists.
pub fn upsert_squash(
    region: &Region,
    expr1: &[u8],
    expr2: &[u8],
    dict: &TupleDict,
    index_base: i32,
) -> Result<Option<Vec<u8>>> {
    let reqs = [
        read_ops(expr1, dict, index_base, 0)?,
        read_ops(expr2, dict, index_base, 0)?,
    ];
    for req in &reqs {
        // The first updatable field is protected: numbers at or below
        // the base would squash ops against the primary key.
        let mut prev_field_no = index_base - 1;
        for op in &req.ops.list {
            if !matches!(op.opcode, Opcode::Set | Opcode::Add | Opcode::Sub) {
                return Ok(None);
            }
            if !op.lexer.src().is_empty() {
                return Ok(None);
            }
            if op.field_no <= prev_field_no {
                return Ok(None);
            }
            prev_field_no = op.field_no;
        }
    }

    let mut cur = [expr1, expr2];
    for c in &mut cur {
        mp::read_array(c).map_err(|_| UpdateError::illegal("truncated operations"))?;
    }
    let count = [reqs[0].ops.list.len(), reqs[1].ops.list.len()];
    let mut op_no = [0usize, 0usize];
    let mut body: Vec<u8> = Vec::with_capacity(expr1.len() + expr2.len());
    let mut res_count = 0u32;

    while op_no[0] < count[0] || op_no[1] < count[1] {
        res_count += 1;
        let has = [op_no[0] < count[0], op_no[1] < count[1]];
        // 0/1: take the op from that list verbatim; 2: merge the tie.
        let mut from = if has[0] && has[1] {
            let f0 = reqs[0].ops.list[op_no[0]].field_no;
            let f1 = reqs[1].ops.list[op_no[1]].field_no;
            match f0.cmp(&f1) {
                std::cmp::Ordering::Less => 0,
                std::cmp::Ordering::Greater => 1,
                std::cmp::Ordering::Equal => 2,
            }
        } else if has[1] {
            1
        } else {
            0
        };
        if from == 2 && reqs[1].ops.list[op_no[1]].opcode == Opcode::Set {
            // A '=' from the second list overwrites whatever the first
            // list did to the field; drop the first op.
            mp::skip(&mut cur[0]).map_err(|_| UpdateError::illegal("truncated operations"))?;
            op_no[0] += 1;
            from = 1;
        }
        if from < 2 {
            let start = cur[from];
            mp::skip(&mut cur[from]).map_err(|_| UpdateError::illegal("truncated operations"))?;
            body.extend_from_slice(&start[..start.len() - cur[from].len()]);
            op_no[from] += 1;
            continue;
        }

        // Arithmetic tie: fold both into one op.
        let first = &reqs[0].ops.list[op_no[0]];
        let second = &reqs[1].ops.list[op_no[1]];
        debug_assert!(second.opcode.is_arith());
        let OpArg::Arith(first_val) = first.arg else {
            // '=' followed by arithmetic cannot fold into one op.
            return Ok(None);
        };
        let left = if first.opcode == Opcode::Sub {
            match first_val.negate() {
                Ok(v) => v,
                Err(_) => return Ok(None),
            }
        } else {
            first_val
        };
        let OpArg::Arith(right) = second.arg else {
            unreachable!("arith op carries an arith argument");
        };
        let op = second.arith_kind().expect("arith opcode");
        let folded = match arith_op(op, &left, &right) {
            Ok(v) => v,
            Err(_) => return Ok(None),
        };
        // Fold sign into the opcode so negative integer results read
        // the way a caller would write them.
        let (out_opcode, out_val) = match folded {
            ArithVal::Int(v) if v < 0 => ('-', ArithVal::Int(-v)),
            other => ('+', other),
        };
        mp::write_array(&mut body, 3);
        mp::write_str(&mut body, &[out_opcode as u8]);
        mp::write_uint(&mut body, (first.field_no + index_base) as u64);
        out_val.store(&mut body);
        mp::skip(&mut cur[0]).map_err(|_| UpdateError::illegal("truncated operations"))?;
        mp::skip(&mut cur[1]).map_err(|_| UpdateError::illegal("truncated operations"))?;
        op_no[0] += 1;
        op_no[1] += 1;
    }
    debug_assert!(cur[0].is_empty() && cur[1].is_empty());

    let len = mp::sizeof_array(res_count) + body.len();
    let mut out = region.alloc(len);
    out.clear();
    mp::write_array(&mut out, res_count);
    out.extend_from_slice(&body);
    Ok(Some(out))
}
