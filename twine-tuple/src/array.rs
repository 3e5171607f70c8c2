//! Array nodes of the field tree.
//!
//! An array under update is a rope over its fields (see [`crate::rope`]).
//! Terminal operations transform the extracted field in place; pathful
//! operations descend into the extracted child node.

use crate::error::{Result, UpdateError};
use crate::field::{self, UpdateField};
use crate::op::{AddrToken, OpArg, Opcode, Ops, UpdateOp};
use crate::rope::Rope;
use twine_mp as mp;

/// Split a run of untouched fields after its first `k` fields.
fn split_run<'a>(
    run: &UpdateField<'a>,
    k: u32,
) -> Result<(UpdateField<'a>, UpdateField<'a>)> {
    let UpdateField::Nop { data } = run else {
        // Single-field payloads are never split: positions inside a
        // span > 1 only exist for runs.
        return Err(UpdateError::illegal("split of an updated field"));
    };
    let mut cur = *data;
    for _ in 0..k {
        mp::skip(&mut cur).map_err(field::mp_corrupt)?;
    }
    let cut = data.len() - cur.len();
    Ok((
        UpdateField::Nop {
            data: &data[..cut],
        },
        UpdateField::Nop {
            data: &data[cut..],
        },
    ))
}

/// An array with structural changes.
pub(crate) struct ArrayUpdate<'a> {
    rope: Rope<'a>,
}

impl<'a> ArrayUpdate<'a> {
    /// Build over a header-less field sequence of `count` fields.
    pub(crate) fn new(body: &'a [u8], count: u32) -> Self {
        let mut rope = Rope::new();
        if count > 0 {
            rope.append(UpdateField::Nop { data: body }, count);
        }
        Self { rope }
    }

    /// Build over a full array value (header included).
    pub(crate) fn from_value(value: &'a [u8]) -> Result<Self> {
        let mut cur = value;
        let count = mp::read_array(&mut cur).map_err(field::mp_corrupt)?;
        Ok(Self::new(cur, count))
    }

    /// Build over a full array value with `child` standing in for the
    /// field at `field_no`. Used when a subtree is relocated during a
    /// branch.
    pub(crate) fn with_child(
        value: &'a [u8],
        field_no: u32,
        child: UpdateField<'a>,
    ) -> Result<Self> {
        let mut arr = Self::from_value(value)?;
        let id = arr.rope.extract(field_no, &split_run)?;
        *arr.rope.field_mut(id) = child;
        Ok(arr)
    }

    /// Current field count.
    pub(crate) fn len(&self) -> u32 {
        self.rope.count()
    }

    /// Exact output size, header included.
    pub(crate) fn sizeof(&self, ops: &Ops<'_>) -> usize {
        let mut size = mp::sizeof_array(self.len());
        self.rope
            .for_each(|f, _| size += field_sizeof_leaf(ops, f));
        size
    }

    /// Serialize, header included.
    pub(crate) fn store(&self, ops: &Ops<'_>, out: &mut Vec<u8>) {
        mp::write_array(out, self.len());
        self.rope.for_each(|f, _| field::field_store(ops, f, out));
    }
}

fn field_sizeof_leaf(ops: &Ops<'_>, f: &UpdateField<'_>) -> usize {
    field::field_sizeof(ops, f)
}

impl std::fmt::Debug for ArrayUpdate<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ArrayUpdate(len={})", self.len())
    }
}

/// Resolve a possibly negative field number against `field_max`
/// positions.
fn adjust_field_no(op: &UpdateOp<'_>, field_no: i32, field_max: u32) -> Result<u32> {
    if field_no >= 0 {
        if (field_no as u32) < field_max {
            return Ok(field_no as u32);
        }
    } else if field_no + field_max as i32 >= 0 {
        return Ok((field_no + field_max as i32) as u32);
    }
    Err(op.err_no_such_field())
}

/// Apply operation `idx` at this array level.
pub(crate) fn do_op<'a>(
    ops: &mut Ops<'a>,
    idx: usize,
    field: &mut UpdateField<'a>,
) -> Result<()> {
    let UpdateField::Array(arr) = field else {
        unreachable!("array dispatch on a non-array node");
    };
    let token = ops.list[idx].next_token()?;
    let field_no = match token {
        AddrToken::Num(n) => n,
        AddrToken::Key(_) => {
            return Err(ops.list[idx].err_field("can not update array by non-integer index"))
        }
    };
    if ops.list[idx].is_term() {
        do_op_term(ops, idx, arr, field_no)
    } else {
        let pos = adjust_field_no(&ops.list[idx], field_no, arr.len())?;
        let id = arr.rope.extract(pos, &split_run)?;
        field::do_op(ops, idx, arr.rope.field_mut(id))
    }
}

fn do_op_term<'a>(
    ops: &mut Ops<'a>,
    idx: usize,
    arr: &mut ArrayUpdate<'a>,
    field_no: i32,
) -> Result<()> {
    let size = arr.len();
    match ops.list[idx].opcode {
        Opcode::Insert => do_insert(ops, idx, arr, field_no),
        Opcode::Set => {
            // '=' addressing one past the end means append.
            if field_no >= 0 && field_no as u32 == size {
                return do_insert(ops, idx, arr, field_no);
            }
            let pos = adjust_field_no(&ops.list[idx], field_no, size)?;
            let id = arr.rope.extract(pos, &split_run)?;
            let slot = arr.rope.field_mut(id);
            let UpdateField::Nop { data } = *slot else {
                return Err(ops.list[idx].err_double());
            };
            let OpArg::Set(value) = ops.list[idx].arg else {
                unreachable!("set op carries a set argument");
            };
            ops.list[idx].new_field_len = value.len() as u32;
            *arr.rope.field_mut(id) = UpdateField::Scalar { data, op: idx };
            Ok(())
        }
        Opcode::Delete => {
            let pos = adjust_field_no(&ops.list[idx], field_no, size)?;
            let OpArg::Del(requested) = ops.list[idx].arg else {
                unreachable!("delete op carries a count");
            };
            let count = requested.min(size - pos);
            debug_assert!(count > 0);
            for _ in 0..count {
                arr.rope.erase(pos, &split_run)?;
            }
            Ok(())
        }
        Opcode::Add
        | Opcode::Sub
        | Opcode::BitAnd
        | Opcode::BitOr
        | Opcode::BitXor
        | Opcode::Splice => {
            let pos = adjust_field_no(&ops.list[idx], field_no, size)?;
            let id = arr.rope.extract(pos, &split_run)?;
            let UpdateField::Nop { data } = *arr.rope.field(id) else {
                return Err(ops.list[idx].err_double());
            };
            apply_scalar(&mut ops.list[idx], data)?;
            *arr.rope.field_mut(id) = UpdateField::Scalar { data, op: idx };
            Ok(())
        }
    }
}

fn do_insert<'a>(
    ops: &mut Ops<'a>,
    idx: usize,
    arr: &mut ArrayUpdate<'a>,
    field_no: i32,
) -> Result<()> {
    let pos = adjust_field_no(&ops.list[idx], field_no, arr.len() + 1)?;
    let OpArg::Set(value) = ops.list[idx].arg else {
        unreachable!("insert op carries a set argument");
    };
    // The inserted field is plain new bytes, not an operation result.
    arr.rope
        .insert(pos, UpdateField::Nop { data: value }, &split_run)
}

/// Run the scalar computation of an op against the old field bytes.
pub(crate) fn apply_scalar<'a>(op: &mut UpdateOp<'a>, old: &'a [u8]) -> Result<()> {
    match op.opcode {
        Opcode::Add | Opcode::Sub => op.do_arith(old),
        Opcode::BitAnd | Opcode::BitOr | Opcode::BitXor => op.do_bit(old),
        Opcode::Splice => op.do_splice(old),
        _ => unreachable!("not a computed scalar opcode"),
    }
}
