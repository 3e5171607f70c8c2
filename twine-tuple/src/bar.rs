//! Bar nodes: a pinpoint edit inside an otherwise unchanged region.
//!
//! When an operation with a JSON path lands on untouched bytes, there is
//! no need to materialize the whole container chain: the path is walked
//! once in the original bytes, and the node only remembers where the
//! edit point is. The surrounding bytes are copied verbatim at store
//! time, with the parent container's header re-encoded when the
//! operation changes its field count.

use crate::error::{Result, UpdateError};
use crate::field::{self, array_elem, map_find, value_len, UpdateField};
use crate::op::{OpArg, Opcode, Ops};
use crate::path::PathToken;
use twine_mp as mp;

/// A pinpoint edit. All slices point into the original tuple buffer;
/// `parent` and `point` lie inside `data`.
pub(crate) struct BarUpdate<'a> {
    /// This field's whole original extent.
    pub data: &'a [u8],
    /// The operation to apply at the point.
    pub op: usize,
    /// Path suffix from this field's root to the point.
    pub path: &'a str,
    /// The container holding the point; used by `!`/`#` to re-encode
    /// the header.
    pub parent: &'a [u8],
    /// The located value; widened to the full deleted range for `#`,
    /// zero-length at the insertion position for an array `!`.
    pub point: &'a [u8],
    /// Key of a new map pair inserted by `!` (or a promoted `=`).
    pub new_key: Option<&'a str>,
}

fn subslice<'a>(parent: &'a [u8], off: usize, len: usize) -> &'a [u8] {
    &parent[off..off + len]
}

/// Walk the op's remaining path; every token must resolve.
fn bar_locate<'a>(ops: &mut Ops<'a>, idx: usize, data: &'a [u8]) -> Result<BarUpdate<'a>> {
    let path = ops.list[idx].lexer.remainder();
    let mut parent = data;
    let mut pos = data;
    loop {
        let token = {
            let op = &mut ops.list[idx];
            op.lexer.next_token().map_err(|p| op.err_bad_path(p))?
        };
        match token {
            PathToken::End => break,
            PathToken::Num(n) => {
                parent = pos;
                let (off, len) = array_elem(pos, n as u32)?
                    .ok_or_else(|| ops.list[idx].err_no_such_field())?;
                pos = subslice(pos, off, len);
            }
            PathToken::Str(key) => {
                parent = pos;
                let hit =
                    map_find(pos, key)?.ok_or_else(|| ops.list[idx].err_no_such_field())?;
                pos = subslice(pos, hit.value_off, hit.value_len);
            }
            PathToken::Any => {
                let pos_sym = ops.list[idx].lexer.symbol_count;
                return Err(ops.list[idx].err_bad_path(pos_sym));
            }
        }
    }
    let point = if pos.len() == data.len() && pos.as_ptr() == data.as_ptr() {
        // Empty path: the point is the whole field.
        &data[..value_len(data)?]
    } else {
        pos
    };
    Ok(BarUpdate {
        data,
        op: idx,
        path,
        parent,
        point,
        new_key: None,
    })
}

struct Located<'a> {
    bar: BarUpdate<'a>,
    found: bool,
    /// Array position of the point, for `#` clamping.
    last_index: Option<u32>,
    /// Key of the last path step, for `#` pair widening and duplicate
    /// reporting.
    last_key: Option<&'a str>,
}

/// Walk the op's remaining path; only the final step may be missing.
fn bar_locate_opt<'a>(ops: &mut Ops<'a>, idx: usize, data: &'a [u8]) -> Result<Located<'a>> {
    let path = ops.list[idx].lexer.remainder();
    let mut parent = data;
    let mut pos = data;
    let mut last_index = None;
    let mut last_key = None;
    let mut found = true;
    let mut new_key = None;
    loop {
        let token = {
            let op = &mut ops.list[idx];
            op.lexer.next_token().map_err(|p| op.err_bad_path(p))?
        };
        match token {
            PathToken::End => {
                let point = if pos.len() == data.len() && pos.as_ptr() == data.as_ptr() {
                    &data[..value_len(data)?]
                } else {
                    pos
                };
                return Ok(Located {
                    bar: BarUpdate {
                        data,
                        op: idx,
                        path,
                        parent,
                        point,
                        new_key,
                    },
                    found,
                    last_index,
                    last_key,
                });
            }
            PathToken::Num(n) => {
                parent = pos;
                last_index = Some(n as u32);
                last_key = None;
                match array_elem(pos, n as u32)? {
                    Some((off, len)) => pos = subslice(pos, off, len),
                    None => {
                        not_found_tail(ops, idx)?;
                        if !matches!(mp::type_of(parent), Ok(mp::MpType::Array)) {
                            return Err(ops.list[idx]
                                .err_field("can not access by index a non-array field"));
                        }
                        let mut cur = parent;
                        let size = mp::read_array(&mut cur).map_err(field::mp_corrupt)?;
                        if n as u32 > size {
                            return Err(ops.list[idx].err_no_such_field());
                        }
                        // Index == size: the one in-bounds miss, meaning
                        // "insert at the end of this array".
                        found = false;
                        pos = &parent[parent.len()..];
                        return Ok(Located {
                            bar: BarUpdate {
                                data,
                                op: idx,
                                path,
                                parent,
                                point: pos,
                                new_key: None,
                            },
                            found,
                            last_index,
                            last_key,
                        });
                    }
                }
            }
            PathToken::Str(key) => {
                parent = pos;
                last_key = Some(key);
                last_index = None;
                match map_find(pos, key)? {
                    Some(hit) => pos = subslice(pos, hit.value_off, hit.value_len),
                    None => {
                        not_found_tail(ops, idx)?;
                        if !matches!(mp::type_of(parent), Ok(mp::MpType::Map)) {
                            return Err(ops.list[idx]
                                .err_field("can not access by key a non-map field"));
                        }
                        found = false;
                        new_key = Some(key);
                        return Ok(Located {
                            bar: BarUpdate {
                                data,
                                op: idx,
                                path,
                                parent,
                                point: &parent[parent.len()..],
                                new_key,
                            },
                            found,
                            last_index,
                            last_key,
                        });
                    }
                }
            }
            PathToken::Any => {
                let pos_sym = ops.list[idx].lexer.symbol_count;
                return Err(ops.list[idx].err_bad_path(pos_sym));
            }
        }
    }
}

/// After a missing path step, the rest of the path must be empty.
fn not_found_tail<'a>(ops: &mut Ops<'a>, idx: usize) -> Result<()> {
    let op = &mut ops.list[idx];
    match op.lexer.next_token() {
        Ok(PathToken::End) => Ok(()),
        Ok(_) => Err(op.err_no_such_field()),
        Err(p) => Err(op.err_bad_path(p)),
    }
}

/// Transition a NOP field under a pathful (or path-exhausted) op.
pub(crate) fn do_op_nop<'a>(
    ops: &mut Ops<'a>,
    idx: usize,
    field: &mut UpdateField<'a>,
) -> Result<()> {
    let UpdateField::Nop { data } = *field else {
        unreachable!("nop transition on a non-nop node");
    };
    match ops.list[idx].opcode {
        Opcode::Insert => {
            let located = bar_locate_opt(ops, idx, data)?;
            let mut bar = located.bar;
            let OpArg::Set(value) = ops.list[idx].arg else {
                unreachable!("insert op carries a set argument");
            };
            let mut new_len = value.len() as u32;
            if matches!(mp::type_of(bar.parent), Ok(mp::MpType::Map)) {
                if located.found {
                    return Err(UpdateError::Duplicate(
                        located.last_key.unwrap_or_default().to_string(),
                    ));
                }
                new_len += mp::sizeof_str(bar.new_key.map_or(0, str::len)) as u32;
            }
            ops.list[idx].new_field_len = new_len;
            bar.op = idx;
            *field = UpdateField::Bar(bar);
            Ok(())
        }
        Opcode::Set => {
            let located = bar_locate_opt(ops, idx, data)?;
            let bar = located.bar;
            let OpArg::Set(value) = ops.list[idx].arg else {
                unreachable!("set op carries a set argument");
            };
            let mut new_len = value.len() as u32;
            if !located.found {
                // Promote to an insertion; store/sizeof dispatch on the
                // opcode.
                ops.list[idx].opcode = Opcode::Insert;
                if matches!(mp::type_of(bar.parent), Ok(mp::MpType::Map)) {
                    new_len += mp::sizeof_str(bar.new_key.map_or(0, str::len)) as u32;
                }
            }
            ops.list[idx].new_field_len = new_len;
            *field = UpdateField::Bar(bar);
            Ok(())
        }
        Opcode::Delete => {
            let located = bar_locate_opt(ops, idx, data)?;
            let mut bar = located.bar;
            if !located.found {
                return Err(ops.list[idx].err_no_such_field());
            }
            if matches!(mp::type_of(bar.parent), Ok(mp::MpType::Array)) {
                let index = located.last_index.expect("array step recorded its index");
                let mut cur = bar.parent;
                let size = mp::read_array(&mut cur).map_err(field::mp_corrupt)?;
                let OpArg::Del(requested) = ops.list[idx].arg else {
                    unreachable!("delete op carries a count");
                };
                let count = requested.min(size - index);
                if count != requested {
                    ops.list[idx].arg = OpArg::Del(count);
                }
                // Widen the point over all deleted fields.
                let start = field::offset_in(bar.data, bar.point);
                let mut end_cur = &bar.data[start + bar.point.len()..];
                for _ in 1..count {
                    mp::skip(&mut end_cur).map_err(field::mp_corrupt)?;
                }
                let end = bar.data.len() - end_cur.len();
                bar.point = &bar.data[start..end];
            } else {
                let OpArg::Del(count) = ops.list[idx].arg else {
                    unreachable!("delete op carries a count");
                };
                if count != 1 {
                    return Err(
                        ops.list[idx].err_field("can delete only 1 field from a map in a row")
                    );
                }
                // Take the key into the deleted range so the pair goes
                // away whole.
                let key = located.last_key.expect("map step recorded its key");
                let hit = map_find(bar.parent, key)?
                    .ok_or_else(|| ops.list[idx].err_no_such_field())?;
                let widened = &bar.parent[hit.key_off..hit.value_off + hit.value_len];
                bar.point = widened;
            }
            *field = UpdateField::Bar(bar);
            Ok(())
        }
        Opcode::Add
        | Opcode::Sub
        | Opcode::BitAnd
        | Opcode::BitOr
        | Opcode::BitXor
        | Opcode::Splice => {
            let bar = bar_locate(ops, idx, data)?;
            crate::array::apply_scalar(&mut ops.list[idx], bar.point)?;
            *field = UpdateField::Bar(bar);
            Ok(())
        }
    }
}

impl<'a> BarUpdate<'a> {
    fn parent_header(&self) -> Result<(bool, u32, usize)> {
        let mut cur = self.parent;
        match mp::type_of(self.parent) {
            Ok(mp::MpType::Array) => {
                let n = mp::read_array(&mut cur).map_err(field::mp_corrupt)?;
                Ok((true, n, self.parent.len() - cur.len()))
            }
            Ok(mp::MpType::Map) => {
                let n = mp::read_map(&mut cur).map_err(field::mp_corrupt)?;
                Ok((false, n, self.parent.len() - cur.len()))
            }
            _ => Err(UpdateError::illegal("malformed tuple data")),
        }
    }

    /// Exact output size of the whole field.
    pub(crate) fn sizeof(&self, ops: &Ops<'_>) -> usize {
        let op = &ops.list[self.op];
        match op.opcode {
            Opcode::Insert => {
                let (is_array, n, _) = self.parent_header().expect("located parent");
                let size = self.data.len() + op.new_field_len as usize;
                let delta = if is_array {
                    mp::sizeof_array(n + 1) - mp::sizeof_array(n)
                } else {
                    mp::sizeof_map(n + 1) - mp::sizeof_map(n)
                };
                size + delta
            }
            Opcode::Delete => {
                let (is_array, n, _) = self.parent_header().expect("located parent");
                let size = self.data.len() - self.point.len();
                let (old_h, new_h) = if is_array {
                    let OpArg::Del(count) = op.arg else {
                        unreachable!("delete op carries a count");
                    };
                    (mp::sizeof_array(n), mp::sizeof_array(n - count))
                } else {
                    (mp::sizeof_map(n), mp::sizeof_map(n - 1))
                };
                size - old_h + new_h
            }
            _ => self.data.len() - self.point.len() + op.new_field_len as usize,
        }
    }

    /// Serialize the whole field.
    pub(crate) fn store(&self, ops: &Ops<'_>, out: &mut Vec<u8>) {
        let op = &ops.list[self.op];
        let parent_off = field::offset_in(self.data, self.parent);
        let point_off = field::offset_in(self.data, self.point);
        match op.opcode {
            Opcode::Insert => {
                let (is_array, n, header_len) =
                    self.parent_header().expect("located parent");
                out.extend_from_slice(&self.data[..parent_off]);
                if is_array {
                    mp::write_array(out, n + 1);
                    out.extend_from_slice(&self.data[parent_off + header_len..point_off]);
                    op.store(&[], out);
                    out.extend_from_slice(&self.data[point_off..]);
                } else {
                    mp::write_map(out, n + 1);
                    let key = self.new_key.expect("map insert recorded its key");
                    mp::write_str(out, key.as_bytes());
                    op.store(&[], out);
                    out.extend_from_slice(&self.data[parent_off + header_len..]);
                }
            }
            Opcode::Delete => {
                let (is_array, n, header_len) =
                    self.parent_header().expect("located parent");
                out.extend_from_slice(&self.data[..parent_off]);
                if is_array {
                    let OpArg::Del(count) = op.arg else {
                        unreachable!("delete op carries a count");
                    };
                    mp::write_array(out, n - count);
                } else {
                    mp::write_map(out, n - 1);
                }
                out.extend_from_slice(&self.data[parent_off + header_len..point_off]);
                out.extend_from_slice(&self.data[point_off + self.point.len()..]);
            }
            _ => {
                out.extend_from_slice(&self.data[..point_off]);
                op.store(self.point, out);
                out.extend_from_slice(&self.data[point_off + self.point.len()..]);
            }
        }
    }
}

impl std::fmt::Debug for BarUpdate<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BarUpdate(path={:?}, found_len={})", self.path, self.point.len())
    }
}
