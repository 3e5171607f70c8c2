//! Route nodes and path branching.
//!
//! When several operations share a JSON path prefix, the first one
//! leaves a bar; the second forces a *branch*: the shared prefix becomes
//! a route node whose next hop is a materialized array/map holding both
//! subtrees. Later operations with the same prefix skip the re-walk: a
//! route compares the prefix bytes and forwards with nothing but a
//! lexer offset bump.

use crate::array::ArrayUpdate;
use crate::error::{Result, UpdateError};
use crate::field::{self, array_elem, map_find, UpdateField};
use crate::map::MapUpdate;
use crate::op::{AddrToken, Ops};
use crate::path::{PathLexer, PathToken, PATH_INDEX_BASE};
use twine_mp as mp;

/// A shared-path-prefix node with a single next hop.
pub(crate) struct RouteUpdate<'a> {
    /// This field's whole original extent.
    pub data: &'a [u8],
    /// The shared prefix.
    pub path: &'a str,
    /// Original extent of the next hop inside `data`.
    pub next_data: &'a [u8],
    /// The subtree below the prefix.
    pub next: Box<UpdateField<'a>>,
}

impl<'a> RouteUpdate<'a> {
    /// Exact output size of the whole field.
    pub(crate) fn sizeof(&self, ops: &Ops<'_>) -> usize {
        self.data.len() - self.next_data.len() + field::field_sizeof(ops, &self.next)
    }

    /// Serialize the whole field.
    pub(crate) fn store(&self, ops: &Ops<'_>, out: &mut Vec<u8>) {
        let off = field::offset_in(self.data, self.next_data);
        out.extend_from_slice(&self.data[..off]);
        field::field_store(ops, &self.next, out);
        out.extend_from_slice(&self.data[off + self.next_data.len()..]);
    }
}

impl std::fmt::Debug for RouteUpdate<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RouteUpdate(path={:?})", self.path)
    }
}

/// Apply operation `idx` to a bar or route node.
pub(crate) fn do_op<'a>(ops: &mut Ops<'a>, idx: usize, field: &mut UpdateField<'a>) -> Result<()> {
    if let UpdateField::Route(r) = field {
        // Fast path: the op's path starts with the stored prefix, so the
        // route is followed with no JSON parsing and no MsgPack dive.
        let new_path = ops.list[idx].lexer.remainder();
        if ops.list[idx].token.is_none() && new_path.starts_with(r.path) {
            ops.list[idx].lexer.offset += r.path.len();
            return field::do_op(ops, idx, &mut r.next);
        }
    }
    branch(ops, idx, field)
}

fn branch<'a>(ops: &mut Ops<'a>, idx: usize, field: &mut UpdateField<'a>) -> Result<()> {
    let (old_path, data) = match &*field {
        UpdateField::Bar(b) => (b.path, b.data),
        UpdateField::Route(r) => (r.path, r.data),
        _ => unreachable!("branch starts from a bar or a route"),
    };

    // Walk both paths in lockstep until they diverge, following the
    // common steps down the original bytes.
    let mut old_lexer = PathLexer::new(old_path, PATH_INDEX_BASE);
    let mut parent: &'a [u8] = data;
    let mut saved_old_offset;
    let (old_token, new_token) = loop {
        saved_old_offset = old_lexer.offset;
        let old_token = old_lexer
            .next_token()
            .map_err(|p| ops.list[idx].err_bad_path(p))?;
        let new_token = {
            let op = &mut ops.list[idx];
            match op.lexer.next_token() {
                Ok(t) => t,
                Err(p) => return Err(op.err_bad_path(p)),
            }
        };
        if old_token != new_token {
            break (old_token, new_token);
        }
        match new_token {
            PathToken::Num(n) => {
                let (off, len) = array_elem(parent, n as u32)?
                    .ok_or_else(|| ops.list[idx].err_no_such_field())?;
                parent = &parent[off..off + len];
            }
            PathToken::Str(key) => {
                let hit = map_find(parent, key)?
                    .ok_or_else(|| ops.list[idx].err_no_such_field())?;
                parent = &parent[hit.value_off..hit.value_off + hit.value_len];
            }
            // Equal END tokens: the new op addresses exactly the path
            // the old subtree already updated.
            PathToken::End => return Err(ops.list[idx].err_double()),
            PathToken::Any => {
                let pos = ops.list[idx].lexer.symbol_count;
                return Err(ops.list[idx].err_bad_path(pos));
            }
        }
    };

    if old_token == PathToken::End {
        // The old subtree replaced this whole value; the new op dives
        // below it.
        return Err(UpdateError::Unsupported("intersected JSON paths"));
    }

    let path_offset = old_lexer.offset;
    let transform_root = saved_old_offset == 0;

    // Detach the old subtree and trim its path by the consumed prefix
    // plus its own position token. Most subtrees move into the new
    // parent as-is: a non-leaf changes nothing outside its own extent,
    // and a scalar bar already overwrote its arguments with its result,
    // so it must not run again. The exception is a path-exhausted bar
    // carrying `!` or `#`: those change the parent's field count and
    // header, which only the materialized parent can absorb, so the
    // operation is re-executed against it instead.
    let old_field = std::mem::replace(field, UpdateField::Nop { data: &[] });
    let mut reapply_op = None;
    let child = match old_field {
        UpdateField::Bar(mut b) => {
            b.path = &b.path[path_offset..];
            if b.path.is_empty() && ops.list[b.op].opcode.changes_field_count() {
                reapply_op = Some(b.op);
                None
            } else {
                Some(UpdateField::Bar(b))
            }
        }
        UpdateField::Route(mut r) => {
            let trimmed = &r.path[path_offset..];
            if trimmed.is_empty() {
                Some(*r.next)
            } else {
                r.path = trimmed;
                Some(UpdateField::Route(r))
            }
        }
        _ => unreachable!("branch starts from a bar or a route"),
    };

    // Materialize the container at the divergence point with both
    // subtrees in it.
    let next_hop = match mp::type_of(parent) {
        Ok(mp::MpType::Array) => {
            let (PathToken::Num(old_n), PathToken::Num(new_n)) = (old_token, new_token) else {
                return Err(ops.list[idx].err_field("can not update array by non-integer index"));
            };
            let node = match child {
                Some(mut child) => {
                    let (off, len) = array_elem(parent, old_n as u32)?
                        .ok_or_else(|| ops.list[idx].err_no_such_field())?;
                    refit_child(&mut child, &parent[off..off + len]);
                    UpdateField::Array(ArrayUpdate::with_child(parent, old_n as u32, child)?)
                }
                None => {
                    let mut node = UpdateField::Array(ArrayUpdate::from_value(parent)?);
                    let old_op = reapply_op.expect("re-applied child recorded its op");
                    ops.list[old_op].token = Some(AddrToken::Num(old_n));
                    field::do_op(ops, old_op, &mut node)?;
                    node
                }
            };
            ops.list[idx].token = Some(AddrToken::Num(new_n));
            node
        }
        Ok(mp::MpType::Map) => {
            let (PathToken::Str(old_key), PathToken::Str(new_key)) = (old_token, new_token)
            else {
                return Err(ops.list[idx].err_field("can not update map by non-string key"));
            };
            let node = match child {
                Some(mut child) => {
                    let hit = map_find(parent, old_key)?
                        .ok_or_else(|| ops.list[idx].err_no_such_field())?;
                    refit_child(&mut child, &parent[hit.value_off..hit.value_off + hit.value_len]);
                    UpdateField::Map(MapUpdate::with_child(parent, old_key, child)?)
                }
                None => {
                    let mut node = UpdateField::Map(MapUpdate::from_value(parent)?);
                    let old_op = reapply_op.expect("re-applied child recorded its op");
                    ops.list[old_op].token = Some(AddrToken::Key(old_key));
                    field::do_op(ops, old_op, &mut node)?;
                    node
                }
            };
            ops.list[idx].token = Some(AddrToken::Key(new_key));
            node
        }
        _ => return Err(ops.list[idx].err_no_such_field()),
    };

    // Install the new structure before applying the op, so a per-op
    // failure in upsert mode leaves a consistent tree behind.
    if transform_root {
        // Zero common prefix: the field itself becomes the container.
        *field = next_hop;
        field::do_op(ops, idx, field)
    } else {
        *field = UpdateField::Route(RouteUpdate {
            data,
            path: &old_path[..saved_old_offset],
            next_data: parent,
            next: Box::new(next_hop),
        });
        let UpdateField::Route(route) = field else {
            unreachable!("just installed a route");
        };
        field::do_op(ops, idx, &mut route.next)
    }
}

/// A relocated subtree's verbatim extent becomes the element it now
/// occupies; interior slices (bar point/parent, route next hop) already
/// lie inside it.
fn refit_child<'a>(child: &mut UpdateField<'a>, element: &'a [u8]) {
    match child {
        UpdateField::Bar(b) => b.data = element,
        UpdateField::Route(r) => r.data = element,
        // Arrays, maps and scalars carry their own exact extents.
        _ => {}
    }
}
