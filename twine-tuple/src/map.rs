//! Map nodes of the field tree.
//!
//! A map under update keeps its original bytes untouched and collects
//! an append-only edit list of `(key, change)` pairs, consulted before
//! the originals on every lookup. The store pass walks the original
//! pairs in order, substituting or dropping edited ones, and appends
//! inserted pairs at the end.

use crate::error::{Result, UpdateError};
use crate::field::{self, map_find, UpdateField};
use crate::op::{AddrToken, OpArg, Opcode, Ops};
use twine_mp as mp;

pub(crate) enum EditKind<'a> {
    /// The key's value is replaced by a child node.
    Replace(UpdateField<'a>),
    /// A new pair is appended.
    Insert(UpdateField<'a>),
    /// The pair (key and value) is dropped.
    Delete,
}

pub(crate) struct MapEdit<'a> {
    key: &'a str,
    kind: EditKind<'a>,
}

/// A map with pending edits.
pub(crate) struct MapUpdate<'a> {
    /// Full original value, header included.
    value: &'a [u8],
    /// Pair area, header stripped.
    body: &'a [u8],
    /// Original pair count.
    count: u32,
    edits: Vec<MapEdit<'a>>,
}

impl<'a> MapUpdate<'a> {
    /// Build over a full map value.
    pub(crate) fn from_value(value: &'a [u8]) -> Result<Self> {
        let mut cur = value;
        let count = mp::read_map(&mut cur).map_err(field::mp_corrupt)?;
        Ok(Self {
            value,
            body: cur,
            count,
            edits: Vec::new(),
        })
    }

    /// Build over a full map value with `child` already standing in for
    /// the value of `key` (branch relocation).
    pub(crate) fn with_child(
        value: &'a [u8],
        key: &'a str,
        child: UpdateField<'a>,
    ) -> Result<Self> {
        let mut map = Self::from_value(value)?;
        map.edits.push(MapEdit {
            key,
            kind: EditKind::Replace(child),
        });
        Ok(map)
    }

    fn edit_pos(&self, key: &str) -> Option<usize> {
        self.edits.iter().position(|e| e.key == key)
    }

    fn new_count(&self) -> u32 {
        let mut count = self.count;
        for e in &self.edits {
            match e.kind {
                EditKind::Insert(_) => count += 1,
                EditKind::Delete => count -= 1,
                EditKind::Replace(_) => {}
            }
        }
        count
    }

    /// Walk original pairs, reporting `(key_str, key_bytes_len,
    /// value_slice)` per pair.
    fn for_each_pair<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(Option<&'a str>, &'a [u8], &'a [u8]),
    {
        let mut cur = self.body;
        for _ in 0..self.count {
            let key_start = cur;
            let key = match mp::type_of(cur) {
                Ok(mp::MpType::Str) => Some(
                    mp::read_str_utf8(&mut cur).map_err(field::mp_corrupt)?,
                ),
                _ => {
                    mp::skip(&mut cur).map_err(field::mp_corrupt)?;
                    None
                }
            };
            let key_len = key_start.len() - cur.len();
            let value_start = cur;
            mp::skip(&mut cur).map_err(field::mp_corrupt)?;
            let value_len = value_start.len() - cur.len();
            f(key, &key_start[..key_len], &value_start[..value_len]);
        }
        Ok(())
    }

    /// Exact output size, header included.
    pub(crate) fn sizeof(&self, ops: &Ops<'_>) -> usize {
        let mut size = mp::sizeof_map(self.new_count());
        self.for_each_pair(|key, key_bytes, value| {
            match key.and_then(|k| self.edit_pos(k)).map(|p| &self.edits[p].kind) {
                Some(EditKind::Replace(child)) => {
                    size += key_bytes.len() + field::field_sizeof(ops, child);
                }
                Some(EditKind::Delete) => {}
                Some(EditKind::Insert(_)) | None => {
                    size += key_bytes.len() + value.len();
                }
            }
        })
        .expect("map bytes were navigated before");
        for e in &self.edits {
            if let EditKind::Insert(child) = &e.kind {
                size += mp::sizeof_str(e.key.len()) + field::field_sizeof(ops, child);
            }
        }
        size
    }

    /// Serialize, header included.
    pub(crate) fn store(&self, ops: &Ops<'_>, out: &mut Vec<u8>) {
        mp::write_map(out, self.new_count());
        self.for_each_pair(|key, key_bytes, value| {
            match key.and_then(|k| self.edit_pos(k)).map(|p| &self.edits[p].kind) {
                Some(EditKind::Replace(child)) => {
                    out.extend_from_slice(key_bytes);
                    field::field_store(ops, child, out);
                }
                Some(EditKind::Delete) => {}
                Some(EditKind::Insert(_)) | None => {
                    out.extend_from_slice(key_bytes);
                    out.extend_from_slice(value);
                }
            }
        })
        .expect("map bytes were navigated before");
        for e in &self.edits {
            if let EditKind::Insert(child) = &e.kind {
                mp::write_str(out, e.key.as_bytes());
                field::field_store(ops, child, out);
            }
        }
    }
}

impl std::fmt::Debug for MapUpdate<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MapUpdate(count={}, edits={})", self.count, self.edits.len())
    }
}

/// Apply operation `idx` at this map level.
pub(crate) fn do_op<'a>(ops: &mut Ops<'a>, idx: usize, field: &mut UpdateField<'a>) -> Result<()> {
    let UpdateField::Map(m) = field else {
        unreachable!("map dispatch on a non-map node");
    };
    let token = ops.list[idx].next_token()?;
    let key = match token {
        AddrToken::Key(k) => k,
        AddrToken::Num(_) => {
            return Err(ops.list[idx].err_field("can not update map by non-string key"))
        }
    };
    if ops.list[idx].is_term() {
        return do_op_term(ops, idx, m, key);
    }
    // Descend, consulting pending edits before the original pairs.
    if let Some(pos) = m.edit_pos(key) {
        return match &mut m.edits[pos].kind {
            EditKind::Replace(child) | EditKind::Insert(child) => field::do_op(ops, idx, child),
            EditKind::Delete => Err(ops.list[idx].err_no_such_field()),
        };
    }
    let hit = map_find(m.value, key)?.ok_or_else(|| ops.list[idx].err_no_such_field())?;
    let mut child = UpdateField::Nop {
        data: &m.value[hit.value_off..hit.value_off + hit.value_len],
    };
    field::do_op(ops, idx, &mut child)?;
    m.edits.push(MapEdit {
        key,
        kind: EditKind::Replace(child),
    });
    Ok(())
}

fn do_op_term<'a>(
    ops: &mut Ops<'a>,
    idx: usize,
    m: &mut MapUpdate<'a>,
    key: &'a str,
) -> Result<()> {
    let has_edit = m.edit_pos(key).is_some();
    match ops.list[idx].opcode {
        Opcode::Set => {
            if has_edit {
                return Err(ops.list[idx].err_double());
            }
            let OpArg::Set(value) = ops.list[idx].arg else {
                unreachable!("set op carries a set argument");
            };
            ops.list[idx].new_field_len = value.len() as u32;
            let kind = match map_find(m.value, key)? {
                Some(hit) => EditKind::Replace(UpdateField::Scalar {
                    data: &m.value[hit.value_off..hit.value_off + hit.value_len],
                    op: idx,
                }),
                // '=' on a missing key auto-inserts.
                None => EditKind::Insert(UpdateField::Nop { data: value }),
            };
            m.edits.push(MapEdit { key, kind });
            Ok(())
        }
        Opcode::Insert => {
            if has_edit || map_find(m.value, key)?.is_some() {
                return Err(UpdateError::Duplicate(key.to_string()));
            }
            let OpArg::Set(value) = ops.list[idx].arg else {
                unreachable!("insert op carries a set argument");
            };
            m.edits.push(MapEdit {
                key,
                kind: EditKind::Insert(UpdateField::Nop { data: value }),
            });
            Ok(())
        }
        Opcode::Delete => {
            let OpArg::Del(count) = ops.list[idx].arg else {
                unreachable!("delete op carries a count");
            };
            if count != 1 {
                return Err(ops.list[idx].err_field("can delete only 1 field from a map in a row"));
            }
            if has_edit {
                return Err(ops.list[idx].err_double());
            }
            if map_find(m.value, key)?.is_none() {
                return Err(ops.list[idx].err_no_such_field());
            }
            m.edits.push(MapEdit {
                key,
                kind: EditKind::Delete,
            });
            Ok(())
        }
        Opcode::Add
        | Opcode::Sub
        | Opcode::BitAnd
        | Opcode::BitOr
        | Opcode::BitXor
        | Opcode::Splice => {
            if has_edit {
                return Err(ops.list[idx].err_double());
            }
            let hit = map_find(m.value, key)?.ok_or_else(|| ops.list[idx].err_no_such_field())?;
            let old = &m.value[hit.value_off..hit.value_off + hit.value_len];
            crate::array::apply_scalar(&mut ops.list[idx], old)?;
            m.edits.push(MapEdit {
                key,
                kind: EditKind::Replace(UpdateField::Scalar { data: old, op: idx }),
            });
            Ok(())
        }
    }
}
