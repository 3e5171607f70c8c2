//! The field tree.
//!
//! While operations apply, the tuple is represented as a tree of nodes
//! over the original bytes. Nothing is materialized until the final
//! store pass: every node knows its original byte extent, so untouched
//! ranges are copied verbatim with one `memcpy` each.
//!
//! The six node kinds and the transitions between them are implemented
//! across `array`, `map`, `bar` and `route`; this module holds the
//! union, the dispatchers and the MsgPack navigation helpers they
//! share.

use crate::array::ArrayUpdate;
use crate::bar::BarUpdate;
use crate::error::{Result, UpdateError};
use crate::map::MapUpdate;
use crate::op::Ops;
use crate::route::RouteUpdate;
use crate::{bar, map, route};
use twine_mp as mp;

/// One node of the update tree.
pub(crate) enum UpdateField<'a> {
    /// Unchanged bytes of the original tuple.
    Nop {
        /// The covered byte range.
        data: &'a [u8],
    },
    /// A field replaced by one scalar operation's result.
    Scalar {
        /// Original field bytes (splice reads pieces of them back).
        data: &'a [u8],
        /// Index of the operation whose result replaces the field.
        op: usize,
    },
    /// An array with structural changes, held as a rope.
    Array(ArrayUpdate<'a>),
    /// A map with pending edits.
    Map(MapUpdate<'a>),
    /// A pinpoint edit inside an otherwise unchanged region.
    Bar(BarUpdate<'a>),
    /// A shared path prefix leading to a single next hop.
    Route(RouteUpdate<'a>),
}

impl<'a> UpdateField<'a> {
    /// Original byte extent of the node, where one exists verbatim.
    pub(crate) fn data(&self) -> &'a [u8] {
        match self {
            UpdateField::Nop { data } | UpdateField::Scalar { data, .. } => data,
            UpdateField::Bar(b) => b.data,
            UpdateField::Route(r) => r.data,
            UpdateField::Array(_) | UpdateField::Map(_) => {
                unreachable!("containers do not keep a verbatim extent")
            }
        }
    }
}

impl std::fmt::Debug for UpdateField<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UpdateField::Nop { .. } => "Nop",
            UpdateField::Scalar { .. } => "Scalar",
            UpdateField::Array(_) => "Array",
            UpdateField::Map(_) => "Map",
            UpdateField::Bar(_) => "Bar",
            UpdateField::Route(_) => "Route",
        };
        f.write_str(name)
    }
}

/// Exact output size of a node.
pub(crate) fn field_sizeof(ops: &Ops<'_>, field: &UpdateField<'_>) -> usize {
    match field {
        UpdateField::Nop { data } => data.len(),
        UpdateField::Scalar { op, .. } => ops.list[*op].new_field_len as usize,
        UpdateField::Array(a) => a.sizeof(ops),
        UpdateField::Map(m) => m.sizeof(ops),
        UpdateField::Bar(b) => b.sizeof(ops),
        UpdateField::Route(r) => r.sizeof(ops),
    }
}

/// Serialize a node.
pub(crate) fn field_store(ops: &Ops<'_>, field: &UpdateField<'_>, out: &mut Vec<u8>) {
    match field {
        UpdateField::Nop { data } => out.extend_from_slice(data),
        UpdateField::Scalar { data, op } => ops.list[*op].store(data, out),
        UpdateField::Array(a) => a.store(ops, out),
        UpdateField::Map(m) => m.store(ops, out),
        UpdateField::Bar(b) => b.store(ops, out),
        UpdateField::Route(r) => r.store(ops, out),
    }
}

/// Apply operation `idx` to a node, dispatching on the node kind.
pub(crate) fn do_op<'a>(
    ops: &mut Ops<'a>,
    idx: usize,
    field: &mut UpdateField<'a>,
) -> Result<()> {
    match field {
        UpdateField::Nop { .. } => bar::do_op_nop(ops, idx, field),
        UpdateField::Scalar { .. } => Err(ops.list[idx].err_double()),
        UpdateField::Array(_) => crate::array::do_op(ops, idx, field),
        UpdateField::Map(_) => map::do_op(ops, idx, field),
        UpdateField::Bar(_) | UpdateField::Route(_) => route::do_op(ops, idx, field),
    }
}

// MsgPack navigation over the original tuple bytes. The tuple was
// validated on its way into the database, so decoding failures here are
// a malformed-input condition, not a per-field error.

pub(crate) fn mp_corrupt(_: mp::MpError) -> UpdateError {
    UpdateError::illegal("malformed tuple data")
}

/// Serialized length of the value starting at `data`.
pub(crate) fn value_len(data: &[u8]) -> Result<usize> {
    let mut cur = data;
    mp::skip(&mut cur).map_err(mp_corrupt)?;
    Ok(data.len() - cur.len())
}

/// Byte offset of `sub` within `base`; both must view the same buffer.
pub(crate) fn offset_in(base: &[u8], sub: &[u8]) -> usize {
    let base_ptr = base.as_ptr() as usize;
    let sub_ptr = sub.as_ptr() as usize;
    debug_assert!(sub_ptr >= base_ptr && sub_ptr + sub.len() <= base_ptr + base.len());
    sub_ptr - base_ptr
}

/// Locate element `index` of an array value (header included); returns
/// its `(offset, len)` within `value`, or None when out of range.
pub(crate) fn array_elem(value: &[u8], index: u32) -> Result<Option<(usize, usize)>> {
    let mut cur = value;
    let Ok(count) = mp::read_array(&mut cur) else {
        return Ok(None);
    };
    if index >= count {
        return Ok(None);
    }
    for _ in 0..index {
        mp::skip(&mut cur).map_err(mp_corrupt)?;
    }
    let off = offset_in(value, cur);
    let len = value_len(cur)?;
    Ok(Some((off, len)))
}

/// A key/value pair located inside a map value.
pub(crate) struct MapHit {
    /// Offset of the key within the map value.
    pub key_off: usize,
    /// Offset of the value.
    pub value_off: usize,
    /// Serialized length of the value.
    pub value_len: usize,
}

/// Find `key` in a map value (header included).
pub(crate) fn map_find(value: &[u8], key: &str) -> Result<Option<MapHit>> {
    let mut cur = value;
    let Ok(count) = mp::read_map(&mut cur) else {
        return Ok(None);
    };
    for _ in 0..count {
        let key_off = offset_in(value, cur);
        let found = match mp::type_of(cur) {
            Ok(mp::MpType::Str) => {
                let k = mp::read_str(&mut cur).map_err(mp_corrupt)?;
                k == key.as_bytes()
            }
            _ => {
                mp::skip(&mut cur).map_err(mp_corrupt)?;
                false
            }
        };
        if found {
            let value_off = offset_in(value, cur);
            let value_len = value_len(cur)?;
            return Ok(Some(MapHit {
                key_off,
                value_off,
                value_len,
            }));
        }
        mp::skip(&mut cur).map_err(mp_corrupt)?;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_elem_finds_offsets() {
        let mut buf = Vec::new();
        mp::write_array(&mut buf, 3);
        mp::write_uint(&mut buf, 7);
        mp::write_str(&mut buf, b"ab");
        mp::write_uint(&mut buf, 9);
        let (off, len) = array_elem(&buf, 1).unwrap().unwrap();
        let mut expected = Vec::new();
        mp::write_str(&mut expected, b"ab");
        assert_eq!(&buf[off..off + len], &expected[..]);
        assert!(array_elem(&buf, 3).unwrap().is_none());
    }

    #[test]
    fn map_find_reports_key_and_value() {
        let mut buf = Vec::new();
        mp::write_map(&mut buf, 2);
        mp::write_str(&mut buf, b"a");
        mp::write_uint(&mut buf, 1);
        mp::write_str(&mut buf, b"b");
        mp::write_uint(&mut buf, 200);
        let hit = map_find(&buf, "b").unwrap().unwrap();
        let mut expected = Vec::new();
        mp::write_uint(&mut expected, 200);
        assert_eq!(&buf[hit.value_off..hit.value_off + hit.value_len], &expected[..]);
        assert!(hit.key_off < hit.value_off);
        assert!(map_find(&buf, "c").unwrap().is_none());
    }
}
