//! A rope over field-tree nodes.
//!
//! Arrays under update are represented as a balanced tree whose leaves
//! cover runs of consecutive fields: a run of untouched fields is one
//! leaf until an operation needs a field out of it, at which point the
//! run is split so the target stands alone. Index, insert and delete
//! are O(log n) and never copy field data.
//!
//! The balancing scheme is a treap with deterministic per-rope
//! priorities; nodes live in an arena `Vec` so handles stay valid
//! across restructures.

use crate::error::Result;
use crate::field::UpdateField;

/// Handle of a rope node; stable for the rope's lifetime.
pub(crate) type NodeId = usize;

struct Node<'a> {
    left: Option<NodeId>,
    right: Option<NodeId>,
    prio: u64,
    /// Fields covered by this node's own payload.
    span: u32,
    /// Fields covered by the whole subtree.
    total: u32,
    field: UpdateField<'a>,
}

/// Splits a multi-field payload into the first `k` fields and the rest.
pub(crate) type Splitter<'a> =
    dyn Fn(&UpdateField<'a>, u32) -> Result<(UpdateField<'a>, UpdateField<'a>)> + 'a;

pub(crate) struct Rope<'a> {
    nodes: Vec<Node<'a>>,
    root: Option<NodeId>,
    rng: u64,
}

impl<'a> Rope<'a> {
    pub(crate) fn new() -> Self {
        Self {
            nodes: Vec::new(),
            root: None,
            rng: 0x9e3779b97f4a7c15,
        }
    }

    /// Total number of fields covered.
    pub(crate) fn count(&self) -> u32 {
        self.root.map_or(0, |r| self.nodes[r].total)
    }

    fn next_prio(&mut self) -> u64 {
        self.rng = self
            .rng
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.rng
    }

    fn new_node(&mut self, field: UpdateField<'a>, span: u32) -> NodeId {
        let prio = self.next_prio();
        self.nodes.push(Node {
            left: None,
            right: None,
            prio,
            span,
            total: span,
            field,
        });
        self.nodes.len() - 1
    }

    fn total(&self, node: Option<NodeId>) -> u32 {
        node.map_or(0, |n| self.nodes[n].total)
    }

    fn update(&mut self, node: NodeId) {
        let left = self.total(self.nodes[node].left);
        let right = self.total(self.nodes[node].right);
        self.nodes[node].total = left + self.nodes[node].span + right;
    }

    fn merge(&mut self, a: Option<NodeId>, b: Option<NodeId>) -> Option<NodeId> {
        match (a, b) {
            (None, b) => b,
            (a, None) => a,
            (Some(x), Some(y)) => {
                if self.nodes[x].prio >= self.nodes[y].prio {
                    let r = self.nodes[x].right;
                    let merged = self.merge(r, Some(y));
                    self.nodes[x].right = merged;
                    self.update(x);
                    Some(x)
                } else {
                    let l = self.nodes[y].left;
                    let merged = self.merge(Some(x), l);
                    self.nodes[y].left = merged;
                    self.update(y);
                    Some(y)
                }
            }
        }
    }

    /// Split the tree into `[0, pos)` and `[pos, ..)`, cutting a
    /// multi-field payload with `splitter` when `pos` falls inside one.
    fn split(
        &mut self,
        node: Option<NodeId>,
        pos: u32,
        splitter: &Splitter<'a>,
    ) -> Result<(Option<NodeId>, Option<NodeId>)> {
        let Some(n) = node else {
            return Ok((None, None));
        };
        let left_total = self.total(self.nodes[n].left);
        if pos <= left_total {
            let l = self.nodes[n].left.take();
            let (a, b) = self.split(l, pos, splitter)?;
            self.nodes[n].left = b;
            self.update(n);
            Ok((a, Some(n)))
        } else if pos >= left_total + self.nodes[n].span {
            let r = self.nodes[n].right.take();
            let (a, b) = self.split(r, pos - left_total - self.nodes[n].span, splitter)?;
            self.nodes[n].right = a;
            self.update(n);
            Ok((Some(n), b))
        } else {
            // The position cuts this node's own payload.
            let k = pos - left_total;
            let span = self.nodes[n].span;
            let (head, tail) = splitter(&self.nodes[n].field, k)?;
            self.nodes[n].field = head;
            self.nodes[n].span = k;
            let tail_node = self.new_node(tail, span - k);
            let r = self.nodes[n].right.take();
            let right_part = self.merge(Some(tail_node), r);
            self.update(n);
            Ok((Some(n), right_part))
        }
    }

    /// Append a payload covering `span` fields.
    pub(crate) fn append(&mut self, field: UpdateField<'a>, span: u32) {
        let n = self.new_node(field, span);
        self.root = self.merge(self.root, Some(n));
    }

    /// Insert a single-field payload before position `pos`.
    pub(crate) fn insert(
        &mut self,
        pos: u32,
        field: UpdateField<'a>,
        splitter: &Splitter<'a>,
    ) -> Result<()> {
        debug_assert!(pos <= self.count());
        let root = self.root.take();
        let (a, b) = self.split(root, pos, splitter)?;
        let n = self.new_node(field, 1);
        let left = self.merge(a, Some(n));
        self.root = self.merge(left, b);
        Ok(())
    }

    /// Remove the field at `pos`.
    pub(crate) fn erase(&mut self, pos: u32, splitter: &Splitter<'a>) -> Result<()> {
        debug_assert!(pos < self.count());
        let root = self.root.take();
        let (a, b) = self.split(root, pos, splitter)?;
        let (_, c) = self.split(b, 1, splitter)?;
        // The erased node stays in the arena; ropes live for one
        // request, so the garbage is bounded by the operation count.
        self.root = self.merge(a, c);
        Ok(())
    }

    /// Isolate position `pos` into its own node and return its handle.
    pub(crate) fn extract(&mut self, pos: u32, splitter: &Splitter<'a>) -> Result<NodeId> {
        debug_assert!(pos < self.count());
        let root = self.root.take();
        let (a, b) = self.split(root, pos, splitter)?;
        let (m, c) = self.split(b, 1, splitter)?;
        let id = m.expect("non-empty middle after split around pos");
        debug_assert_eq!(self.nodes[id].span, 1);
        debug_assert!(self.nodes[id].left.is_none() && self.nodes[id].right.is_none());
        let left = self.merge(a, m);
        self.root = self.merge(left, c);
        Ok(id)
    }

    pub(crate) fn field(&self, id: NodeId) -> &UpdateField<'a> {
        &self.nodes[id].field
    }

    pub(crate) fn field_mut(&mut self, id: NodeId) -> &mut UpdateField<'a> {
        &mut self.nodes[id].field
    }

    /// In-order visit of `(payload, span)` pairs.
    pub(crate) fn for_each<F: FnMut(&UpdateField<'a>, u32)>(&self, mut f: F) {
        fn walk<'a, F: FnMut(&UpdateField<'a>, u32)>(rope: &Rope<'a>, node: Option<NodeId>, f: &mut F) {
            let Some(n) = node else { return };
            walk(rope, rope.nodes[n].left, f);
            f(&rope.nodes[n].field, rope.nodes[n].span);
            walk(rope, rope.nodes[n].right, f);
        }
        walk(self, self.root, &mut f);
    }
}

impl std::fmt::Debug for Rope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Rope(count={}, nodes={})", self.count(), self.nodes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Payload stand-in: a Nop over a synthetic byte range where each
    // field is exactly one byte, so the splitter is trivial.
    fn nop(data: &[u8]) -> UpdateField<'_> {
        UpdateField::Nop { data }
    }

    fn byte_splitter<'a>() -> Box<Splitter<'a>> {
        Box::new(|field, k| {
            let UpdateField::Nop { data } = field else {
                panic!("only runs are split");
            };
            let (a, b) = data.split_at(k as usize);
            Ok((UpdateField::Nop { data: a }, UpdateField::Nop { data: b }))
        })
    }

    fn contents(rope: &Rope<'_>) -> Vec<u8> {
        let mut out = Vec::new();
        rope.for_each(|f, _| {
            if let UpdateField::Nop { data } = f {
                out.extend_from_slice(data);
            }
        });
        out
    }

    #[test]
    fn append_and_count() {
        let data = b"abcde";
        let mut rope = Rope::new();
        rope.append(nop(data), 5);
        assert_eq!(rope.count(), 5);
        assert_eq!(contents(&rope), data);
    }

    #[test]
    fn extract_isolates_a_field() {
        let data = b"abcde";
        let mut rope = Rope::new();
        rope.append(nop(data), 5);
        let splitter = byte_splitter();
        let id = rope.extract(2, &splitter).unwrap();
        assert_eq!(rope.count(), 5);
        if let UpdateField::Nop { data } = rope.field(id) {
            assert_eq!(*data, b"c");
        } else {
            panic!("extracted field is a run");
        }
        assert_eq!(contents(&rope), data);
    }

    #[test]
    fn insert_at_every_position() {
        let data = b"ace";
        for pos in 0..=3u32 {
            let mut rope = Rope::new();
            rope.append(nop(data), 3);
            let splitter = byte_splitter();
            rope.insert(pos, nop(b"X"), &splitter).unwrap();
            assert_eq!(rope.count(), 4);
            let mut expected = data.to_vec();
            expected.insert(pos as usize, b'X');
            assert_eq!(contents(&rope), expected);
        }
    }

    #[test]
    fn erase_at_every_position() {
        let data = b"abcd";
        for pos in 0..4u32 {
            let mut rope = Rope::new();
            rope.append(nop(data), 4);
            let splitter = byte_splitter();
            rope.erase(pos, &splitter).unwrap();
            assert_eq!(rope.count(), 3);
            let mut expected = data.to_vec();
            expected.remove(pos as usize);
            assert_eq!(contents(&rope), expected);
        }
    }

    #[test]
    fn many_operations_preserve_order() {
        let data = b"0123456789";
        let mut rope = Rope::new();
        rope.append(nop(data), 10);
        let splitter = byte_splitter();
        rope.erase(9, &splitter).unwrap();
        rope.erase(0, &splitter).unwrap();
        rope.insert(0, nop(b"x"), &splitter).unwrap();
        rope.insert(9, nop(b"y"), &splitter).unwrap();
        let id = rope.extract(4, &splitter).unwrap();
        assert!(matches!(rope.field(id), UpdateField::Nop { data: b } if *b == b"4"));
        assert_eq!(contents(&rope), b"x12345678y");
    }
}
