/*!
Interval index over node address ranges.

A binary segment tree spanning the whole 64-bit address space. Leaves hold
the items whose intervals touch them and split at their midpoint once they
fill up; an item spanning the split point is kept in both halves. Every
tree node carries aggregate properties of the items below it, recomputed
bottom-up on insert, so range statistics and overlap queries run in
O(log n + k).
*/

use super::node::NodeId;
use crate::symbols::TypeCategory;
use crate::types::Address;

use smallvec::SmallVec;

/// A leaf splits once it holds more than this many distinct items.
const LEAF_MAX_ITEMS: usize = 8;
/// Leaves covering at most this many bytes are never split.
const MIN_SPAN: u64 = 0xf;

/// Aggregate statistics over the items below a tree node.
///
/// Uniting properties of overlapping objects may over-count
/// `object_count`, and aggregated bounds only ever widen: a probability
/// lowered in place after indexing leaves the old bound standing as a
/// conservative envelope. The category set stays exact.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RangeProps {
    pub min_probability: f32,
    pub max_probability: f32,
    pub object_count: usize,
    pub categories: TypeCategory,
}

impl Default for RangeProps {
    fn default() -> Self {
        Self {
            min_probability: 1.0,
            max_probability: 0.0,
            object_count: 0,
            categories: TypeCategory::empty(),
        }
    }
}

impl RangeProps {
    pub fn is_empty(&self) -> bool {
        self.object_count == 0
    }

    /// Folds a single observation into the aggregate. `new_item` is false
    /// when an already-indexed node is re-observed after a merge; that
    /// widens the probability bounds without inflating the count.
    fn observe(&mut self, probability: f32, categories: TypeCategory, new_item: bool) {
        if probability < self.min_probability {
            self.min_probability = probability;
        }
        if probability > self.max_probability {
            self.max_probability = probability;
        }
        self.categories |= categories;
        if new_item {
            self.object_count += 1;
        }
    }

    /// Unites these properties with `other`.
    pub fn unite(&mut self, other: &RangeProps) {
        if other.is_empty() {
            return;
        }
        if other.min_probability < self.min_probability {
            self.min_probability = other.min_probability;
        }
        if other.max_probability > self.max_probability {
            self.max_probability = other.max_probability;
        }
        self.categories |= other.categories;
        self.object_count += other.object_count;
    }
}

#[derive(Copy, Clone, Debug)]
struct ItemRec {
    start: u64,
    /// Inclusive end of the item's extent.
    end: u64,
    id: NodeId,
    probability: f32,
    categories: TypeCategory,
}

struct TreeNode {
    start: u64,
    /// Inclusive end of the covered address range.
    end: u64,
    left: Option<u32>,
    right: Option<u32>,
    props: RangeProps,
    items: SmallVec<[ItemRec; 8]>,
}

impl TreeNode {
    fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            left: None,
            right: None,
            props: RangeProps::default(),
            items: SmallVec::new(),
        }
    }

    fn is_leaf(&self) -> bool {
        self.left.is_none()
    }

    /// End address of the left half after a split.
    fn split_addr(&self) -> u64 {
        self.start + ((self.end - self.start) >> 1)
    }
}

/// Segment tree over [`MemoryMapNode`](super::MemoryMapNode) address
/// intervals, holding non-owning ids into the node store.
pub struct RangeTree {
    nodes: Vec<TreeNode>,
}

impl Default for RangeTree {
    fn default() -> Self {
        Self {
            nodes: vec![TreeNode::new(0, !0)],
        }
    }
}

impl RangeTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aggregate over everything in the index.
    pub fn props(&self) -> &RangeProps {
        &self.nodes[0].props
    }

    pub fn object_count(&self) -> usize {
        self.nodes[0].props.object_count
    }

    /// Indexes (or re-observes) a node's extent. A zero-sized extent is
    /// treated as one byte so that every node is queryable.
    pub fn insert(
        &mut self,
        id: NodeId,
        addr: Address,
        size: usize,
        probability: f32,
        categories: TypeCategory,
    ) {
        let start = addr.as_u64();
        let end = start.saturating_add(size.max(1) as u64 - 1);
        self.insert_at(
            0,
            ItemRec {
                start,
                end,
                id,
                probability,
                categories,
            },
        );
    }

    fn insert_at(&mut self, idx: usize, item: ItemRec) -> bool {
        let added = if self.nodes[idx].is_leaf() {
            let node = &mut self.nodes[idx];
            match node.items.iter_mut().find(|i| i.id == item.id) {
                Some(existing) => {
                    // re-observation after a merge or penalty: the caller
                    // passes the node's current probability
                    existing.probability = item.probability;
                    existing.categories |= item.categories;
                    false
                }
                None => {
                    node.items.push(item);
                    let span = node.end - node.start;
                    if node.items.len() > LEAF_MAX_ITEMS && span > MIN_SPAN {
                        self.split(idx);
                    }
                    true
                }
            }
        } else {
            let split = self.nodes[idx].split_addr();
            let (left, right) = (self.nodes[idx].left, self.nodes[idx].right);
            let mut added = false;
            if item.start <= split {
                added |= self.insert_at(left.unwrap() as usize, item);
            }
            if item.end > split {
                added |= self.insert_at(right.unwrap() as usize, item);
            }
            added
        };
        self.nodes[idx]
            .props
            .observe(item.probability, item.categories, added);
        added
    }

    fn split(&mut self, idx: usize) {
        let (start, end, split) = {
            let node = &self.nodes[idx];
            (node.start, node.end, node.split_addr())
        };
        let left = self.nodes.len() as u32;
        self.nodes.push(TreeNode::new(start, split));
        let right = self.nodes.len() as u32;
        self.nodes.push(TreeNode::new(split + 1, end));

        let items = std::mem::replace(&mut self.nodes[idx].items, SmallVec::new());
        self.nodes[idx].left = Some(left);
        self.nodes[idx].right = Some(right);
        // redistribute; items spanning the split point live in both
        // halves. The parent's props already cover these items, only the
        // child props accumulate here.
        for item in items {
            if item.start <= split {
                self.insert_at(left as usize, item);
            }
            if item.end > split {
                self.insert_at(right as usize, item);
            }
        }
    }

    /// All indexed ids whose interval intersects `[start, end)`, in
    /// ascending order of their start address.
    pub fn query(&self, start: Address, end: Address) -> Vec<NodeId> {
        if end <= start {
            return Vec::new();
        }
        let (qs, qe) = (start.as_u64(), end.as_u64() - 1);
        let mut hits: Vec<(u64, NodeId)> = Vec::new();
        self.query_at(0, qs, qe, &mut hits);
        hits.sort_unstable();
        hits.dedup();
        hits.into_iter().map(|(_, id)| id).collect()
    }

    fn query_at(&self, idx: usize, qs: u64, qe: u64, out: &mut Vec<(u64, NodeId)>) {
        let node = &self.nodes[idx];
        if qe < node.start || qs > node.end || node.props.is_empty() {
            return;
        }
        if node.is_leaf() {
            for item in &node.items {
                if item.start <= qe && item.end >= qs {
                    out.push((item.start, item.id));
                }
            }
        } else {
            self.query_at(node.left.unwrap() as usize, qs, qe, out);
            self.query_at(node.right.unwrap() as usize, qs, qe, out);
        }
    }

    /// Aggregate properties over all items intersecting `[start, end)`.
    pub fn props_in_range(&self, start: Address, end: Address) -> RangeProps {
        let mut props = RangeProps::default();
        if end <= start {
            return props;
        }
        let (qs, qe) = (start.as_u64(), end.as_u64() - 1);
        self.props_at(0, qs, qe, &mut props);
        props
    }

    fn props_at(&self, idx: usize, qs: u64, qe: u64, out: &mut RangeProps) {
        let node = &self.nodes[idx];
        if qe < node.start || qs > node.end || node.props.is_empty() {
            return;
        }
        if qs <= node.start && node.end <= qe {
            out.unite(&node.props);
            return;
        }
        if node.is_leaf() {
            for item in &node.items {
                if item.start <= qe && item.end >= qs {
                    out.observe(item.probability, item.categories, true);
                }
            }
        } else {
            self.props_at(node.left.unwrap() as usize, qs, qe, out);
            self.props_at(node.right.unwrap() as usize, qs, qe, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use rand::SeedableRng;
    use rand_xorshift::XorShiftRng;

    fn insert(tree: &mut RangeTree, id: u32, start: u64, size: usize, prob: f32) {
        tree.insert(
            NodeId(id),
            Address::from(start),
            size,
            prob,
            TypeCategory::STRUCT,
        );
    }

    #[test]
    fn query_exact_intersection_sorted() {
        let mut tree = RangeTree::new();
        insert(&mut tree, 0, 0x1000, 0x10, 0.9);
        insert(&mut tree, 1, 0x1010, 0x10, 0.8);
        insert(&mut tree, 2, 0x2000, 0x100, 0.7);
        insert(&mut tree, 3, 0x3000, 0x8, 0.6);

        // covers the tail of item 0, all of 1, the head of 2
        let hits = tree.query(Address::from(0x100fu64), Address::from(0x2001u64));
        assert_eq!(hits, vec![NodeId(0), NodeId(1), NodeId(2)]);

        // empty and non-intersecting ranges
        assert!(tree.query(Address::from(0x1000u64), Address::from(0x1000u64)).is_empty());
        assert!(tree.query(Address::from(0x4000u64), Address::from(0x5000u64)).is_empty());

        // exact boundary: end is exclusive
        let hits = tree.query(Address::from(0xfu64), Address::from(0x1000u64));
        assert!(hits.is_empty());
    }

    #[test]
    fn aggregates_track_min_max_and_count() {
        let mut tree = RangeTree::new();
        insert(&mut tree, 0, 0x1000, 0x10, 0.9);
        insert(&mut tree, 1, 0x1100, 0x10, 0.3);
        tree.insert(
            NodeId(2),
            Address::from(0x1200u64),
            8,
            0.5,
            TypeCategory::POINTER,
        );

        let props = tree.props();
        assert_eq!(props.object_count, 3);
        assert_eq!(props.min_probability, 0.3);
        assert_eq!(props.max_probability, 0.9);
        assert_eq!(props.categories, TypeCategory::STRUCT | TypeCategory::POINTER);

        let partial = tree.props_in_range(Address::from(0x1100u64), Address::from(0x1300u64));
        assert_eq!(partial.object_count, 2);
        assert_eq!(partial.max_probability, 0.5);
    }

    #[test]
    fn reobservation_widens_without_counting() {
        let mut tree = RangeTree::new();
        insert(&mut tree, 0, 0x1000, 0x10, 0.4);
        insert(&mut tree, 0, 0x1000, 0x10, 0.7);
        assert_eq!(tree.object_count(), 1);
        assert_eq!(tree.props().max_probability, 0.7);
    }

    #[test]
    fn reobservation_tracks_the_current_probability() {
        let mut tree = RangeTree::new();
        insert(&mut tree, 0, 0x1000, 0x10, 1.0);
        // the node's probability was lowered in place after indexing
        insert(&mut tree, 0, 0x1000, 0x10, 0.7);
        assert_eq!(tree.object_count(), 1);
        let props = tree.props_in_range(Address::from(0x1000u64), Address::from(0x1010u64));
        assert_eq!(props.min_probability, 0.7);
        assert_eq!(props.max_probability, 0.7);
    }

    #[test]
    fn splitting_keeps_queries_correct() {
        let mut tree = RangeTree::new();
        // force many items into one region so leaves split
        for i in 0..64u64 {
            insert(&mut tree, i as u32, 0x1000 + i * 0x20, 0x20, 0.5);
        }
        // an item spanning a wide range lands in many leaves but is
        // reported once
        insert(&mut tree, 100, 0x0800, 0x2000, 0.9);

        let hits = tree.query(Address::from(0x1000u64), Address::from(0x1040u64));
        assert_eq!(hits, vec![NodeId(100), NodeId(0), NodeId(1)]);
        assert_eq!(tree.object_count(), 65);
    }

    #[test]
    fn randomized_against_brute_force() {
        let mut rng = XorShiftRng::seed_from_u64(0x1337);
        let mut tree = RangeTree::new();
        let mut reference: Vec<(u64, u64, NodeId)> = Vec::new();

        for i in 0..500u32 {
            let start: u64 = rng.gen_range(0, 0x10000);
            let size: usize = rng.gen_range(1, 0x200);
            insert(&mut tree, i, start, size, 0.5);
            reference.push((start, start + size as u64 - 1, NodeId(i)));
        }

        for _ in 0..200 {
            let qs: u64 = rng.gen_range(0, 0x10000);
            let qe: u64 = qs + rng.gen_range(1, 0x1000);

            let mut expected: Vec<(u64, NodeId)> = reference
                .iter()
                .filter(|(s, e, _)| *s < qe && *e >= qs)
                .map(|(s, _, id)| (*s, *id))
                .collect();
            expected.sort_unstable();
            let expected: Vec<NodeId> = expected.into_iter().map(|(_, id)| id).collect();

            assert_eq!(tree.query(Address::from(qs), Address::from(qe)), expected);
        }
    }
}
