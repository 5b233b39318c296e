//! Static layout of the broadcast tree.
//!
//! Node ids follow heap order: the root is 0 and node `i` has children
//! `2i + 1` and `2i + 2`. A tree of depth `D` has `2^D - 1` internal nodes
//! followed by `2^D` leaves, so leaf `j` is node `2^D - 1 + j`.

use std::ops::Range;

use kluster_core::EngineId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub id: u32,
    pub depth: u32,
    /// Engine slots served by this node's subtree.
    pub slots: Range<u32>,
    /// Child node ids, `None` for leaves.
    pub children: Option<[u32; 2]>,
}

impl TreeNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastTree {
    depth: u32,
    slot_count: u32,
    nodes: Vec<TreeNode>,
}

impl BroadcastTree {
    /// Lay out a tree of `depth` levels below the root over `slots` engine slots.
    ///
    /// Leaf ranges are contiguous in leaf order and differ in size by at most
    /// one; with fewer slots than leaves the trailing leaves own empty ranges.
    pub fn build(depth: u32, slots: u32) -> Self {
        let slot_count = slots.max(1);
        let leaf_count = 1u32 << depth;
        let internal = leaf_count - 1;
        let base = slot_count / leaf_count;
        let extra = slot_count % leaf_count;

        let mut nodes: Vec<TreeNode> = (0..internal + leaf_count)
            .map(|id| TreeNode {
                id,
                depth: (id + 1).ilog2(),
                slots: 0..0,
                children: (id < internal).then_some([2 * id + 1, 2 * id + 2]),
            })
            .collect();

        for j in 0..leaf_count {
            let start = j * base + j.min(extra);
            let len = base + u32::from(j < extra);
            nodes[(internal + j) as usize].slots = start..start + len;
        }
        for id in (0..internal).rev() {
            let left = nodes[(2 * id + 1) as usize].slots.start;
            let right = nodes[(2 * id + 2) as usize].slots.end;
            nodes[id as usize].slots = left..right;
        }

        Self {
            depth,
            slot_count,
            nodes,
        }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    pub fn node_count(&self) -> u32 {
        self.nodes.len() as u32
    }

    pub fn leaf_count(&self) -> u32 {
        1 << self.depth
    }

    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    pub fn node(&self, id: u32) -> Option<&TreeNode> {
        self.nodes.get(id as usize)
    }

    /// Node id of leaf `index`.
    pub fn leaf_node_id(&self, index: u32) -> u32 {
        self.leaf_count() - 1 + index
    }

    pub fn slot_of(&self, engine: EngineId) -> u32 {
        engine.0 % self.slot_count
    }

    /// Index (not node id) of the leaf serving `engine`.
    pub fn leaf_for_engine(&self, engine: EngineId) -> u32 {
        let slot = self.slot_of(engine);
        let first_leaf = (self.leaf_count() - 1) as usize;
        let offset = self.nodes[first_leaf..].partition_point(|n| n.slots.end <= slot);
        offset as u32
    }

    /// Whether `engine` is reached through the subtree rooted at `node`.
    pub fn covers(&self, node: u32, engine: EngineId) -> bool {
        self.node(node)
            .is_some_and(|n| n.slots.contains(&self.slot_of(engine)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_follows_depth() {
        let tree = BroadcastTree::build(2, 64);
        assert_eq!(tree.node_count(), 7);
        assert_eq!(tree.leaf_count(), 4);
        let leaves: Vec<u32> = tree.nodes().iter().filter(|n| n.is_leaf()).map(|n| n.id).collect();
        assert_eq!(leaves, vec![3, 4, 5, 6]);
        assert_eq!(tree.node(0).unwrap().children, Some([1, 2]));
        assert_eq!(tree.node(2).unwrap().children, Some([5, 6]));
        assert_eq!(tree.node(5).unwrap().depth, 2);
        assert_eq!(tree.leaf_node_id(3), 6);
    }

    #[test]
    fn every_slot_is_owned_by_exactly_one_leaf() {
        for (depth, slots) in [(0, 1), (1, 3), (2, 10), (3, 5), (3, 64)] {
            let tree = BroadcastTree::build(depth, slots);
            let leaves: Vec<&TreeNode> = tree.nodes().iter().filter(|n| n.is_leaf()).collect();
            for slot in 0..slots {
                let owners = leaves.iter().filter(|n| n.slots.contains(&slot)).count();
                assert_eq!(owners, 1, "depth {depth} slots {slots} slot {slot}");
            }
            let sizes: Vec<u32> = leaves.iter().map(|n| n.slots.len() as u32).collect();
            let (min, max) = (sizes.iter().min().unwrap(), sizes.iter().max().unwrap());
            assert!(max - min <= 1);
            assert_eq!(tree.node(0).unwrap().slots, 0..slots);
        }
    }

    #[test]
    fn internal_ranges_are_union_of_children() {
        let tree = BroadcastTree::build(3, 21);
        for node in tree.nodes().iter().filter(|n| !n.is_leaf()) {
            let [l, r] = node.children.unwrap();
            let (l, r) = (tree.node(l).unwrap(), tree.node(r).unwrap());
            assert_eq!(l.slots.end, r.slots.start);
            assert_eq!(node.slots, l.slots.start..r.slots.end);
        }
    }

    #[test]
    fn engines_wrap_onto_slots() {
        let tree = BroadcastTree::build(1, 4);
        assert_eq!(tree.leaf_for_engine(EngineId(0)), 0);
        assert_eq!(tree.leaf_for_engine(EngineId(1)), 0);
        assert_eq!(tree.leaf_for_engine(EngineId(2)), 1);
        assert_eq!(tree.leaf_for_engine(EngineId(6)), 1);
        assert!(tree.covers(2, EngineId(7)));
        assert!(!tree.covers(1, EngineId(7)));
        assert!(tree.covers(0, EngineId(1000)));
    }

    #[test]
    fn fewer_slots_than_leaves_leaves_empty_ranges() {
        let tree = BroadcastTree::build(2, 2);
        assert_eq!(tree.leaf_for_engine(EngineId(0)), 0);
        assert_eq!(tree.leaf_for_engine(EngineId(1)), 1);
        assert!(tree.node(tree.leaf_node_id(3)).unwrap().slots.is_empty());
    }
}
