//! Beacon blocks seen across nodes, as a tree for re-org checks.

use std::collections::HashMap;

use hivenet_types::aliases::{Root, Slot};

/// Arena index of a block in a [`BlockTree`].
pub type NodeId = usize;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockTreeNode {
    pub root: Root,
    pub slot: Slot,
    pub parent_root: Root,
    /// Set once the parent has been inserted.
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

/// Arena of blocks linked by parent id; orphans are linked when their parent shows up.
#[derive(Clone, Debug, Default)]
pub struct BlockTree {
    nodes: Vec<BlockTreeNode>,
    by_root: HashMap<Root, NodeId>,
}

impl BlockTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, root: &Root) -> bool {
        self.by_root.contains_key(root)
    }

    pub fn get(&self, root: &Root) -> Option<&BlockTreeNode> {
        self.by_root.get(root).map(|id| &self.nodes[*id])
    }

    /// Adds a block; inserting a known root is a no-op.
    pub fn insert(&mut self, root: Root, slot: Slot, parent_root: Root) -> NodeId {
        if let Some(id) = self.by_root.get(&root) {
            return *id;
        }
        let id = self.nodes.len();
        let parent = self.by_root.get(&parent_root).copied();
        self.nodes.push(BlockTreeNode { root, slot, parent_root, parent, children: Vec::new() });
        self.by_root.insert(root, id);
        if let Some(p) = parent {
            self.nodes[p].children.push(id);
        }

        let orphans: Vec<NodeId> =
            (0..id).filter(|i| self.nodes[*i].parent.is_none() && self.nodes[*i].parent_root == root).collect();
        for orphan in orphans {
            self.nodes[orphan].parent = Some(id);
            self.nodes[id].children.push(orphan);
        }
        id
    }

    /// Roots from `root` (inclusive) back to the oldest known ancestor.
    pub fn ancestors(&self, root: &Root) -> Vec<Root> {
        let mut out = Vec::new();
        let mut current = self.by_root.get(root).copied();
        while let Some(id) = current {
            out.push(self.nodes[id].root);
            current = self.nodes[id].parent;
        }
        out
    }

    /// Most recent block both `a` and `b` descend from.
    pub fn common_ancestor(&self, a: &Root, b: &Root) -> Option<Root> {
        let seen: Vec<Root> = self.ancestors(a);
        self.ancestors(b).into_iter().find(|r| seen.contains(r))
    }

    /// Blocks without children, highest slot first.
    pub fn heads(&self) -> Vec<&BlockTreeNode> {
        let mut heads: Vec<&BlockTreeNode> = self.nodes.iter().filter(|n| n.children.is_empty()).collect();
        heads.sort_by(|a, b| b.slot.cmp(&a.slot).then(a.root.cmp(&b.root)));
        heads
    }
}
