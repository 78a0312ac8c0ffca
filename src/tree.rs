//! Node tree representation
//!
//! Flat arena of named nodes with ordered children, used by the
//! in-memory store for the live tree and for frozen snapshot copies.
//!
//! Author: Moroya Sakamoto

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::path;
use crate::store::{AttrValue, NodeData, NodeKind};

/// Unique node identifier within one tree
pub type NodeId = u32;

/// Tree node
#[derive(Debug, Clone)]
pub struct TreeNode {
    /// Unique identifier within the tree
    pub id: NodeId,
    pub kind: NodeKind,
    /// Node name, unique among its siblings
    pub name: String,
    pub attributes: BTreeMap<String, AttrValue>,
    /// Child node IDs in order
    pub children: Vec<NodeId>,
}

impl TreeNode {
    pub fn new(id: NodeId, kind: NodeKind, name: &str) -> Self {
        Self {
            id,
            kind,
            name: String::from(name),
            attributes: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    /// Snapshot of kind, name and attributes
    pub fn data(&self) -> NodeData {
        NodeData {
            name: self.name.clone(),
            kind: self.kind,
            attributes: self.attributes.clone(),
        }
    }
}

/// Node tree: flat storage, ID lookup through a HashMap index
#[derive(Debug, Clone)]
pub struct NodeTree {
    nodes: Vec<TreeNode>,
    /// Maps NodeId → index in `nodes`
    index: HashMap<NodeId, usize>,
    /// Maps child NodeId → parent NodeId
    parent_index: HashMap<NodeId, NodeId>,
    root_id: NodeId,
    next_id: NodeId,
}

impl Default for NodeTree {
    fn default() -> Self {
        Self::new(NodeKind::Folder)
    }
}

impl NodeTree {
    pub fn new(root_kind: NodeKind) -> Self {
        let root = TreeNode::new(0, root_kind, "");
        let mut index = HashMap::new();
        index.insert(0, 0);
        Self {
            nodes: vec![root],
            index,
            parent_index: HashMap::new(),
            root_id: 0,
            next_id: 1,
        }
    }

    /// Add a node as last child of `parent_id`, returns its ID
    pub fn add_node(&mut self, kind: NodeKind, name: &str, parent_id: NodeId) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        let idx = self.nodes.len();
        self.nodes.push(TreeNode::new(id, kind, name));
        self.index.insert(id, idx);
        self.parent_index.insert(id, parent_id);
        if let Some(parent) = self.get_node_mut(parent_id) {
            parent.children.push(id);
        }
        id
    }

    pub fn get_node(&self, id: NodeId) -> Option<&TreeNode> {
        self.index.get(&id).map(|&idx| &self.nodes[idx])
    }

    pub fn get_node_mut(&mut self, id: NodeId) -> Option<&mut TreeNode> {
        self.index.get(&id).map(|&idx| &mut self.nodes[idx])
    }

    pub fn root_id(&self) -> NodeId {
        self.root_id
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Parent of a node, O(1) via the parent index
    pub fn parent_of(&self, id: NodeId) -> Option<NodeId> {
        self.parent_index.get(&id).copied()
    }

    /// Child of `parent_id` named `name`
    pub fn child_by_name(&self, parent_id: NodeId, name: &str) -> Option<NodeId> {
        let parent = self.get_node(parent_id)?;
        parent
            .children
            .iter()
            .copied()
            .find(|&c| self.get_node(c).is_some_and(|n| n.name == name))
    }

    /// Find a node by path relative to the root (leading slash optional)
    pub fn find(&self, rel_path: &str) -> Option<NodeId> {
        let mut current = self.root_id;
        for seg in path::segments(rel_path) {
            current = self.child_by_name(current, seg)?;
        }
        Some(current)
    }

    /// Path of a node relative to the root, without leading slash
    pub fn path_of(&self, id: NodeId) -> Option<String> {
        let mut names = Vec::new();
        let mut current = id;
        while current != self.root_id {
            names.push(self.get_node(current)?.name.as_str());
            current = self.parent_of(current)?;
        }
        names.reverse();
        Some(names.join("/"))
    }

    /// Child names of a node in order
    pub fn child_names(&self, id: NodeId) -> Vec<String> {
        self.get_node(id)
            .map(|n| {
                n.children
                    .iter()
                    .filter_map(|&c| self.get_node(c).map(|c| c.name.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove a node and all its descendants
    pub fn remove_subtree(&mut self, id: NodeId) {
        let mut to_remove_vec = Vec::new();
        self.collect_subtree(id, &mut to_remove_vec);
        let to_remove: HashSet<NodeId> = to_remove_vec.into_iter().collect();

        if let Some(parent_id) = self.parent_of(id) {
            if let Some(parent) = self.get_node_mut(parent_id) {
                parent.children.retain(|&c| c != id);
            }
        }
        for rid in &to_remove {
            self.parent_index.remove(rid);
        }
        self.nodes.retain(|n| !to_remove.contains(&n.id));
        self.index.clear();
        for (idx, node) in self.nodes.iter().enumerate() {
            self.index.insert(node.id, idx);
        }
    }

    /// IDs of a node and all descendants, pre-order
    pub fn subtree_ids(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_subtree(id, &mut out);
        out
    }

    fn collect_subtree(&self, id: NodeId, result: &mut Vec<NodeId>) {
        result.push(id);
        if let Some(node) = self.get_node(id) {
            for &child_id in &node.children {
                self.collect_subtree(child_id, result);
            }
        }
    }

    /// True if `id` is `ancestor` or lies below it
    pub fn is_within(&self, ancestor: NodeId, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(c) = current {
            if c == ancestor {
                return true;
            }
            current = self.parent_of(c);
        }
        false
    }

    /// Re-parent a node under `new_parent` as last child, renaming it.
    /// Returns `false` if the move would create a cycle.
    pub fn move_node(&mut self, id: NodeId, new_parent: NodeId, new_name: &str) -> bool {
        if id == self.root_id || self.is_within(id, new_parent) {
            return false;
        }
        if let Some(old_parent) = self.parent_of(id) {
            if let Some(p) = self.get_node_mut(old_parent) {
                p.children.retain(|&c| c != id);
            }
        }
        if let Some(p) = self.get_node_mut(new_parent) {
            p.children.push(id);
        }
        self.parent_index.insert(id, new_parent);
        if let Some(node) = self.get_node_mut(id) {
            node.name = String::from(new_name);
        }
        true
    }

    /// Move child `id` of `parent_id` before sibling `before`, or to the end.
    pub fn order_before(&mut self, parent_id: NodeId, id: NodeId, before: Option<NodeId>) -> bool {
        let Some(parent) = self.get_node_mut(parent_id) else {
            return false;
        };
        let Some(pos) = parent.children.iter().position(|&c| c == id) else {
            return false;
        };
        parent.children.remove(pos);
        match before.and_then(|b| parent.children.iter().position(|&c| c == b)) {
            Some(target) => parent.children.insert(target, id),
            None => parent.children.push(id),
        }
        true
    }

    /// Copy the subtree at `id` into `target` below `target_parent`,
    /// passing every copied node through `map`. Returns the new root ID.
    pub fn copy_subtree_into<F>(
        &self,
        id: NodeId,
        target: &mut NodeTree,
        target_parent: NodeId,
        map: &mut F,
    ) -> Option<NodeId>
    where
        F: FnMut(&TreeNode, &mut TreeNode),
    {
        let node = self.get_node(id)?;
        let new_id = target.add_node(node.kind, &node.name, target_parent);
        if let Some(copy) = target.get_node_mut(new_id) {
            copy.attributes = node.attributes.clone();
            map(node, copy);
        }
        for &child in &node.children {
            self.copy_subtree_into(child, target, new_id, map);
        }
        Some(new_id)
    }

    /// Compute Merkle hash of a subtree (FNV-1a)
    pub fn subtree_hash(&self, id: NodeId) -> u64 {
        let mut h: u64 = 0xcbf29ce484222325;
        self.hash_node(id, &mut h);
        h
    }

    fn hash_node(&self, id: NodeId, h: &mut u64) {
        if let Some(node) = self.get_node(id) {
            fnv(h, &[node.kind as u8]);
            fnv(h, node.name.as_bytes());
            for (key, value) in &node.attributes {
                fnv(h, key.as_bytes());
                fnv(h, format!("{value:?}").as_bytes());
            }
            for &child_id in &node.children {
                self.hash_node(child_id, h);
            }
        }
    }
}

fn fnv(h: &mut u64, bytes: &[u8]) {
    for &b in bytes {
        *h ^= b as u64;
        *h = h.wrapping_mul(0x100000001b3);
    }
}
