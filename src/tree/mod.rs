//!
//! dam resource tree
//! -----------------
//! Hierarchical snapshot of an endpoint's namespace. Paths such as `bucket1/sub/b.txt` are
//! split on the endpoint separator and every prefix becomes a node whose id is the full
//! joined prefix (`bucket1`, `bucket1/sub`, `bucket1/sub/b.txt`) and whose tag is the last
//! segment. Ids are therefore unique even when leaf names repeat across branches.
//!
//! Nodes live in an arena in insertion order. A node is always inserted after its parent,
//! which lets the partitioner compute descendant facts with a single reverse scan.
//! Trees are immutable once built; endpoints replace them wholesale on reload.

use std::collections::HashMap;

use serde::Serialize;

use crate::error::{AccessError, AccessResult};

pub mod partition;

pub use partition::{partition, NodePredicate};

/// Id (and tag) of the synthetic root present in every tree.
pub const ROOT_ID: &str = "root";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNode {
    /// Full path from the root, separator-joined. `root` for the root node.
    pub id: String,
    /// Last path segment.
    pub tag: String,
    parent: Option<usize>,
    children: Vec<usize>,
}

impl ResourceNode {
    pub fn is_root(&self) -> bool { self.parent.is_none() }

    pub fn is_leaf(&self) -> bool { self.children.is_empty() }
}

/// Flat `{id, parent, tag}` view of one node, handed to renderers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeRecord {
    pub id: String,
    pub parent: Option<String>,
    pub tag: String,
}

/// Nested view of a (sub)tree, serialisable as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeView {
    pub id: String,
    pub tag: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeView>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceTree {
    nodes: Vec<ResourceNode>,
    index: HashMap<String, usize>,
    separator: String,
}

impl Default for ResourceTree {
    fn default() -> Self { Self::new("/") }
}

impl ResourceTree {
    /// A tree holding only the root.
    pub fn new(separator: &str) -> Self {
        let root = ResourceNode { id: ROOT_ID.to_string(), tag: ROOT_ID.to_string(), parent: None, children: Vec::new() };
        let mut index = HashMap::new();
        index.insert(ROOT_ID.to_string(), 0);
        Self { nodes: vec![root], index, separator: separator.to_string() }
    }

    /// Build a tree from a flat path listing. Order and overlap of the input do not matter.
    pub fn build<I, S>(paths: I, separator: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tree = Self::new(separator);
        for path in paths {
            tree.insert_path(path.as_ref());
        }
        tree
    }

    /// Insert a path and all its prefixes; existing nodes are left untouched. Returns how
    /// many nodes were created.
    ///
    /// Leading and trailing separators are trimmed. Empty segments inside the path are kept,
    /// so `dir//file` and `dir/file` stay distinct. A first segment equal to the root id
    /// resolves to the root itself.
    pub fn insert_path(&mut self, path: &str) -> usize {
        let sep = self.separator.as_str();
        let trimmed = if sep.is_empty() { path } else { path.trim_start_matches(sep).trim_end_matches(sep) };
        if trimmed.is_empty() { return 0; }
        let segments: Vec<&str> = if sep.is_empty() { vec![trimmed] } else { trimmed.split(sep).collect() };
        let mut created = 0usize;
        let mut parent = 0usize;
        let mut id = String::with_capacity(path.len());
        for (i, tag) in segments.iter().enumerate() {
            if i > 0 { id.push_str(&self.separator); }
            id.push_str(tag);
            parent = match self.index.get(&id) {
                Some(&existing) => existing,
                None => {
                    created += 1;
                    self.push_node(id.clone(), (*tag).to_string(), parent)
                }
            };
        }
        created
    }

    fn push_node(&mut self, id: String, tag: String, parent: usize) -> usize {
        let idx = self.nodes.len();
        self.index.insert(id.clone(), idx);
        self.nodes.push(ResourceNode { id, tag, parent: Some(parent), children: Vec::new() });
        self.nodes[parent].children.push(idx);
        idx
    }

    pub fn separator(&self) -> &str { &self.separator }

    pub fn root(&self) -> &ResourceNode { &self.nodes[0] }

    /// Number of nodes including the root.
    pub fn len(&self) -> usize { self.nodes.len() }

    /// True when the tree holds nothing but the root.
    pub fn is_empty(&self) -> bool { self.nodes.len() == 1 }

    pub fn contains(&self, id: &str) -> bool { self.index.contains_key(id) }

    pub fn get(&self, id: &str) -> AccessResult<&ResourceNode> {
        self.index.get(id).map(|&i| &self.nodes[i]).ok_or_else(|| AccessError::PathNotFound(id.to_string()))
    }

    pub fn children<'a>(&'a self, node: &'a ResourceNode) -> impl Iterator<Item = &'a ResourceNode> + 'a {
        node.children.iter().map(move |&i| &self.nodes[i])
    }

    pub fn parent(&self, node: &ResourceNode) -> Option<&ResourceNode> { node.parent.map(|i| &self.nodes[i]) }

    /// Ancestors of `id`, nearest first, ending at the root.
    pub fn ancestors(&self, id: &str) -> AccessResult<Vec<&ResourceNode>> {
        let mut out = Vec::new();
        let mut cur = self.get(id)?;
        while let Some(p) = self.parent(cur) {
            out.push(p);
            cur = p;
        }
        Ok(out)
    }

    /// Ids of the leaves under `id` (the node itself when it is a leaf), depth-first.
    pub fn leaves(&self, id: &str) -> AccessResult<Vec<String>> {
        let start = *self.index.get(id).ok_or_else(|| AccessError::PathNotFound(id.to_string()))?;
        let mut out = Vec::new();
        let mut stack = vec![start];
        while let Some(i) = stack.pop() {
            let node = &self.nodes[i];
            if node.is_leaf() {
                if !node.is_root() { out.push(node.id.clone()); }
            } else {
                stack.extend(node.children.iter().rev());
            }
        }
        Ok(out)
    }

    /// Nodes in insertion order (parents before children), root first.
    pub fn iter(&self) -> impl Iterator<Item = &ResourceNode> { self.nodes.iter() }

    /// Ids of every node except the root, in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = &str> { self.nodes.iter().skip(1).map(|n| n.id.as_str()) }

    /// Depth-first (pre-order) traversal, children in insertion order.
    pub fn depth_first(&self) -> Vec<&ResourceNode> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![0usize];
        while let Some(i) = stack.pop() {
            out.push(&self.nodes[i]);
            stack.extend(self.nodes[i].children.iter().rev());
        }
        out
    }

    pub fn records(&self) -> Vec<NodeRecord> {
        self.depth_first()
            .into_iter()
            .map(|n| NodeRecord {
                id: n.id.clone(),
                parent: self.parent(n).map(|p| p.id.clone()),
                tag: n.tag.clone(),
            })
            .collect()
    }

    pub fn nested(&self) -> TreeView { self.view_of(0) }

    fn view_of(&self, i: usize) -> TreeView {
        let n = &self.nodes[i];
        TreeView { id: n.id.clone(), tag: n.tag.clone(), children: n.children.iter().map(|&c| self.view_of(c)).collect() }
    }

    /// Induced subtree of the nodes accepted by `keep` plus all their ancestors.
    pub fn filtered<F>(&self, keep: F) -> ResourceTree
    where
        F: Fn(&ResourceNode) -> bool,
    {
        let marker = crate::policy::Action::Read;
        partition(self, |node, _| keep(node), &[marker]).remove(&marker).unwrap_or_else(|| Self::new(&self.separator))
    }

    /// Build a tree from `self` keeping exactly the nodes flagged in `keep` (indexed like the
    /// arena). Every kept node's parent must be kept too.
    pub(crate) fn project(&self, keep: &[bool]) -> ResourceTree {
        let mut out = Self::new(&self.separator);
        let mut remap: Vec<Option<usize>> = vec![None; self.nodes.len()];
        remap[0] = Some(0);
        for (i, node) in self.nodes.iter().enumerate().skip(1) {
            if !keep[i] { continue; }
            let Some(parent) = node.parent.and_then(|p| remap[p]) else { continue; };
            remap[i] = Some(out.push_node(node.id.clone(), node.tag.clone(), parent));
        }
        out
    }
}
