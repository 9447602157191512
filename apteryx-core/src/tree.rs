//! Tree documents.
//!
//! Multi-path operations exchange a rooted set of value-bearing leaves: the
//! branching is implicit in the paths, so a document is a root path plus a
//! sorted map of full leaf paths to values. An empty value on a leaf means
//! "unset" in a `set_tree`.

use std::collections::BTreeMap;

use bytes::Bytes;

use apteryx_proto::Leaf;

use crate::path;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathTree {
    root: String,
    leaves: BTreeMap<String, Bytes>,
}

impl PathTree {
    pub fn new(root: impl Into<String>) -> Self {
        PathTree {
            root: root.into(),
            leaves: BTreeMap::new(),
        }
    }

    /// Builder-style leaf under the root.
    pub fn with_leaf(mut self, rel: &str, value: impl Into<Bytes>) -> Self {
        let full = if self.root == "/" {
            format!("/{rel}")
        } else {
            format!("{}/{rel}", self.root)
        };
        self.leaves.insert(full, value.into());
        self
    }

    /// Insert a leaf by its full path.
    pub fn insert(&mut self, full_path: impl Into<String>, value: impl Into<Bytes>) {
        self.leaves.insert(full_path.into(), value.into());
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn get(&self, full_path: &str) -> Option<&Bytes> {
        self.leaves.get(full_path)
    }

    pub fn leaves(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.leaves.iter().map(|(path, value)| (path.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Flatten to the wire representation.
    pub fn to_wire(&self) -> Vec<Leaf> {
        self.leaves
            .iter()
            .map(|(path, value)| Leaf {
                path: path.clone(),
                value: value.clone(),
            })
            .collect()
    }

    /// Rebuild from the wire, rooting the document at the leaves' longest
    /// common path prefix.
    pub fn from_wire(leaves: Vec<Leaf>) -> Self {
        let root = path::common_prefix(leaves.iter().map(|leaf| leaf.path.as_str()));
        let mut tree = PathTree::new(root);
        for leaf in leaves {
            tree.leaves.insert(leaf.path, leaf.value);
        }
        tree
    }

    /// Rebuild from collected `(path, value)` pairs under a known root.
    pub fn from_pairs(root: impl Into<String>, pairs: Vec<(String, Bytes)>) -> Self {
        let mut tree = PathTree::new(root);
        for (path, value) in pairs {
            tree.leaves.insert(path, value);
        }
        tree
    }
}
