//! The path tree (database).
//!
//! A trie keyed by path segments. Each node carries an optional value and a
//! last-modified stamp in microseconds since the epoch. A node exists iff it
//! has a value or a descendant with one; mutations restamp every ancestor up
//! to the root, so a node's stamp is always the most recent stamp in its
//! subtree.
//!
//! One readers-writer lock guards the whole tree. Batch mutations
//! (`set_tree`, CAS) go through [`Db::write`], which holds the write guard
//! for the compare and every apply, so concurrent readers observe either the
//! prior state or the full post-state.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use bytes::Bytes;
use parking_lot::RwLock;
use parking_lot::RwLockWriteGuard;

use crate::path;

/// Accounting overhead charged per node by `memuse`, on top of value bytes.
const NODE_OVERHEAD: u64 = 64;

#[derive(Debug, Default)]
struct Node {
    value: Option<Bytes>,
    last_modified: u64,
    children: BTreeMap<String, Node>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.is_empty()
    }

    fn descend(&self, segs: &[&str]) -> Option<&Node> {
        match segs.split_first() {
            None => Some(self),
            Some((head, rest)) => self.children.get(*head)?.descend(rest),
        }
    }

    fn memuse(&self) -> u64 {
        let own = NODE_OVERHEAD + self.value.as_ref().map_or(0, |v| v.len() as u64);
        own + self.children.values().map(Node::memuse).sum::<u64>()
    }

    /// Pre-order collection of value-bearing descendants, self included.
    fn collect(&self, prefix: &mut String, out: &mut Vec<(String, Bytes)>) {
        if let Some(value) = &self.value {
            out.push((prefix.clone(), value.clone()));
        }
        for (name, child) in &self.children {
            let len = prefix.len();
            prefix.push('/');
            prefix.push_str(name);
            child.collect(prefix, out);
            prefix.truncate(len);
        }
    }
}

/// The canonical store.
pub struct Db {
    root: RwLock<Node>,
    last_stamp: AtomicU64,
}

/// A held write lock. All mutations performed through one transaction are
/// observed atomically by readers.
pub struct WriteTxn<'a> {
    guard: RwLockWriteGuard<'a, Node>,
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

impl Default for Db {
    fn default() -> Self {
        Self::new()
    }
}

impl Db {
    pub fn new() -> Self {
        Db {
            root: RwLock::new(Node::default()),
            last_stamp: AtomicU64::new(0),
        }
    }

    /// Allocate a write stamp: wall-clock microseconds, bumped by one on
    /// collision so distinct writes always receive strictly increasing
    /// stamps.
    pub fn next_timestamp(&self) -> u64 {
        let now = now_us();
        let mut prev = self.last_stamp.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self.last_stamp.compare_exchange_weak(
                prev,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => prev = observed,
            }
        }
    }

    /// Acquire the write lock.
    pub fn write(&self) -> WriteTxn<'_> {
        WriteTxn {
            guard: self.root.write(),
        }
    }

    /// Single-path set, stamping the leaf and its ancestors. Returns the
    /// prior value.
    pub fn add(&self, path: &str, value: Bytes, ts: u64) -> Option<Bytes> {
        self.write().apply(path, Some(value), ts)
    }

    /// Single-path delete. Returns the removed value, `None` if the path
    /// had none.
    pub fn delete(&self, path: &str, ts: u64) -> Option<Bytes> {
        self.write().apply(path, None, ts)
    }

    /// Exact-path lookup.
    pub fn get(&self, path: &str) -> Option<Bytes> {
        let root = self.root.read();
        root.descend(&path::segments(path))?.value.clone()
    }

    /// Immediate children of `prefix`, as full paths, sorted by segment.
    pub fn search(&self, prefix: &str) -> Vec<String> {
        let root = self.root.read();
        let base = prefix.trim_end_matches('/');
        let Some(node) = root.descend(&path::segments(base)) else {
            return Vec::new();
        };
        node.children
            .keys()
            .map(|name| format!("{base}/{name}"))
            .collect()
    }

    /// Deep copy of every value-bearing node at or below `path`, pre-order.
    pub fn traverse(&self, path: &str) -> Vec<(String, Bytes)> {
        let root = self.root.read();
        let base = if path == "/" { "" } else { path };
        let Some(node) = root.descend(&path::segments(path)) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        node.collect(&mut base.to_string(), &mut out);
        out
    }

    /// Most recent stamp in the subtree at `path` (its own stamp, by the
    /// restamping invariant). Zero when the path does not exist.
    pub fn timestamp(&self, path: &str) -> u64 {
        let root = self.root.read();
        root.descend(&path::segments(path))
            .map_or(0, |node| node.last_modified)
    }

    /// Value bytes plus per-node overhead at or below `path`.
    pub fn memuse(&self, path: &str) -> u64 {
        let root = self.root.read();
        root.descend(&path::segments(path))
            .map_or(0, Node::memuse)
    }

    /// Remove the subtree at `path`, restamp the parent chain, and return
    /// the removed `(path, value)` pairs in pre-order.
    pub fn prune(&self, path: &str, ts: u64) -> Vec<(String, Bytes)> {
        self.write().prune(path, ts)
    }
}

impl WriteTxn<'_> {
    /// Timestamp visible inside this transaction.
    pub fn timestamp(&self, path: &str) -> u64 {
        self.guard
            .descend(&path::segments(path))
            .map_or(0, |node| node.last_modified)
    }

    /// Set (`Some`) or delete (`None`) the value at `path`. Intermediate
    /// nodes are created on set; nodes left without a value or descendants
    /// are removed on delete. Ancestors are stamped with `max(existing, ts)`
    /// whenever the tree changed. Returns the prior value.
    pub fn apply(&mut self, path: &str, value: Option<Bytes>, ts: u64) -> Option<Bytes> {
        let segs = path::segments(path);
        match value {
            Some(value) => set_at(&mut self.guard, &segs, value, ts),
            None => delete_at(&mut self.guard, &segs, ts).0,
        }
    }

    /// See [`Db::prune`].
    pub fn prune(&mut self, path: &str, ts: u64) -> Vec<(String, Bytes)> {
        let mut out = Vec::new();
        if path == "/" {
            let root = &mut *self.guard;
            let mut prefix = String::new();
            root.collect(&mut prefix, &mut out);
            root.value = None;
            root.children.clear();
            if !out.is_empty() {
                root.last_modified = root.last_modified.max(ts);
            }
            return out;
        }
        let segs = path::segments(path);
        let mut prefix = String::new();
        prune_at(&mut self.guard, &segs, &mut prefix, ts, &mut out);
        out
    }
}

fn set_at(node: &mut Node, segs: &[&str], value: Bytes, ts: u64) -> Option<Bytes> {
    node.last_modified = node.last_modified.max(ts);
    match segs.split_first() {
        None => node.value.replace(value),
        Some((head, rest)) => {
            let child = node.children.entry((*head).to_string()).or_default();
            set_at(child, rest, value, ts)
        }
    }
}

/// Returns `(prior value, remove-this-node)`.
fn delete_at(node: &mut Node, segs: &[&str], ts: u64) -> (Option<Bytes>, bool) {
    match segs.split_first() {
        None => {
            let prior = node.value.take();
            if prior.is_some() {
                node.last_modified = node.last_modified.max(ts);
            }
            (prior, node.is_empty())
        }
        Some((head, rest)) => {
            let Some(child) = node.children.get_mut(*head) else {
                return (None, false);
            };
            let (prior, remove_child) = delete_at(child, rest, ts);
            if prior.is_some() {
                node.last_modified = node.last_modified.max(ts);
                if remove_child {
                    node.children.remove(*head);
                }
            }
            (prior, node.is_empty())
        }
    }
}

/// Returns `(found, remove-this-node)`.
fn prune_at(
    node: &mut Node,
    segs: &[&str],
    prefix: &mut String,
    ts: u64,
    out: &mut Vec<(String, Bytes)>,
) -> (bool, bool) {
    let Some((head, rest)) = segs.split_first() else {
        node.collect(prefix, out);
        return (true, true);
    };
    let Some(child) = node.children.get_mut(*head) else {
        return (false, false);
    };
    let len = prefix.len();
    prefix.push('/');
    prefix.push_str(head);
    let (found, remove_child) = prune_at(child, rest, prefix, ts, out);
    prefix.truncate(len);
    if found {
        node.last_modified = node.last_modified.max(ts);
        if remove_child {
            node.children.remove(*head);
        }
    }
    (found, found && node.is_empty())
}
