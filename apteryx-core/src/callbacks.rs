//! Callback registry.
//!
//! Registrations are stored per kind in a trie over pattern segments. A `*`
//! segment occupies a dedicated child slot; a trailing `/` registers under
//! the one-level slot. Matching walks the target path through the trie and
//! ranks hits most-specific first: fewer wildcards, then deeper patterns,
//! then most recent registration.
//!
//! Records are shared out as `Arc`s, so a registration stays alive while a
//! dispatch holds it even after removal from the trie; removal only flips
//! the disabled flag and detaches the record.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::path;

/// The six callback kinds, plus tree-shaped watch delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Watch,
    WatchTree,
    Validate,
    Refresh,
    Provide,
    Index,
    Proxy,
}

impl Kind {
    /// Plural form used under `/apteryx/statistics/`.
    pub fn plural(self) -> &'static str {
        match self {
            Kind::Watch => "watchers",
            Kind::WatchTree => "tree-watchers",
            Kind::Validate => "validators",
            Kind::Refresh => "refreshers",
            Kind::Provide => "providers",
            Kind::Index => "indexers",
            Kind::Proxy => "proxies",
        }
    }
}

/// Per-registration invocation statistics, all in microseconds.
#[derive(Debug)]
pub struct CallStats {
    pub count: AtomicU32,
    pub min: AtomicU32,
    pub max: AtomicU32,
    pub total: AtomicU64,
}

impl Default for CallStats {
    fn default() -> Self {
        CallStats {
            count: AtomicU32::new(0),
            min: AtomicU32::new(u32::MAX),
            max: AtomicU32::new(0),
            total: AtomicU64::new(0),
        }
    }
}

impl CallStats {
    pub fn record(&self, elapsed_us: u32) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.min.fetch_min(elapsed_us, Ordering::Relaxed);
        self.max.fetch_max(elapsed_us, Ordering::Relaxed);
        self.total.fetch_add(elapsed_us as u64, Ordering::Relaxed);
    }

    /// `count,min,avg,max` as published by the statistics refresher.
    pub fn render(&self) -> String {
        let count = self.count.load(Ordering::Relaxed);
        let min = if count == 0 { 0 } else { self.min.load(Ordering::Relaxed) };
        let max = self.max.load(Ordering::Relaxed);
        let avg = if count == 0 {
            0
        } else {
            (self.total.load(Ordering::Relaxed) / count as u64) as u32
        };
        format!("{count},{min},{avg},{max}")
    }
}

/// One registration.
#[derive(Debug)]
pub struct Callback {
    pub kind: Kind,
    /// Hex triple `pid-handle-hash` uniquely identifying the registration.
    pub guid: String,
    /// Pattern path as registered (may contain `*`, may end with `/`).
    pub pattern: String,
    /// Originator process id parsed from the GUID.
    pub pid: u64,
    /// Opaque callback handle parsed from the GUID.
    pub handle: u64,
    /// Forwarding URI (proxies only).
    pub uri: Option<String>,
    pub stats: CallStats,
    active: AtomicBool,
    seq: u64,
}

impl Callback {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn disable(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/// Compose the GUID for a registration.
pub fn make_guid(pid: u64, handle: u64, hash: u64) -> String {
    format!("{pid:x}-{handle:x}-{hash:x}")
}

/// Parse a GUID back into its `(pid, handle, hash)` triple.
pub fn parse_guid(guid: &str) -> Option<(u64, u64, u64)> {
    let mut parts = guid.splitn(3, '-');
    let pid = u64::from_str_radix(parts.next()?, 16).ok()?;
    let handle = u64::from_str_radix(parts.next()?, 16).ok()?;
    let hash = u64::from_str_radix(parts.next()?, 16).ok()?;
    Some((pid, handle, hash))
}

#[derive(Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    callbacks: Vec<Arc<Callback>>,
}

const ONE_LEVEL: &str = "";

struct Table {
    root: RwLock<TrieNode>,
}

impl Table {
    fn new() -> Self {
        Table {
            root: RwLock::new(TrieNode::default()),
        }
    }

    fn insert(&self, cb: Arc<Callback>) {
        let mut root = self.root.write();
        // A bare trie walk: the one-level marker and `*` live in their own
        // child slots.
        let mut node = &mut *root;
        for seg in path::pattern_segments(&cb.pattern) {
            node = node.children.entry(seg.to_string()).or_default();
        }
        node.callbacks.push(cb);
    }

    fn remove(&self, cb: &Callback) {
        let mut root = self.root.write();
        remove_at(&mut root, &path::pattern_segments(&cb.pattern), &cb.guid);
    }

    fn match_path(&self, segs: &[&str]) -> Vec<Arc<Callback>> {
        let root = self.root.read();
        let mut hits: Vec<(u32, usize, u64, Arc<Callback>)> = Vec::new();
        collect_matches(&root, segs, 0, 0, &mut hits);
        hits.sort_by(|a, b| {
            a.0.cmp(&b.0) // fewer wildcards first
                .then(b.1.cmp(&a.1)) // deeper pattern first
                .then(b.2.cmp(&a.2)) // most recent registration first
        });
        let mut seen = std::collections::HashSet::new();
        hits.into_iter()
            .filter(|(_, _, _, cb)| cb.is_active() && seen.insert(cb.guid.clone()))
            .map(|(_, _, _, cb)| cb)
            .collect()
    }

    fn search(&self, segs: &[&str], base: &str) -> Vec<String> {
        let root = self.root.read();
        let mut nodes: Vec<&TrieNode> = Vec::new();
        descend_all(&root, segs, &mut nodes);
        let mut out: Vec<String> = Vec::new();
        for node in nodes {
            for (name, child) in &node.children {
                if name == path::WILDCARD || name == ONE_LEVEL {
                    continue;
                }
                if has_any(child) {
                    out.push(format!("{base}{name}"));
                }
            }
        }
        out.sort();
        out.dedup();
        out
    }

    fn exists(&self, segs: &[&str]) -> bool {
        let root = self.root.read();
        exists_at(&root, segs)
    }

    fn foreach(&self, f: &mut dyn FnMut(&Arc<Callback>)) {
        let root = self.root.read();
        visit_all(&root, f);
    }
}

fn remove_at(node: &mut TrieNode, segs: &[&str], guid: &str) -> bool {
    match segs.split_first() {
        None => {
            node.callbacks.retain(|cb| cb.guid != guid);
        }
        Some((head, rest)) => {
            if let Some(child) = node.children.get_mut(*head) {
                if remove_at(child, rest, guid) {
                    node.children.remove(*head);
                }
            }
        }
    }
    node.callbacks.is_empty() && node.children.is_empty()
}

fn collect_matches(
    node: &TrieNode,
    segs: &[&str],
    wilds: u32,
    depth: usize,
    out: &mut Vec<(u32, usize, u64, Arc<Callback>)>,
) {
    match segs.split_first() {
        None => {
            for cb in &node.callbacks {
                out.push((wilds, depth, cb.seq, cb.clone()));
            }
        }
        Some((head, rest)) => {
            // One-level slot matches when exactly one segment remains.
            if rest.is_empty() {
                if let Some(one) = node.children.get(ONE_LEVEL) {
                    for cb in &one.callbacks {
                        out.push((wilds, depth + 1, cb.seq, cb.clone()));
                    }
                }
            }
            if let Some(child) = node.children.get(*head) {
                collect_matches(child, rest, wilds, depth + 1, out);
            }
            if let Some(wild) = node.children.get(path::WILDCARD) {
                collect_matches(wild, rest, wilds + 1, depth + 1, out);
                // A terminal `*` also swallows the whole remaining subtree.
                if !rest.is_empty() {
                    for cb in &wild.callbacks {
                        out.push((wilds + 1, depth + 1, cb.seq, cb.clone()));
                    }
                }
            }
        }
    }
}

/// Walk `segs` through the trie following exact and wildcard edges,
/// accumulating every node the full prefix can land on.
fn descend_all<'a>(node: &'a TrieNode, segs: &[&str], out: &mut Vec<&'a TrieNode>) {
    match segs.split_first() {
        None => out.push(node),
        Some((head, rest)) => {
            if let Some(child) = node.children.get(*head) {
                descend_all(child, rest, out);
            }
            if let Some(wild) = node.children.get(path::WILDCARD) {
                descend_all(wild, rest, out);
            }
        }
    }
}

fn has_any(node: &TrieNode) -> bool {
    if node.callbacks.iter().any(|cb| cb.is_active()) {
        return true;
    }
    node.children.values().any(has_any)
}

fn exists_at(node: &TrieNode, segs: &[&str]) -> bool {
    match segs.split_first() {
        None => has_any(node),
        Some((head, rest)) => {
            // A terminal `*` above the prefix covers everything below it.
            if let Some(wild) = node.children.get(path::WILDCARD) {
                if wild.callbacks.iter().any(|cb| cb.is_active()) {
                    return true;
                }
                if exists_at(wild, rest) {
                    return true;
                }
            }
            if let Some(one) = node.children.get(ONE_LEVEL) {
                if one.callbacks.iter().any(|cb| cb.is_active()) {
                    return true;
                }
            }
            match node.children.get(*head) {
                Some(child) => exists_at(child, rest),
                None => false,
            }
        }
    }
}

fn visit_all(node: &TrieNode, f: &mut dyn FnMut(&Arc<Callback>)) {
    for cb in &node.callbacks {
        if cb.is_active() {
            f(cb);
        }
    }
    for child in node.children.values() {
        visit_all(child, f);
    }
}

/// All registrations, all kinds.
pub struct Registry {
    watch: Table,
    watch_tree: Table,
    validate: Table,
    refresh: Table,
    provide: Table,
    index: Table,
    proxy: Table,
    by_guid: DashMap<String, Arc<Callback>>,
    seq: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            watch: Table::new(),
            watch_tree: Table::new(),
            validate: Table::new(),
            refresh: Table::new(),
            provide: Table::new(),
            index: Table::new(),
            proxy: Table::new(),
            by_guid: DashMap::new(),
            seq: AtomicU64::new(1),
        }
    }

    fn table(&self, kind: Kind) -> &Table {
        match kind {
            Kind::Watch => &self.watch,
            Kind::WatchTree => &self.watch_tree,
            Kind::Validate => &self.validate,
            Kind::Refresh => &self.refresh,
            Kind::Provide => &self.provide,
            Kind::Index => &self.index,
            Kind::Proxy => &self.proxy,
        }
    }

    /// Create a registration. An existing record under the same GUID is
    /// disabled and replaced.
    pub fn create(
        &self,
        kind: Kind,
        guid: &str,
        pattern: &str,
        uri: Option<String>,
    ) -> Option<Arc<Callback>> {
        let (pid, handle, _hash) = parse_guid(guid)?;
        if let Some(old) = self.destroy(guid) {
            tracing::debug!(guid, old = %old.pattern, "replacing callback registration");
        }
        let cb = Arc::new(Callback {
            kind,
            guid: guid.to_string(),
            pattern: pattern.to_string(),
            pid,
            handle,
            uri,
            stats: CallStats::default(),
            active: AtomicBool::new(true),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        });
        self.table(kind).insert(cb.clone());
        self.by_guid.insert(guid.to_string(), cb.clone());
        Some(cb)
    }

    /// Disable and detach the registration under `guid`. The record lives
    /// on for any dispatch already holding it.
    pub fn destroy(&self, guid: &str) -> Option<Arc<Callback>> {
        let (_, cb) = self.by_guid.remove(guid)?;
        cb.disable();
        self.table(cb.kind).remove(&cb);
        Some(cb)
    }

    pub fn find(&self, guid: &str) -> Option<Arc<Callback>> {
        self.by_guid.get(guid).map(|entry| entry.value().clone())
    }

    /// All records matching `path`, most-specific first.
    pub fn match_path(&self, kind: Kind, target: &str) -> Vec<Arc<Callback>> {
        self.table(kind).match_path(&path::segments(target))
    }

    /// Records able to produce a child directly below `prefix` (which must
    /// end with `/`): the nameable next-level segments, as full paths.
    pub fn search(&self, kind: Kind, prefix: &str) -> Vec<String> {
        let base = prefix.trim_end_matches('/');
        self.table(kind)
            .search(&path::segments(base), &format!("{base}/"))
    }

    /// Cheap predicate: any active record at or below `prefix`?
    pub fn exists(&self, kind: Kind, prefix: &str) -> bool {
        self.table(kind).exists(&path::segments(prefix))
    }

    pub fn foreach(&self, kind: Kind, mut f: impl FnMut(&Arc<Callback>)) {
        self.table(kind).foreach(&mut f);
    }

    /// Tear down every registration owned by `pid` (client disconnect).
    pub fn drop_pid(&self, pid: u64) -> Vec<Arc<Callback>> {
        let guids: Vec<String> = self
            .by_guid
            .iter()
            .filter(|entry| entry.value().pid == pid)
            .map(|entry| entry.key().clone())
            .collect();
        guids.iter().filter_map(|guid| self.destroy(guid)).collect()
    }
}
