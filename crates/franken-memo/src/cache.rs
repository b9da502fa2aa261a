//! Composite ephemeron cache: [`KeyTuple`] to function instance.
//!
//! The cache is a trie with one layer per capture position, built entirely
//! out of host heap objects so the collector alone decides what survives.
//! Every node is a tuple `[primitive_partition, weak_partition, terminal]`:
//!
//! - a `Primitive` component selects a child through the node's strong
//!   value-keyed map;
//! - an `ObjectRef`/`CellRef` component selects a child through the node's
//!   ephemeron map, which neither retains the key nor keeps the child alive
//!   once the key is unreachable from outside the cache;
//! - the function instance sits in the terminal slot of the last node, so it
//!   is strongly held for all-primitive keys and otherwise lives exactly as
//!   long as every object component of its key.
//!
//! Losing one weak edge orphans the whole sub-trie below it, which the next
//! collection reclaims in one pass. Partitions are created lazily; the root
//! node is pinned for the lifetime of the cache.
//!
//! A capture position has a fixed mode (value or cell), so object and cell
//! identities never share one layer's ephemeron map.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::heap::{EphemeronHost, GcObjectId, HeapError};
use crate::key::{KeyComponent, KeyTuple};
use crate::scope::SiteId;
use crate::value::Value;

pub const NODE_PRIMITIVE: usize = 0;
pub const NODE_WEAK: usize = 1;
pub const NODE_TERMINAL: usize = 2;
const NODE_LEN: usize = 3;

// ---------------------------------------------------------------------------
// Errors / stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum CacheError {
    #[error("cache for {site} expects {expected} key components, got {actual}")]
    ArityMismatch {
        site: SiteId,
        expected: usize,
        actual: usize,
    },
    #[error("cache consistency violation at {site}: {detail}")]
    ConsistencyViolation { site: SiteId, detail: String },
    #[error(transparent)]
    Host(#[from] HeapError),
}

impl CacheError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            Self::ArityMismatch { .. } => "FE-MEMO-0601",
            Self::ConsistencyViolation { .. } => "FE-MEMO-0602",
            Self::Host(err) => err.stable_code(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    /// Built instances dropped because an entry already existed.
    pub discarded: u64,
    /// Trie nodes removed by [`CompositeEphemeronCache::compact`].
    pub pruned_nodes: u64,
}

impl CacheStats {
    pub fn merge(&mut self, other: &Self) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.inserts += other.inserts;
        self.discarded += other.discarded;
        self.pruned_nodes += other.pruned_nodes;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    Hit,
    Miss,
}

impl CacheOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
        }
    }
}

// ---------------------------------------------------------------------------
// CompositeEphemeronCache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeEphemeronCache {
    site: SiteId,
    arity: usize,
    root: GcObjectId,
    stats: CacheStats,
}

impl CompositeEphemeronCache {
    /// Allocate and pin the root node.
    pub fn new(host: &mut impl EphemeronHost, site: SiteId, arity: usize) -> Result<Self, CacheError> {
        let root = host.new_tuple(NODE_LEN);
        host.pin(root)?;
        Ok(Self {
            site,
            arity,
            root,
            stats: CacheStats::default(),
        })
    }

    /// Unpin the root; the whole trie becomes collectible.
    pub fn release(self, host: &mut impl EphemeronHost) -> Result<(), CacheError> {
        host.unpin(self.root)?;
        Ok(())
    }

    pub fn site(&self) -> SiteId {
        self.site
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn root(&self) -> GcObjectId {
        self.root
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Walk the layers for `key`; any missing layer is a miss.
    pub fn lookup(
        &self,
        host: &impl EphemeronHost,
        key: &KeyTuple,
    ) -> Result<Option<GcObjectId>, CacheError> {
        self.check_arity(key)?;
        let mut node = self.root;
        for component in key.components() {
            match self.child(host, node, component)? {
                Some(child) => node = child,
                None => return Ok(None),
            }
        }
        self.terminal(host, node)
    }

    /// Associate `key` with `function` unless an association exists, in
    /// which case the existing instance is kept and returned.
    pub fn insert(
        &mut self,
        host: &mut impl EphemeronHost,
        key: &KeyTuple,
        function: GcObjectId,
    ) -> Result<GcObjectId, CacheError> {
        self.check_arity(key)?;
        let mut node = self.root;
        for component in key.components() {
            node = self.child_or_create(host, node, component)?;
        }
        if let Some(existing) = self.terminal(&*host, node)? {
            self.stats.discarded += 1;
            return Ok(existing);
        }
        host.tuple_set(node, NODE_TERMINAL, Value::Object(function))?;
        self.stats.inserts += 1;
        Ok(function)
    }

    /// Return the instance for `key`, building and inserting one on a miss.
    pub fn get_or_insert_with<H, F, E>(
        &mut self,
        host: &mut H,
        key: &KeyTuple,
        build: F,
    ) -> Result<(GcObjectId, CacheOutcome), E>
    where
        H: EphemeronHost,
        F: FnOnce(&mut H) -> Result<GcObjectId, E>,
        E: From<CacheError>,
    {
        if let Some(function) = self.lookup(&*host, key)? {
            self.stats.hits += 1;
            return Ok((function, CacheOutcome::Hit));
        }
        self.stats.misses += 1;
        let built = build(host)?;
        let stored = self.insert(host, key, built)?;
        Ok((stored, CacheOutcome::Miss))
    }

    /// Number of reachable terminal entries.
    pub fn live_entries(&self, host: &impl EphemeronHost) -> Result<usize, CacheError> {
        let mut count = 0usize;
        let mut stack = vec![self.root];
        while let Some(node) = stack.pop() {
            if self.terminal(host, node)?.is_some() {
                count += 1;
            }
            stack.extend(self.children(host, node)?);
        }
        Ok(count)
    }

    /// Drop trie nodes left without entries after their keys were collected.
    /// Returns the number of nodes removed.
    pub fn compact(&mut self, host: &mut impl EphemeronHost) -> Result<usize, CacheError> {
        let (_, pruned) = self.compact_node(host, self.root)?;
        self.stats.pruned_nodes += pruned as u64;
        Ok(pruned)
    }

    // -----------------------------------------------------------------------
    // Node helpers
    // -----------------------------------------------------------------------

    fn check_arity(&self, key: &KeyTuple) -> Result<(), CacheError> {
        if key.arity() != self.arity {
            return Err(CacheError::ArityMismatch {
                site: self.site,
                expected: self.arity,
                actual: key.arity(),
            });
        }
        Ok(())
    }

    fn violation(&self, detail: String) -> CacheError {
        CacheError::ConsistencyViolation {
            site: self.site,
            detail,
        }
    }

    /// Partition object in `slot` of `node`, if created.
    fn partition(
        &self,
        host: &impl EphemeronHost,
        node: GcObjectId,
        slot: usize,
    ) -> Result<Option<GcObjectId>, CacheError> {
        match host.tuple_get(node, slot)? {
            Value::Undefined => Ok(None),
            Value::Object(map) => Ok(Some(map)),
            other => Err(self.violation(format!(
                "partition slot {slot} of {node} holds a {}",
                other.type_name()
            ))),
        }
    }

    fn as_node(&self, value: Option<Value>) -> Result<Option<GcObjectId>, CacheError> {
        match value {
            None => Ok(None),
            Some(Value::Object(child)) => Ok(Some(child)),
            Some(other) => Err(self.violation(format!("child edge holds a {}", other.type_name()))),
        }
    }

    fn terminal(&self, host: &impl EphemeronHost, node: GcObjectId) -> Result<Option<GcObjectId>, CacheError> {
        match host.tuple_get(node, NODE_TERMINAL)? {
            Value::Undefined => Ok(None),
            Value::Object(function) => Ok(Some(function)),
            other => Err(self.violation(format!("terminal of {node} holds a {}", other.type_name()))),
        }
    }

    fn child(
        &self,
        host: &impl EphemeronHost,
        node: GcObjectId,
        component: &KeyComponent,
    ) -> Result<Option<GcObjectId>, CacheError> {
        match component {
            KeyComponent::Primitive(key) => match self.partition(host, node, NODE_PRIMITIVE)? {
                Some(map) => self.as_node(host.strong_map_get(map, key)?),
                None => Ok(None),
            },
            KeyComponent::ObjectRef(id) | KeyComponent::CellRef(id) => {
                match self.partition(host, node, NODE_WEAK)? {
                    Some(map) => self.as_node(host.weak_map_get(map, *id)?),
                    None => Ok(None),
                }
            }
        }
    }

    fn child_or_create(
        &self,
        host: &mut impl EphemeronHost,
        node: GcObjectId,
        component: &KeyComponent,
    ) -> Result<GcObjectId, CacheError> {
        if let Some(child) = self.child(&*host, node, component)? {
            return Ok(child);
        }
        let child = host.new_tuple(NODE_LEN);
        match component {
            KeyComponent::Primitive(key) => {
                let map = match self.partition(&*host, node, NODE_PRIMITIVE)? {
                    Some(map) => map,
                    None => {
                        let map = host.new_strong_map();
                        host.tuple_set(node, NODE_PRIMITIVE, Value::Object(map))?;
                        map
                    }
                };
                host.strong_map_set(map, key.clone(), Value::Object(child))?;
            }
            KeyComponent::ObjectRef(id) | KeyComponent::CellRef(id) => {
                let map = match self.partition(&*host, node, NODE_WEAK)? {
                    Some(map) => map,
                    None => {
                        let map = host.new_weak_map();
                        host.tuple_set(node, NODE_WEAK, Value::Object(map))?;
                        map
                    }
                };
                host.weak_map_set(map, *id, Value::Object(child))?;
            }
        }
        Ok(child)
    }

    fn children(&self, host: &impl EphemeronHost, node: GcObjectId) -> Result<Vec<GcObjectId>, CacheError> {
        let mut out = Vec::new();
        if let Some(map) = self.partition(host, node, NODE_PRIMITIVE)? {
            for (_, value) in host.strong_map_entries(map)? {
                out.extend(self.as_node(Some(value))?);
            }
        }
        if let Some(map) = self.partition(host, node, NODE_WEAK)? {
            for (_, value) in host.weak_map_entries(map)? {
                out.extend(self.as_node(Some(value))?);
            }
        }
        Ok(out)
    }

    /// Returns whether `node` is now empty and how many nodes were pruned
    /// beneath it.
    fn compact_node(
        &self,
        host: &mut impl EphemeronHost,
        node: GcObjectId,
    ) -> Result<(bool, usize), CacheError> {
        let mut pruned = 0usize;

        if let Some(map) = self.partition(&*host, node, NODE_PRIMITIVE)? {
            for (key, value) in host.strong_map_entries(map)? {
                if let Some(child) = self.as_node(Some(value))? {
                    let (empty, below) = self.compact_node(host, child)?;
                    pruned += below;
                    if empty {
                        host.strong_map_remove(map, &key)?;
                        pruned += 1;
                    }
                }
            }
            if host.strong_map_entries(map)?.is_empty() {
                host.tuple_set(node, NODE_PRIMITIVE, Value::Undefined)?;
            }
        }

        if let Some(map) = self.partition(&*host, node, NODE_WEAK)? {
            for (key, value) in host.weak_map_entries(map)? {
                if let Some(child) = self.as_node(Some(value))? {
                    let (empty, below) = self.compact_node(host, child)?;
                    pruned += below;
                    if empty {
                        host.weak_map_delete(map, key)?;
                        pruned += 1;
                    }
                }
            }
            if host.weak_map_entries(map)?.is_empty() {
                host.tuple_set(node, NODE_WEAK, Value::Undefined)?;
            }
        }

        let empty = self.terminal(&*host, node)?.is_none()
            && self.partition(&*host, node, NODE_PRIMITIVE)?.is_none()
            && self.partition(&*host, node, NODE_WEAK)?.is_none();
        Ok((empty, pruned))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
