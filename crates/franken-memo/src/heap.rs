//! Deterministic host heap with weak references and ephemeron maps.
//!
//! Provides the collector contract the memoization core consumes:
//! - explicit root counts, with collection only at explicit [`Heap::collect`]
//!   calls so evaluation never observes a collection mid-step;
//! - weak references with queued cleanup records
//!   ([`Heap::register_weak`], [`Heap::deref_weak`],
//!   [`Heap::drain_finalizations`]);
//! - weak-keyed maps with ephemeron semantics: an entry's value is traced
//!   only once its key is reachable by some other path, and entries whose
//!   key dies are removed during sweep.
//!
//! Mark-sweep over a `BTreeMap` keeps every collection reproducible.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scope::{BindingId, ScopeId, SiteId};
use crate::value::{PrimitiveKey, Value};

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

/// Unique identity of a heap object. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GcObjectId(u64);

impl GcObjectId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for GcObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj-{}", self.0)
    }
}

/// Handle returned by [`Heap::register_weak`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WeakHandle(u64);

// ---------------------------------------------------------------------------
// Object payloads
// ---------------------------------------------------------------------------

/// Link from an environment record to whatever encloses it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvironmentParent {
    None,
    Environment(GcObjectId),
    /// Capture table of the memoized function whose activation this is.
    Captures(GcObjectId),
}

/// Runtime instance of one [`Scope`](crate::scope::Scope).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub scope: ScopeId,
    pub parent: EnvironmentParent,
    /// Indexed by `Binding::slot`; `None` is the temporal dead zone.
    pub slots: Vec<Option<Value>>,
    /// Present on environments of scopes that provide `this`.
    pub this_value: Option<Value>,
}

/// How a function instance reaches the bindings it closes over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClosureEnvironment {
    /// Ordinary closure over the full creation environment.
    Chain(GcObjectId),
    /// Memoized closure: exactly the captures named by its capture spec.
    Captured {
        bindings: Vec<(BindingId, CapturedSlot)>,
        this_value: Option<Value>,
    },
}

/// Storage of one capture in a memoized instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapturedSlot {
    /// Binding already holding its final value when the instance was created.
    Value(Option<Value>),
    /// Binding not yet initialized at creation; read through its slot.
    Binding { env: GcObjectId, index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionObject {
    pub site: SiteId,
    pub environment: ClosureEnvironment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    Ordinary {
        properties: BTreeMap<String, Value>,
    },
    Array {
        elements: Vec<Value>,
    },
    /// Stable-identity box; `None` until first initialized.
    Cell {
        contents: Option<Value>,
    },
    Environment(EnvironmentRecord),
    Function(FunctionObject),
    /// Result of calling a generator or async function; its body is opaque.
    Suspended {
        function: GcObjectId,
        arguments: Vec<Value>,
    },
    /// Fixed-length strong record.
    Tuple {
        slots: Vec<Value>,
    },
    /// Value-keyed map with strong keys and values.
    StrongMap {
        entries: BTreeMap<PrimitiveKey, Value>,
    },
    /// Identity-keyed ephemeron map.
    WeakMap {
        entries: BTreeMap<GcObjectId, Value>,
    },
}

impl ObjectKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ordinary { .. } => "ordinary",
            Self::Array { .. } => "array",
            Self::Cell { .. } => "cell",
            Self::Environment(_) => "environment",
            Self::Function(_) => "function",
            Self::Suspended { .. } => "suspended",
            Self::Tuple { .. } => "tuple",
            Self::StrongMap { .. } => "strong_map",
            Self::WeakMap { .. } => "weak_map",
        }
    }

    /// Push every strongly referenced object id onto `out`.
    fn trace_strong(&self, out: &mut Vec<GcObjectId>) {
        fn push(value: &Value, out: &mut Vec<GcObjectId>) {
            if let Value::Object(id) = value {
                out.push(*id);
            }
        }
        match self {
            Self::Ordinary { properties } => properties.values().for_each(|v| push(v, out)),
            Self::Array { elements } => elements.iter().for_each(|v| push(v, out)),
            Self::Cell { contents } => contents.iter().for_each(|v| push(v, out)),
            Self::Environment(record) => {
                match record.parent {
                    EnvironmentParent::None => {}
                    EnvironmentParent::Environment(id) | EnvironmentParent::Captures(id) => {
                        out.push(id)
                    }
                }
                record.slots.iter().flatten().for_each(|v| push(v, out));
                record.this_value.iter().for_each(|v| push(v, out));
            }
            Self::Function(function) => match &function.environment {
                ClosureEnvironment::Chain(env) => out.push(*env),
                ClosureEnvironment::Captured {
                    bindings,
                    this_value,
                } => {
                    for (_, slot) in bindings {
                        match slot {
                            CapturedSlot::Value(value) => value.iter().for_each(|v| push(v, out)),
                            CapturedSlot::Binding { env, .. } => out.push(*env),
                        }
                    }
                    this_value.iter().for_each(|v| push(v, out));
                }
            },
            Self::Suspended {
                function,
                arguments,
            } => {
                out.push(*function);
                arguments.iter().for_each(|v| push(v, out));
            }
            Self::Tuple { slots } => slots.iter().for_each(|v| push(v, out)),
            Self::StrongMap { entries } => entries.values().for_each(|v| push(v, out)),
            // Ephemeron entries are traced by the fixpoint in `mark`.
            Self::WeakMap { .. } => {}
        }
    }
}

/// A managed object and its root count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapObject {
    pub id: GcObjectId,
    pub kind: ObjectKind,
    pub roots: u32,
}

// ---------------------------------------------------------------------------
// Weak references
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct WeakRegistration {
    target: GcObjectId,
    token: u64,
    cleared: bool,
}

/// Cleanup record queued when a weakly registered target is reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizationRecord {
    pub handle: WeakHandle,
    pub target: GcObjectId,
    pub token: u64,
}

// ---------------------------------------------------------------------------
// Errors / stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum HeapError {
    #[error("object {object_id} not found in heap")]
    ObjectNotFound { object_id: GcObjectId },
    #[error("object {object_id} is a {actual}, expected {expected}")]
    KindMismatch {
        object_id: GcObjectId,
        expected: String,
        actual: String,
    },
    #[error("index {index} out of bounds for {object_id}")]
    IndexOutOfBounds { object_id: GcObjectId, index: usize },
    #[error("object {object_id} is not rooted")]
    NotRooted { object_id: GcObjectId },
}

impl HeapError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            Self::ObjectNotFound { .. } => "FE-MEMO-0501",
            Self::KindMismatch { .. } => "FE-MEMO-0502",
            Self::IndexOutOfBounds { .. } => "FE-MEMO-0503",
            Self::NotRooted { .. } => "FE-MEMO-0504",
        }
    }
}

/// Statistics from a single collection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CollectionStats {
    pub marked_count: u64,
    pub swept_count: u64,
    /// Weak-map entries dropped because their key was reclaimed.
    pub weak_entries_cleared: u64,
    /// Cleanup records queued for reclaimed weak-reference targets.
    pub finalizations_queued: u64,
    /// Ephemeron fixpoint rounds needed to finish marking.
    pub ephemeron_rounds: u64,
}

// ---------------------------------------------------------------------------
// EphemeronHost: the capability the cache is composed from
// ---------------------------------------------------------------------------

/// Host capability consumed by the composite ephemeron cache: pinned roots,
/// strong tuples and maps, and an identity-keyed ephemeron map.
pub trait EphemeronHost {
    fn pin(&mut self, id: GcObjectId) -> Result<(), HeapError>;
    fn unpin(&mut self, id: GcObjectId) -> Result<(), HeapError>;

    fn new_tuple(&mut self, len: usize) -> GcObjectId;
    fn tuple_get(&self, tuple: GcObjectId, index: usize) -> Result<Value, HeapError>;
    fn tuple_set(&mut self, tuple: GcObjectId, index: usize, value: Value)
    -> Result<(), HeapError>;

    fn new_strong_map(&mut self) -> GcObjectId;
    fn strong_map_get(
        &self,
        map: GcObjectId,
        key: &PrimitiveKey,
    ) -> Result<Option<Value>, HeapError>;
    fn strong_map_set(
        &mut self,
        map: GcObjectId,
        key: PrimitiveKey,
        value: Value,
    ) -> Result<(), HeapError>;
    fn strong_map_remove(&mut self, map: GcObjectId, key: &PrimitiveKey)
    -> Result<bool, HeapError>;
    fn strong_map_entries(&self, map: GcObjectId)
    -> Result<Vec<(PrimitiveKey, Value)>, HeapError>;

    fn new_weak_map(&mut self) -> GcObjectId;
    fn weak_map_get(&self, map: GcObjectId, key: GcObjectId) -> Result<Option<Value>, HeapError>;
    /// Fails with [`HeapError::ObjectNotFound`] when `key` is not live.
    fn weak_map_set(
        &mut self,
        map: GcObjectId,
        key: GcObjectId,
        value: Value,
    ) -> Result<(), HeapError>;
    fn weak_map_delete(&mut self, map: GcObjectId, key: GcObjectId) -> Result<bool, HeapError>;
    fn weak_map_entries(&self, map: GcObjectId) -> Result<Vec<(GcObjectId, Value)>, HeapError>;
}

// ---------------------------------------------------------------------------
// Heap
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Heap {
    objects: BTreeMap<GcObjectId, HeapObject>,
    weak_refs: BTreeMap<WeakHandle, WeakRegistration>,
    pending_finalizations: Vec<FinalizationRecord>,
    next_id: u64,
    next_weak: u64,
    allocations_since_collect: u64,
    collection_count: u64,
    total_swept: u64,
}

fn kind_mismatch(id: GcObjectId, expected: &str, actual: &ObjectKind) -> HeapError {
    HeapError::KindMismatch {
        object_id: id,
        expected: expected.to_string(),
        actual: actual.name().to_string(),
    }
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an unrooted object.
    pub fn allocate(&mut self, kind: ObjectKind) -> GcObjectId {
        let id = GcObjectId(self.next_id);
        self.next_id += 1;
        self.allocations_since_collect += 1;
        self.objects.insert(id, HeapObject { id, kind, roots: 0 });
        id
    }

    pub fn root(&mut self, id: GcObjectId) -> Result<(), HeapError> {
        let obj = self
            .objects
            .get_mut(&id)
            .ok_or(HeapError::ObjectNotFound { object_id: id })?;
        obj.roots += 1;
        Ok(())
    }

    pub fn unroot(&mut self, id: GcObjectId) -> Result<(), HeapError> {
        let obj = self
            .objects
            .get_mut(&id)
            .ok_or(HeapError::ObjectNotFound { object_id: id })?;
        if obj.roots == 0 {
            return Err(HeapError::NotRooted { object_id: id });
        }
        obj.roots -= 1;
        Ok(())
    }

    pub fn contains(&self, id: GcObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn get(&self, id: GcObjectId) -> Option<&HeapObject> {
        self.objects.get(&id)
    }

    pub fn kind(&self, id: GcObjectId) -> Result<&ObjectKind, HeapError> {
        self.objects
            .get(&id)
            .map(|obj| &obj.kind)
            .ok_or(HeapError::ObjectNotFound { object_id: id })
    }

    pub fn kind_mut(&mut self, id: GcObjectId) -> Result<&mut ObjectKind, HeapError> {
        self.objects
            .get_mut(&id)
            .map(|obj| &mut obj.kind)
            .ok_or(HeapError::ObjectNotFound { object_id: id })
    }

    pub fn environment(&self, id: GcObjectId) -> Result<&EnvironmentRecord, HeapError> {
        match self.kind(id)? {
            ObjectKind::Environment(record) => Ok(record),
            other => Err(kind_mismatch(id, "environment", other)),
        }
    }

    pub fn environment_mut(&mut self, id: GcObjectId) -> Result<&mut EnvironmentRecord, HeapError> {
        match self.kind_mut(id)? {
            ObjectKind::Environment(record) => Ok(record),
            other => Err(kind_mismatch(id, "environment", other)),
        }
    }

    pub fn function(&self, id: GcObjectId) -> Result<&FunctionObject, HeapError> {
        match self.kind(id)? {
            ObjectKind::Function(function) => Ok(function),
            other => Err(kind_mismatch(id, "function", other)),
        }
    }

    pub fn cell_contents(&self, id: GcObjectId) -> Result<Option<&Value>, HeapError> {
        match self.kind(id)? {
            ObjectKind::Cell { contents } => Ok(contents.as_ref()),
            other => Err(kind_mismatch(id, "cell", other)),
        }
    }

    pub fn set_cell_contents(&mut self, id: GcObjectId, value: Value) -> Result<(), HeapError> {
        match self.kind_mut(id)? {
            ObjectKind::Cell { contents } => {
                *contents = Some(value);
                Ok(())
            }
            other => Err(kind_mismatch(id, "cell", other)),
        }
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn collection_count(&self) -> u64 {
        self.collection_count
    }

    pub fn total_swept(&self) -> u64 {
        self.total_swept
    }

    pub fn allocations_since_collect(&self) -> u64 {
        self.allocations_since_collect
    }

    // -----------------------------------------------------------------------
    // Weak references
    // -----------------------------------------------------------------------

    /// Register a weak reference to `target`; `token` is handed back in the
    /// cleanup record once the target is reclaimed.
    pub fn register_weak(&mut self, target: GcObjectId, token: u64) -> Result<WeakHandle, HeapError> {
        if !self.contains(target) {
            return Err(HeapError::ObjectNotFound { object_id: target });
        }
        let handle = WeakHandle(self.next_weak);
        self.next_weak += 1;
        self.weak_refs.insert(
            handle,
            WeakRegistration {
                target,
                token,
                cleared: false,
            },
        );
        Ok(handle)
    }

    /// The target if it is still live.
    pub fn deref_weak(&self, handle: WeakHandle) -> Option<GcObjectId> {
        self.weak_refs
            .get(&handle)
            .filter(|reg| !reg.cleared)
            .map(|reg| reg.target)
    }

    /// Take all cleanup records queued by past collections.
    pub fn drain_finalizations(&mut self) -> Vec<FinalizationRecord> {
        std::mem::take(&mut self.pending_finalizations)
    }

    // -----------------------------------------------------------------------
    // Collection
    // -----------------------------------------------------------------------

    /// Mark from roots with an ephemeron fixpoint, then sweep.
    pub fn collect(&mut self) -> CollectionStats {
        let (marked, ephemeron_rounds) = self.mark();

        let before = self.objects.len() as u64;
        self.objects.retain(|id, _| marked.contains(id));
        let swept_count = before - self.objects.len() as u64;

        let mut weak_entries_cleared = 0u64;
        for obj in self.objects.values_mut() {
            if let ObjectKind::WeakMap { entries } = &mut obj.kind {
                let len = entries.len();
                entries.retain(|key, _| marked.contains(key));
                weak_entries_cleared += (len - entries.len()) as u64;
            }
        }

        let mut finalizations_queued = 0u64;
        for (handle, reg) in &mut self.weak_refs {
            if !reg.cleared && !marked.contains(&reg.target) {
                reg.cleared = true;
                self.pending_finalizations.push(FinalizationRecord {
                    handle: *handle,
                    target: reg.target,
                    token: reg.token,
                });
                finalizations_queued += 1;
            }
        }

        self.collection_count += 1;
        self.total_swept += swept_count;
        self.allocations_since_collect = 0;

        CollectionStats {
            marked_count: marked.len() as u64,
            swept_count,
            weak_entries_cleared,
            finalizations_queued,
            ephemeron_rounds,
        }
    }

    fn mark(&self) -> (BTreeSet<GcObjectId>, u64) {
        let mut marked: BTreeSet<GcObjectId> = BTreeSet::new();
        let mut work: Vec<GcObjectId> = self
            .objects
            .values()
            .filter(|obj| obj.roots > 0)
            .map(|obj| obj.id)
            .collect();
        let mut weak_maps: Vec<GcObjectId> = Vec::new();
        let mut rounds = 0u64;

        loop {
            while let Some(id) = work.pop() {
                if marked.contains(&id) {
                    continue;
                }
                // Dangling ids (already swept) are ignored.
                let Some(obj) = self.objects.get(&id) else {
                    continue;
                };
                marked.insert(id);
                if matches!(obj.kind, ObjectKind::WeakMap { .. }) {
                    weak_maps.push(id);
                }
                obj.kind.trace_strong(&mut work);
            }

            rounds += 1;
            for map in &weak_maps {
                if let Some(ObjectKind::WeakMap { entries }) =
                    self.objects.get(map).map(|obj| &obj.kind)
                {
                    for (key, value) in entries {
                        if let (true, Value::Object(target)) = (marked.contains(key), value) {
                            if !marked.contains(target) {
                                work.push(*target);
                            }
                        }
                    }
                }
            }
            if work.is_empty() {
                break;
            }
        }

        (marked, rounds)
    }

    fn tuple_slots(&self, id: GcObjectId) -> Result<&Vec<Value>, HeapError> {
        match self.kind(id)? {
            ObjectKind::Tuple { slots } => Ok(slots),
            other => Err(kind_mismatch(id, "tuple", other)),
        }
    }

    fn strong_entries(&self, id: GcObjectId) -> Result<&BTreeMap<PrimitiveKey, Value>, HeapError> {
        match self.kind(id)? {
            ObjectKind::StrongMap { entries } => Ok(entries),
            other => Err(kind_mismatch(id, "strong_map", other)),
        }
    }

    fn strong_entries_mut(
        &mut self,
        id: GcObjectId,
    ) -> Result<&mut BTreeMap<PrimitiveKey, Value>, HeapError> {
        match self.kind_mut(id)? {
            ObjectKind::StrongMap { entries } => Ok(entries),
            other => Err(kind_mismatch(id, "strong_map", other)),
        }
    }

    fn weak_entries(&self, id: GcObjectId) -> Result<&BTreeMap<GcObjectId, Value>, HeapError> {
        match self.kind(id)? {
            ObjectKind::WeakMap { entries } => Ok(entries),
            other => Err(kind_mismatch(id, "weak_map", other)),
        }
    }

    fn weak_entries_mut(
        &mut self,
        id: GcObjectId,
    ) -> Result<&mut BTreeMap<GcObjectId, Value>, HeapError> {
        match self.kind_mut(id)? {
            ObjectKind::WeakMap { entries } => Ok(entries),
            other => Err(kind_mismatch(id, "weak_map", other)),
        }
    }
}

impl EphemeronHost for Heap {
    fn pin(&mut self, id: GcObjectId) -> Result<(), HeapError> {
        self.root(id)
    }

    fn unpin(&mut self, id: GcObjectId) -> Result<(), HeapError> {
        self.unroot(id)
    }

    fn new_tuple(&mut self, len: usize) -> GcObjectId {
        self.allocate(ObjectKind::Tuple {
            slots: vec![Value::Undefined; len],
        })
    }

    fn tuple_get(&self, tuple: GcObjectId, index: usize) -> Result<Value, HeapError> {
        self.tuple_slots(tuple)?
            .get(index)
            .cloned()
            .ok_or(HeapError::IndexOutOfBounds {
                object_id: tuple,
                index,
            })
    }

    fn tuple_set(
        &mut self,
        tuple: GcObjectId,
        index: usize,
        value: Value,
    ) -> Result<(), HeapError> {
        match self.kind_mut(tuple)? {
            ObjectKind::Tuple { slots } => {
                let slot = slots.get_mut(index).ok_or(HeapError::IndexOutOfBounds {
                    object_id: tuple,
                    index,
                })?;
                *slot = value;
                Ok(())
            }
            other => Err(kind_mismatch(tuple, "tuple", other)),
        }
    }

    fn new_strong_map(&mut self) -> GcObjectId {
        self.allocate(ObjectKind::StrongMap {
            entries: BTreeMap::new(),
        })
    }

    fn strong_map_get(
        &self,
        map: GcObjectId,
        key: &PrimitiveKey,
    ) -> Result<Option<Value>, HeapError> {
        Ok(self.strong_entries(map)?.get(key).cloned())
    }

    fn strong_map_set(
        &mut self,
        map: GcObjectId,
        key: PrimitiveKey,
        value: Value,
    ) -> Result<(), HeapError> {
        self.strong_entries_mut(map)?.insert(key, value);
        Ok(())
    }

    fn strong_map_remove(
        &mut self,
        map: GcObjectId,
        key: &PrimitiveKey,
    ) -> Result<bool, HeapError> {
        Ok(self.strong_entries_mut(map)?.remove(key).is_some())
    }

    fn strong_map_entries(
        &self,
        map: GcObjectId,
    ) -> Result<Vec<(PrimitiveKey, Value)>, HeapError> {
        Ok(self
            .strong_entries(map)?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn new_weak_map(&mut self) -> GcObjectId {
        self.allocate(ObjectKind::WeakMap {
            entries: BTreeMap::new(),
        })
    }

    fn weak_map_get(&self, map: GcObjectId, key: GcObjectId) -> Result<Option<Value>, HeapError> {
        Ok(self.weak_entries(map)?.get(&key).cloned())
    }

    fn weak_map_set(
        &mut self,
        map: GcObjectId,
        key: GcObjectId,
        value: Value,
    ) -> Result<(), HeapError> {
        if !self.contains(key) {
            return Err(HeapError::ObjectNotFound { object_id: key });
        }
        self.weak_entries_mut(map)?.insert(key, value);
        Ok(())
    }

    fn weak_map_delete(&mut self, map: GcObjectId, key: GcObjectId) -> Result<bool, HeapError> {
        Ok(self.weak_entries_mut(map)?.remove(&key).is_some())
    }

    fn weak_map_entries(&self, map: GcObjectId) -> Result<Vec<(GcObjectId, Value)>, HeapError> {
        Ok(self
            .weak_entries(map)?
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
