//! Evaluator glue around the memoization core.
//!
//! [`Runtime`] loads a program (resolution and capture analysis happen up
//! front, so analysis errors surface before any code runs), then evaluates
//! it with a small tree-walking interpreter over the host [`Heap`].
//!
//! Reaching a memoized definition site builds the site's key from the live
//! environment and asks the site's cache for an instance. A memoized
//! instance carries a flat capture table instead of its creation
//! environment; its activations read outer bindings through that table.
//! Unmemoized sites create a fresh closure over the full environment chain.
//!
//! Collection only happens in [`Runtime::collect_garbage`]. Values handed to
//! the host stay alive across a collection only while retained.

use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analyzer::{
    AnalysisReport, AnalysisTable, CaptureSpec, SiteAnalysis, UnmemoizedReason, analyze_program,
};
use crate::ast::{
    BinaryOp, Block, DeclarationKind, Expression, FunctionKind, FunctionNode, Identifier, Program,
    Resolution, Statement,
};
use crate::cache::CacheError;
use crate::config::{ConfigError, MemoConfig};
use crate::events::{
    COMPONENT_ANALYZER, COMPONENT_CACHE, COMPONENT_HEAP, COMPONENT_REGISTRY, COMPONENT_RESOLVER,
    EventLog,
};
use crate::heap::{
    CapturedSlot, ClosureEnvironment, CollectionStats, EnvironmentParent, EnvironmentRecord,
    FinalizationRecord, FunctionObject, GcObjectId, Heap, HeapError, ObjectKind, WeakHandle,
};
use crate::key::{KeyError, LiveScope, build_key};
use crate::registry::CacheRegistry;
use crate::resolver::{ResolveError, ResolvedProgram, SiteInfo, resolve};
use crate::scope::{BindingId, BindingStorage, ScopeError, ScopeId, ScopeTree, SiteId};
use crate::value::Value;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RuntimeError {
    #[error("ReferenceError: {name} is not defined")]
    ReferenceError { name: String },
    #[error("ReferenceError: cannot access '{name}' before initialization")]
    Uninitialized { name: String },
    #[error("TypeError: {detail} is not a function")]
    NotCallable { detail: String },
    #[error("TypeError: {detail}")]
    NotAnObject { detail: String },
    #[error("TypeError: {detail}")]
    TypeError { detail: String },
    #[error("unknown definition site {site}")]
    UnknownSite { site: SiteId },
    #[error("{what} was not annotated by the resolver")]
    Unannotated { what: String },
    #[error("dynamic evaluation is not supported")]
    DynamicEvalUnsupported,
    #[error("captured binding '{name}' is not assignable")]
    ImmutableCapture { name: String },
    #[error("program has already run")]
    AlreadyRan,
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Heap(#[from] HeapError),
    #[error(transparent)]
    Scope(#[from] ScopeError),
}

impl RuntimeError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            Self::ReferenceError { .. } => "FE-MEMO-0701",
            Self::Uninitialized { .. } => "FE-MEMO-0702",
            Self::NotCallable { .. } => "FE-MEMO-0703",
            Self::NotAnObject { .. } => "FE-MEMO-0704",
            Self::TypeError { .. } => "FE-MEMO-0705",
            Self::UnknownSite { .. } => "FE-MEMO-0706",
            Self::Unannotated { .. } => "FE-MEMO-0707",
            Self::DynamicEvalUnsupported => "FE-MEMO-0708",
            Self::ImmutableCapture { .. } => "FE-MEMO-0709",
            Self::AlreadyRan => "FE-MEMO-0710",
            Self::Key(err) => err.stable_code(),
            Self::Cache(err) => err.stable_code(),
            Self::Heap(err) => err.stable_code(),
            Self::Scope(err) => err.stable_code(),
        }
    }
}

/// Anything that can stop a program from loading or running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Analysis(#[from] AnalysisReport),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl MemoError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            Self::Config(err) => err.stable_code(),
            Self::Resolve(err) => err.stable_code(),
            Self::Analysis(report) => report
                .errors
                .first()
                .map(|err| err.stable_code())
                .unwrap_or("FE-MEMO-0300"),
            Self::Runtime(err) => err.stable_code(),
        }
    }
}

// ---------------------------------------------------------------------------
// Environment access
// ---------------------------------------------------------------------------

/// Where a binding's storage was found from some environment.
enum Location {
    Slot { env: GcObjectId, index: usize },
    Captured { function: GcObjectId, index: usize },
}

/// Walk outward from `env` to the storage of `binding`.
fn locate(
    heap: &Heap,
    tree: &ScopeTree,
    mut env: GcObjectId,
    binding: BindingId,
) -> Result<Option<Location>, RuntimeError> {
    let target = tree.binding(binding)?;
    loop {
        let record = heap.environment(env)?;
        if record.scope == target.scope {
            return Ok(Some(Location::Slot {
                env,
                index: target.slot as usize,
            }));
        }
        match record.parent {
            EnvironmentParent::Environment(parent) => env = parent,
            EnvironmentParent::Captures(function) => {
                return Ok(match &heap.function(function)?.environment {
                    ClosureEnvironment::Captured { bindings, .. } => bindings
                        .iter()
                        .position(|(id, _)| *id == binding)
                        .map(|index| Location::Captured { function, index }),
                    ClosureEnvironment::Chain(_) => None,
                });
            }
            EnvironmentParent::None => return Ok(None),
        }
    }
}

/// Raw storage at `location`: the value, or the cell for cell bindings.
fn raw_at(heap: &Heap, location: &Location) -> Result<Option<Value>, HeapError> {
    match *location {
        Location::Slot { env, index } => slot_at(heap, env, index),
        Location::Captured { function, index } => {
            let slot = captured_slot(heap, function, index)?;
            captured_raw(heap, &slot)
        }
    }
}

fn slot_at(heap: &Heap, env: GcObjectId, index: usize) -> Result<Option<Value>, HeapError> {
    heap.environment(env)?
        .slots
        .get(index)
        .cloned()
        .ok_or(HeapError::IndexOutOfBounds {
            object_id: env,
            index,
        })
}

fn captured_slot(heap: &Heap, function: GcObjectId, index: usize) -> Result<CapturedSlot, HeapError> {
    match &heap.function(function)?.environment {
        ClosureEnvironment::Captured { bindings, .. } => bindings
            .get(index)
            .map(|(_, slot)| slot.clone())
            .ok_or(HeapError::IndexOutOfBounds {
                object_id: function,
                index,
            }),
        ClosureEnvironment::Chain(_) => Err(HeapError::KindMismatch {
            object_id: function,
            expected: "memoized function".to_string(),
            actual: "closure".to_string(),
        }),
    }
}

fn captured_raw(heap: &Heap, slot: &CapturedSlot) -> Result<Option<Value>, HeapError> {
    match slot {
        CapturedSlot::Value(value) => Ok(value.clone()),
        CapturedSlot::Binding { env, index } => slot_at(heap, *env, *index),
    }
}

/// `this` of the activation of `provider`, as seen from `env`.
fn locate_this(heap: &Heap, mut env: GcObjectId, provider: ScopeId) -> Result<Option<Value>, HeapError> {
    loop {
        let record = heap.environment(env)?;
        if record.scope == provider {
            return Ok(record.this_value.clone());
        }
        match record.parent {
            EnvironmentParent::Environment(parent) => env = parent,
            EnvironmentParent::Captures(function) => {
                return Ok(match &heap.function(function)?.environment {
                    ClosureEnvironment::Captured { this_value, .. } => this_value.clone(),
                    ClosureEnvironment::Chain(_) => None,
                });
            }
            EnvironmentParent::None => return Ok(None),
        }
    }
}

/// Live bindings seen from one environment, for key building.
struct EnvView<'a> {
    heap: &'a Heap,
    tree: &'a ScopeTree,
    env: GcObjectId,
}

impl LiveScope for EnvView<'_> {
    fn slot(&self, binding: BindingId) -> Result<Option<Value>, KeyError> {
        match locate(self.heap, self.tree, self.env, binding) {
            Ok(Some(location)) => {
                raw_at(self.heap, &location).map_err(|_| KeyError::MissingBinding { binding })
            }
            _ => Err(KeyError::MissingBinding { binding }),
        }
    }

    fn this_value(&self, provider: ScopeId) -> Result<Value, KeyError> {
        locate_this(self.heap, self.env, provider)
            .ok()
            .flatten()
            .ok_or(KeyError::MissingThis)
    }

    fn is_cell(&self, object: GcObjectId) -> bool {
        matches!(self.heap.kind(object), Ok(ObjectKind::Cell { .. }))
    }
}

/// Initial slots for a fresh instance of `scope`.
fn initial_slots(heap: &mut Heap, tree: &ScopeTree, scope: ScopeId) -> Result<Vec<Option<Value>>, RuntimeError> {
    let scope = tree.scope(scope)?;
    let mut slots = Vec::with_capacity(scope.bindings.len());
    for id in &scope.bindings {
        let binding = tree.binding(*id)?;
        let initial = if binding.kind.is_lexical() {
            None
        } else {
            Some(Value::Undefined)
        };
        slots.push(match binding.storage {
            BindingStorage::Slot => initial,
            BindingStorage::Cell => Some(Value::Object(
                heap.allocate(ObjectKind::Cell { contents: initial }),
            )),
        });
    }
    Ok(slots)
}

/// Capture table of a new memoized instance reached from `env`.
///
/// A binding that already holds its final value is copied. One still in its
/// temporal dead zone, or a hoisted slot not yet written, is read through
/// its environment slot so a later initialization is seen by the instance.
fn captured_environment(
    heap: &Heap,
    tree: &ScopeTree,
    env: GcObjectId,
    spec: &CaptureSpec,
) -> Result<ClosureEnvironment, RuntimeError> {
    let mut bindings = Vec::with_capacity(spec.arity());
    let mut this_value = None;
    for capture in spec.captures() {
        let Some(binding) = capture.binding else {
            this_value = locate_this(heap, env, capture.source_scope)?;
            continue;
        };
        let declared = tree.binding(binding)?;
        let location = locate(heap, tree, env, binding)?.ok_or(KeyError::MissingBinding { binding })?;
        let slot = match location {
            Location::Captured { function, index } => captured_slot(heap, function, index)?,
            Location::Slot { env, index } => {
                let raw = slot_at(heap, env, index)?;
                let settled = declared.storage == BindingStorage::Cell
                    || (raw.is_some() && !declared.kind.is_provisional());
                if settled {
                    CapturedSlot::Value(raw)
                } else {
                    CapturedSlot::Binding { env, index }
                }
            }
        };
        bindings.push((binding, slot));
    }
    Ok(ClosureEnvironment::Captured {
        bindings,
        this_value,
    })
}

enum Completion {
    Normal,
    Return(Value),
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Runtime {
    program: Rc<Program>,
    tree: ScopeTree,
    sites: BTreeMap<SiteId, SiteInfo>,
    functions: BTreeMap<SiteId, Rc<FunctionNode>>,
    analysis: AnalysisTable,
    heap: Heap,
    registry: CacheRegistry,
    events: EventLog,
    config: MemoConfig,
    global_env: GcObjectId,
    global_object: GcObjectId,
    ran: bool,
}

impl Runtime {
    /// Resolve and analyze `program`. Fails before any evaluation if a
    /// memoized site captures a mutable binding without a cell.
    pub fn load(program: Program, config: MemoConfig) -> Result<Self, MemoError> {
        config.validate()?;
        let mut events = EventLog::new(config.trace_id.clone(), config.event_capacity);

        let resolved = resolve(program)?;
        events.ok(
            COMPONENT_RESOLVER,
            "resolve",
            None,
            format!(
                "sites={} scopes={} bindings={}",
                resolved.sites.len(),
                resolved.tree.scope_count(),
                resolved.tree.binding_count()
            ),
        );

        let analysis = analyze_program(&resolved)?;
        for (site, result) in analysis.iter() {
            match result {
                SiteAnalysis::Memoized(spec) => events.ok(
                    COMPONENT_ANALYZER,
                    "analyze",
                    Some(*site),
                    format!("captures=[{}] {}", spec.names().join(","), spec.fingerprint()),
                ),
                SiteAnalysis::Unmemoized {
                    reason: UnmemoizedReason::DynamicBody,
                } => events.emit(
                    COMPONENT_ANALYZER,
                    "analyze",
                    "unmemoized",
                    "",
                    Some(*site),
                    "dynamic_body",
                ),
                SiteAnalysis::Unmemoized { .. } => {}
            }
        }

        let functions: BTreeMap<SiteId, Rc<FunctionNode>> = resolved
            .program
            .functions()
            .into_iter()
            .filter_map(|node| node.site.map(|site| (site, Rc::new(node.clone()))))
            .collect();
        let ResolvedProgram {
            program,
            tree,
            sites,
        } = resolved;

        let mut heap = Heap::new();
        let global_object = heap.allocate(ObjectKind::Ordinary {
            properties: BTreeMap::new(),
        });
        heap.root(global_object).map_err(RuntimeError::from)?;
        let slots = initial_slots(&mut heap, &tree, tree.global())?;
        let global_env = heap.allocate(ObjectKind::Environment(EnvironmentRecord {
            scope: tree.global(),
            parent: EnvironmentParent::None,
            slots,
            this_value: Some(Value::Undefined),
        }));
        heap.root(global_env).map_err(RuntimeError::from)?;

        Ok(Self {
            program: Rc::new(program),
            tree,
            sites,
            functions,
            analysis,
            heap,
            registry: CacheRegistry::new(),
            events,
            config,
            global_env,
            global_object,
            ran: false,
        })
    }

    /// Execute the top-level statements once.
    pub fn run(&mut self) -> Result<Value, RuntimeError> {
        if self.ran {
            return Err(RuntimeError::AlreadyRan);
        }
        self.ran = true;
        let program = Rc::clone(&self.program);
        self.hoist_functions(self.global_env, &program.body)?;
        match self.execute_all(self.global_env, &program.body)? {
            Completion::Return(value) => Ok(value),
            Completion::Normal => Ok(Value::Undefined),
        }
    }

    // -----------------------------------------------------------------------
    // Host API
    // -----------------------------------------------------------------------

    /// Top-level binding or global property named `name`.
    pub fn global(&self, name: &str) -> Option<Value> {
        match self.tree.lookup_local(self.tree.global(), name) {
            Some(binding) => self.read_binding(self.global_env, binding, name).ok(),
            None => match self.heap.kind(self.global_object) {
                Ok(ObjectKind::Ordinary { properties }) => properties.get(name).cloned(),
                _ => None,
            },
        }
    }

    pub fn set_global(&mut self, name: &str, value: Value) -> Result<(), RuntimeError> {
        match self.tree.lookup_local(self.tree.global(), name) {
            Some(binding) => self.write_binding(self.global_env, binding, name, value),
            None => self.set_property(&Value::Object(self.global_object), name, value),
        }
    }

    pub fn call(&mut self, function: &Value, this: Value, arguments: Vec<Value>) -> Result<Value, RuntimeError> {
        self.call_function(function, this, arguments)
    }

    /// Call the global named `name` with an undefined `this`.
    pub fn call_global(&mut self, name: &str, arguments: Vec<Value>) -> Result<Value, RuntimeError> {
        let function = self.global(name).ok_or_else(|| RuntimeError::ReferenceError {
            name: name.to_string(),
        })?;
        self.call_function(&function, Value::Undefined, arguments)
    }

    pub fn alloc_object(&mut self, properties: Vec<(&str, Value)>) -> Value {
        Value::Object(self.heap.allocate(ObjectKind::Ordinary {
            properties: properties
                .into_iter()
                .map(|(key, value)| (key.to_string(), value))
                .collect(),
        }))
    }

    pub fn alloc_array(&mut self, elements: Vec<Value>) -> Value {
        Value::Object(self.heap.allocate(ObjectKind::Array { elements }))
    }

    pub fn property(&self, target: &Value, name: &str) -> Result<Value, RuntimeError> {
        self.get_property(target, name)
    }

    /// Keep `value` alive across collections until released.
    pub fn retain(&mut self, value: &Value) -> Result<(), RuntimeError> {
        if let Some(id) = value.as_object() {
            self.heap.root(id)?;
        }
        Ok(())
    }

    pub fn release(&mut self, value: &Value) -> Result<(), RuntimeError> {
        if let Some(id) = value.as_object() {
            self.heap.unroot(id)?;
        }
        Ok(())
    }

    /// Run a full collection, then compact caches if configured.
    pub fn collect_garbage(&mut self) -> Result<CollectionStats, RuntimeError> {
        let stats = self.heap.collect();
        self.events.ok(
            COMPONENT_HEAP,
            "collect",
            None,
            format!(
                "marked={} swept={} weak_cleared={} finalizations={} rounds={}",
                stats.marked_count,
                stats.swept_count,
                stats.weak_entries_cleared,
                stats.finalizations_queued,
                stats.ephemeron_rounds
            ),
        );
        if self.config.prune_after_collect {
            let pruned = self.registry.compact_all(&mut self.heap)?;
            if pruned > 0 {
                self.events
                    .ok(COMPONENT_REGISTRY, "compact", None, format!("pruned={pruned}"));
            }
        }
        Ok(stats)
    }

    /// Collect when allocation pressure crosses the configured threshold.
    pub fn collect_if_needed(&mut self) -> Result<Option<CollectionStats>, RuntimeError> {
        if self
            .config
            .should_collect(self.heap.allocations_since_collect())
        {
            return self.collect_garbage().map(Some);
        }
        Ok(None)
    }

    pub fn register_weak(&mut self, value: &Value, token: u64) -> Result<WeakHandle, RuntimeError> {
        let id = value.as_object().ok_or_else(|| RuntimeError::NotAnObject {
            detail: format!("cannot weakly reference a {}", value.type_name()),
        })?;
        Ok(self.heap.register_weak(id, token)?)
    }

    pub fn deref_weak(&self, handle: WeakHandle) -> Option<Value> {
        self.heap.deref_weak(handle).map(Value::Object)
    }

    pub fn drain_finalizations(&mut self) -> Vec<FinalizationRecord> {
        self.heap.drain_finalizations()
    }

    pub fn site_named(&self, name: &str) -> Option<SiteId> {
        self.sites
            .values()
            .find(|info| info.name.as_deref() == Some(name))
            .map(|info| info.site)
    }

    pub fn site(&self, site: SiteId) -> Option<&SiteInfo> {
        self.sites.get(&site)
    }

    pub fn capture_spec(&self, site: SiteId) -> Option<&CaptureSpec> {
        self.analysis.spec(site)
    }

    pub fn analysis(&self) -> &AnalysisTable {
        &self.analysis
    }

    /// Definition site of a function instance.
    pub fn function_site(&self, value: &Value) -> Option<SiteId> {
        let id = value.as_object()?;
        self.heap.function(id).ok().map(|function| function.site)
    }

    /// Raw captured storage named `name` in a memoized instance (the cell
    /// itself for cell captures).
    pub fn captured(&self, function: &Value, name: &str) -> Option<Value> {
        let id = function.as_object()?;
        match &self.heap.function(id).ok()?.environment {
            ClosureEnvironment::Captured {
                bindings,
                this_value,
            } => {
                if name == "this" {
                    return this_value.clone();
                }
                bindings.iter().find_map(|(binding, slot)| {
                    let declared = self.tree.binding(*binding).ok()?;
                    if declared.name != name {
                        return None;
                    }
                    captured_raw(&self.heap, slot).ok().flatten()
                })
            }
            ClosureEnvironment::Chain(_) => None,
        }
    }

    /// Live entries in the cache of `site`; zero before its first reach.
    pub fn cache_entries(&self, site: SiteId) -> Result<usize, RuntimeError> {
        match self.registry.get(site) {
            Some(cache) => Ok(cache.live_entries(&self.heap)?),
            None => Ok(0),
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn registry(&self) -> &CacheRegistry {
        &self.registry
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn tree(&self) -> &ScopeTree {
        &self.tree
    }

    pub fn config(&self) -> &MemoConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Bindings
    // -----------------------------------------------------------------------

    fn new_env(
        &mut self,
        scope: ScopeId,
        parent: EnvironmentParent,
        this_value: Option<Value>,
    ) -> Result<GcObjectId, RuntimeError> {
        let slots = initial_slots(&mut self.heap, &self.tree, scope)?;
        Ok(self
            .heap
            .allocate(ObjectKind::Environment(EnvironmentRecord {
                scope,
                parent,
                slots,
                this_value,
            })))
    }

    fn read_binding(&self, env: GcObjectId, binding: BindingId, name: &str) -> Result<Value, RuntimeError> {
        let location = locate(&self.heap, &self.tree, env, binding)?.ok_or_else(|| {
            RuntimeError::ReferenceError {
                name: name.to_string(),
            }
        })?;
        let raw = raw_at(&self.heap, &location)?;
        let value = match (self.tree.binding(binding)?.storage, raw) {
            (BindingStorage::Cell, Some(Value::Object(cell))) => {
                self.heap.cell_contents(cell)?.cloned()
            }
            (_, raw) => raw,
        };
        value.ok_or_else(|| RuntimeError::Uninitialized {
            name: name.to_string(),
        })
    }

    fn write_binding(
        &mut self,
        env: GcObjectId,
        binding: BindingId,
        name: &str,
        value: Value,
    ) -> Result<(), RuntimeError> {
        let storage = self.tree.binding(binding)?.storage;
        let location = locate(&self.heap, &self.tree, env, binding)?.ok_or_else(|| {
            RuntimeError::ReferenceError {
                name: name.to_string(),
            }
        })?;
        if storage == BindingStorage::Cell {
            return match raw_at(&self.heap, &location)? {
                Some(Value::Object(cell)) => Ok(self.heap.set_cell_contents(cell, value)?),
                _ => Err(RuntimeError::ImmutableCapture {
                    name: name.to_string(),
                }),
            };
        }
        match location {
            Location::Slot { env, index } => {
                let record = self.heap.environment_mut(env)?;
                let slot = record
                    .slots
                    .get_mut(index)
                    .ok_or(HeapError::IndexOutOfBounds {
                        object_id: env,
                        index,
                    })?;
                *slot = Some(value);
                Ok(())
            }
            Location::Captured { .. } => Err(RuntimeError::ImmutableCapture {
                name: name.to_string(),
            }),
        }
    }

    fn read_identifier(&self, env: GcObjectId, identifier: &Identifier) -> Result<Value, RuntimeError> {
        match identifier.resolution {
            Resolution::Binding(binding) => self.read_binding(env, binding, &identifier.name),
            Resolution::Global => match self.heap.kind(self.global_object)? {
                ObjectKind::Ordinary { properties } if properties.contains_key(&identifier.name) => {
                    Ok(properties
                        .get(&identifier.name)
                        .cloned()
                        .unwrap_or_default())
                }
                _ => Err(RuntimeError::ReferenceError {
                    name: identifier.name.clone(),
                }),
            },
            Resolution::Unresolved => Err(RuntimeError::ReferenceError {
                name: identifier.name.clone(),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Functions
    // -----------------------------------------------------------------------

    /// Produce the function value for one reach of a definition site.
    fn instantiate_function(&mut self, node: &FunctionNode, env: GcObjectId) -> Result<Value, RuntimeError> {
        let site = node.site.ok_or_else(|| RuntimeError::Unannotated {
            what: format!("function '{}'", node.display_name()),
        })?;
        let spec = match self.analysis.get(site) {
            Some(SiteAnalysis::Memoized(spec)) => spec,
            Some(SiteAnalysis::Unmemoized { reason }) => {
                if *reason == UnmemoizedReason::DynamicBody && self.config.record_cache_events {
                    self.events.emit(
                        COMPONENT_CACHE,
                        "reach",
                        "unmemoized",
                        "",
                        Some(site),
                        "dynamic_body",
                    );
                }
                let closure = self.heap.allocate(ObjectKind::Function(FunctionObject {
                    site,
                    environment: ClosureEnvironment::Chain(env),
                }));
                return Ok(Value::Object(closure));
            }
            None => return Err(RuntimeError::UnknownSite { site }),
        };

        let view = EnvView {
            heap: &self.heap,
            tree: &self.tree,
            env,
        };
        let key = match build_key(spec, &view) {
            Ok(key) => key,
            Err(err) => {
                self.events.emit(
                    COMPONENT_CACHE,
                    "reach",
                    "error",
                    err.stable_code(),
                    Some(site),
                    err.to_string(),
                );
                return Err(err.into());
            }
        };
        let environment = captured_environment(&self.heap, &self.tree, env, spec)?;

        let (cache, created) = self
            .registry
            .get_or_create(&mut self.heap, site, spec.arity())?;
        let (function, outcome) = cache.get_or_insert_with(&mut self.heap, &key, |heap| {
            Ok::<_, RuntimeError>(heap.allocate(ObjectKind::Function(FunctionObject {
                site,
                environment,
            })))
        })?;

        if created {
            self.events.ok(
                COMPONENT_REGISTRY,
                "create_cache",
                Some(site),
                format!("arity={}", spec.arity()),
            );
        }
        if self.config.record_cache_events {
            self.events.emit(
                COMPONENT_CACHE,
                "reach",
                outcome.as_str(),
                "",
                Some(site),
                key.to_string(),
            );
        }
        Ok(Value::Object(function))
    }

    fn call_function(&mut self, callee: &Value, this: Value, arguments: Vec<Value>) -> Result<Value, RuntimeError> {
        let id = callee.as_object().ok_or_else(|| RuntimeError::NotCallable {
            detail: callee.type_name().to_string(),
        })?;
        let function = match self.heap.kind(id)? {
            ObjectKind::Function(function) => function.clone(),
            other => {
                return Err(RuntimeError::NotCallable {
                    detail: other.name().to_string(),
                });
            }
        };
        let node = self
            .functions
            .get(&function.site)
            .cloned()
            .ok_or(RuntimeError::UnknownSite {
                site: function.site,
            })?;

        // Generator and async bodies are opaque.
        if node.flavor.is_suspending() {
            return Ok(Value::Object(self.heap.allocate(ObjectKind::Suspended {
                function: id,
                arguments,
            })));
        }

        let scope = node.scope.ok_or_else(|| RuntimeError::Unannotated {
            what: format!("scope of '{}'", node.display_name()),
        })?;
        let parent = match function.environment {
            ClosureEnvironment::Chain(env) => EnvironmentParent::Environment(env),
            ClosureEnvironment::Captured { .. } => EnvironmentParent::Captures(id),
        };
        let this_value = if node.is_arrow() { None } else { Some(this) };
        let env = self.new_env(scope, parent, this_value)?;

        for (index, param) in node.params.iter().enumerate() {
            if let Some(binding) = param.binding() {
                let value = arguments.get(index).cloned().unwrap_or_default();
                self.write_binding(env, binding, &param.name, value)?;
            }
        }
        if let Some(rest) = &node.rest {
            if let Some(binding) = rest.binding() {
                let tail = arguments.iter().skip(node.params.len()).cloned().collect();
                let array = self.alloc_array(tail);
                self.write_binding(env, binding, &rest.name, array)?;
            }
        }
        if let Some(binding) = node.arguments {
            let array = self.alloc_array(arguments.clone());
            self.write_binding(env, binding, "arguments", array)?;
        }
        if node.kind == FunctionKind::Expression {
            if let Some(name) = &node.name {
                if let Some(binding) = name.binding() {
                    self.write_binding(env, binding, &name.name, Value::Object(id))?;
                }
            }
        }

        self.hoist_functions(env, &node.body)?;
        match self.execute_all(env, &node.body)? {
            Completion::Return(value) => Ok(value),
            Completion::Normal => Ok(Value::Undefined),
        }
    }

    /// Instantiate the function declarations of a body on entry.
    fn hoist_functions(&mut self, env: GcObjectId, statements: &[Statement]) -> Result<(), RuntimeError> {
        for statement in statements {
            if let Statement::Function(node) = statement {
                let value = self.instantiate_function(node, env)?;
                if let Some(name) = &node.name {
                    if let Some(binding) = name.binding() {
                        self.write_binding(env, binding, &name.name, value)?;
                    }
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    fn execute_all(&mut self, env: GcObjectId, statements: &[Statement]) -> Result<Completion, RuntimeError> {
        for statement in statements {
            if let Completion::Return(value) = self.execute(env, statement)? {
                return Ok(Completion::Return(value));
            }
        }
        Ok(Completion::Normal)
    }

    fn execute_block(&mut self, env: GcObjectId, block: &Block) -> Result<Completion, RuntimeError> {
        let scope = block.scope.ok_or_else(|| RuntimeError::Unannotated {
            what: "block".to_string(),
        })?;
        let inner = self.new_env(scope, EnvironmentParent::Environment(env), None)?;
        self.hoist_functions(inner, &block.body)?;
        self.execute_all(inner, &block.body)
    }

    fn execute(&mut self, env: GcObjectId, statement: &Statement) -> Result<Completion, RuntimeError> {
        match statement {
            Statement::Declaration {
                kind, name, init, ..
            } => {
                let value = match init {
                    Some(init) => Some(self.evaluate(env, init)?),
                    None => None,
                };
                let binding = name.binding().ok_or_else(|| RuntimeError::Unannotated {
                    what: format!("declaration of '{}'", name.name),
                })?;
                match (kind, value) {
                    // `var x;` leaves the hoisted value alone.
                    (DeclarationKind::Var, None) => {}
                    (_, value) => {
                        self.write_binding(env, binding, &name.name, value.unwrap_or_default())?
                    }
                }
            }
            Statement::Function(_) => {}
            Statement::Expression(expression) => {
                self.evaluate(env, expression)?;
            }
            Statement::Return(value) => {
                let value = match value {
                    Some(value) => self.evaluate(env, value)?,
                    None => Value::Undefined,
                };
                return Ok(Completion::Return(value));
            }
            Statement::Block(block) => return self.execute_block(env, block),
            Statement::If {
                test,
                consequent,
                alternate,
            } => {
                if self.evaluate(env, test)?.is_truthy() {
                    return self.execute_block(env, consequent);
                }
                if let Some(alternate) = alternate {
                    return self.execute_block(env, alternate);
                }
            }
            Statement::While { test, body } => {
                while self.evaluate(env, test)?.is_truthy() {
                    if let Completion::Return(value) = self.execute_block(env, body)? {
                        return Ok(Completion::Return(value));
                    }
                }
            }
        }
        Ok(Completion::Normal)
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    fn evaluate(&mut self, env: GcObjectId, expression: &Expression) -> Result<Value, RuntimeError> {
        match expression {
            Expression::Literal(literal) => Ok(literal.to_value()),
            Expression::Identifier(identifier) => self.read_identifier(env, identifier),
            Expression::This { provider } => match provider {
                Some(provider) => Ok(locate_this(&self.heap, env, *provider)?.unwrap_or_default()),
                None => Ok(Value::Undefined),
            },
            Expression::Object(properties) => {
                let mut evaluated = BTreeMap::new();
                for (key, value) in properties {
                    evaluated.insert(key.clone(), self.evaluate(env, value)?);
                }
                Ok(Value::Object(self.heap.allocate(ObjectKind::Ordinary {
                    properties: evaluated,
                })))
            }
            Expression::Array(elements) => {
                let mut evaluated = Vec::with_capacity(elements.len());
                for element in elements {
                    evaluated.push(self.evaluate(env, element)?);
                }
                Ok(self.alloc_array(evaluated))
            }
            Expression::Member { object, property } => {
                let target = self.evaluate(env, object)?;
                self.get_property(&target, property)
            }
            Expression::SetMember {
                object,
                property,
                value,
            } => {
                let target = self.evaluate(env, object)?;
                let value = self.evaluate(env, value)?;
                self.set_property(&target, property, value.clone())?;
                Ok(value)
            }
            Expression::Call { callee, arguments } => {
                let (function, this) = match callee.as_ref() {
                    Expression::Member { object, property } => {
                        let target = self.evaluate(env, object)?;
                        (self.get_property(&target, property)?, target)
                    }
                    other => (self.evaluate(env, other)?, Value::Undefined),
                };
                let mut evaluated = Vec::with_capacity(arguments.len());
                for argument in arguments {
                    evaluated.push(self.evaluate(env, argument)?);
                }
                self.call_function(&function, this, evaluated)
            }
            Expression::Assign { target, value } => {
                let value = self.evaluate(env, value)?;
                match target.resolution {
                    Resolution::Binding(binding) => {
                        self.write_binding(env, binding, &target.name, value.clone())?
                    }
                    Resolution::Global => {
                        self.set_property(&Value::Object(self.global_object), &target.name, value.clone())?
                    }
                    Resolution::Unresolved => {
                        return Err(RuntimeError::ReferenceError {
                            name: target.name.clone(),
                        });
                    }
                }
                Ok(value)
            }
            Expression::Binary { op, left, right } => {
                let left = self.evaluate(env, left)?;
                let right = self.evaluate(env, right)?;
                binary(*op, left, right)
            }
            Expression::Function(node) => self.instantiate_function(node, env),
            Expression::DynamicEval(_) => Err(RuntimeError::DynamicEvalUnsupported),
        }
    }

    fn get_property(&self, target: &Value, property: &str) -> Result<Value, RuntimeError> {
        match target {
            Value::Object(id) => Ok(match self.heap.kind(*id)? {
                ObjectKind::Ordinary { properties } => {
                    properties.get(property).cloned().unwrap_or_default()
                }
                ObjectKind::Array { elements } if property == "length" => {
                    Value::Number(elements.len() as i64)
                }
                ObjectKind::Array { elements } => property
                    .parse::<usize>()
                    .ok()
                    .and_then(|index| elements.get(index).cloned())
                    .unwrap_or_default(),
                _ => Value::Undefined,
            }),
            Value::Str(s) if property == "length" => Ok(Value::Number(s.chars().count() as i64)),
            Value::Undefined | Value::Null => Err(RuntimeError::NotAnObject {
                detail: format!("cannot read '{property}' of {}", target.type_name()),
            }),
            _ => Ok(Value::Undefined),
        }
    }

    fn set_property(&mut self, target: &Value, property: &str, value: Value) -> Result<(), RuntimeError> {
        let id = target.as_object().ok_or_else(|| RuntimeError::NotAnObject {
            detail: format!("cannot set '{property}' on {}", target.type_name()),
        })?;
        match self.heap.kind_mut(id)? {
            ObjectKind::Ordinary { properties } => {
                properties.insert(property.to_string(), value);
                Ok(())
            }
            ObjectKind::Array { elements } => {
                let index = property.parse::<usize>().map_err(|_| RuntimeError::TypeError {
                    detail: format!("'{property}' is not an array index"),
                })?;
                if index >= elements.len() {
                    elements.resize(index + 1, Value::Undefined);
                }
                elements[index] = value;
                Ok(())
            }
            other => Err(RuntimeError::TypeError {
                detail: format!("cannot set '{property}' on a {}", other.name()),
            }),
        }
    }
}

fn binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, RuntimeError> {
    let mismatch = |left: &Value, right: &Value| RuntimeError::TypeError {
        detail: format!(
            "unsupported operands {} and {} for {op:?}",
            left.type_name(),
            right.type_name()
        ),
    };
    match op {
        BinaryOp::Add => match (&left, &right) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a.wrapping_add(*b))),
            (Value::Str(_), _) | (_, Value::Str(_)) => Ok(Value::Str(format!("{left}{right}"))),
            _ => Err(mismatch(&left, &right)),
        },
        BinaryOp::Sub => match (&left, &right) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a.wrapping_sub(*b))),
            _ => Err(mismatch(&left, &right)),
        },
        BinaryOp::Lt => match (&left, &right) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Bool(a < b)),
            (Value::Str(a), Value::Str(b)) => Ok(Value::Bool(a < b)),
            _ => Err(mismatch(&left, &right)),
        },
        BinaryOp::StrictEq => Ok(Value::Bool(left == right)),
        BinaryOp::StrictNe => Ok(Value::Bool(left != right)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expression as E, FunctionFlavor, FunctionNode as F, Statement as S};

    fn load(body: Vec<S>) -> Runtime {
        let mut runtime = Runtime::load(Program::new(body), MemoConfig::deterministic()).unwrap();
        runtime.run().unwrap();
        runtime
    }

    #[test]
    fn evaluates_closures_and_arithmetic() {
        let add = F::declaration("make_adder").params(&["n"]).body(vec![S::ret(E::function(
            F::arrow()
                .params(&["m"])
                .body(vec![S::ret(E::binary(BinaryOp::Add, E::ident("n"), E::ident("m")))]),
        ))]);
        let mut rt = load(vec![
            S::Function(add),
            S::let_(
                "result",
                E::call(
                    E::call(E::ident("make_adder"), vec![E::num(2)]),
                    vec![E::num(3)],
                ),
            ),
        ]);
        assert_eq!(rt.global("result"), Some(Value::Number(5)));
        let adder = rt.call_global("make_adder", vec![Value::Number(10)]).unwrap();
        assert_eq!(rt.call(&adder, Value::Undefined, vec![Value::Number(1)]).unwrap(), Value::Number(11));
    }

    #[test]
    fn while_loop_and_assignment() {
        let rt = load(vec![
            S::let_("i", E::num(0)),
            S::let_("sum", E::num(0)),
            S::While {
                test: E::binary(BinaryOp::Lt, E::ident("i"), E::num(4)),
                body: Block::new(vec![
                    S::expr(E::assign("sum", E::binary(BinaryOp::Add, E::ident("sum"), E::ident("i")))),
                    S::expr(E::assign("i", E::binary(BinaryOp::Add, E::ident("i"), E::num(1)))),
                ]),
            },
        ]);
        assert_eq!(rt.global("sum"), Some(Value::Number(6)));
    }

    #[test]
    fn memoized_arrow_is_reused_for_equal_captures() {
        let make = F::declaration("make").params(&["k"]).body(vec![S::ret(E::function(
            F::arrow().memoized().body(vec![S::ret(E::ident("k"))]),
        ))]);
        let mut rt = load(vec![S::Function(make)]);
        let a = rt.call_global("make", vec![Value::Number(1)]).unwrap();
        let b = rt.call_global("make", vec![Value::Number(1)]).unwrap();
        let c = rt.call_global("make", vec![Value::Number(2)]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(rt.call(&a, Value::Undefined, vec![]).unwrap(), Value::Number(1));
        assert_eq!(rt.call(&c, Value::Undefined, vec![]).unwrap(), Value::Number(2));
        let site = rt.function_site(&a).unwrap();
        assert_eq!(rt.cache_entries(site).unwrap(), 2);
    }

    #[test]
    fn memoized_instance_holds_only_its_captures() {
        let make = F::declaration("make").params(&["k", "unused"]).body(vec![S::ret(E::function(
            F::arrow().memoized().body(vec![S::ret(E::ident("k"))]),
        ))]);
        let mut rt = load(vec![S::Function(make)]);
        let a = rt.call_global("make", vec![Value::Number(1), Value::from("big")]).unwrap();
        assert_eq!(rt.captured(&a, "k"), Some(Value::Number(1)));
        assert_eq!(rt.captured(&a, "unused"), None);
        assert!(matches!(
            rt.heap().function(a.as_object().unwrap()).unwrap().environment,
            ClosureEnvironment::Captured { .. }
        ));
    }

    #[test]
    fn generator_calls_return_suspended_objects() {
        let generator = F::declaration("gen")
            .flavor(FunctionFlavor::Generator)
            .body(vec![S::expr(E::DynamicEval("never run".into()))]);
        let mut rt = load(vec![S::Function(generator)]);
        let result = rt.call_global("gen", vec![Value::Number(1)]).unwrap();
        let id = result.as_object().unwrap();
        assert_eq!(rt.heap().kind(id).unwrap().name(), "suspended");
    }

    #[test]
    fn reading_let_before_initialization_fails() {
        let mut rt = Runtime::load(
            Program::new(vec![
                S::expr(E::ident("late")),
                S::let_("late", E::num(1)),
            ]),
            MemoConfig::deterministic(),
        )
        .unwrap();
        let err = rt.run().unwrap_err();
        assert_eq!(err, RuntimeError::Uninitialized { name: "late".into() });
    }

    #[test]
    fn capture_in_temporal_dead_zone_keys_separately() {
        // `early` is reached before `later` is initialized, `again` after.
        let arrow = || F::arrow().memoized().body(vec![S::ret(E::ident("later"))]);
        let rt = load(vec![
            S::Function(F::declaration("pick").body(vec![S::ret(E::function(arrow()))])),
            S::let_("early", E::call(E::ident("pick"), vec![])),
            S::let_("later", E::num(1)),
            S::let_("again", E::call(E::ident("pick"), vec![])),
        ]);
        assert_ne!(rt.global("early"), rt.global("again"));
    }

    #[test]
    fn capture_initialized_after_reach_is_seen_on_call() {
        let rt = load(vec![
            S::const_(
                "f",
                E::function(F::arrow().memoized().body(vec![S::ret(E::ident("f"))])),
            ),
            S::let_(
                "same",
                E::binary(BinaryOp::StrictEq, E::call(E::ident("f"), vec![]), E::ident("f")),
            ),
        ]);
        assert_eq!(rt.global("same"), Some(Value::Bool(true)));
    }

    #[test]
    fn hoisted_memoized_declaration_calls_itself() {
        let countdown = F::declaration("f")
            .memoized()
            .params(&["n"])
            .body(vec![
                S::If {
                    test: E::binary(BinaryOp::Lt, E::ident("n"), E::num(1)),
                    consequent: Block::new(vec![S::ret(E::num(0))]),
                    alternate: None,
                },
                S::ret(E::call(
                    E::ident("f"),
                    vec![E::binary(BinaryOp::Sub, E::ident("n"), E::num(1))],
                )),
            ]);
        let outer = F::declaration("outer").body(vec![S::Function(countdown), S::ret(E::ident("f"))]);
        let mut rt = load(vec![S::Function(outer)]);
        let f = rt.call_global("outer", vec![]).unwrap();
        assert_eq!(rt.call(&f, Value::Undefined, vec![Value::Number(3)]).unwrap(), Value::Number(0));
        assert_eq!(rt.captured(&f, "f"), Some(f.clone()));
    }

    #[test]
    fn undefined_global_is_a_reference_error() {
        let mut rt = Runtime::load(
            Program::new(vec![S::expr(E::ident("nowhere"))]),
            MemoConfig::deterministic(),
        )
        .unwrap();
        let err = rt.run().unwrap_err();
        assert_eq!(err.stable_code(), "FE-MEMO-0701");
    }

    #[test]
    fn host_globals_are_visible_to_code() {
        let mut rt = Runtime::load(
            Program::new(vec![S::Function(
                F::declaration("read").body(vec![S::ret(E::ident("config_value"))]),
            )]),
            MemoConfig::deterministic(),
        )
        .unwrap();
        rt.run().unwrap();
        rt.set_global("config_value", Value::Number(7)).unwrap();
        assert_eq!(rt.call_global("read", vec![]).unwrap(), Value::Number(7));
    }

    #[test]
    fn run_twice_is_rejected() {
        let mut rt = load(vec![]);
        assert_eq!(rt.run().unwrap_err(), RuntimeError::AlreadyRan);
    }

    #[test]
    fn load_records_resolver_and_analyzer_events() {
        let rt = load(vec![S::expr(E::function(F::arrow().memoized()))]);
        assert_eq!(rt.events().matching(COMPONENT_RESOLVER, "resolve").count(), 1);
        let analyzed = rt
            .events()
            .matching(COMPONENT_ANALYZER, "analyze")
            .next()
            .unwrap();
        assert!(analyzed.detail.contains("sha256:"));
        assert_eq!(rt.events().matching(COMPONENT_REGISTRY, "create_cache").count(), 1);
    }

    #[test]
    fn binary_operators() {
        assert_eq!(
            binary(BinaryOp::Add, Value::from("a"), Value::Number(1)).unwrap(),
            Value::from("a1")
        );
        assert_eq!(
            binary(BinaryOp::Sub, Value::Number(5), Value::Number(7)).unwrap(),
            Value::Number(-2)
        );
        assert_eq!(
            binary(BinaryOp::StrictEq, Value::Null, Value::Undefined).unwrap(),
            Value::Bool(false)
        );
        assert!(binary(BinaryOp::Lt, Value::Null, Value::Number(1)).is_err());
    }
}
