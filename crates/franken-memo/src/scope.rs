//! Static lexical scope model.
//!
//! A [`ScopeTree`] is the resolved binding graph for one program:
//! - **Scopes** (global, function, block) with non-owning parent links.
//! - **Bindings** with their declaring scope, kind, storage, slot index and
//!   mutability flag.
//! - **Definition sites** registered on the scope that textually contains them.
//!
//! The tree is built once by the resolver and is read-only afterwards. Runtime
//! scope instances live in the heap as
//! [`EnvironmentRecord`](crate::heap::EnvironmentRecord)s indexed by the slot
//! numbers assigned here.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Index of a scope in its [`ScopeTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScopeId(pub u32);

/// Index of a binding in its [`ScopeTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BindingId(pub u32);

/// Static identity of a function definition site.
///
/// Sites are numbered in textual order of their definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SiteId(pub u32);

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope-{}", self.0)
    }
}

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "binding-{}", self.0)
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "site-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    Global,
    Function,
    Block,
}

/// How a binding was introduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingKind {
    Parameter,
    /// Trailing rest parameter collecting surplus arguments.
    Rest,
    /// Implicit `arguments` collection of a non-arrow function.
    Arguments,
    /// Own name of a named function expression, visible only inside it.
    FunctionName,
    Var,
    Let,
    Const,
    FunctionDeclaration,
}

impl BindingKind {
    /// Kinds that can never be the target of an assignment.
    pub fn is_immutable(self) -> bool {
        matches!(self, Self::Const | Self::FunctionName)
    }

    /// Kinds hoisted to the nearest function or global scope.
    pub fn is_var_scoped(self) -> bool {
        matches!(self, Self::Var)
    }

    /// Kinds that start in the temporal dead zone.
    pub fn is_lexical(self) -> bool {
        matches!(self, Self::Let | Self::Const)
    }

    /// Kinds whose slot starts as `undefined` and is written later by a
    /// hoisted declaration or initializer.
    pub fn is_provisional(self) -> bool {
        matches!(self, Self::Var | Self::FunctionDeclaration)
    }
}

/// Where a binding's value physically lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingStorage {
    /// Directly in the environment slot.
    #[default]
    Slot,
    /// In a stable-identity cell referenced from the environment slot.
    Cell,
}

// ---------------------------------------------------------------------------
// Binding / Scope
// ---------------------------------------------------------------------------

/// A declared name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub id: BindingId,
    pub name: String,
    /// Declaring scope.
    pub scope: ScopeId,
    pub kind: BindingKind,
    pub storage: BindingStorage,
    /// Position in the declaring scope's environment record.
    pub slot: u32,
    /// Number of assignments targeting this binding anywhere in the program.
    pub assignments: u32,
    /// Set by [`ScopeTree::finalize_mutability`]: assignable and assigned.
    pub mutable: bool,
}

/// One lexical scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub id: ScopeId,
    pub kind: ScopeKind,
    pub parent: Option<ScopeId>,
    pub depth: u32,
    /// True for the function scope of an arrow definition.
    pub arrow: bool,
    /// Definition site owning this scope (function scopes only).
    pub owner_site: Option<SiteId>,
    /// Bindings in slot order.
    pub bindings: Vec<BindingId>,
    /// Definition sites textually contained directly in this scope.
    pub sites: Vec<SiteId>,
    names: BTreeMap<String, BindingId>,
}

impl Scope {
    fn new(
        id: ScopeId,
        kind: ScopeKind,
        parent: Option<ScopeId>,
        depth: u32,
        arrow: bool,
        owner_site: Option<SiteId>,
    ) -> Self {
        Self {
            id,
            kind,
            parent,
            depth,
            arrow,
            owner_site,
            bindings: Vec::new(),
            sites: Vec::new(),
            names: BTreeMap::new(),
        }
    }

    /// Whether `var` declarations hoist into this scope.
    pub fn is_var_scope(&self) -> bool {
        matches!(self.kind, ScopeKind::Function | ScopeKind::Global)
    }

    /// Whether this scope provides its own `this` binding.
    pub fn provides_this(&self) -> bool {
        match self.kind {
            ScopeKind::Global => true,
            ScopeKind::Function => !self.arrow,
            ScopeKind::Block => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ScopeError {
    #[error("SyntaxError: identifier '{name}' has already been declared in {scope}")]
    DuplicateBinding { name: String, scope: ScopeId },
    #[error("InternalError: unknown scope {scope}")]
    UnknownScope { scope: ScopeId },
    #[error("InternalError: unknown binding {binding}")]
    UnknownBinding { binding: BindingId },
}

impl ScopeError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            Self::DuplicateBinding { .. } => "FE-MEMO-0101",
            Self::UnknownScope { .. } => "FE-MEMO-0102",
            Self::UnknownBinding { .. } => "FE-MEMO-0103",
        }
    }
}

// ---------------------------------------------------------------------------
// ScopeTree
// ---------------------------------------------------------------------------

/// Arena of scopes and bindings for one program. Scope 0 is the global scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeTree {
    scopes: Vec<Scope>,
    bindings: Vec<Binding>,
}

impl ScopeTree {
    pub fn new() -> Self {
        let global = Scope::new(ScopeId(0), ScopeKind::Global, None, 0, false, None);
        Self {
            scopes: vec![global],
            bindings: Vec::new(),
        }
    }

    pub fn global(&self) -> ScopeId {
        ScopeId(0)
    }

    /// Open a child scope and return its id.
    pub fn add_scope(
        &mut self,
        parent: ScopeId,
        kind: ScopeKind,
        arrow: bool,
        owner_site: Option<SiteId>,
    ) -> Result<ScopeId, ScopeError> {
        let depth = self.scope(parent)?.depth + 1;
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes
            .push(Scope::new(id, kind, Some(parent), depth, arrow, owner_site));
        Ok(id)
    }

    pub fn scope(&self, id: ScopeId) -> Result<&Scope, ScopeError> {
        self.scopes
            .get(id.0 as usize)
            .ok_or(ScopeError::UnknownScope { scope: id })
    }

    fn scope_mut(&mut self, id: ScopeId) -> Result<&mut Scope, ScopeError> {
        self.scopes
            .get_mut(id.0 as usize)
            .ok_or(ScopeError::UnknownScope { scope: id })
    }

    pub fn binding(&self, id: BindingId) -> Result<&Binding, ScopeError> {
        self.bindings
            .get(id.0 as usize)
            .ok_or(ScopeError::UnknownBinding { binding: id })
    }

    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn bindings(&self) -> impl Iterator<Item = &Binding> {
        self.bindings.iter()
    }

    /// Declare `name` in `scope`.
    ///
    /// `var` and function declarations may redeclare an existing var-like
    /// binding and return it; any other collision is a duplicate.
    pub fn declare(
        &mut self,
        scope: ScopeId,
        name: &str,
        kind: BindingKind,
        storage: BindingStorage,
    ) -> Result<BindingId, ScopeError> {
        if let Some(existing) = self.scope(scope)?.names.get(name).copied() {
            let prior = self.binding(existing)?.kind;
            let redeclarable = |k: BindingKind| {
                matches!(
                    k,
                    BindingKind::Var
                        | BindingKind::FunctionDeclaration
                        | BindingKind::Parameter
                        | BindingKind::Arguments
                )
            };
            if matches!(kind, BindingKind::Var | BindingKind::FunctionDeclaration)
                && redeclarable(prior)
            {
                if kind == BindingKind::FunctionDeclaration {
                    let binding = &mut self.bindings[existing.0 as usize];
                    binding.kind = BindingKind::FunctionDeclaration;
                }
                return Ok(existing);
            }
            return Err(ScopeError::DuplicateBinding {
                name: name.to_string(),
                scope,
            });
        }

        let id = BindingId(self.bindings.len() as u32);
        let target = self.scope_mut(scope)?;
        let slot = target.bindings.len() as u32;
        target.bindings.push(id);
        target.names.insert(name.to_string(), id);
        self.bindings.push(Binding {
            id,
            name: name.to_string(),
            scope,
            kind,
            storage,
            slot,
            assignments: 0,
            mutable: false,
        });
        Ok(id)
    }

    /// Look up a name declared directly in `scope`.
    pub fn lookup_local(&self, scope: ScopeId, name: &str) -> Option<BindingId> {
        self.scopes
            .get(scope.0 as usize)
            .and_then(|s| s.names.get(name).copied())
    }

    /// Resolve a name by walking outward from `scope`.
    pub fn resolve(&self, scope: ScopeId, name: &str) -> Option<BindingId> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let s = self.scopes.get(id.0 as usize)?;
            if let Some(binding) = s.names.get(name) {
                return Some(*binding);
            }
            current = s.parent;
        }
        None
    }

    /// True when `scope` is `ancestor` or nested (at any depth) inside it.
    pub fn is_within(&self, scope: ScopeId, ancestor: ScopeId) -> bool {
        let mut current = Some(scope);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.scopes.get(id.0 as usize).and_then(|s| s.parent);
        }
        false
    }

    /// Nearest enclosing scope that accepts `var` declarations.
    pub fn var_scope(&self, scope: ScopeId) -> Result<ScopeId, ScopeError> {
        let mut current = scope;
        loop {
            let s = self.scope(current)?;
            if s.is_var_scope() {
                return Ok(current);
            }
            match s.parent {
                Some(parent) => current = parent,
                None => return Ok(current),
            }
        }
    }

    /// Nearest enclosing scope that provides `this`: a non-arrow function
    /// scope, otherwise the global scope.
    pub fn this_provider(&self, scope: ScopeId) -> Result<ScopeId, ScopeError> {
        let mut current = scope;
        loop {
            let s = self.scope(current)?;
            if s.provides_this() {
                return Ok(current);
            }
            match s.parent {
                Some(parent) => current = parent,
                None => return Ok(current),
            }
        }
    }

    pub fn record_site(&mut self, scope: ScopeId, site: SiteId) -> Result<(), ScopeError> {
        self.scope_mut(scope)?.sites.push(site);
        Ok(())
    }

    pub fn record_assignment(&mut self, binding: BindingId) -> Result<(), ScopeError> {
        let slot = self
            .bindings
            .get_mut(binding.0 as usize)
            .ok_or(ScopeError::UnknownBinding { binding })?;
        slot.assignments += 1;
        Ok(())
    }

    /// Derive every binding's `mutable` flag from its kind and assignment count.
    pub fn finalize_mutability(&mut self) {
        for binding in &mut self.bindings {
            binding.mutable = !binding.kind.is_immutable() && binding.assignments > 0;
        }
    }
}

impl Default for ScopeTree {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
