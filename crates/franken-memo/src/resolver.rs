//! One-pass name resolution.
//!
//! Builds the [`ScopeTree`] for a program and annotates the IR in place so
//! that later passes never look names up again:
//! - `var` declarations hoist to the nearest function (or global) scope;
//! - `let`, `const` and function declarations are declared on entry to their
//!   block;
//! - function scopes declare parameters, the rest parameter, the implicit
//!   `arguments` collection (non-arrow only) and, for named function
//!   expressions, the function's own name;
//! - definition sites are numbered in textual order.
//!
//! Assignments are counted per binding; after the walk every binding's
//! mutability flag is fixed.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ast::{
    Block, DeclarationKind, Expression, FunctionFlavor, FunctionKind, FunctionNode, Program,
    Resolution, SourceSpan, Statement,
};
use crate::scope::{
    BindingId, BindingKind, BindingStorage, ScopeError, ScopeId, ScopeKind, ScopeTree, SiteId,
};

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Static facts about one definition site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteInfo {
    pub site: SiteId,
    pub name: Option<String>,
    pub kind: FunctionKind,
    pub flavor: FunctionFlavor,
    pub memoized: bool,
    /// The function's own scope.
    pub scope: ScopeId,
    /// The scope the definition textually appears in.
    pub parent_scope: ScopeId,
    pub span: SourceSpan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProgram {
    pub program: Program,
    pub tree: ScopeTree,
    pub sites: BTreeMap<SiteId, SiteInfo>,
}

impl ResolvedProgram {
    pub fn site(&self, site: SiteId) -> Option<&SiteInfo> {
        self.sites.get(&site)
    }

    /// First site (in textual order) whose function is named `name`.
    pub fn site_named(&self, name: &str) -> Option<SiteId> {
        self.sites
            .values()
            .find(|info| info.name.as_deref() == Some(name))
            .map(|info| info.site)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ResolveError {
    #[error(transparent)]
    Scope(#[from] ScopeError),
    #[error("TypeError: assignment to constant binding '{name}'")]
    AssignToConstant { name: String, binding: BindingId },
    #[error("TypeError: assignment to function name '{name}'")]
    AssignToFunctionName { name: String, binding: BindingId },
    #[error("InternalError: declaration of '{name}' was not hoisted")]
    MissingDeclaration { name: String },
}

impl ResolveError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            Self::Scope(err) => err.stable_code(),
            Self::AssignToConstant { .. } => "FE-MEMO-0201",
            Self::AssignToFunctionName { .. } => "FE-MEMO-0202",
            Self::MissingDeclaration { .. } => "FE-MEMO-0203",
        }
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Resolve `program`, returning it annotated together with its scope tree.
pub fn resolve(mut program: Program) -> Result<ResolvedProgram, ResolveError> {
    let mut resolver = Resolver::default();
    let global = resolver.tree.global();
    resolver.hoist_vars(global, &program.body)?;
    resolver.declare_lexicals(global, &program.body)?;
    resolver.statements(global, &mut program.body)?;
    resolver.tree.finalize_mutability();
    Ok(ResolvedProgram {
        program,
        tree: resolver.tree,
        sites: resolver.sites,
    })
}

#[derive(Default)]
struct Resolver {
    tree: ScopeTree,
    sites: BTreeMap<SiteId, SiteInfo>,
    next_site: u32,
    /// `while` nesting within the current function body.
    loop_depth: u32,
    /// `var` bindings whose initializer has already been seen once.
    initialized_vars: BTreeSet<BindingId>,
}

impl Resolver {
    fn hoist_vars(&mut self, var_scope: ScopeId, statements: &[Statement]) -> Result<(), ResolveError> {
        for statement in statements {
            match statement {
                Statement::Declaration {
                    kind: DeclarationKind::Var,
                    name,
                    storage,
                    ..
                } => {
                    self.tree
                        .declare(var_scope, &name.name, BindingKind::Var, *storage)?;
                }
                Statement::Block(block) => self.hoist_vars(var_scope, &block.body)?,
                Statement::If {
                    consequent,
                    alternate,
                    ..
                } => {
                    self.hoist_vars(var_scope, &consequent.body)?;
                    if let Some(alternate) = alternate {
                        self.hoist_vars(var_scope, &alternate.body)?;
                    }
                }
                Statement::While { body, .. } => self.hoist_vars(var_scope, &body.body)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn declare_lexicals(&mut self, scope: ScopeId, statements: &[Statement]) -> Result<(), ResolveError> {
        for statement in statements {
            match statement {
                Statement::Declaration {
                    kind,
                    name,
                    storage,
                    ..
                } => {
                    let kind = match kind {
                        DeclarationKind::Var => continue,
                        DeclarationKind::Let => BindingKind::Let,
                        DeclarationKind::Const => BindingKind::Const,
                    };
                    self.tree.declare(scope, &name.name, kind, *storage)?;
                }
                Statement::Function(node) => {
                    if let Some(name) = &node.name {
                        self.tree.declare(
                            scope,
                            &name.name,
                            BindingKind::FunctionDeclaration,
                            BindingStorage::Slot,
                        )?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn local(&self, scope: ScopeId, name: &str) -> Result<BindingId, ResolveError> {
        self.tree
            .lookup_local(scope, name)
            .ok_or_else(|| ResolveError::MissingDeclaration {
                name: name.to_string(),
            })
    }

    fn reference(&self, scope: ScopeId, name: &str) -> Resolution {
        match self.tree.resolve(scope, name) {
            Some(binding) => Resolution::Binding(binding),
            None => Resolution::Global,
        }
    }

    fn statements(&mut self, scope: ScopeId, statements: &mut [Statement]) -> Result<(), ResolveError> {
        for statement in statements {
            self.statement(scope, statement)?;
        }
        Ok(())
    }

    fn block(&mut self, parent: ScopeId, block: &mut Block) -> Result<(), ResolveError> {
        let scope = self.tree.add_scope(parent, ScopeKind::Block, false, None)?;
        block.scope = Some(scope);
        self.declare_lexicals(scope, &block.body)?;
        self.statements(scope, &mut block.body)
    }

    fn statement(&mut self, scope: ScopeId, statement: &mut Statement) -> Result<(), ResolveError> {
        match statement {
            Statement::Declaration {
                kind, name, init, ..
            } => {
                if let Some(init) = init.as_mut() {
                    self.expression(scope, init)?;
                }
                let binding = match kind {
                    DeclarationKind::Var => {
                        let var_scope = self.tree.var_scope(scope)?;
                        self.local(var_scope, &name.name)?
                    }
                    DeclarationKind::Let | DeclarationKind::Const => self.local(scope, &name.name)?,
                };
                name.resolution = Resolution::Binding(binding);
                // Re-running a `var` initializer overwrites the same slot.
                if *kind == DeclarationKind::Var
                    && init.is_some()
                    && (self.loop_depth > 0 || !self.initialized_vars.insert(binding))
                {
                    self.tree.record_assignment(binding)?;
                }
            }
            Statement::Function(node) => {
                if let Some(name) = node.name.as_mut() {
                    name.resolution = Resolution::Binding(self.local(scope, &name.name)?);
                }
                self.function(scope, node)?;
            }
            Statement::Expression(expression) => self.expression(scope, expression)?,
            Statement::Return(value) => {
                if let Some(value) = value {
                    self.expression(scope, value)?;
                }
            }
            Statement::Block(block) => self.block(scope, block)?,
            Statement::If {
                test,
                consequent,
                alternate,
            } => {
                self.expression(scope, test)?;
                self.block(scope, consequent)?;
                if let Some(alternate) = alternate {
                    self.block(scope, alternate)?;
                }
            }
            Statement::While { test, body } => {
                self.expression(scope, test)?;
                self.loop_depth += 1;
                let result = self.block(scope, body);
                self.loop_depth -= 1;
                result?;
            }
        }
        Ok(())
    }

    fn function(&mut self, parent: ScopeId, node: &mut FunctionNode) -> Result<(), ResolveError> {
        let site = SiteId(self.next_site);
        self.next_site += 1;
        let arrow = node.is_arrow();
        let scope = self
            .tree
            .add_scope(parent, ScopeKind::Function, arrow, Some(site))?;
        self.tree.record_site(parent, site)?;
        node.site = Some(site);
        node.scope = Some(scope);
        self.sites.insert(
            site,
            SiteInfo {
                site,
                name: node.name.as_ref().map(|name| name.name.clone()),
                kind: node.kind,
                flavor: node.flavor,
                memoized: node.memoized,
                scope,
                parent_scope: parent,
                span: node.span.clone(),
            },
        );

        for param in &mut node.params {
            let id = self
                .tree
                .declare(scope, &param.name, BindingKind::Parameter, BindingStorage::Slot)?;
            param.resolution = Resolution::Binding(id);
        }
        if let Some(rest) = node.rest.as_mut() {
            let id = self
                .tree
                .declare(scope, &rest.name, BindingKind::Rest, BindingStorage::Slot)?;
            rest.resolution = Resolution::Binding(id);
        }
        if !arrow && self.tree.lookup_local(scope, "arguments").is_none() {
            node.arguments = Some(self.tree.declare(
                scope,
                "arguments",
                BindingKind::Arguments,
                BindingStorage::Slot,
            )?);
        }
        self.hoist_vars(scope, &node.body)?;
        self.declare_lexicals(scope, &node.body)?;

        // A named expression sees its own name unless a parameter or local
        // shadows it.
        if node.kind == FunctionKind::Expression {
            if let Some(name) = node.name.as_mut() {
                name.resolution = match self.tree.lookup_local(scope, &name.name) {
                    Some(_) => Resolution::Unresolved,
                    None => Resolution::Binding(self.tree.declare(
                        scope,
                        &name.name,
                        BindingKind::FunctionName,
                        BindingStorage::Slot,
                    )?),
                };
            }
        }

        let outer_loops = std::mem::replace(&mut self.loop_depth, 0);
        let result = self.statements(scope, &mut node.body);
        self.loop_depth = outer_loops;
        result
    }

    fn expression(&mut self, scope: ScopeId, expression: &mut Expression) -> Result<(), ResolveError> {
        match expression {
            Expression::Literal(_) | Expression::DynamicEval(_) => {}
            Expression::Identifier(identifier) => {
                identifier.resolution = self.reference(scope, &identifier.name);
            }
            Expression::This { provider } => {
                *provider = Some(self.tree.this_provider(scope)?);
            }
            Expression::Object(properties) => {
                for (_, value) in properties {
                    self.expression(scope, value)?;
                }
            }
            Expression::Array(elements) => {
                for element in elements {
                    self.expression(scope, element)?;
                }
            }
            Expression::Member { object, .. } => self.expression(scope, object)?,
            Expression::SetMember { object, value, .. } => {
                self.expression(scope, object)?;
                self.expression(scope, value)?;
            }
            Expression::Call { callee, arguments } => {
                self.expression(scope, callee)?;
                for argument in arguments {
                    self.expression(scope, argument)?;
                }
            }
            Expression::Assign { target, value } => {
                self.expression(scope, value)?;
                target.resolution = self.reference(scope, &target.name);
                if let Resolution::Binding(binding) = target.resolution {
                    match self.tree.binding(binding)?.kind {
                        BindingKind::Const => {
                            return Err(ResolveError::AssignToConstant {
                                name: target.name.clone(),
                                binding,
                            });
                        }
                        BindingKind::FunctionName => {
                            return Err(ResolveError::AssignToFunctionName {
                                name: target.name.clone(),
                                binding,
                            });
                        }
                        _ => self.tree.record_assignment(binding)?,
                    }
                }
            }
            Expression::Binary { left, right, .. } => {
                self.expression(scope, left)?;
                self.expression(scope, right)?;
            }
            Expression::Function(node) => self.function(scope, node)?,
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
