//! Free-variable capture analysis for memoized definition sites.
//!
//! For each memoized site the analyzer derives an immutable [`CaptureSpec`]:
//! the bindings declared outside the definition's own scope that its body
//! (nested functions included) references, in first-use order, deduplicated
//! by binding identity. Arrow definitions that observe the inherited `this`
//! get one trailing this-value capture; non-arrow definitions never do.
//!
//! Analysis is purely static. It reads the resolver's annotations and the
//! [`ScopeTree`]; it never looks names up.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::ast::{Expression, FunctionNode, Resolution, Statement};
use crate::resolver::ResolvedProgram;
use crate::scope::{BindingId, BindingStorage, ScopeError, ScopeId, ScopeTree, SiteId};

// ---------------------------------------------------------------------------
// CaptureSpec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// Keyed by the binding's current value (primitive) or identity (object).
    Value,
    /// Keyed by the identity of the cell holding the binding.
    Cell,
    /// Keyed by the lexically inherited `this`.
    ThisValue,
}

impl fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Value => "value",
            Self::Cell => "cell",
            Self::ThisValue => "this",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capture {
    /// `None` only for the this-value capture.
    pub binding: Option<BindingId>,
    pub name: String,
    pub mode: CaptureMode,
    /// Declaring scope of the binding, or the scope providing `this`.
    pub source_scope: ScopeId,
}

/// Ordered capture list of one definition site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSpec {
    pub site: SiteId,
    captures: Vec<Capture>,
}

impl CaptureSpec {
    pub fn new(site: SiteId, captures: Vec<Capture>) -> Self {
        Self { site, captures }
    }

    pub fn captures(&self) -> &[Capture] {
        &self.captures
    }

    pub fn arity(&self) -> usize {
        self.captures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.captures.is_empty()
    }

    pub fn captures_this(&self) -> bool {
        self.captures
            .iter()
            .any(|capture| capture.mode == CaptureMode::ThisValue)
    }

    pub fn names(&self) -> Vec<&str> {
        self.captures.iter().map(|c| c.name.as_str()).collect()
    }

    /// Stable digest of the site and its ordered captures.
    pub fn fingerprint(&self) -> String {
        let mut canonical = format!("site={}", self.site.0);
        for capture in &self.captures {
            let binding = capture
                .binding
                .map(|b| b.0.to_string())
                .unwrap_or_else(|| "-".to_string());
            canonical.push_str(&format!(
                "|{}:{}:{}:{}",
                capture.mode, binding, capture.source_scope.0, capture.name
            ));
        }
        let digest = Sha256::digest(canonical.as_bytes());
        format!("sha256:{}", hex::encode(digest))
    }
}

// ---------------------------------------------------------------------------
// Analysis results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmemoizedReason {
    /// The site was not marked for memoization.
    NotMemoized,
    /// The body evaluates source text at run time.
    DynamicBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SiteAnalysis {
    Memoized(CaptureSpec),
    Unmemoized { reason: UnmemoizedReason },
}

impl SiteAnalysis {
    pub fn spec(&self) -> Option<&CaptureSpec> {
        match self {
            Self::Memoized(spec) => Some(spec),
            Self::Unmemoized { .. } => None,
        }
    }
}

/// Analysis of every site of one program.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisTable {
    sites: BTreeMap<SiteId, SiteAnalysis>,
}

impl AnalysisTable {
    pub fn get(&self, site: SiteId) -> Option<&SiteAnalysis> {
        self.sites.get(&site)
    }

    pub fn spec(&self, site: SiteId) -> Option<&CaptureSpec> {
        self.sites.get(&site).and_then(SiteAnalysis::spec)
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn memoized_count(&self) -> usize {
        self.sites.values().filter(|a| a.spec().is_some()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SiteId, &SiteAnalysis)> {
        self.sites.iter()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum AnalysisError {
    #[error("mutable capture requires indirection: '{name}' captured by {site}")]
    MutableCapture {
        site: SiteId,
        name: String,
        binding: BindingId,
    },
    #[error("function '{name}' has not been resolved")]
    Unresolved { name: String },
    #[error(transparent)]
    Scope(#[from] ScopeError),
}

impl AnalysisError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            Self::MutableCapture { .. } => "FE-MEMO-0301",
            Self::Unresolved { .. } => "FE-MEMO-0302",
            Self::Scope(err) => err.stable_code(),
        }
    }
}

/// Every analysis error of one program, in site order.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("capture analysis failed at {} site(s)", .errors.len())]
pub struct AnalysisReport {
    pub errors: Vec<AnalysisError>,
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// Analyze one definition site.
pub fn analyze_site(tree: &ScopeTree, function: &FunctionNode) -> Result<SiteAnalysis, AnalysisError> {
    let unresolved = || AnalysisError::Unresolved {
        name: function.display_name().to_string(),
    };
    let site = function.site.ok_or_else(unresolved)?;
    let own_scope = function.scope.ok_or_else(unresolved)?;

    if !function.memoized {
        return Ok(SiteAnalysis::Unmemoized {
            reason: UnmemoizedReason::NotMemoized,
        });
    }

    let mut references = References::default();
    references.statements(&function.body);
    if references.dynamic {
        return Ok(SiteAnalysis::Unmemoized {
            reason: UnmemoizedReason::DynamicBody,
        });
    }

    let mut seen = BTreeSet::new();
    let mut captures = Vec::new();
    for binding_id in references.bindings {
        if !seen.insert(binding_id) {
            continue;
        }
        let binding = tree.binding(binding_id)?;
        if tree.is_within(binding.scope, own_scope) {
            continue;
        }
        let mode = match binding.storage {
            BindingStorage::Cell => CaptureMode::Cell,
            BindingStorage::Slot if binding.mutable => {
                return Err(AnalysisError::MutableCapture {
                    site,
                    name: binding.name.clone(),
                    binding: binding_id,
                });
            }
            BindingStorage::Slot => CaptureMode::Value,
        };
        captures.push(Capture {
            binding: Some(binding_id),
            name: binding.name.clone(),
            mode,
            source_scope: binding.scope,
        });
    }

    if function.is_arrow() {
        if let Some(provider) = references
            .this_providers
            .into_iter()
            .find(|provider| !tree.is_within(*provider, own_scope))
        {
            captures.push(Capture {
                binding: None,
                name: "this".to_string(),
                mode: CaptureMode::ThisValue,
                source_scope: provider,
            });
        }
    }

    Ok(SiteAnalysis::Memoized(CaptureSpec::new(site, captures)))
}

/// Analyze every site of a resolved program, reporting all errors together.
pub fn analyze_program(resolved: &ResolvedProgram) -> Result<AnalysisTable, AnalysisReport> {
    let mut table = AnalysisTable::default();
    let mut errors = Vec::new();
    for function in resolved.program.functions() {
        match analyze_site(&resolved.tree, function) {
            Ok(analysis) => {
                if let Some(site) = function.site {
                    table.sites.insert(site, analysis);
                }
            }
            Err(err) => errors.push(err),
        }
    }
    if errors.is_empty() {
        Ok(table)
    } else {
        Err(AnalysisReport { errors })
    }
}

/// Resolved references of a body in textual order.
#[derive(Default)]
struct References {
    bindings: Vec<BindingId>,
    this_providers: Vec<ScopeId>,
    dynamic: bool,
}

impl References {
    fn statements(&mut self, statements: &[Statement]) {
        for statement in statements {
            self.statement(statement);
        }
    }

    fn statement(&mut self, statement: &Statement) {
        match statement {
            Statement::Declaration { init, .. } => {
                if let Some(init) = init {
                    self.expression(init);
                }
            }
            Statement::Function(node) => self.statements(&node.body),
            Statement::Expression(expression) => self.expression(expression),
            Statement::Return(value) => {
                if let Some(value) = value {
                    self.expression(value);
                }
            }
            Statement::Block(block) => self.statements(&block.body),
            Statement::If {
                test,
                consequent,
                alternate,
            } => {
                self.expression(test);
                self.statements(&consequent.body);
                if let Some(alternate) = alternate {
                    self.statements(&alternate.body);
                }
            }
            Statement::While { test, body } => {
                self.expression(test);
                self.statements(&body.body);
            }
        }
    }

    fn resolution(&mut self, resolution: Resolution) {
        if let Resolution::Binding(binding) = resolution {
            self.bindings.push(binding);
        }
    }

    fn expression(&mut self, expression: &Expression) {
        match expression {
            Expression::Literal(_) => {}
            Expression::Identifier(identifier) => self.resolution(identifier.resolution),
            Expression::This { provider } => self.this_providers.extend(*provider),
            Expression::Object(properties) => {
                for (_, value) in properties {
                    self.expression(value);
                }
            }
            Expression::Array(elements) => {
                for element in elements {
                    self.expression(element);
                }
            }
            Expression::Member { object, .. } => self.expression(object),
            Expression::SetMember { object, value, .. } => {
                self.expression(object);
                self.expression(value);
            }
            Expression::Call { callee, arguments } => {
                self.expression(callee);
                for argument in arguments {
                    self.expression(argument);
                }
            }
            Expression::Assign { target, value } => {
                self.expression(value);
                self.resolution(target.resolution);
            }
            Expression::Binary { left, right, .. } => {
                self.expression(left);
                self.expression(right);
            }
            Expression::Function(node) => self.statements(&node.body),
            Expression::DynamicEval(_) => self.dynamic = true,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
