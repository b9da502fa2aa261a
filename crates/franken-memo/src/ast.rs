//! Definition IR consumed by the resolver, analyzer and evaluator.
//!
//! Programs arrive already parsed: function definitions are identified and
//! those eligible for memoization carry `memoized = true`. The resolver fills
//! the annotation fields (`Identifier::resolution`, `This::provider`,
//! `FunctionNode::{site, scope, arguments}`, `Block::scope`) in place; the
//! analyzer and evaluator only read them.

use serde::{Deserialize, Serialize};

use crate::scope::{BindingId, BindingStorage, ScopeId, SiteId};
use crate::value::Value;

/// Source-span with byte offsets and one-based line/column markers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpan {
    pub start_offset: u64,
    pub end_offset: u64,
    pub start_line: u64,
    pub start_column: u64,
    pub end_line: u64,
    pub end_column: u64,
}

impl SourceSpan {
    pub fn new(
        start_offset: u64,
        end_offset: u64,
        start_line: u64,
        start_column: u64,
        end_line: u64,
        end_column: u64,
    ) -> Self {
        Self {
            start_offset,
            end_offset,
            start_line,
            start_column,
            end_line,
            end_column,
        }
    }
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    #[default]
    Unresolved,
    Binding(BindingId),
    /// Not declared anywhere in the program; looked up in the global object.
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    pub name: String,
    pub resolution: Resolution,
}

impl Identifier {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resolution: Resolution::Unresolved,
        }
    }

    pub fn binding(&self) -> Option<BindingId> {
        match self.resolution {
            Resolution::Binding(id) => Some(id),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Functions
// ---------------------------------------------------------------------------

/// Syntactic shape of a definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionKind {
    Declaration,
    Expression,
    Arrow,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionFlavor {
    #[default]
    Plain,
    Generator,
    Async,
    AsyncGenerator,
}

impl FunctionFlavor {
    /// Calls produce a suspended object instead of running the body.
    pub fn is_suspending(self) -> bool {
        !matches!(self, Self::Plain)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionNode {
    pub name: Option<Identifier>,
    pub kind: FunctionKind,
    pub flavor: FunctionFlavor,
    pub memoized: bool,
    pub params: Vec<Identifier>,
    pub rest: Option<Identifier>,
    pub body: Vec<Statement>,
    pub span: SourceSpan,
    pub site: Option<SiteId>,
    pub scope: Option<ScopeId>,
    /// Implicit `arguments` binding (non-arrow functions only).
    pub arguments: Option<BindingId>,
}

impl FunctionNode {
    fn with_kind(kind: FunctionKind, name: Option<&str>) -> Self {
        Self {
            name: name.map(Identifier::new),
            kind,
            flavor: FunctionFlavor::Plain,
            memoized: false,
            params: Vec::new(),
            rest: None,
            body: Vec::new(),
            span: SourceSpan::default(),
            site: None,
            scope: None,
            arguments: None,
        }
    }

    pub fn declaration(name: &str) -> Self {
        Self::with_kind(FunctionKind::Declaration, Some(name))
    }

    pub fn expression(name: Option<&str>) -> Self {
        Self::with_kind(FunctionKind::Expression, name)
    }

    pub fn arrow() -> Self {
        Self::with_kind(FunctionKind::Arrow, None)
    }

    pub fn memoized(mut self) -> Self {
        self.memoized = true;
        self
    }

    pub fn flavor(mut self, flavor: FunctionFlavor) -> Self {
        self.flavor = flavor;
        self
    }

    pub fn params(mut self, names: &[&str]) -> Self {
        self.params = names.iter().map(|name| Identifier::new(*name)).collect();
        self
    }

    pub fn rest(mut self, name: &str) -> Self {
        self.rest = Some(Identifier::new(name));
        self
    }

    pub fn body(mut self, body: Vec<Statement>) -> Self {
        self.body = body;
        self
    }

    pub fn span(mut self, span: SourceSpan) -> Self {
        self.span = span;
        self
    }

    pub fn is_arrow(&self) -> bool {
        self.kind == FunctionKind::Arrow
    }

    pub fn display_name(&self) -> &str {
        self.name
            .as_ref()
            .map(|name| name.name.as_str())
            .unwrap_or("<anonymous>")
    }
}

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclarationKind {
    Var,
    Let,
    Const,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub body: Vec<Statement>,
    pub scope: Option<ScopeId>,
}

impl Block {
    pub fn new(body: Vec<Statement>) -> Self {
        Self { body, scope: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Statement {
    Declaration {
        kind: DeclarationKind,
        name: Identifier,
        init: Option<Expression>,
        storage: BindingStorage,
    },
    Function(FunctionNode),
    Expression(Expression),
    Return(Option<Expression>),
    Block(Block),
    If {
        test: Expression,
        consequent: Block,
        alternate: Option<Block>,
    },
    While {
        test: Expression,
        body: Block,
    },
}

impl Statement {
    fn declare(kind: DeclarationKind, name: &str, init: Expression, storage: BindingStorage) -> Self {
        Self::Declaration {
            kind,
            name: Identifier::new(name),
            init: Some(init),
            storage,
        }
    }

    pub fn var(name: &str, init: Expression) -> Self {
        Self::declare(DeclarationKind::Var, name, init, BindingStorage::Slot)
    }

    pub fn let_(name: &str, init: Expression) -> Self {
        Self::declare(DeclarationKind::Let, name, init, BindingStorage::Slot)
    }

    /// `let` whose value lives in a stable-identity cell.
    pub fn let_cell(name: &str, init: Expression) -> Self {
        Self::declare(DeclarationKind::Let, name, init, BindingStorage::Cell)
    }

    pub fn const_(name: &str, init: Expression) -> Self {
        Self::declare(DeclarationKind::Const, name, init, BindingStorage::Slot)
    }

    pub fn expr(expression: Expression) -> Self {
        Self::Expression(expression)
    }

    pub fn ret(expression: Expression) -> Self {
        Self::Return(Some(expression))
    }
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Literal {
    Undefined,
    Null,
    Bool(bool),
    Number(i64),
    Str(String),
}

impl Literal {
    pub fn to_value(&self) -> Value {
        match self {
            Self::Undefined => Value::Undefined,
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => Value::Number(*n),
            Self::Str(s) => Value::Str(s.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Lt,
    StrictEq,
    StrictNe,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expression {
    Literal(Literal),
    Identifier(Identifier),
    This {
        /// Scope whose activation supplies `this`.
        provider: Option<ScopeId>,
    },
    Object(Vec<(String, Expression)>),
    Array(Vec<Expression>),
    Member {
        object: Box<Expression>,
        property: String,
    },
    SetMember {
        object: Box<Expression>,
        property: String,
        value: Box<Expression>,
    },
    Call {
        callee: Box<Expression>,
        arguments: Vec<Expression>,
    },
    Assign {
        target: Identifier,
        value: Box<Expression>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Function(Box<FunctionNode>),
    /// Source text evaluated at run time; the surrounding body cannot be
    /// analyzed statically.
    DynamicEval(String),
}

impl Expression {
    pub fn ident(name: &str) -> Self {
        Self::Identifier(Identifier::new(name))
    }

    pub fn num(value: i64) -> Self {
        Self::Literal(Literal::Number(value))
    }

    pub fn str(value: &str) -> Self {
        Self::Literal(Literal::Str(value.to_string()))
    }

    pub fn bool(value: bool) -> Self {
        Self::Literal(Literal::Bool(value))
    }

    pub fn undefined() -> Self {
        Self::Literal(Literal::Undefined)
    }

    pub fn null() -> Self {
        Self::Literal(Literal::Null)
    }

    pub fn this() -> Self {
        Self::This { provider: None }
    }

    pub fn object(properties: Vec<(&str, Expression)>) -> Self {
        Self::Object(
            properties
                .into_iter()
                .map(|(key, value)| (key.to_string(), value))
                .collect(),
        )
    }

    pub fn array(elements: Vec<Expression>) -> Self {
        Self::Array(elements)
    }

    pub fn member(object: Expression, property: &str) -> Self {
        Self::Member {
            object: Box::new(object),
            property: property.to_string(),
        }
    }

    pub fn set_member(object: Expression, property: &str, value: Expression) -> Self {
        Self::SetMember {
            object: Box::new(object),
            property: property.to_string(),
            value: Box::new(value),
        }
    }

    pub fn call(callee: Expression, arguments: Vec<Expression>) -> Self {
        Self::Call {
            callee: Box::new(callee),
            arguments,
        }
    }

    /// `object.property(arguments)`, binding `this` to `object`.
    pub fn method(object: Expression, property: &str, arguments: Vec<Expression>) -> Self {
        Self::call(Self::member(object, property), arguments)
    }

    pub fn assign(name: &str, value: Expression) -> Self {
        Self::Assign {
            target: Identifier::new(name),
            value: Box::new(value),
        }
    }

    pub fn binary(op: BinaryOp, left: Expression, right: Expression) -> Self {
        Self::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn function(node: FunctionNode) -> Self {
        Self::Function(Box::new(node))
    }
}

// ---------------------------------------------------------------------------
// Program
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub body: Vec<Statement>,
}

impl Program {
    pub fn new(body: Vec<Statement>) -> Self {
        Self { body }
    }

    /// Every function definition in textual (pre-)order, nested ones included.
    pub fn functions(&self) -> Vec<&FunctionNode> {
        let mut out = Vec::new();
        functions_in_statements(&self.body, &mut out);
        out
    }
}

fn functions_in_statements<'a>(statements: &'a [Statement], out: &mut Vec<&'a FunctionNode>) {
    for statement in statements {
        match statement {
            Statement::Declaration { init, .. } => {
                if let Some(init) = init {
                    functions_in_expression(init, out);
                }
            }
            Statement::Function(node) => functions_in_function(node, out),
            Statement::Expression(expression) => functions_in_expression(expression, out),
            Statement::Return(value) => {
                if let Some(value) = value {
                    functions_in_expression(value, out);
                }
            }
            Statement::Block(block) => functions_in_statements(&block.body, out),
            Statement::If {
                test,
                consequent,
                alternate,
            } => {
                functions_in_expression(test, out);
                functions_in_statements(&consequent.body, out);
                if let Some(alternate) = alternate {
                    functions_in_statements(&alternate.body, out);
                }
            }
            Statement::While { test, body } => {
                functions_in_expression(test, out);
                functions_in_statements(&body.body, out);
            }
        }
    }
}

fn functions_in_function<'a>(node: &'a FunctionNode, out: &mut Vec<&'a FunctionNode>) {
    out.push(node);
    functions_in_statements(&node.body, out);
}

fn functions_in_expression<'a>(expression: &'a Expression, out: &mut Vec<&'a FunctionNode>) {
    match expression {
        Expression::Literal(_)
        | Expression::Identifier(_)
        | Expression::This { .. }
        | Expression::DynamicEval(_) => {}
        Expression::Object(properties) => {
            for (_, value) in properties {
                functions_in_expression(value, out);
            }
        }
        Expression::Array(elements) => {
            for element in elements {
                functions_in_expression(element, out);
            }
        }
        Expression::Member { object, .. } => functions_in_expression(object, out),
        Expression::SetMember { object, value, .. } => {
            functions_in_expression(object, out);
            functions_in_expression(value, out);
        }
        Expression::Call { callee, arguments } => {
            functions_in_expression(callee, out);
            for argument in arguments {
                functions_in_expression(argument, out);
            }
        }
        Expression::Assign { value, .. } => functions_in_expression(value, out),
        Expression::Binary { left, right, .. } => {
            functions_in_expression(left, out);
            functions_in_expression(right, out);
        }
        Expression::Function(node) => functions_in_function(node, out),
    }
}
