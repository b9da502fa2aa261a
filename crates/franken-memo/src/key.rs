//! Key construction: evaluate a [`CaptureSpec`] against live bindings.
//!
//! Building a key never copies or hashes object contents. Primitives are
//! keyed by value, objects and cells by identity.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analyzer::{CaptureMode, CaptureSpec};
use crate::heap::GcObjectId;
use crate::scope::{BindingId, ScopeId};
use crate::value::{PrimitiveKey, Value};

// ---------------------------------------------------------------------------
// KeyComponent / KeyTuple
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyComponent {
    Primitive(PrimitiveKey),
    ObjectRef(GcObjectId),
    CellRef(GcObjectId),
}

impl KeyComponent {
    /// Identity of a weakly held component.
    pub fn object(&self) -> Option<GcObjectId> {
        match self {
            Self::Primitive(_) => None,
            Self::ObjectRef(id) | Self::CellRef(id) => Some(*id),
        }
    }

    pub fn is_weak(&self) -> bool {
        self.object().is_some()
    }
}

impl From<&Value> for KeyComponent {
    fn from(value: &Value) -> Self {
        match value {
            Value::Object(id) => Self::ObjectRef(*id),
            Value::Undefined => Self::Primitive(PrimitiveKey::Undefined),
            Value::Null => Self::Primitive(PrimitiveKey::Null),
            Value::Bool(b) => Self::Primitive(PrimitiveKey::Bool(*b)),
            Value::Number(n) => Self::Primitive(PrimitiveKey::Number(*n)),
            Value::Str(s) => Self::Primitive(PrimitiveKey::Str(s.clone())),
        }
    }
}

impl fmt::Display for KeyComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primitive(key) => write!(f, "{key}"),
            Self::ObjectRef(id) => write!(f, "&{id}"),
            Self::CellRef(id) => write!(f, "cell&{id}"),
        }
    }
}

/// Concrete captures of one evaluation, in capture order.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyTuple(Vec<KeyComponent>);

impl KeyTuple {
    pub fn new(components: Vec<KeyComponent>) -> Self {
        Self(components)
    }

    pub fn arity(&self) -> usize {
        self.0.len()
    }

    pub fn components(&self) -> &[KeyComponent] {
        &self.0
    }

    pub fn is_all_primitive(&self) -> bool {
        self.0.iter().all(|component| !component.is_weak())
    }

    /// Identities of every weakly held component.
    pub fn weak_objects(&self) -> Vec<GcObjectId> {
        self.0.iter().filter_map(KeyComponent::object).collect()
    }
}

impl fmt::Display for KeyTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (index, component) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{component}")?;
        }
        f.write_str(")")
    }
}

// ---------------------------------------------------------------------------
// LiveScope
// ---------------------------------------------------------------------------

/// Read access to the bindings visible at one control reach.
pub trait LiveScope {
    /// Current slot contents of `binding`; `None` while it is uninitialized.
    fn slot(&self, binding: BindingId) -> Result<Option<Value>, KeyError>;

    /// `this` supplied by the activation of `provider`, as seen from the
    /// reach point.
    fn this_value(&self, provider: ScopeId) -> Result<Value, KeyError>;

    fn is_cell(&self, object: GcObjectId) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum KeyError {
    #[error("binding {binding} is not visible from the reach point")]
    MissingBinding { binding: BindingId },
    #[error("cell-mode capture '{name}' does not hold a cell")]
    NotACell { name: String, binding: BindingId },
    #[error("capture '{name}' has no binding")]
    MissingCaptureBinding { name: String },
    #[error("no `this` is visible from the reach point")]
    MissingThis,
}

impl KeyError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            Self::MissingBinding { .. } => "FE-MEMO-0401",
            Self::NotACell { .. } => "FE-MEMO-0402",
            Self::MissingCaptureBinding { .. } => "FE-MEMO-0403",
            Self::MissingThis => "FE-MEMO-0404",
        }
    }
}

/// Build the key tuple for `spec` from the live bindings in `scope`.
pub fn build_key(spec: &CaptureSpec, scope: &impl LiveScope) -> Result<KeyTuple, KeyError> {
    let mut components = Vec::with_capacity(spec.arity());
    for capture in spec.captures() {
        let component = match capture.mode {
            CaptureMode::ThisValue => KeyComponent::from(&scope.this_value(capture.source_scope)?),
            CaptureMode::Value | CaptureMode::Cell => {
                let binding = capture
                    .binding
                    .ok_or_else(|| KeyError::MissingCaptureBinding {
                        name: capture.name.clone(),
                    })?;
                let slot = scope.slot(binding)?;
                if capture.mode == CaptureMode::Cell {
                    match slot {
                        Some(Value::Object(id)) if scope.is_cell(id) => KeyComponent::CellRef(id),
                        _ => {
                            return Err(KeyError::NotACell {
                                name: capture.name.clone(),
                                binding,
                            });
                        }
                    }
                } else {
                    match slot {
                        Some(value) => KeyComponent::from(&value),
                        None => KeyComponent::Primitive(PrimitiveKey::Uninitialized),
                    }
                }
            }
        };
        components.push(component);
    }
    Ok(KeyTuple::new(components))
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::*;
    use crate::analyzer::Capture;
    use crate::heap::{EphemeronHost, Heap, ObjectKind};
    use crate::scope::SiteId;

    #[derive(Default)]
    struct FakeScope {
        slots: BTreeMap<BindingId, Option<Value>>,
        this_value: Option<Value>,
        cells: BTreeSet<GcObjectId>,
    }

    impl LiveScope for FakeScope {
        fn slot(&self, binding: BindingId) -> Result<Option<Value>, KeyError> {
            self.slots
                .get(&binding)
                .cloned()
                .ok_or(KeyError::MissingBinding { binding })
        }

        fn this_value(&self, _provider: ScopeId) -> Result<Value, KeyError> {
            self.this_value.clone().ok_or(KeyError::MissingThis)
        }

        fn is_cell(&self, object: GcObjectId) -> bool {
            self.cells.contains(&object)
        }
    }

    fn capture(binding: u32, mode: CaptureMode) -> Capture {
        Capture {
            binding: Some(BindingId(binding)),
            name: format!("b{binding}"),
            mode,
            source_scope: ScopeId(0),
        }
    }

    fn this_capture() -> Capture {
        Capture {
            binding: None,
            name: "this".into(),
            mode: CaptureMode::ThisValue,
            source_scope: ScopeId(0),
        }
    }

    #[test]
    fn primitives_and_objects_map_to_tagged_components() {
        let mut heap = Heap::new();
        let obj = heap.new_tuple(0);
        let mut scope = FakeScope::default();
        scope.slots.insert(BindingId(0), Some(Value::Number(2)));
        scope.slots.insert(BindingId(1), Some(Value::Object(obj)));
        let spec = CaptureSpec::new(
            SiteId(0),
            vec![capture(0, CaptureMode::Value), capture(1, CaptureMode::Value)],
        );
        let key = build_key(&spec, &scope).unwrap();
        assert_eq!(
            key.components(),
            &[
                KeyComponent::Primitive(PrimitiveKey::Number(2)),
                KeyComponent::ObjectRef(obj)
            ]
        );
        assert!(!key.is_all_primitive());
        assert_eq!(key.weak_objects(), vec![obj]);
    }

    #[test]
    fn uninitialized_binding_has_its_own_component() {
        let mut scope = FakeScope::default();
        scope.slots.insert(BindingId(0), None);
        let spec = CaptureSpec::new(SiteId(0), vec![capture(0, CaptureMode::Value)]);
        let key = build_key(&spec, &scope).unwrap();
        assert_eq!(
            key.components(),
            &[KeyComponent::Primitive(PrimitiveKey::Uninitialized)]
        );
    }

    #[test]
    fn cell_mode_keys_by_cell_identity() {
        let mut heap = Heap::new();
        let cell = heap.allocate(ObjectKind::Cell {
            contents: Some(Value::Number(1)),
        });
        let mut scope = FakeScope::default();
        scope.slots.insert(BindingId(0), Some(Value::Object(cell)));
        scope.cells.insert(cell);
        let spec = CaptureSpec::new(SiteId(0), vec![capture(0, CaptureMode::Cell)]);
        let first = build_key(&spec, &scope).unwrap();
        heap.set_cell_contents(cell, Value::Number(2)).unwrap();
        let second = build_key(&spec, &scope).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.components(), &[KeyComponent::CellRef(cell)]);
    }

    #[test]
    fn cell_mode_without_cell_is_an_error() {
        let mut scope = FakeScope::default();
        scope.slots.insert(BindingId(0), Some(Value::Number(1)));
        let spec = CaptureSpec::new(SiteId(0), vec![capture(0, CaptureMode::Cell)]);
        let err = build_key(&spec, &scope).unwrap_err();
        assert!(matches!(err, KeyError::NotACell { .. }));
        assert_eq!(err.stable_code(), "FE-MEMO-0402");
    }

    #[test]
    fn this_component_follows_this_value_type() {
        let mut scope = FakeScope::default();
        scope.this_value = Some(Value::Undefined);
        let spec = CaptureSpec::new(SiteId(0), vec![this_capture()]);
        let key = build_key(&spec, &scope).unwrap();
        assert_eq!(
            key.components(),
            &[KeyComponent::Primitive(PrimitiveKey::Undefined)]
        );
    }

    #[test]
    fn empty_spec_builds_empty_key() {
        let spec = CaptureSpec::new(SiteId(0), vec![]);
        let key = build_key(&spec, &FakeScope::default()).unwrap();
        assert_eq!(key.arity(), 0);
        assert_eq!(key.to_string(), "()");
    }

    #[test]
    fn display_lists_components() {
        let mut heap = Heap::new();
        let obj = heap.new_tuple(0);
        let key = KeyTuple::new(vec![
            KeyComponent::Primitive(PrimitiveKey::Str("a".into())),
            KeyComponent::ObjectRef(obj),
        ]);
        assert_eq!(key.to_string(), format!("(\"a\", &{obj})"));
    }
}
