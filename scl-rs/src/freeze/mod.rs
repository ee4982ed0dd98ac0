//! The freezable step graph and the freezing pass.
//!
//! A [`FreezableStep`] is the parser's output: a step kind plus named child
//! properties, with no types attached.  [`StepFactoryStore::freeze`] resolves
//! it against a [`TypeResolver`](crate::types::TypeResolver) into an
//! [`ExecutableStep`](crate::step::ExecutableStep).
//!
//! The JSON interchange form:
//!
//! | JSON | Meaning |
//! |------|---------|
//! | `true`, `1`, `2.5`, `"text"` | constant |
//! | `{"enum": "ErrorBehavior.Skip"}` | enumeration constant |
//! | `{"step": "Kind", "args": {...}, "at": {"line": 1, "column": 1}}` | compound step |
//! | `[step, ...]` | list property |
//! | `{"var": "name"}` | variable-name property |
//! | `{"lambda": "name", "body": step}` | lambda property (`lambda` omitted: `<>`) |

mod factory;
mod registry;

pub use factory::{
    BuildFn, BuildRequest, DeclareFn, InferFn, InferRequest, LambdaBinding, OutputShape,
    PropertyInfo, PropertyKind, StepFactory,
};
pub use registry::StepFactoryStore;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, Result, StructuredError, TextPosition};
use crate::types::{TypeReference, VariableName};
use crate::value::{EnumValue, Value};

// ── Constants ─────────────────────────────────────────────────────────────────

/// A literal leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConstantValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
    Enum {
        #[serde(rename = "enum")]
        value: String,
    },
}

impl ConstantValue {
    pub fn enumeration(value: &EnumValue) -> Self {
        ConstantValue::Enum { value: value.to_string() }
    }

    pub fn type_reference(&self) -> Result<TypeReference> {
        Ok(match self {
            ConstantValue::Bool(_) => TypeReference::BOOL,
            ConstantValue::Int(_) => TypeReference::INT,
            ConstantValue::Double(_) => TypeReference::DOUBLE,
            ConstantValue::Str(_) => TypeReference::STRING,
            ConstantValue::Enum { .. } => TypeReference::enumeration(self.enum_value()?.type_name),
        })
    }

    fn enum_value(&self) -> Result<EnumValue> {
        match self {
            ConstantValue::Enum { value } => EnumValue::parse(value).ok_or_else(|| {
                StructuredError::new(
                    ErrorCode::InvalidTree,
                    format!("'{value}' is not an enumeration value of the form Type.Value"),
                )
            }),
            _ => Err(StructuredError::new(ErrorCode::InvalidTree, "not an enumeration")),
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(match self {
            ConstantValue::Bool(b) => Value::Bool(*b),
            ConstantValue::Int(n) => Value::Int(*n),
            ConstantValue::Double(x) => Value::Double(*x),
            ConstantValue::Str(s) => Value::Str(s.clone()),
            ConstantValue::Enum { .. } => Value::Enum(self.enum_value()?),
        })
    }
}

// ── Steps ─────────────────────────────────────────────────────────────────────

/// An unfrozen step with named properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompoundStep {
    #[serde(rename = "step")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, FreezableProperty>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<TextPosition>,
}

/// A node of the untyped step graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FreezableStep {
    Compound(CompoundStep),
    Constant(ConstantValue),
}

impl FreezableStep {
    /// A compound step with the given properties.
    pub fn step<'a>(
        kind: &str,
        args: impl IntoIterator<Item = (&'a str, FreezableProperty)>,
    ) -> Self {
        FreezableStep::Compound(CompoundStep {
            kind: kind.to_owned(),
            args: args.into_iter().map(|(k, v)| (k.to_owned(), v)).collect(),
            at: None,
        })
    }

    /// Parse the JSON interchange form.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| {
            StructuredError::new(ErrorCode::InvalidTree, format!("invalid step tree: {e}"))
        })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// The step kind, or `Constant`.
    pub fn kind(&self) -> &str {
        match self {
            FreezableStep::Compound(c) => &c.kind,
            FreezableStep::Constant(_) => "Constant",
        }
    }

    pub fn position(&self) -> Option<TextPosition> {
        match self {
            FreezableStep::Compound(c) => c.at,
            FreezableStep::Constant(_) => None,
        }
    }

    pub fn as_constant(&self) -> Option<&ConstantValue> {
        match self {
            FreezableStep::Constant(c) => Some(c),
            FreezableStep::Compound(_) => None,
        }
    }
}

impl From<ConstantValue> for FreezableStep {
    fn from(c: ConstantValue) -> Self {
        FreezableStep::Constant(c)
    }
}

impl From<i64> for FreezableStep {
    fn from(n: i64) -> Self {
        FreezableStep::Constant(ConstantValue::Int(n))
    }
}

impl From<f64> for FreezableStep {
    fn from(x: f64) -> Self {
        FreezableStep::Constant(ConstantValue::Double(x))
    }
}

impl From<bool> for FreezableStep {
    fn from(b: bool) -> Self {
        FreezableStep::Constant(ConstantValue::Bool(b))
    }
}

impl From<&str> for FreezableStep {
    fn from(s: &str) -> Self {
        FreezableStep::Constant(ConstantValue::Str(s.to_owned()))
    }
}

impl fmt::Display for FreezableStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_json())
    }
}

// ── Properties ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariableRef {
    pub var: VariableName,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LambdaProperty {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lambda: Option<VariableName>,
    pub body: Box<FreezableStep>,
}

/// The value of one named property of a compound step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FreezableProperty {
    List(Vec<FreezableStep>),
    Variable(VariableRef),
    Lambda(LambdaProperty),
    Step(Box<FreezableStep>),
}

impl FreezableProperty {
    pub fn var(name: &str) -> Self {
        FreezableProperty::Variable(VariableRef { var: VariableName::new(name) })
    }

    /// A lambda binding its item to `name`, or to `<>` when `None`.
    pub fn lambda(name: Option<&str>, body: FreezableStep) -> Self {
        FreezableProperty::Lambda(LambdaProperty {
            lambda: name.map(VariableName::new),
            body: Box::new(body),
        })
    }

    pub fn list(items: impl IntoIterator<Item = FreezableStep>) -> Self {
        FreezableProperty::List(items.into_iter().collect())
    }

    /// Short description used in error messages.
    pub fn shape(&self) -> &'static str {
        match self {
            FreezableProperty::List(_) => "a list",
            FreezableProperty::Variable(_) => "a variable name",
            FreezableProperty::Lambda(_) => "a lambda",
            FreezableProperty::Step(_) => "a step",
        }
    }
}

impl From<FreezableStep> for FreezableProperty {
    fn from(step: FreezableStep) -> Self {
        FreezableProperty::Step(Box::new(step))
    }
}

macro_rules! constant_property {
    ($($t:ty),*) => {
        $(impl From<$t> for FreezableProperty {
            fn from(v: $t) -> Self {
                FreezableProperty::Step(Box::new(FreezableStep::from(v)))
            }
        })*
    };
}

constant_property!(i64, f64, bool, &str, ConstantValue);

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_names_are_validated_when_parsed() {
        let get = |name: &str| {
            format!(r#"{{"step": "GetVariable", "args": {{"Variable": {{"var": "{name}"}}}}}}"#)
        };
        assert!(FreezableStep::from_json(&get("count_1")).is_ok());
        for bad in ["a-b", "1abc", ""] {
            let e = FreezableStep::from_json(&get(bad)).unwrap_err();
            assert_eq!(e.code(), Some(ErrorCode::InvalidTree), "{bad}");
        }
        let lambda = r#"{"step": "ArrayMap", "args": {"Array": [1],
            "Function": {"lambda": "no good", "body": 1}}}"#;
        assert!(FreezableStep::from_json(lambda).is_err());
    }

    #[test]
    fn parse_interchange_form() {
        let tree = FreezableStep::from_json(
            r#"{"step": "ArrayMap", "at": {"line": 3, "column": 7}, "args": {
                "Array": {"step": "Array", "args": {"Elements": [1, 2.5, "x", true]}},
                "Function": {"lambda": "item", "body": {"step": "GetVariable", "args": {"Variable": {"var": "item"}}}},
                "Other": {"body": {"enum": "ErrorBehavior.Skip"}}
            }}"#,
        )
        .unwrap();
        let FreezableStep::Compound(c) = &tree else { panic!("expected compound") };
        assert_eq!(c.kind, "ArrayMap");
        assert_eq!(c.at, Some(TextPosition { line: 3, column: 7 }));
        let FreezableProperty::Step(array) = &c.args["Array"] else { panic!("expected step") };
        let FreezableStep::Compound(array) = array.as_ref() else { panic!("expected compound") };
        let FreezableProperty::List(elements) = &array.args["Elements"] else { panic!("expected list") };
        assert_eq!(
            elements.iter().map(|e| e.as_constant().cloned().unwrap()).collect::<Vec<_>>(),
            vec![
                ConstantValue::Int(1),
                ConstantValue::Double(2.5),
                ConstantValue::Str("x".into()),
                ConstantValue::Bool(true),
            ]
        );
        let FreezableProperty::Lambda(f) = &c.args["Function"] else { panic!("expected lambda") };
        assert_eq!(f.lambda, Some(VariableName::new("item")));
        let FreezableProperty::Lambda(auto) = &c.args["Other"] else { panic!("expected lambda") };
        assert_eq!(auto.lambda, None);
    }

    #[test]
    fn json_round_trip_preserves_tree() {
        let tree = FreezableStep::step(
            "SetVariable",
            [("Variable", FreezableProperty::var("x")), ("Value", 1i64.into())],
        );
        assert_eq!(FreezableStep::from_json(&tree.to_json()).unwrap(), tree);
    }

    #[test]
    fn malformed_json_is_invalid_tree() {
        let e = FreezableStep::from_json("{\"args\": 1}").unwrap_err();
        assert_eq!(e.code(), Some(ErrorCode::InvalidTree));
    }

    #[test]
    fn enum_constants() {
        let c = ConstantValue::Enum { value: "ErrorBehavior.Warning".into() };
        assert_eq!(c.type_reference().unwrap(), TypeReference::enumeration("ErrorBehavior"));
        assert_eq!(c.to_value().unwrap(), Value::Enum(EnumValue::new("ErrorBehavior", "Warning")));
        let bad = ConstantValue::Enum { value: "Warning".into() };
        assert_eq!(bad.to_value().unwrap_err().code(), Some(ErrorCode::InvalidTree));
    }
}
