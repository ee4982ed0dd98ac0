//! Type references and their resolution.
//!
//! Freezing works on [`TypeReference`]s: types that may still depend on a
//! variable's inferred type, on the implicit lambda item, or on several
//! observed uses that have to agree.  A [`TypeResolver`] collapses them into
//! concrete shapes (an [`ActualType`] or an array of one).

mod resolver;

pub use resolver::TypeResolver;

use std::fmt;
use std::sync::OnceLock;

use itertools::Itertools;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, Result, StructuredError};

// ── VariableName ──────────────────────────────────────────────────────────────

/// The name of an SCL variable, displayed as `<name>`.  Names read from a
/// step tree are validated like [`VariableName::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VariableName(String);

impl VariableName {
    pub fn new(name: impl Into<String>) -> Self {
        VariableName(name.into())
    }

    /// Validate `name` as a user-visible identifier.
    pub fn parse(name: &str) -> std::result::Result<Self, String> {
        static IDENT: OnceLock<Regex> = OnceLock::new();
        let re = IDENT.get_or_init(|| {
            Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid")
        });
        if re.is_match(name) {
            Ok(VariableName(name.to_owned()))
        } else {
            Err(format!("'{name}' is not a valid variable name"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VariableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.0)
    }
}

impl TryFrom<String> for VariableName {
    type Error = String;

    fn try_from(name: String) -> std::result::Result<Self, String> {
        VariableName::parse(&name)
    }
}

impl From<VariableName> for String {
    fn from(name: VariableName) -> String {
        name.0
    }
}

impl From<&str> for VariableName {
    fn from(s: &str) -> Self {
        VariableName(s.to_owned())
    }
}

// ── ActualType ────────────────────────────────────────────────────────────────

/// A concrete, non-array value kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActualType {
    Unit,
    Bool,
    Int,
    Double,
    String,
    Entity,
    /// An enumeration, by type name (e.g. `ErrorBehavior`).
    Enum(String),
}

impl fmt::Display for ActualType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActualType::Unit => f.write_str("unit"),
            ActualType::Bool => f.write_str("bool"),
            ActualType::Int => f.write_str("int"),
            ActualType::Double => f.write_str("double"),
            ActualType::String => f.write_str("string"),
            ActualType::Entity => f.write_str("entity"),
            ActualType::Enum(name) => f.write_str(name),
        }
    }
}

// ── TypeReference ─────────────────────────────────────────────────────────────

/// A possibly not-yet-concrete type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeReference {
    /// Nothing is known yet.
    Unknown,
    /// Any type is acceptable.
    Any,
    Actual(ActualType),
    Array(Box<TypeReference>),
    /// The inferred type of a variable.
    Variable(VariableName),
    /// Several observed uses that must unify into one type.
    MultipleCandidates(Vec<TypeReference>),
    /// The type of the implicit lambda item `<>`.
    AutomaticVariable,
}

impl fmt::Display for TypeReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeReference::Unknown => f.write_str("unknown"),
            TypeReference::Any => f.write_str("any"),
            TypeReference::Actual(a) => write!(f, "{a}"),
            TypeReference::Array(inner) => write!(f, "array<{inner}>"),
            TypeReference::Variable(name) => write!(f, "typeof {name}"),
            TypeReference::MultipleCandidates(c) => {
                write!(f, "one of [{}]", c.iter().join(", "))
            }
            TypeReference::AutomaticVariable => f.write_str("typeof <>"),
        }
    }
}

impl From<ActualType> for TypeReference {
    fn from(a: ActualType) -> Self {
        TypeReference::Actual(a)
    }
}

impl TypeReference {
    pub const UNIT: TypeReference = TypeReference::Actual(ActualType::Unit);
    pub const BOOL: TypeReference = TypeReference::Actual(ActualType::Bool);
    pub const INT: TypeReference = TypeReference::Actual(ActualType::Int);
    pub const DOUBLE: TypeReference = TypeReference::Actual(ActualType::Double);
    pub const STRING: TypeReference = TypeReference::Actual(ActualType::String);
    pub const ENTITY: TypeReference = TypeReference::Actual(ActualType::Entity);

    pub fn array(of: TypeReference) -> Self {
        TypeReference::Array(Box::new(of))
    }

    pub fn enumeration(name: impl Into<String>) -> Self {
        TypeReference::Actual(ActualType::Enum(name.into()))
    }

    /// Build a candidate set, flattening nested sets and dropping duplicates.
    /// A set of one is that candidate itself.
    pub fn candidates(types: impl IntoIterator<Item = TypeReference>) -> Self {
        let mut flat: Vec<TypeReference> = Vec::new();
        for t in types {
            let parts = match t {
                TypeReference::MultipleCandidates(inner) => inner,
                other => vec![other],
            };
            for p in parts {
                if !flat.contains(&p) {
                    flat.push(p);
                }
            }
        }
        match flat.len() {
            0 => TypeReference::Unknown,
            1 => flat.remove(0),
            _ => TypeReference::MultipleCandidates(flat),
        }
    }

    /// `Unknown` or `Any`: compatible with everything.
    pub fn is_absorbing(&self) -> bool {
        matches!(self, TypeReference::Unknown | TypeReference::Any)
    }

    /// Element type, if this is an array.
    pub fn element_type(&self) -> Option<&TypeReference> {
        match self {
            TypeReference::Array(inner) => Some(inner),
            _ => None,
        }
    }

    /// `true` when a step producing this type can execute: fully resolved,
    /// not `Unknown`/`Any` at the top, and no `Unknown` inside arrays.
    /// `array<any>` is allowed: an array whose elements are unconstrained.
    pub fn is_concrete(&self) -> bool {
        match self {
            TypeReference::Actual(_) => true,
            TypeReference::Array(inner) => match inner.as_ref() {
                TypeReference::Any => true,
                other => other.is_concrete(),
            },
            _ => false,
        }
    }

    /// `true` if a value of type `actual` can be used where `self` is expected.
    pub fn allows(&self, actual: &TypeReference) -> bool {
        match (self, actual) {
            (e, a) if e.is_absorbing() || a.is_absorbing() => true,
            (TypeReference::Array(e), TypeReference::Array(a)) => e.allows(a),
            (TypeReference::Actual(e), TypeReference::Actual(a)) => e == a,
            (TypeReference::MultipleCandidates(c), a) => c.iter().any(|t| t.allows(a)),
            (e, TypeReference::MultipleCandidates(c)) => c.iter().all(|t| e.allows(t)),
            (TypeReference::Variable(x), TypeReference::Variable(y)) => x == y,
            (TypeReference::AutomaticVariable, TypeReference::AutomaticVariable) => true,
            _ => false,
        }
    }

    /// The most specific type compatible with both, if any.
    pub fn unify(a: &TypeReference, b: &TypeReference) -> Option<TypeReference> {
        match (a, b) {
            (TypeReference::Unknown, TypeReference::Any)
            | (TypeReference::Any, TypeReference::Unknown) => Some(TypeReference::Unknown),
            (x, y) if x.is_absorbing() => Some(y.clone()),
            (x, y) if y.is_absorbing() => Some(x.clone()),
            (TypeReference::Array(x), TypeReference::Array(y)) => {
                TypeReference::unify(x, y).map(TypeReference::array)
            }
            (x, y) if x == y => Some(x.clone()),
            _ => None,
        }
    }

    /// Resolve against `resolver` into an `Actual`/`Array` shape.
    ///
    /// `Unknown` and `Any` are returned unchanged (deferred); callers decide
    /// whether that is acceptable with [`TypeReference::is_concrete`].
    pub fn resolve(&self, resolver: &TypeResolver) -> Result<TypeReference> {
        match self {
            TypeReference::Unknown | TypeReference::Any | TypeReference::Actual(_) => {
                Ok(self.clone())
            }
            TypeReference::Array(inner) => Ok(TypeReference::array(inner.resolve(resolver)?)),
            TypeReference::Variable(name) => resolver.variable_type(name).cloned(),
            TypeReference::AutomaticVariable => resolver.automatic_type().cloned(),
            TypeReference::MultipleCandidates(candidates) => {
                let mut result = TypeReference::Unknown;
                for candidate in candidates {
                    let resolved = candidate.resolve(resolver)?;
                    result = TypeReference::unify(&result, &resolved).ok_or_else(|| {
                        StructuredError::new(
                            ErrorCode::ConflictingTypes,
                            format!("conflicting types {result} and {resolved}"),
                        )
                    })?;
                }
                Ok(result)
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn arr(t: TypeReference) -> TypeReference {
        TypeReference::array(t)
    }

    #[test]
    fn display_forms() {
        assert_eq!(arr(TypeReference::INT).to_string(), "array<int>");
        assert_eq!(TypeReference::Variable("x".into()).to_string(), "typeof <x>");
        assert_eq!(TypeReference::enumeration("ErrorBehavior").to_string(), "ErrorBehavior");
    }

    #[test]
    fn allows_rules() {
        assert!(TypeReference::Any.allows(&TypeReference::INT));
        assert!(TypeReference::INT.allows(&TypeReference::Unknown));
        assert!(arr(TypeReference::Any).allows(&arr(TypeReference::STRING)));
        assert!(!arr(TypeReference::INT).allows(&arr(TypeReference::STRING)));
        assert!(!TypeReference::INT.allows(&TypeReference::DOUBLE));
        let numeric = TypeReference::candidates([TypeReference::INT, TypeReference::DOUBLE]);
        assert!(numeric.allows(&TypeReference::DOUBLE));
        assert!(!numeric.allows(&TypeReference::STRING));
    }

    #[test]
    fn unify_most_specific() {
        let u = TypeReference::unify(&arr(TypeReference::Unknown), &arr(TypeReference::INT));
        assert_eq!(u, Some(arr(TypeReference::INT)));
        assert_eq!(
            TypeReference::unify(&TypeReference::Any, &TypeReference::STRING),
            Some(TypeReference::STRING)
        );
        assert_eq!(TypeReference::unify(&TypeReference::INT, &TypeReference::STRING), None);
    }

    #[test]
    fn candidates_flatten_and_dedup() {
        let inner = TypeReference::candidates([TypeReference::INT, TypeReference::Any]);
        let outer = TypeReference::candidates([inner, TypeReference::INT]);
        assert_eq!(
            outer,
            TypeReference::MultipleCandidates(vec![TypeReference::INT, TypeReference::Any])
        );
        assert_eq!(TypeReference::candidates([TypeReference::BOOL]), TypeReference::BOOL);
    }

    #[test]
    fn resolve_candidates() {
        let r = TypeResolver::new();
        let ok = TypeReference::candidates([TypeReference::Any, TypeReference::INT, TypeReference::Unknown]);
        assert_eq!(ok.resolve(&r).unwrap(), TypeReference::INT);

        let none = TypeReference::candidates([TypeReference::Any, TypeReference::Unknown]);
        assert_eq!(none.resolve(&r).unwrap(), TypeReference::Unknown);

        let bad = TypeReference::candidates([TypeReference::INT, TypeReference::STRING]);
        let e = bad.resolve(&r).unwrap_err();
        assert_eq!(e.code(), Some(ErrorCode::ConflictingTypes));
        assert!(e.as_user_message().contains("int"));
        assert!(e.as_user_message().contains("string"));
    }

    #[test]
    fn concreteness() {
        assert!(TypeReference::INT.is_concrete());
        assert!(arr(TypeReference::Any).is_concrete());
        assert!(!arr(TypeReference::Unknown).is_concrete());
        assert!(!TypeReference::Any.is_concrete());
        assert!(!TypeReference::Variable("x".into()).is_concrete());
    }

    #[test]
    fn variable_name_validation() {
        assert!(VariableName::parse("count_1").is_ok());
        assert!(VariableName::parse("1abc").is_err());
        assert!(VariableName::parse("a-b").is_err());
        assert_eq!(VariableName::new("x").to_string(), "<x>");
    }
}
