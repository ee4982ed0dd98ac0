//! Variable-name → type table used while freezing.

use std::collections::{HashMap, HashSet};

use crate::error::{ErrorCode, Result, StructuredError};

use super::{TypeReference, VariableName};

/// State of the implicit lambda item `<>` at some point in the tree.
#[derive(Debug, Clone, Default, PartialEq)]
enum Automatic {
    #[default]
    NotSet,
    Declared(TypeReference),
    /// Two or more enclosing automatic lambdas: `<>` does not name one item.
    Ambiguous,
}

/// Resolved variable types for one freeze pass.
///
/// Entries are only ever added with fully resolved types, so resolving a
/// [`TypeReference::Variable`] is a single lookup and always terminates.
/// Lambda bodies get a clone with their item bound ([`TypeResolver::for_lambda`]);
/// the parent table is never touched.
#[derive(Debug, Clone, Default)]
pub struct TypeResolver {
    variables: HashMap<VariableName, TypeReference>,
    unresolved: HashSet<VariableName>,
    automatic: Automatic,
}

impl TypeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the type of `name`.  A name seen again must unify with its
    /// earlier type; the table keeps the unified (most specific) one.
    ///
    /// Returns `true` when the table changed.
    pub fn declare(&mut self, name: VariableName, ty: TypeReference) -> Result<bool> {
        self.unresolved.remove(&name);
        match self.variables.get(&name) {
            None => {
                self.variables.insert(name, ty);
                Ok(true)
            }
            Some(existing) => match TypeReference::unify(existing, &ty) {
                Some(unified) if &unified == existing => Ok(false),
                Some(unified) => {
                    self.variables.insert(name, unified);
                    Ok(true)
                }
                None => Err(StructuredError::new(
                    ErrorCode::ConflictingTypes,
                    format!("{name} is assigned both {existing} and {ty}"),
                )),
            },
        }
    }

    /// Remember that `name` is assigned somewhere but its type could not be
    /// inferred, so lookups can say so instead of "undeclared".
    pub fn mark_unresolved(&mut self, name: VariableName) {
        if !self.variables.contains_key(&name) {
            self.unresolved.insert(name);
        }
    }

    pub fn contains(&self, name: &VariableName) -> bool {
        self.variables.contains_key(name)
    }

    pub fn variable_type(&self, name: &VariableName) -> Result<&TypeReference> {
        if let Some(ty) = self.variables.get(name) {
            return Ok(ty);
        }
        if self.unresolved.contains(name) {
            Err(StructuredError::new(
                ErrorCode::UnresolvableVariable,
                format!("the type of {name} could not be inferred"),
            ))
        } else {
            Err(StructuredError::new(
                ErrorCode::UndeclaredVariable,
                format!("{name} is never set"),
            ))
        }
    }

    pub fn automatic_type(&self) -> Result<&TypeReference> {
        match &self.automatic {
            Automatic::Declared(ty) => Ok(ty),
            Automatic::NotSet => Err(StructuredError::new(
                ErrorCode::AutomaticVariableNotSet,
                "<> is used outside of any lambda that binds it",
            )),
            Automatic::Ambiguous => Err(StructuredError::new(
                ErrorCode::AmbiguousAutomaticVariable,
                "<> could refer to more than one enclosing lambda; name the lambda variables",
            )),
        }
    }

    /// Resolver for a lambda body whose item has type `item`.
    ///
    /// A named item shadows any outer variable of the same name.  An automatic
    /// item nested inside another automatic lambda makes `<>` ambiguous.
    pub fn for_lambda(&self, name: Option<&VariableName>, item: TypeReference) -> Self {
        let mut child = self.clone();
        match name {
            Some(name) => {
                child.unresolved.remove(name);
                child.variables.insert(name.clone(), item);
            }
            None => {
                child.automatic = match child.automatic {
                    Automatic::NotSet => Automatic::Declared(item),
                    _ => Automatic::Ambiguous,
                };
            }
        }
        child
    }

    /// Declared variables, sorted by name.
    pub fn variables(&self) -> Vec<(&VariableName, &TypeReference)> {
        let mut v: Vec<_> = self.variables.iter().collect();
        v.sort_by(|a, b| a.0.cmp(b.0));
        v
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn x() -> VariableName {
        VariableName::new("x")
    }

    #[test]
    fn declare_then_lookup() {
        let mut r = TypeResolver::new();
        assert!(r.declare(x(), TypeReference::INT).unwrap());
        assert!(!r.declare(x(), TypeReference::INT).unwrap());
        assert_eq!(r.variable_type(&x()).unwrap(), &TypeReference::INT);
    }

    #[test]
    fn declare_refines_unknown_elements() {
        let mut r = TypeResolver::new();
        r.declare(x(), TypeReference::array(TypeReference::Any)).unwrap();
        assert!(r.declare(x(), TypeReference::array(TypeReference::STRING)).unwrap());
        assert_eq!(
            r.variable_type(&x()).unwrap(),
            &TypeReference::array(TypeReference::STRING)
        );
    }

    #[test]
    fn conflicting_declarations() {
        let mut r = TypeResolver::new();
        r.declare(x(), TypeReference::INT).unwrap();
        let e = r.declare(x(), TypeReference::STRING).unwrap_err();
        assert_eq!(e.code(), Some(ErrorCode::ConflictingTypes));
    }

    #[test]
    fn undeclared_vs_unresolvable() {
        let mut r = TypeResolver::new();
        assert_eq!(
            r.variable_type(&x()).unwrap_err().code(),
            Some(ErrorCode::UndeclaredVariable)
        );
        r.mark_unresolved(x());
        assert_eq!(
            r.variable_type(&x()).unwrap_err().code(),
            Some(ErrorCode::UnresolvableVariable)
        );
    }

    #[test]
    fn lambda_overrides_do_not_touch_parent() {
        let mut r = TypeResolver::new();
        r.declare(x(), TypeReference::INT).unwrap();
        let child = r.for_lambda(Some(&x()), TypeReference::STRING);
        assert_eq!(child.variable_type(&x()).unwrap(), &TypeReference::STRING);
        assert_eq!(r.variable_type(&x()).unwrap(), &TypeReference::INT);
    }

    #[test]
    fn automatic_variable_states() {
        let r = TypeResolver::new();
        assert_eq!(
            r.automatic_type().unwrap_err().code(),
            Some(ErrorCode::AutomaticVariableNotSet)
        );
        let one = r.for_lambda(None, TypeReference::INT);
        assert_eq!(one.automatic_type().unwrap(), &TypeReference::INT);
        let named_inside = one.for_lambda(Some(&x()), TypeReference::STRING);
        assert_eq!(named_inside.automatic_type().unwrap(), &TypeReference::INT);
        let two = one.for_lambda(None, TypeReference::STRING);
        assert_eq!(
            two.automatic_type().unwrap_err().code(),
            Some(ErrorCode::AmbiguousAutomaticVariable)
        );
    }
}
