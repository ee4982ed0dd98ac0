//! The step factory registry and the freezing pass.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::error::{ErrorCode, ErrorLocation, Result, StructuredError};
use crate::step::ExecutableStep;
use crate::steps;
use crate::steps::flow::Constant;
use crate::types::{TypeReference, TypeResolver, VariableName};

use super::{BuildRequest, CompoundStep, FreezableProperty, FreezableStep, InferRequest, OutputShape, StepFactory};

/// Factories by kind.  Lookup ignores case and accepts aliases.
#[derive(Clone, Default)]
pub struct StepFactoryStore {
    factories: Vec<StepFactory>,
    index: HashMap<String, usize>,
}

impl fmt::Debug for StepFactoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepFactoryStore")
            .field("kinds", &self.factories.iter().map(|f| f.kind).collect::<Vec<_>>())
            .finish()
    }
}

/// A variable assignment found while scanning a tree for declarations.
struct Declaration {
    name: VariableName,
    ty: Result<TypeReference>,
    location: ErrorLocation,
}

/// Path and location of `step` as a child at `at` (empty for the root).
fn locate(step: &FreezableStep, at: &str) -> (String, ErrorLocation) {
    match step {
        FreezableStep::Compound(c) => {
            let path = if at.is_empty() { c.kind.clone() } else { format!("{at}.{}", c.kind) };
            let location = ErrorLocation::new(c.kind.clone(), path.clone()).with_position(c.at);
            (path, location)
        }
        FreezableStep::Constant(_) => {
            let path = if at.is_empty() { "Constant".to_owned() } else { at.to_owned() };
            let location = ErrorLocation::new("Constant", path.clone());
            (path, location)
        }
    }
}

fn check_allows(expected: &TypeReference, actual: &TypeReference) -> Result<()> {
    if expected.allows(actual) {
        Ok(())
    } else {
        Err(StructuredError::wrong_type(expected, actual))
    }
}

impl StepFactoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store holding every built-in step kind.
    pub fn core() -> Self {
        let mut store = Self::new();
        for factory in steps::core_factories() {
            store.register(factory);
        }
        store
    }

    /// Add `factory`, replacing any factory already registered under the
    /// same kind.
    pub fn register(&mut self, factory: StepFactory) {
        let key = factory.kind.to_lowercase();
        let slot = match self.index.get(&key) {
            Some(&i) => {
                tracing::debug!(kind = factory.kind, "replacing step factory");
                self.factories[i] = factory;
                i
            }
            None => {
                self.factories.push(factory);
                self.factories.len() - 1
            }
        };
        self.index.insert(key, slot);
        for alias in self.factories[slot].aliases {
            self.index.insert(alias.to_lowercase(), slot);
        }
    }

    pub fn get(&self, kind: &str) -> Option<&StepFactory> {
        self.index.get(&kind.to_lowercase()).map(|&i| &self.factories[i])
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.iter().map(|f| f.kind)
    }

    /// The factory for `step`, once its properties check out against the
    /// factory's declared ones.  Every problem is reported.
    fn lookup(&self, step: &CompoundStep) -> Result<&StepFactory> {
        let factory = self.get(&step.kind).ok_or_else(|| {
            StructuredError::new(ErrorCode::UnknownStep, format!("'{}' is not a known step", step.kind))
        })?;
        let mut errors = Vec::new();
        if !factory.open_properties {
            for key in step.args.keys() {
                if factory.property(key).is_none() {
                    errors.push(StructuredError::new(
                        ErrorCode::UnexpectedParameter,
                        format!("{} has no parameter '{key}'", factory.kind),
                    ));
                }
            }
        }
        for p in factory.properties.iter().filter(|p| p.required && p.default.is_none()) {
            let given = step.args.keys().any(|k| p.answers_to(k));
            if !given {
                errors.push(StructuredError::new(
                    ErrorCode::MissingParameter,
                    format!("{} requires '{}'", factory.kind, p.name),
                ));
            }
        }
        match StructuredError::combine(errors) {
            Some(e) => Err(e),
            None => Ok(factory),
        }
    }

    // ── Inference ─────────────────────────────────────────────────────────────

    /// The output type `step` would freeze to.
    pub fn infer(
        &self,
        step: &FreezableStep,
        expected: &TypeReference,
        resolver: &TypeResolver,
    ) -> Result<TypeReference> {
        self.infer_at(step, expected, resolver, "")
    }

    pub(crate) fn infer_at(
        &self,
        step: &FreezableStep,
        expected: &TypeReference,
        resolver: &TypeResolver,
        at: &str,
    ) -> Result<TypeReference> {
        let (path, location) = locate(step, at);
        let result = match step {
            FreezableStep::Constant(c) => c.type_reference().and_then(|ty| {
                check_allows(expected, &ty)?;
                Ok(ty)
            }),
            FreezableStep::Compound(c) => self.lookup(c).and_then(|factory| {
                let req = InferRequest { store: self, step: c, factory, expected, resolver, path: &path };
                Self::output_of(&req)
            }),
        };
        result.map_err(|e| e.with_location(&location))
    }

    fn output_of(req: &InferRequest<'_>) -> Result<TypeReference> {
        let ty = match &req.factory.output {
            OutputShape::Simple(ty) => ty.clone(),
            OutputShape::Generic(infer) => infer(req)?,
        };
        let resolved = ty.resolve(req.resolver)?;
        if !resolved.is_concrete() {
            return Err(StructuredError::new(
                ErrorCode::CannotInferType,
                format!("cannot infer the output type of {}: got {resolved}", req.factory.kind),
            ));
        }
        check_allows(req.expected, &resolved)?;
        Ok(resolved)
    }

    // ── Freezing ──────────────────────────────────────────────────────────────

    /// Resolve `step` into an executable tree whose output satisfies
    /// `expected`.
    pub fn freeze(
        &self,
        step: &FreezableStep,
        expected: &TypeReference,
        resolver: &TypeResolver,
    ) -> Result<ExecutableStep> {
        self.freeze_at(step, expected, resolver, "")
    }

    pub(crate) fn freeze_at(
        &self,
        step: &FreezableStep,
        expected: &TypeReference,
        resolver: &TypeResolver,
        at: &str,
    ) -> Result<ExecutableStep> {
        let (path, location) = locate(step, at);
        let result = match step {
            FreezableStep::Constant(c) => c.type_reference().and_then(|ty| {
                check_allows(expected, &ty)?;
                let body = Box::new(Constant(c.to_value()?));
                Ok(ExecutableStep::new("Constant", location.clone(), ty, body))
            }),
            FreezableStep::Compound(c) => self.lookup(c).and_then(|factory| {
                let infer = InferRequest { store: self, step: c, factory, expected, resolver, path: &path };
                let output = Self::output_of(&infer)?;
                let req = BuildRequest { infer, output };
                let body = (factory.build)(&req)?;
                Ok(ExecutableStep::new(factory.kind, location.clone(), req.output, body))
            }),
        };
        result.map_err(|e| e.with_location(&location))
    }

    // ── Resolver construction ─────────────────────────────────────────────────

    /// Scan `root` for variable assignments and type them, starting from
    /// `seed` (host-provided variables).  Assignments whose type depends on
    /// other variables are retried until nothing changes; names that never
    /// resolve are marked unresolvable.
    pub fn create_resolver(&self, root: &FreezableStep, seed: TypeResolver) -> Result<TypeResolver> {
        let mut resolver = seed;
        let mut seen: HashSet<VariableName> = HashSet::new();
        loop {
            let mut found = Vec::new();
            self.collect_declarations(root, &resolver, "", &mut found);
            let mut changed = false;
            for d in found {
                seen.insert(d.name.clone());
                let Ok(ty) = d.ty else { continue };
                if !ty.is_concrete() {
                    continue;
                }
                changed |= resolver
                    .declare(d.name, ty)
                    .map_err(|e| e.with_location(&d.location))?;
            }
            if !changed {
                break;
            }
        }
        for name in seen {
            if !resolver.contains(&name) {
                resolver.mark_unresolved(name);
            }
        }
        tracing::debug!(variables = resolver.variables().len(), "resolver built");
        Ok(resolver)
    }

    fn collect_declarations(
        &self,
        step: &FreezableStep,
        resolver: &TypeResolver,
        at: &str,
        found: &mut Vec<Declaration>,
    ) {
        let FreezableStep::Compound(c) = step else { return };
        let (path, location) = locate(step, at);
        let Ok(factory) = self.lookup(c) else { return };
        let req = InferRequest {
            store: self,
            step: c,
            factory,
            expected: &TypeReference::Any,
            resolver,
            path: &path,
        };
        if let Some(declares) = factory.declares {
            for (name, ty) in declares(&req) {
                found.push(Declaration { name, ty, location: location.clone() });
            }
        }
        for (key, property) in &c.args {
            let child_at = format!("{path}.{key}");
            match property {
                FreezableProperty::Step(s) => self.collect_declarations(s, resolver, &child_at, found),
                FreezableProperty::List(items) => {
                    for (i, item) in items.iter().enumerate() {
                        self.collect_declarations(item, resolver, &format!("{child_at}[{i}]"), found);
                    }
                }
                FreezableProperty::Lambda(l) => {
                    let item = req.lambda_item_type(key).unwrap_or(TypeReference::Unknown);
                    let inner = resolver.for_lambda(l.lambda.as_ref(), item);
                    self.collect_declarations(&l.body, &inner, &child_at, found);
                }
                FreezableProperty::Variable(_) => {}
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freeze::FreezableProperty as P;

    fn get(name: &str) -> FreezableStep {
        FreezableStep::step("GetVariable", [("Variable", P::var(name))])
    }

    fn set(name: &str, value: impl Into<P>) -> FreezableStep {
        FreezableStep::step("SetVariable", [("Variable", P::var(name)), ("Value", value.into())])
    }

    fn seq(steps: Vec<FreezableStep>) -> FreezableStep {
        FreezableStep::step("Sequence", [("InitialSteps", P::list(steps))])
    }

    #[test]
    fn lookup_ignores_case() {
        let store = StepFactoryStore::core();
        assert_eq!(store.get("arraymap").map(|f| f.kind), Some("ArrayMap"));
        assert!(store.get("NoSuchStep").is_none());
    }

    #[test]
    fn unknown_step_is_located() {
        let store = StepFactoryStore::core();
        let tree = FreezableStep::step("Frobnicate", Vec::<(&str, P)>::new());
        let e = store.freeze(&tree, &TypeReference::Any, &TypeResolver::new()).unwrap_err();
        assert_eq!(e.code(), Some(ErrorCode::UnknownStep));
        assert_eq!(
            e.errors()[0].location.as_ref().map(|l| l.path.as_str()),
            Some("Frobnicate")
        );
    }

    #[test]
    fn parameter_problems_are_all_reported() {
        let store = StepFactoryStore::core();
        let tree = FreezableStep::step("SetVariable", [("Bogus", P::from(1i64))]);
        let e = store.freeze(&tree, &TypeReference::UNIT, &TypeResolver::new()).unwrap_err();
        assert!(e.has_code(ErrorCode::UnexpectedParameter));
        assert!(e.has_code(ErrorCode::MissingParameter));
        assert_eq!(e.errors().len(), 3);
    }

    #[test]
    fn constants_check_expected_type() {
        let store = StepFactoryStore::core();
        let ok = store.freeze(&FreezableStep::from(2i64), &TypeReference::INT, &TypeResolver::new());
        assert_eq!(ok.unwrap().output_type(), &TypeReference::INT);
        let e = store
            .freeze(&FreezableStep::from("x"), &TypeReference::INT, &TypeResolver::new())
            .unwrap_err();
        assert_eq!(e.code(), Some(ErrorCode::WrongType));
    }

    #[test]
    fn resolver_types_assignments_in_rounds() {
        let store = StepFactoryStore::core();
        // y depends on x, declared later in the tree
        let tree = seq(vec![set("y", get("x")), set("x", 3i64)]);
        let resolver = store.create_resolver(&tree, TypeResolver::new()).unwrap();
        assert_eq!(resolver.variable_type(&VariableName::new("y")).unwrap(), &TypeReference::INT);
    }

    #[test]
    fn conflicting_assignments_name_both_types() {
        let store = StepFactoryStore::core();
        let tree = seq(vec![set("x", 1i64), set("x", "one")]);
        let e = store.create_resolver(&tree, TypeResolver::new()).unwrap_err();
        assert_eq!(e.code(), Some(ErrorCode::ConflictingTypes));
        let msg = &e.errors()[0].message;
        assert!(msg.contains("int") && msg.contains("string"), "{msg}");
        assert_eq!(
            e.errors()[0].location.as_ref().map(|l| l.step.as_str()),
            Some("SetVariable")
        );
    }

    #[test]
    fn self_referential_variable_is_unresolvable() {
        let store = StepFactoryStore::core();
        let tree = seq(vec![set("x", get("x"))]);
        let resolver = store.create_resolver(&tree, TypeResolver::new()).unwrap();
        let e = store.freeze(&tree, &TypeReference::UNIT, &resolver).unwrap_err();
        assert!(e.has_code(ErrorCode::UnresolvableVariable));
    }

    #[test]
    fn freezing_is_deterministic() {
        let store = StepFactoryStore::core();
        let tree = seq(vec![set("x", 1i64), FreezableStep::step("Print", [("Value", get("x").into())])]);
        let resolver = store.create_resolver(&tree, TypeResolver::new()).unwrap();
        let a = store.freeze(&tree, &TypeReference::UNIT, &resolver).unwrap();
        let b = store.freeze(&tree, &TypeReference::UNIT, &resolver).unwrap();
        assert_eq!(format!("{a:?}"), format!("{b:?}"));
    }
}
