//! Step factories: how one step kind is typed, built and printed.

use std::fmt;
use std::ops::Deref;

use crate::error::{collect_all, ErrorCode, Result, StructuredError};
use crate::serialize::Serializer;
use crate::step::{ExecutableStep, FrozenLambda, LambdaVariable, StepBody};
use crate::types::{TypeReference, TypeResolver, VariableName};

use super::{CompoundStep, ConstantValue, FreezableProperty, FreezableStep, LambdaProperty, StepFactoryStore};

pub type InferFn = fn(&InferRequest<'_>) -> Result<TypeReference>;
pub type BuildFn = fn(&BuildRequest<'_>) -> Result<Box<dyn StepBody>>;
/// Variables a step assigns, with their inferred types.  Used to build the
/// resolver before freezing; a type that cannot be inferred yet is an `Err`
/// and is retried on the next round.
pub type DeclareFn = fn(&InferRequest<'_>) -> Vec<(VariableName, Result<TypeReference>)>;

// ── Property metadata ─────────────────────────────────────────────────────────

/// What a lambda property binds its item to.
#[derive(Debug, Clone, PartialEq)]
pub enum LambdaBinding {
    /// The element type of the named array property.
    ElementOf(&'static str),
    Fixed(TypeReference),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyKind {
    Step,
    List,
    Variable,
    Lambda(LambdaBinding),
}

/// One declared property of a step kind.
#[derive(Debug, Clone)]
pub struct PropertyInfo {
    pub name: &'static str,
    pub kind: PropertyKind,
    /// Type of the step, of each list element, or of the lambda body.
    pub expected: TypeReference,
    pub required: bool,
    pub default: Option<FreezableProperty>,
    pub aliases: &'static [&'static str],
}

impl PropertyInfo {
    fn new(name: &'static str, kind: PropertyKind, expected: TypeReference) -> Self {
        PropertyInfo { name, kind, expected, required: true, default: None, aliases: &[] }
    }

    pub fn step(name: &'static str, expected: TypeReference) -> Self {
        Self::new(name, PropertyKind::Step, expected)
    }

    pub fn list(name: &'static str, element: TypeReference) -> Self {
        Self::new(name, PropertyKind::List, element)
    }

    pub fn variable(name: &'static str) -> Self {
        Self::new(name, PropertyKind::Variable, TypeReference::Any)
    }

    pub fn lambda(name: &'static str, binding: LambdaBinding, body: TypeReference) -> Self {
        Self::new(name, PropertyKind::Lambda(binding), body)
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn default_to(mut self, value: impl Into<FreezableProperty>) -> Self {
        self.required = false;
        self.default = Some(value.into());
        self
    }

    pub fn alias(mut self, aliases: &'static [&'static str]) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn answers_to(&self, name: &str) -> bool {
        self.name == name || self.aliases.contains(&name)
    }
}

// ── StepFactory ───────────────────────────────────────────────────────────────

/// How a factory computes its output type.
#[derive(Clone)]
pub enum OutputShape {
    /// Fixed, independent of the children.
    Simple(TypeReference),
    /// Derived from the children's types and the expected type.
    Generic(InferFn),
}

impl fmt::Debug for OutputShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputShape::Simple(t) => write!(f, "Simple({t})"),
            OutputShape::Generic(_) => f.write_str("Generic"),
        }
    }
}

/// Everything the engine knows about one step kind.
#[derive(Clone)]
pub struct StepFactory {
    pub kind: &'static str,
    pub aliases: &'static [&'static str],
    pub properties: Vec<PropertyInfo>,
    pub output: OutputShape,
    pub build: BuildFn,
    pub declares: Option<DeclareFn>,
    pub serializer: Serializer,
    /// Accept any property name (entity literals).
    pub open_properties: bool,
}

impl fmt::Debug for StepFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepFactory")
            .field("kind", &self.kind)
            .field("output", &self.output)
            .field("properties", &self.properties.iter().map(|p| p.name).collect::<Vec<_>>())
            .finish()
    }
}

impl StepFactory {
    fn new(kind: &'static str, output: OutputShape, build: BuildFn) -> Self {
        StepFactory {
            kind,
            aliases: &[],
            properties: Vec::new(),
            output,
            build,
            declares: None,
            serializer: Serializer::Function,
            open_properties: false,
        }
    }

    pub fn simple(kind: &'static str, output: TypeReference, build: BuildFn) -> Self {
        Self::new(kind, OutputShape::Simple(output), build)
    }

    pub fn generic(kind: &'static str, infer: InferFn, build: BuildFn) -> Self {
        Self::new(kind, OutputShape::Generic(infer), build)
    }

    pub fn prop(mut self, property: PropertyInfo) -> Self {
        self.properties.push(property);
        self
    }

    pub fn alias(mut self, aliases: &'static [&'static str]) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn declaring(mut self, declares: DeclareFn) -> Self {
        self.declares = Some(declares);
        self
    }

    pub fn serialized_as(mut self, serializer: Serializer) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn open(mut self) -> Self {
        self.open_properties = true;
        self
    }

    /// The declared property answering to `name` (or one of its aliases).
    pub fn property(&self, name: &str) -> Option<&PropertyInfo> {
        self.properties.iter().find(|p| p.answers_to(name))
    }
}

// ── InferRequest ──────────────────────────────────────────────────────────────

/// A compound step being typed: its factory, the type its parent expects and
/// the resolver in scope.
pub struct InferRequest<'a> {
    pub(crate) store: &'a StepFactoryStore,
    pub(crate) step: &'a CompoundStep,
    pub(crate) factory: &'a StepFactory,
    pub(crate) expected: &'a TypeReference,
    pub(crate) resolver: &'a TypeResolver,
    pub(crate) path: &'a str,
}

impl<'a> InferRequest<'a> {
    pub fn kind(&self) -> &'static str {
        self.factory.kind
    }

    pub fn expected(&self) -> &TypeReference {
        self.expected
    }

    pub fn resolver(&self) -> &TypeResolver {
        self.resolver
    }

    pub fn store(&self) -> &StepFactoryStore {
        self.store
    }

    pub fn path(&self) -> &str {
        self.path
    }

    /// The given properties, in name order.
    pub fn given(&self) -> impl Iterator<Item = (&'a str, &'a FreezableProperty)> {
        self.step.args.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The property `name`: given under its name or an alias, else its default.
    pub fn property(&self, name: &str) -> Option<&'a FreezableProperty> {
        if let Some(p) = self.step.args.get(name) {
            return Some(p);
        }
        let info = self.factory.property(name)?;
        info.aliases
            .iter()
            .find_map(|alias| self.step.args.get(*alias))
            .or(info.default.as_ref())
    }

    pub fn has(&self, name: &str) -> bool {
        self.property(name).is_some()
    }

    pub(crate) fn child_path(&self, name: &str) -> String {
        format!("{}.{}", self.path, name)
    }

    fn declared(&self, name: &str) -> TypeReference {
        self.factory
            .property(name)
            .map(|p| p.expected.clone())
            .unwrap_or(TypeReference::Any)
    }

    fn missing(&self, name: &str) -> StructuredError {
        StructuredError::new(
            ErrorCode::MissingParameter,
            format!("{} requires '{name}'", self.factory.kind),
        )
    }

    fn shape_error(&self, name: &str, wanted: &str, got: &FreezableProperty) -> StructuredError {
        StructuredError::new(
            ErrorCode::InvalidTree,
            format!(
                "{}.{name} must be {wanted}, not {}",
                self.factory.kind,
                got.shape()
            ),
        )
    }

    pub fn child(&self, name: &str) -> Result<&'a FreezableStep> {
        match self.property(name) {
            Some(FreezableProperty::Step(s)) => Ok(s),
            Some(other) => Err(self.shape_error(name, "a step", other)),
            None => Err(self.missing(name)),
        }
    }

    pub fn children(&self, name: &str) -> Result<&'a [FreezableStep]> {
        match self.property(name) {
            Some(FreezableProperty::List(items)) => Ok(items),
            Some(other) => Err(self.shape_error(name, "a list", other)),
            None => Err(self.missing(name)),
        }
    }

    fn lambda_property(&self, name: &str) -> Result<&'a LambdaProperty> {
        match self.property(name) {
            Some(FreezableProperty::Lambda(l)) => Ok(l),
            Some(other) => Err(self.shape_error(name, "a lambda", other)),
            None => Err(self.missing(name)),
        }
    }

    pub fn variable_name(&self, name: &str) -> Result<VariableName> {
        match self.property(name) {
            Some(FreezableProperty::Variable(v)) => Ok(v.var.clone()),
            Some(other) => Err(self.shape_error(name, "a variable name", other)),
            None => Err(self.missing(name)),
        }
    }

    /// The literal value of a constant step property, if it is one.
    pub fn constant(&self, name: &str) -> Option<&'a ConstantValue> {
        self.child(name).ok().and_then(FreezableStep::as_constant)
    }

    /// Type of child `name` against its declared expected type.
    pub fn child_type(&self, name: &str) -> Result<TypeReference> {
        self.child_type_with(name, &self.declared(name))
    }

    pub fn child_type_with(&self, name: &str, expected: &TypeReference) -> Result<TypeReference> {
        let child = self.child(name)?;
        self.store.infer_at(child, expected, self.resolver, &self.child_path(name))
    }

    /// Types of every element of list property `name`.  All elements are
    /// typed; their errors are combined.
    pub fn list_types_with(&self, name: &str, expected: &TypeReference) -> Result<Vec<TypeReference>> {
        let items = self.children(name)?;
        collect_all(items.iter().enumerate().map(|(i, item)| {
            let at = format!("{}[{i}]", self.child_path(name));
            self.store.infer_at(item, expected, self.resolver, &at)
        }))
    }

    /// Element type of array property `name`, which must be known: an
    /// `array<any>` child (an empty literal, say) is a `CannotInferType`.
    pub fn element_type(&self, name: &str) -> Result<TypeReference> {
        self.element_type_with(name, &TypeReference::Any)
    }

    /// As [`InferRequest::element_type`], passing `element` down as the
    /// expected element type.  Non-concrete hints are widened to `any`.
    pub fn element_type_with(&self, name: &str, element: &TypeReference) -> Result<TypeReference> {
        let hint = if element.is_concrete() { element.clone() } else { TypeReference::Any };
        let ty = self.child_type_with(name, &TypeReference::array(hint))?;
        match ty.element_type() {
            Some(inner) if inner.is_concrete() => Ok(inner.clone()),
            _ => Err(StructuredError::new(
                ErrorCode::CannotInferType,
                format!("cannot infer the element type of {}", self.child_path(name)),
            )),
        }
    }

    /// The type a lambda property binds its item to.
    pub fn lambda_item_type(&self, name: &str) -> Result<TypeReference> {
        let binding = match self.factory.property(name).map(|p| &p.kind) {
            Some(PropertyKind::Lambda(binding)) => binding,
            _ => {
                return Err(StructuredError::new(
                    ErrorCode::InvalidTree,
                    format!("{}.{name} is not a lambda parameter", self.factory.kind),
                ))
            }
        };
        match binding {
            LambdaBinding::ElementOf(array) => self.element_type(array),
            LambdaBinding::Fixed(ty) => Ok(ty.clone()),
        }
    }

    fn lambda_scope(&self, name: &str) -> Result<(&'a LambdaProperty, TypeResolver)> {
        let lambda = self.lambda_property(name)?;
        let item = self.lambda_item_type(name)?;
        Ok((lambda, self.resolver.for_lambda(lambda.lambda.as_ref(), item)))
    }

    /// Type of the body of lambda `name` against its declared type.
    pub fn lambda_type(&self, name: &str) -> Result<TypeReference> {
        self.lambda_type_with(name, &self.declared(name))
    }

    pub fn lambda_type_with(&self, name: &str, expected: &TypeReference) -> Result<TypeReference> {
        let (lambda, resolver) = self.lambda_scope(name)?;
        self.store.infer_at(&lambda.body, expected, &resolver, &self.child_path(name))
    }
}

// ── BuildRequest ──────────────────────────────────────────────────────────────

/// A typed compound step whose children are being frozen.
pub struct BuildRequest<'a> {
    pub(crate) infer: InferRequest<'a>,
    pub(crate) output: TypeReference,
}

impl<'a> Deref for BuildRequest<'a> {
    type Target = InferRequest<'a>;

    fn deref(&self) -> &InferRequest<'a> {
        &self.infer
    }
}

impl BuildRequest<'_> {
    /// This step's resolved output type.
    pub fn output(&self) -> &TypeReference {
        &self.output
    }

    /// Freeze child `name` against its declared expected type.
    pub fn step(&self, name: &str) -> Result<ExecutableStep> {
        self.step_with(name, &self.declared(name))
    }

    pub fn step_with(&self, name: &str, expected: &TypeReference) -> Result<ExecutableStep> {
        let child = self.child(name)?;
        self.store.freeze_at(child, expected, self.resolver, &self.child_path(name))
    }

    /// `Ok(None)` when the property is absent and has no default.
    pub fn optional_step(&self, name: &str) -> Result<Option<ExecutableStep>> {
        if self.has(name) {
            self.step(name).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Freeze every element of list `name`, combining all their errors.
    pub fn list(&self, name: &str) -> Result<Vec<ExecutableStep>> {
        self.list_with(name, &self.declared(name))
    }

    pub fn list_with(&self, name: &str, expected: &TypeReference) -> Result<Vec<ExecutableStep>> {
        let items = self.children(name)?;
        collect_all(items.iter().enumerate().map(|(i, item)| {
            let at = format!("{}[{i}]", self.child_path(name));
            self.store.freeze_at(item, expected, self.resolver, &at)
        }))
    }

    pub fn lambda(&self, name: &str) -> Result<FrozenLambda> {
        self.lambda_with(name, &self.declared(name))
    }

    pub fn lambda_with(&self, name: &str, expected: &TypeReference) -> Result<FrozenLambda> {
        let (lambda, resolver) = self.lambda_scope(name)?;
        let body = self
            .store
            .freeze_at(&lambda.body, expected, &resolver, &self.child_path(name))?;
        Ok(FrozenLambda::new(LambdaVariable::from_name(lambda.lambda.clone()), body))
    }

    pub fn optional_lambda(&self, name: &str) -> Result<Option<FrozenLambda>> {
        if self.has(name) {
            self.lambda(name).map(Some)
        } else {
            Ok(None)
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_defaults_and_aliases() {
        let p = PropertyInfo::step("Count", TypeReference::INT).alias(&["N"]);
        assert!(p.required);
        assert!(p.answers_to("N"));
        assert!(!p.answers_to("n"));
        let d = PropertyInfo::step("Increment", TypeReference::INT).default_to(1i64);
        assert!(!d.required);
        assert_eq!(d.default, Some(FreezableProperty::from(1i64)));
    }

    #[test]
    fn factory_property_lookup() {
        fn never(_: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
            Err(StructuredError::new(ErrorCode::InvalidTree, "unused"))
        }
        let f = StepFactory::simple("Thing", TypeReference::UNIT, never)
            .prop(PropertyInfo::step("Value", TypeReference::Any).alias(&["V"]));
        assert_eq!(f.property("V").map(|p| p.name), Some("Value"));
        assert!(f.property("Other").is_none());
        assert_eq!(f.serializer, Serializer::Function);
    }
}
