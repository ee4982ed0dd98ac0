//! The executable step tree.
//!
//! Freezing turns every node into an [`ExecutableStep`]: its kind, where it
//! sits in the tree, its resolved output type and a [`StepBody`] holding the
//! frozen children.  [`ExecutableStep::run`] is the single entry point; it
//! checks for cancellation, runs the body and stamps the step's location on
//! any error that does not carry one yet.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::RunContext;
use crate::error::{ErrorLocation, Result};
use crate::scope::Scope;
use crate::types::{TypeReference, VariableName};
use crate::value::{Entity, LazyArray, Value};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a frozen step does when it runs.
pub trait StepBody: fmt::Debug + Send + Sync {
    fn run<'a>(&'a self, scope: &'a Scope, ctx: &'a RunContext) -> BoxFuture<'a, Result<Value>>;
}

// ── ExecutableStep ────────────────────────────────────────────────────────────

/// A frozen, concretely typed node.  Owns its children.
#[derive(Debug)]
pub struct ExecutableStep {
    kind: &'static str,
    location: ErrorLocation,
    output: TypeReference,
    body: Box<dyn StepBody>,
}

impl ExecutableStep {
    pub fn new(
        kind: &'static str,
        location: ErrorLocation,
        output: TypeReference,
        body: Box<dyn StepBody>,
    ) -> Self {
        ExecutableStep { kind, location, output, body }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn location(&self) -> &ErrorLocation {
        &self.location
    }

    pub fn output_type(&self) -> &TypeReference {
        &self.output
    }

    pub async fn run(&self, scope: &Scope, ctx: &RunContext) -> Result<Value> {
        ctx.check_cancelled().map_err(|e| e.with_location(&self.location))?;
        tracing::trace!(step = self.kind, path = %self.location.path, "run");
        self.body
            .run(scope, ctx)
            .await
            .map_err(|e| e.with_location(&self.location))
    }

    pub async fn run_bool(&self, scope: &Scope, ctx: &RunContext) -> Result<bool> {
        self.located(self.run(scope, ctx).await?.as_bool())
    }

    pub async fn run_int(&self, scope: &Scope, ctx: &RunContext) -> Result<i64> {
        self.located(self.run(scope, ctx).await?.as_int())
    }

    pub async fn run_string(&self, scope: &Scope, ctx: &RunContext) -> Result<String> {
        match self.run(scope, ctx).await? {
            Value::Str(s) => Ok(s),
            other => self.located(other.as_str().map(str::to_owned)),
        }
    }

    pub async fn run_entity(&self, scope: &Scope, ctx: &RunContext) -> Result<Entity> {
        match self.run(scope, ctx).await? {
            Value::Entity(e) => Ok(e),
            other => self.located(other.as_entity().cloned()),
        }
    }

    pub async fn run_array(&self, scope: &Scope, ctx: &RunContext) -> Result<LazyArray> {
        match self.run(scope, ctx).await? {
            Value::Array(a) => Ok(a),
            other => self.located(other.as_array().cloned()),
        }
    }

    fn located<T>(&self, r: Result<T>) -> Result<T> {
        r.map_err(|e| e.with_location(&self.location))
    }
}

// ── Lambdas ───────────────────────────────────────────────────────────────────

/// How a lambda binds its item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LambdaVariable {
    Named(VariableName),
    /// The implicit item `<>`.
    Automatic,
}

impl LambdaVariable {
    pub fn from_name(name: Option<VariableName>) -> Self {
        name.map_or(LambdaVariable::Automatic, LambdaVariable::Named)
    }
}

impl fmt::Display for LambdaVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LambdaVariable::Named(name) => write!(f, "{name}"),
            LambdaVariable::Automatic => f.write_str("<>"),
        }
    }
}

/// A frozen lambda property: a body run once per item in a fresh child
/// scope.  The body is shared so lazy arrays can keep it past the run of
/// the step that built them.  When the body returns a lazy value, the
/// resources its child scope opened move to the calling scope.
#[derive(Debug, Clone)]
pub struct FrozenLambda {
    variable: LambdaVariable,
    body: Arc<ExecutableStep>,
}

impl FrozenLambda {
    pub fn new(variable: LambdaVariable, body: ExecutableStep) -> Self {
        FrozenLambda { variable, body: Arc::new(body) }
    }

    pub fn variable(&self) -> &LambdaVariable {
        &self.variable
    }

    pub fn body(&self) -> &ExecutableStep {
        &self.body
    }

    /// Bind to `scope` for deferred use.
    pub fn capture(&self, scope: &Scope) -> Lambda {
        Lambda { frozen: self.clone(), scope: scope.clone() }
    }

    /// Run the body for `item` in a child of `scope`.
    pub async fn invoke(&self, scope: &Scope, item: Value, ctx: &RunContext) -> Result<Value> {
        self.invoke_with(scope, item, &[], ctx).await
    }

    /// As [`FrozenLambda::invoke`], with extra bindings declared next to the
    /// item (a fold's accumulator).
    pub async fn invoke_with(
        &self,
        scope: &Scope,
        item: Value,
        extra: &[(VariableName, Value)],
        ctx: &RunContext,
    ) -> Result<Value> {
        let child = scope.child();
        for (name, value) in extra {
            child.declare(name, value.clone())?;
        }
        match &self.variable {
            LambdaVariable::Named(name) => child.declare(name, item)?,
            LambdaVariable::Automatic => child.set_automatic(item),
        }
        let result = self.body.run(&child, ctx).await;
        // A returned lazy value may still read streams the body opened.
        if result.as_ref().is_ok_and(Value::holds_lazy) {
            scope.adopt(&child);
        }
        result
    }
}

/// A frozen lambda together with the scope it was created in.
#[derive(Debug, Clone)]
pub struct Lambda {
    frozen: FrozenLambda,
    scope: Scope,
}

impl Lambda {
    pub async fn invoke(&self, item: Value, ctx: &RunContext) -> Result<Value> {
        self.frozen.invoke(&self.scope, item, ctx).await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
