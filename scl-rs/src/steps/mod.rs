//! Built-in step kinds.
//!
//! Each submodule contributes a list of [`StepFactory`] values; the bodies
//! they build are small structs holding already-frozen children.

/// Implement [`StepBody`](crate::step::StepBody) for `$ty` with an async block.
macro_rules! step_body {
    ($ty:ty, |$this:ident, $scope:ident, $ctx:ident| $body:block) => {
        impl $crate::step::StepBody for $ty {
            fn run<'a>(
                &'a self,
                $scope: &'a $crate::scope::Scope,
                $ctx: &'a $crate::context::RunContext,
            ) -> $crate::step::BoxFuture<'a, $crate::error::Result<$crate::value::Value>> {
                let $this = self;
                Box::pin(async move $body)
            }
        }
    };
}

pub(crate) mod array;
pub(crate) mod entity;
pub(crate) mod flow;
pub(crate) mod io;
pub(crate) mod operator;
pub(crate) mod validate;

use crate::error::{Result, StructuredError};
use crate::freeze::StepFactory;
use crate::types::TypeReference;

/// Every built-in factory.
pub fn core_factories() -> Vec<StepFactory> {
    let mut all = flow::factories();
    all.extend(operator::factories());
    all.extend(array::factories());
    all.extend(entity::factories());
    all.extend(validate::factories());
    all.extend(io::factories());
    all
}

/// Both results, or every error among them.
pub(crate) fn both<A, B>(a: Result<A>, b: Result<B>) -> Result<(A, B)> {
    match (a, b) {
        (Ok(a), Ok(b)) => Ok((a, b)),
        (Err(e), Ok(_)) | (Ok(_), Err(e)) => Err(e),
        (Err(x), Err(y)) => Err(StructuredError::Aggregate(
            x.into_errors().into_iter().chain(y.into_errors()).collect(),
        )),
    }
}

/// The expected element type an array-consuming step passes down: the
/// element of `expected` when that is an array, otherwise `any`.
pub(crate) fn element_hint(expected: &TypeReference) -> TypeReference {
    expected.element_type().cloned().unwrap_or(TypeReference::Any)
}

// ── Test support ──────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use crate::context::{MemoryConsole, RunContext};
    use crate::error::Result;
    use crate::freeze::{FreezableStep, StepFactoryStore};
    use crate::scope::Scope;
    use crate::step::ExecutableStep;
    use crate::types::{TypeReference, TypeResolver};
    use crate::value::Value;

    pub(crate) fn tree(json: serde_json::Value) -> FreezableStep {
        serde_json::from_value(json).expect("valid step tree")
    }

    pub(crate) fn freeze(json: serde_json::Value) -> Result<ExecutableStep> {
        let store = StepFactoryStore::core();
        let step = tree(json);
        let resolver = store.create_resolver(&step, TypeResolver::new())?;
        store.freeze(&step, &TypeReference::Any, &resolver)
    }

    /// Freeze and run `json` in a fresh root scope, returning the
    /// materialized result with the context and console used.
    pub(crate) async fn run_with(json: serde_json::Value) -> (Result<Value>, RunContext, Arc<MemoryConsole>) {
        let (ctx, console) = RunContext::with_memory_console();
        let result = async {
            let step = freeze(json)?;
            let scope = Scope::root();
            let value = step.run(&scope, &ctx).await?.materialize(&ctx).await;
            scope.dispose();
            value
        }
        .await;
        (result, ctx, console)
    }

    pub(crate) async fn run(json: serde_json::Value) -> Result<Value> {
        run_with(json).await.0
    }

    pub(crate) fn ints(values: &[i64]) -> Value {
        Value::from(values.to_vec())
    }
}
