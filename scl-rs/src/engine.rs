//! The host-facing entry point: freeze a tree, run it, collect the outcome.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cancel::CancellationToken;
use crate::config::EngineConfig;
use crate::context::{Console, Diagnostic, ExternalContext, RunContext, StdoutConsole};
use crate::error::{Result, StructuredError};
use crate::freeze::{FreezableStep, StepFactoryStore};
use crate::scope::Scope;
use crate::step::ExecutableStep;
use crate::types::{TypeReference, TypeResolver, VariableName};
use crate::value::Value;

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// The root step's result, fully evaluated.
    pub value: Value,
    /// Every binding visible in the root scope when the run ended.
    pub variables: BTreeMap<VariableName, Value>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone)]
pub struct Engine {
    store: Arc<StepFactoryStore>,
    config: EngineConfig,
    console: Arc<dyn Console>,
}

impl Engine {
    /// An engine over the core step kinds, printing to stdout.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_store(config, StepFactoryStore::core())
    }

    pub fn with_store(config: EngineConfig, store: StepFactoryStore) -> Self {
        Engine { store: Arc::new(store), config, console: Arc::new(StdoutConsole) }
    }

    pub fn with_console(mut self, console: Arc<dyn Console>) -> Self {
        self.console = console;
        self
    }

    pub fn store(&self) -> &StepFactoryStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Type-check `step` and build its executable form.
    ///
    /// Configured globals are known to the resolver with the type of their
    /// value, so trees may read them without setting them first.
    pub fn freeze(&self, step: &FreezableStep, expected: &TypeReference) -> Result<ExecutableStep> {
        tracing::debug!(kind = step.kind(), %expected, "freezing");
        let mut seed = TypeResolver::new();
        let conflicts = self
            .config
            .variables
            .iter()
            .filter_map(|(name, value)| seed.declare(name.clone(), value.type_reference()).err());
        if let Some(e) = StructuredError::combine(conflicts.collect::<Vec<_>>()) {
            return Err(e);
        }
        let resolver = self.store.create_resolver(step, seed)?;
        let frozen = self.store.freeze(step, expected, &resolver)?;
        tracing::debug!(kind = frozen.kind(), output = %frozen.output_type(), "frozen");
        Ok(frozen)
    }

    /// Run `step` in a fresh root scope.
    ///
    /// A lazy result is evaluated before the root scope is disposed, so
    /// streams it reads from are still open.
    pub async fn run(&self, step: &ExecutableStep, cancel: CancellationToken) -> Result<RunOutcome> {
        let timer = self.config.timeout().map(|timeout| cancel.cancel_after(timeout));
        let external = Arc::new(ExternalContext::new(self.console.clone(), self.store.clone()));
        let ctx = RunContext::new(external, cancel);
        let scope = Scope::with_variables(self.config.variables.clone());

        let result = match step.run(&scope, &ctx).await {
            Ok(value) => value.materialize(&ctx).await,
            Err(e) => Err(e),
        };
        let variables = scope.variables();
        scope.dispose();
        if let Some(timer) = timer {
            timer.abort();
        }

        match result {
            Ok(value) => {
                tracing::info!(kind = step.kind(), "run finished");
                Ok(RunOutcome { value, variables, diagnostics: ctx.diagnostics().entries() })
            }
            Err(e) => {
                tracing::info!(kind = step.kind(), errors = e.errors().len(), "run failed");
                Err(e)
            }
        }
    }

    /// Freeze `tree` against `any` and run it.
    pub async fn run_tree(&self, tree: &FreezableStep, cancel: CancellationToken) -> Result<RunOutcome> {
        let step = self.freeze(tree, &TypeReference::Any)?;
        self.run(&step, cancel).await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
