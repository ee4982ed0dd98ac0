//! Variables, control flow, assertions and nested execution.

use std::time::Duration;

use crate::error::{ErrorCode, Result, StructuredError};
use crate::freeze::{
    BuildRequest, ConstantValue, FreezableProperty, FreezableStep, InferRequest, LambdaBinding,
    PropertyInfo, StepFactory,
};
use crate::scope::Scope;
use crate::serialize::Serializer;
use crate::step::{ExecutableStep, FrozenLambda, StepBody};
use crate::types::{TypeReference, TypeResolver, VariableName};
use crate::value::Value;

use super::both;

pub(crate) fn factories() -> Vec<StepFactory> {
    vec![
        StepFactory::generic("GetVariable", infer_get_variable, build_get_variable)
            .prop(PropertyInfo::variable("Variable"))
            .serialized_as(Serializer::Variable),
        StepFactory::simple("SetVariable", TypeReference::UNIT, build_set_variable)
            .prop(PropertyInfo::variable("Variable"))
            .prop(PropertyInfo::step("Value", TypeReference::Any))
            .declaring(declare_set_variable)
            .serialized_as(Serializer::Assignment),
        StepFactory::simple("RemoveVariable", TypeReference::UNIT, build_remove_variable)
            .prop(PropertyInfo::variable("Variable"))
            .prop(PropertyInfo::step("Dispose", TypeReference::BOOL).default_to(false)),
        StepFactory::generic("GetAutomaticVariable", |_| Ok(TypeReference::AutomaticVariable), |_| {
            Ok(Box::new(GetAutomaticVariable))
        })
        .serialized_as(Serializer::AutomaticVariable),
        StepFactory::generic("Sequence", infer_sequence, build_sequence)
            .prop(
                PropertyInfo::list("InitialSteps", TypeReference::UNIT)
                    .default_to(FreezableProperty::List(Vec::new())),
            )
            .prop(PropertyInfo::step("FinalStep", TypeReference::Any).optional())
            .serialized_as(Serializer::Sequence),
        StepFactory::simple("If", TypeReference::UNIT, build_if)
            .prop(PropertyInfo::step("Condition", TypeReference::BOOL))
            .prop(PropertyInfo::step("Then", TypeReference::UNIT))
            .prop(PropertyInfo::step("Else", TypeReference::UNIT).optional()),
        StepFactory::generic("ValueIf", infer_value_if, build_value_if)
            .prop(PropertyInfo::step("Condition", TypeReference::BOOL))
            .prop(PropertyInfo::step("Then", TypeReference::Any))
            .prop(PropertyInfo::step("Else", TypeReference::Any)),
        StepFactory::simple("While", TypeReference::UNIT, build_while)
            .prop(PropertyInfo::step("Condition", TypeReference::BOOL))
            .prop(PropertyInfo::step("Action", TypeReference::UNIT)),
        StepFactory::simple("For", TypeReference::UNIT, build_for)
            .prop(PropertyInfo::variable("Variable"))
            .prop(PropertyInfo::step("From", TypeReference::INT))
            .prop(PropertyInfo::step("To", TypeReference::INT))
            .prop(PropertyInfo::step("Increment", TypeReference::INT).default_to(1i64))
            .prop(PropertyInfo::step("Action", TypeReference::UNIT))
            .declaring(|req| match req.variable_name("Variable") {
                Ok(name) => vec![(name, Ok(TypeReference::INT))],
                Err(_) => Vec::new(),
            }),
        StepFactory::simple("ForEach", TypeReference::UNIT, build_for_each)
            .prop(PropertyInfo::step("Array", TypeReference::array(TypeReference::Any)))
            .prop(PropertyInfo::lambda(
                "Action",
                LambdaBinding::ElementOf("Array"),
                TypeReference::UNIT,
            )),
        StepFactory::generic("Try", infer_try, build_try)
            .prop(PropertyInfo::step("Statement", TypeReference::Any))
            .prop(
                PropertyInfo::lambda(
                    "Recover",
                    LambdaBinding::Fixed(TypeReference::STRING),
                    TypeReference::Any,
                )
                .optional(),
            ),
        StepFactory::simple("AssertTrue", TypeReference::UNIT, build_assert_true)
            .prop(PropertyInfo::step("Boolean", TypeReference::BOOL)),
        StepFactory::simple("AssertEqual", TypeReference::UNIT, build_assert_equal)
            .prop(PropertyInfo::step("Left", TypeReference::Any))
            .prop(PropertyInfo::step("Right", TypeReference::Any)),
        StepFactory::simple("AssertError", TypeReference::UNIT, build_assert_error)
            .prop(PropertyInfo::step("Statement", TypeReference::Any)),
        StepFactory::simple("Print", TypeReference::UNIT, |req| {
            Ok(Box::new(Print(req.step("Value")?)))
        })
        .prop(PropertyInfo::step("Value", TypeReference::Any)),
        StepFactory::simple("Delay", TypeReference::UNIT, |req| {
            Ok(Box::new(Delay(req.step("Milliseconds")?)))
        })
        .prop(PropertyInfo::step("Milliseconds", TypeReference::INT)),
        StepFactory::simple("RunScl", TypeReference::UNIT, build_run_scl)
            .prop(PropertyInfo::step("Tree", TypeReference::STRING))
            .prop(
                PropertyInfo::list("Export", TypeReference::STRING)
                    .default_to(FreezableProperty::List(Vec::new())),
            )
            .declaring(declare_run_scl),
        StepFactory::simple("Not", TypeReference::BOOL, |req| {
            Ok(Box::new(Not(req.step("Boolean")?)))
        })
        .prop(PropertyInfo::step("Boolean", TypeReference::BOOL)),
    ]
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// A literal leaf.
#[derive(Debug)]
pub(crate) struct Constant(pub(crate) Value);

step_body!(Constant, |this, _scope, _ctx| { Ok(this.0.clone()) });

// ── Variables ─────────────────────────────────────────────────────────────────

fn infer_get_variable(req: &InferRequest<'_>) -> Result<TypeReference> {
    Ok(TypeReference::Variable(req.variable_name("Variable")?))
}

fn build_get_variable(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    Ok(Box::new(GetVariable(req.variable_name("Variable")?)))
}

#[derive(Debug)]
struct GetVariable(VariableName);

step_body!(GetVariable, |this, scope, _ctx| { scope.get(&this.0) });

fn declare_set_variable(req: &InferRequest<'_>) -> Vec<(VariableName, Result<TypeReference>)> {
    match req.variable_name("Variable") {
        Ok(name) => vec![(name, req.child_type_with("Value", &TypeReference::Any))],
        Err(_) => Vec::new(),
    }
}

fn build_set_variable(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    let name = req.variable_name("Variable")?;
    let expected = req
        .resolver()
        .variable_type(&name)
        .cloned()
        .unwrap_or(TypeReference::Any);
    let value = req.step_with("Value", &expected)?;
    Ok(Box::new(SetVariable { name, value }))
}

#[derive(Debug)]
struct SetVariable {
    name: VariableName,
    value: ExecutableStep,
}

step_body!(SetVariable, |this, scope, ctx| {
    let value = this.value.run(scope, ctx).await?;
    scope.set(&this.name, value)?;
    Ok(Value::Unit)
});

fn build_remove_variable(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    Ok(Box::new(RemoveVariable {
        name: req.variable_name("Variable")?,
        dispose: req.step("Dispose")?,
    }))
}

#[derive(Debug)]
struct RemoveVariable {
    name: VariableName,
    dispose: ExecutableStep,
}

step_body!(RemoveVariable, |this, scope, ctx| {
    let dispose = this.dispose.run_bool(scope, ctx).await?;
    if scope.remove(&this.name, dispose).is_none() {
        tracing::debug!(variable = %this.name, "remove of unset variable");
    }
    Ok(Value::Unit)
});

#[derive(Debug)]
struct GetAutomaticVariable;

step_body!(GetAutomaticVariable, |_this, scope, _ctx| { scope.automatic() });

// ── Control flow ──────────────────────────────────────────────────────────────

fn infer_sequence(req: &InferRequest<'_>) -> Result<TypeReference> {
    if req.has("FinalStep") {
        req.child_type_with("FinalStep", req.expected())
    } else {
        Ok(TypeReference::UNIT)
    }
}

fn build_sequence(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    let final_step = if req.has("FinalStep") {
        Some(req.step_with("FinalStep", req.output()))
    } else {
        None
    };
    let initial = req.list("InitialSteps");
    let (initial, final_step) = both(initial, final_step.transpose())?;
    Ok(Box::new(Sequence { initial, final_step }))
}

#[derive(Debug)]
struct Sequence {
    initial: Vec<ExecutableStep>,
    final_step: Option<ExecutableStep>,
}

step_body!(Sequence, |this, scope, ctx| {
    for step in &this.initial {
        step.run(scope, ctx).await?;
    }
    match &this.final_step {
        Some(step) => step.run(scope, ctx).await,
        None => Ok(Value::Unit),
    }
});

fn build_if(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    Ok(Box::new(If {
        condition: req.step("Condition")?,
        then: req.step("Then")?,
        otherwise: req.optional_step("Else")?,
    }))
}

#[derive(Debug)]
struct If {
    condition: ExecutableStep,
    then: ExecutableStep,
    otherwise: Option<ExecutableStep>,
}

step_body!(If, |this, scope, ctx| {
    if this.condition.run_bool(scope, ctx).await? {
        this.then.run(scope, ctx).await?;
    } else if let Some(otherwise) = &this.otherwise {
        otherwise.run(scope, ctx).await?;
    }
    Ok(Value::Unit)
});

fn infer_value_if(req: &InferRequest<'_>) -> Result<TypeReference> {
    let (then, otherwise) = both(
        req.child_type_with("Then", req.expected()),
        req.child_type_with("Else", req.expected()),
    )?;
    Ok(TypeReference::candidates([then, otherwise]))
}

fn build_value_if(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    let (then, otherwise) = both(
        req.step_with("Then", req.output()),
        req.step_with("Else", req.output()),
    )?;
    Ok(Box::new(ValueIf { condition: req.step("Condition")?, then, otherwise }))
}

#[derive(Debug)]
struct ValueIf {
    condition: ExecutableStep,
    then: ExecutableStep,
    otherwise: ExecutableStep,
}

step_body!(ValueIf, |this, scope, ctx| {
    if this.condition.run_bool(scope, ctx).await? {
        this.then.run(scope, ctx).await
    } else {
        this.otherwise.run(scope, ctx).await
    }
});

fn build_while(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    Ok(Box::new(While { condition: req.step("Condition")?, action: req.step("Action")? }))
}

#[derive(Debug)]
struct While {
    condition: ExecutableStep,
    action: ExecutableStep,
}

step_body!(While, |this, scope, ctx| {
    while this.condition.run_bool(scope, ctx).await? {
        this.action.run(scope, ctx).await?;
    }
    Ok(Value::Unit)
});

fn build_for(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    Ok(Box::new(For {
        variable: req.variable_name("Variable")?,
        from: req.step("From")?,
        to: req.step("To")?,
        increment: req.step("Increment")?,
        action: req.step("Action")?,
    }))
}

#[derive(Debug)]
struct For {
    variable: VariableName,
    from: ExecutableStep,
    to: ExecutableStep,
    increment: ExecutableStep,
    action: ExecutableStep,
}

step_body!(For, |this, scope, ctx| {
    let from = this.from.run_int(scope, ctx).await?;
    let to = this.to.run_int(scope, ctx).await?;
    let increment = this.increment.run_int(scope, ctx).await?;
    if increment == 0 {
        return Err(StructuredError::new(
            ErrorCode::DivideByZero,
            "For cannot step by an increment of zero",
        ));
    }
    let mut i = from;
    while (increment > 0 && i <= to) || (increment < 0 && i >= to) {
        let iteration = scope.child();
        iteration.declare(&this.variable, Value::Int(i))?;
        this.action.run(&iteration, ctx).await?;
        // the action may move the loop variable
        i = iteration.get(&this.variable)?.as_int()?;
        match i.checked_add(increment) {
            Some(next) => i = next,
            None => break,
        }
    }
    Ok(Value::Unit)
});

fn build_for_each(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    Ok(Box::new(ForEach { array: req.step("Array")?, action: req.lambda("Action")? }))
}

#[derive(Debug)]
struct ForEach {
    array: ExecutableStep,
    action: FrozenLambda,
}

step_body!(ForEach, |this, scope, ctx| {
    let mut cursor = this.array.run_array(scope, ctx).await?.cursor()?;
    while let Some(item) = cursor.next(ctx).await? {
        this.action.invoke(scope, item, ctx).await?;
    }
    Ok(Value::Unit)
});

fn infer_try(req: &InferRequest<'_>) -> Result<TypeReference> {
    let statement = req.child_type_with("Statement", req.expected())?;
    if req.has("Recover") {
        let recover = req.lambda_type_with("Recover", &statement)?;
        Ok(TypeReference::candidates([statement, recover]))
    } else if statement == TypeReference::UNIT {
        Ok(statement)
    } else {
        Err(StructuredError::new(
            ErrorCode::MissingParameter,
            format!("Try requires 'Recover' when its statement returns {statement}"),
        ))
    }
}

fn build_try(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    let statement = req.step_with("Statement", req.output())?;
    let recover = if req.has("Recover") {
        Some(req.lambda_with("Recover", req.output())?)
    } else {
        None
    };
    Ok(Box::new(Try { statement, recover }))
}

#[derive(Debug)]
struct Try {
    statement: ExecutableStep,
    recover: Option<FrozenLambda>,
}

step_body!(Try, |this, scope, ctx| {
    match this.statement.run(scope, ctx).await {
        Ok(value) => Ok(value),
        Err(e) if e.is_cancellation() => Err(e),
        Err(e) => {
            tracing::debug!(error = %e, "Try caught an error");
            match &this.recover {
                Some(recover) => recover.invoke(scope, Value::Str(e.as_user_message()), ctx).await,
                None => Ok(Value::Unit),
            }
        }
    }
});

// ── Assertions ────────────────────────────────────────────────────────────────

fn build_assert_true(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    Ok(Box::new(AssertTrue(req.step("Boolean")?)))
}

#[derive(Debug)]
struct AssertTrue(ExecutableStep);

step_body!(AssertTrue, |this, scope, ctx| {
    if this.0.run_bool(scope, ctx).await? {
        Ok(Value::Unit)
    } else {
        Err(StructuredError::new(ErrorCode::AssertionFailed, "assertion failed"))
    }
});

fn build_assert_equal(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    let left = req.child_type("Left")?;
    let (left, right) = both(req.step("Left"), req.step_with("Right", &left))?;
    Ok(Box::new(AssertEqual { left, right }))
}

#[derive(Debug)]
struct AssertEqual {
    left: ExecutableStep,
    right: ExecutableStep,
}

step_body!(AssertEqual, |this, scope, ctx| {
    let left = this.left.run(scope, ctx).await;
    let right = this.right.run(scope, ctx).await;
    let (left, right) = both(left, right)?;
    let left = left.materialize(ctx).await?;
    let right = right.materialize(ctx).await?;
    if left == right {
        Ok(Value::Unit)
    } else {
        Err(StructuredError::new(
            ErrorCode::AssertionFailed,
            format!("expected {left} to equal {right}"),
        ))
    }
});

fn build_assert_error(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    Ok(Box::new(AssertError(req.step("Statement")?)))
}

#[derive(Debug)]
struct AssertError(ExecutableStep);

step_body!(AssertError, |this, scope, ctx| {
    match this.0.run(scope, ctx).await {
        Err(e) if e.is_cancellation() => Err(e),
        Err(_) => Ok(Value::Unit),
        Ok(_) => Err(StructuredError::new(
            ErrorCode::AssertionFailed,
            "expected an error but the step succeeded",
        )),
    }
});

// ── Console and timing ────────────────────────────────────────────────────────

#[derive(Debug)]
struct Print(ExecutableStep);

step_body!(Print, |this, scope, ctx| {
    let value = this.0.run(scope, ctx).await?.materialize(ctx).await?;
    ctx.console().write_line(&value.to_string());
    Ok(Value::Unit)
});

#[derive(Debug)]
struct Delay(ExecutableStep);

step_body!(Delay, |this, scope, ctx| {
    let ms = this.0.run_int(scope, ctx).await?;
    let duration = Duration::from_millis(u64::try_from(ms).unwrap_or(0));
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(Value::Unit),
        _ = ctx.cancel.cancelled() => Err(StructuredError::cancelled()),
    }
});

#[derive(Debug)]
struct Not(ExecutableStep);

step_body!(Not, |this, scope, ctx| { Ok(Value::Bool(!this.0.run_bool(scope, ctx).await?)) });

// ── Nested execution ──────────────────────────────────────────────────────────

/// Export names given as string literals.
fn constant_exports(req: &InferRequest<'_>) -> Vec<VariableName> {
    req.children("Export")
        .unwrap_or_default()
        .iter()
        .filter_map(|step| match step.as_constant() {
            Some(ConstantValue::Str(name)) => Some(VariableName::new(name.as_str())),
            _ => None,
        })
        .collect()
}

/// Exported variables get their types from the nested tree, when it is a
/// literal that parses.
fn declare_run_scl(req: &InferRequest<'_>) -> Vec<(VariableName, Result<TypeReference>)> {
    let Some(ConstantValue::Str(text)) = req.constant("Tree") else {
        return Vec::new();
    };
    let nested = FreezableStep::from_json(text)
        .and_then(|tree| req.store().create_resolver(&tree, TypeResolver::new()));
    constant_exports(req)
        .into_iter()
        .map(|name| {
            let ty = match &nested {
                Ok(resolver) => resolver.variable_type(&name).cloned(),
                Err(e) => Err(e.clone()),
            };
            (name, ty)
        })
        .collect()
}

fn build_run_scl(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    let (tree, exports) = both(req.step("Tree"), req.list("Export"))?;
    Ok(Box::new(RunScl { tree, exports }))
}

#[derive(Debug)]
struct RunScl {
    tree: ExecutableStep,
    exports: Vec<ExecutableStep>,
}

step_body!(RunScl, |this, scope, ctx| {
    let text = this.tree.run_string(scope, ctx).await?;
    let mut exports = Vec::with_capacity(this.exports.len());
    for export in &this.exports {
        exports.push(VariableName::new(export.run_string(scope, ctx).await?));
    }
    let store = ctx.store();
    let nested = FreezableStep::from_json(&text)?;
    let resolver = store.create_resolver(&nested, TypeResolver::new())?;
    let frozen = store.freeze(&nested, &TypeReference::UNIT, &resolver)?;
    tracing::debug!(exports = exports.len(), "running nested tree");

    let inner = Scope::root();
    let result = run_nested(&frozen, &inner, &exports, scope, ctx).await;
    inner.dispose();
    result
});

async fn run_nested(
    frozen: &ExecutableStep,
    inner: &Scope,
    exports: &[VariableName],
    outer: &Scope,
    ctx: &crate::context::RunContext,
) -> Result<Value> {
    frozen.run(inner, ctx).await?;
    for name in exports {
        // materialize while the nested scope still holds its resources
        let value = inner.get(name)?.materialize(ctx).await?;
        outer.set(name, value)?;
    }
    Ok(Value::Unit)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
