//! Entity literals and property access.

use crate::error::{collect_all, ErrorCode, Result, StructuredError};
use crate::freeze::{BuildRequest, InferRequest, PropertyInfo, StepFactory};
use crate::serialize::Serializer;
use crate::step::{ExecutableStep, StepBody};
use crate::types::TypeReference;
use crate::value::{CaseSensitivity, Entity, Value};

pub(crate) fn factories() -> Vec<StepFactory> {
    vec![
        StepFactory::simple("CreateEntity", TypeReference::ENTITY, build_create_entity)
            .open()
            .serialized_as(Serializer::EntityLiteral),
        StepFactory::generic("EntityGetValue", infer_get_value, build_get_value)
            .prop(PropertyInfo::step("Entity", TypeReference::ENTITY))
            .prop(PropertyInfo::step("Property", TypeReference::STRING)),
        StepFactory::simple("EntitySetValue", TypeReference::ENTITY, build_set_value)
            .prop(PropertyInfo::step("Entity", TypeReference::ENTITY))
            .prop(PropertyInfo::step("Property", TypeReference::STRING))
            .prop(PropertyInfo::step("Value", TypeReference::Any)),
        StepFactory::simple("EntityHasProperty", TypeReference::BOOL, build_has_property)
            .prop(PropertyInfo::step("Entity", TypeReference::ENTITY))
            .prop(PropertyInfo::step("Property", TypeReference::STRING))
            .prop(PropertyInfo::step("IgnoreCase", TypeReference::BOOL).default_to(false)),
    ]
}

// ── CreateEntity ──────────────────────────────────────────────────────────────

fn build_create_entity(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    let properties = collect_all(req.given().map(|(name, _)| {
        req.step_with(name, &TypeReference::Any).map(|step| (name.to_owned(), step))
    }))?;
    Ok(Box::new(CreateEntity(properties)))
}

/// Every property is evaluated; all failures are reported together.
#[derive(Debug)]
struct CreateEntity(Vec<(String, ExecutableStep)>);

step_body!(CreateEntity, |this, scope, ctx| {
    let mut results = Vec::with_capacity(this.0.len());
    for (name, step) in &this.0 {
        results.push(step.run(scope, ctx).await.map(|v| (name.clone(), v)));
    }
    Ok(Value::Entity(Entity::new(collect_all(results)?)))
});

// ── Property access ───────────────────────────────────────────────────────────

/// Entities are untyped bags, so the parent decides: a concrete expected
/// type (or the first concrete candidate) is trusted and checked at run
/// time, anything else reads as a string.
fn infer_get_value(req: &InferRequest<'_>) -> Result<TypeReference> {
    let expected = req.expected();
    if expected.is_concrete() {
        return Ok(expected.clone());
    }
    if let TypeReference::MultipleCandidates(candidates) = expected {
        if let Some(first) = candidates.iter().find(|t| t.is_concrete()) {
            return Ok(first.clone());
        }
    }
    Ok(TypeReference::STRING)
}

fn build_get_value(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    Ok(Box::new(GetValue {
        entity: req.step("Entity")?,
        property: req.step("Property")?,
        output: req.output().clone(),
    }))
}

#[derive(Debug)]
struct GetValue {
    entity: ExecutableStep,
    property: ExecutableStep,
    output: TypeReference,
}

step_body!(GetValue, |this, scope, ctx| {
    let entity = this.entity.run_entity(scope, ctx).await?;
    let property = this.property.run_string(scope, ctx).await?;
    let value = entity.get(&property).cloned().ok_or_else(|| {
        StructuredError::new(
            ErrorCode::MissingProperty,
            format!("entity has no property '{property}'"),
        )
    })?;
    if this.output == TypeReference::STRING {
        return Ok(Value::Str(value.materialize(ctx).await?.to_string()));
    }
    if this.output.allows(&value.type_reference()) {
        Ok(value)
    } else {
        Err(StructuredError::invalid_cast(value.type_name(), &this.output))
    }
});

fn build_set_value(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    Ok(Box::new(SetValue {
        entity: req.step("Entity")?,
        property: req.step("Property")?,
        value: req.step("Value")?,
    }))
}

#[derive(Debug)]
struct SetValue {
    entity: ExecutableStep,
    property: ExecutableStep,
    value: ExecutableStep,
}

step_body!(SetValue, |this, scope, ctx| {
    let entity = this.entity.run_entity(scope, ctx).await?;
    let property = this.property.run_string(scope, ctx).await?;
    let value = this.value.run(scope, ctx).await?;
    Ok(Value::Entity(entity.with_value(&property, value)))
});

fn build_has_property(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    Ok(Box::new(HasProperty {
        entity: req.step("Entity")?,
        property: req.step("Property")?,
        ignore_case: req.step("IgnoreCase")?,
    }))
}

#[derive(Debug)]
struct HasProperty {
    entity: ExecutableStep,
    property: ExecutableStep,
    ignore_case: ExecutableStep,
}

step_body!(HasProperty, |this, scope, ctx| {
    let entity = this.entity.run_entity(scope, ctx).await?;
    let property = this.property.run_string(scope, ctx).await?;
    let case = if this.ignore_case.run_bool(scope, ctx).await? {
        CaseSensitivity::Insensitive
    } else {
        CaseSensitivity::Sensitive
    };
    Ok(Value::Bool(entity.contains(&property, case)))
});

// ── Tests ─────────────────────────────────────────────────────────────────────
