//! Schema enforcement over entity streams.
//!
//! A schema is itself an entity mapping property names to type names, e.g.
//! `('Name': 'string', 'Age': 'int')`.  Properties not named by the schema are
//! allowed.

use std::sync::Arc;

use crate::error::{ErrorCode, Result, StructuredError};
use crate::freeze::{BuildRequest, ConstantValue, PropertyInfo, StepFactory};
use crate::step::{ExecutableStep, StepBody};
use crate::types::TypeReference;
use crate::value::{ElementValidator, Entity, ErrorBehavior, Value};

pub(crate) fn factories() -> Vec<StepFactory> {
    let entities = TypeReference::array(TypeReference::ENTITY);
    vec![StepFactory::simple("EnforceSchema", entities.clone(), build_enforce_schema)
        .prop(PropertyInfo::step("EntityStream", entities))
        .prop(PropertyInfo::step("Schema", TypeReference::ENTITY))
        .prop(
            PropertyInfo::step("ErrorBehavior", TypeReference::enumeration(ErrorBehavior::TYPE_NAME))
                .default_to(ConstantValue::enumeration(&ErrorBehavior::Fail.to_enum())),
        )]
}

// ── Field types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldType {
    Int,
    Double,
    String,
    Bool,
    Entity,
    Array,
    Any,
}

impl FieldType {
    fn parse(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "int" | "integer" => FieldType::Int,
            "double" | "number" => FieldType::Double,
            "string" => FieldType::String,
            "bool" | "boolean" => FieldType::Bool,
            "entity" => FieldType::Entity,
            "array" => FieldType::Array,
            "any" => FieldType::Any,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            FieldType::Int => "int",
            FieldType::Double => "double",
            FieldType::String => "string",
            FieldType::Bool => "bool",
            FieldType::Entity => "entity",
            FieldType::Array => "array",
            FieldType::Any => "any",
        }
    }

    /// Ints are accepted where a double is asked for.
    fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (FieldType::Any, _)
                | (FieldType::Int, Value::Int(_))
                | (FieldType::Double, Value::Double(_) | Value::Int(_))
                | (FieldType::String, Value::Str(_))
                | (FieldType::Bool, Value::Bool(_))
                | (FieldType::Entity, Value::Entity(_))
                | (FieldType::Array, Value::Array(_))
        )
    }
}

// ── SchemaValidator ───────────────────────────────────────────────────────────

#[derive(Debug)]
struct SchemaValidator {
    fields: Vec<(String, FieldType)>,
}

impl SchemaValidator {
    fn from_entity(schema: &Entity) -> Result<Self> {
        let mut fields = Vec::with_capacity(schema.len());
        let mut errors = Vec::new();
        for (name, ty) in schema.iter() {
            match ty.as_str().ok().and_then(FieldType::parse) {
                Some(field) => fields.push((name.to_owned(), field)),
                None => errors.push(StructuredError::new(
                    ErrorCode::SchemaViolation,
                    format!("schema property '{name}' has unknown type {ty}"),
                )),
            }
        }
        match StructuredError::combine(errors) {
            Some(e) => Err(e),
            None => Ok(SchemaValidator { fields }),
        }
    }
}

impl ElementValidator for SchemaValidator {
    fn violations(&self, element: &Value) -> Vec<String> {
        let Value::Entity(entity) = element else {
            return vec![format!("{} is a {}, not an entity", element, element.type_name())];
        };
        self.fields
            .iter()
            .filter_map(|(name, field)| match entity.get(name) {
                None => Some(format!("missing property '{name}' in {entity}")),
                Some(value) if !field.accepts(value) => Some(format!(
                    "property '{name}' should be {} but is {}",
                    field.name(),
                    value.type_name()
                )),
                Some(_) => None,
            })
            .collect()
    }
}

// ── EnforceSchema ─────────────────────────────────────────────────────────────

fn build_enforce_schema(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    Ok(Box::new(EnforceSchema {
        stream: req.step("EntityStream")?,
        schema: req.step("Schema")?,
        behavior: req.step("ErrorBehavior")?,
    }))
}

#[derive(Debug)]
struct EnforceSchema {
    stream: ExecutableStep,
    schema: ExecutableStep,
    behavior: ExecutableStep,
}

step_body!(EnforceSchema, |this, scope, ctx| {
    let stream = this.stream.run_array(scope, ctx).await?;
    let schema = this.schema.run_entity(scope, ctx).await?;
    let behavior = ErrorBehavior::from_enum(this.behavior.run(scope, ctx).await?.as_enum()?)?;
    let validator = SchemaValidator::from_entity(&schema)?;
    tracing::debug!(fields = validator.fields.len(), behavior = behavior.as_str(), "enforcing schema");
    Ok(Value::Array(stream.validate(Arc::new(validator), behavior)))
});

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::testing::{run, run_with};
    use serde_json::json;

    fn people() -> serde_json::Value {
        json!({"step": "Array", "args": {"Elements": [
            {"step": "CreateEntity", "args": {"Name": "Ada", "Age": 36}},
            {"step": "CreateEntity", "args": {"Name": "Bob", "Age": "old"}},
            {"step": "CreateEntity", "args": {"Name": "Cy", "Age": 7}},
            {"step": "CreateEntity", "args": {"Age": 50}}
        ]}})
    }

    fn schema() -> serde_json::Value {
        json!({"step": "CreateEntity", "args": {"Name": "string", "Age": "int"}})
    }

    fn enforce(behavior: Option<&str>) -> serde_json::Value {
        let mut args = json!({"EntityStream": people(), "Schema": schema()});
        if let Some(b) = behavior {
            args["ErrorBehavior"] = json!({"enum": format!("ErrorBehavior.{b}")});
        }
        json!({"step": "EnforceSchema", "args": args})
    }

    fn names(value: Value) -> Vec<String> {
        let Value::Array(a) = value else { panic!("expected an array") };
        a.evaluated_items()
            .expect("materialized")
            .iter()
            .map(|e| e.as_entity().unwrap().get("Name").map(|n| n.to_string()).unwrap_or_default())
            .collect()
    }

    #[tokio::test]
    async fn skip_drops_invalid_silently() {
        let (result, ctx, _) = run_with(enforce(Some("Skip"))).await;
        assert_eq!(names(result.unwrap()), vec!["Ada", "Cy"]);
        assert!(ctx.diagnostics().is_empty());
    }

    #[tokio::test]
    async fn fail_is_the_default_and_reports_everything() {
        let e = run(enforce(None)).await.unwrap_err();
        assert_eq!(e.errors().len(), 2);
        assert!(e.errors().iter().all(|s| s.code == ErrorCode::SchemaViolation));
        assert!(e.errors().iter().any(|s| s.message.contains("should be int but is string")));
        assert!(e.errors().iter().any(|s| s.message.contains("missing property 'Name'")));
    }

    #[tokio::test]
    async fn warning_keeps_and_logs() {
        let (result, ctx, _) = run_with(enforce(Some("Warning"))).await;
        assert_eq!(names(result.unwrap()).len(), 4);
        assert_eq!(ctx.diagnostics().entries().len(), 2);
    }

    #[tokio::test]
    async fn unknown_field_type() {
        let tree = json!({"step": "EnforceSchema", "args": {
            "EntityStream": people(),
            "Schema": {"step": "CreateEntity", "args": {"Name": "text"}}}});
        assert_eq!(run(tree).await.unwrap_err().code(), Some(ErrorCode::SchemaViolation));
    }

    #[test]
    fn double_accepts_int() {
        assert!(FieldType::Double.accepts(&Value::Int(1)));
        assert!(!FieldType::Int.accepts(&Value::Double(1.0)));
    }
}
