//! Rendering step trees back to SCL text.
//!
//! Each factory names a [`Serializer`]; steps whose kind is not registered,
//! or whose properties do not have the shape their serializer needs, fall back
//! to the function form `Kind Prop: value`.

use crate::freeze::{
    CompoundStep, ConstantValue, FreezableProperty, FreezableStep, StepFactoryStore,
};

/// How a step kind is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Serializer {
    /// `Kind Prop: value Prop: value`
    #[default]
    Function,
    /// `(a op b op c)` over the `Terms` list.
    Infix(&'static str),
    /// `[a, b]` over `Elements`.
    ArrayLiteral,
    /// `('name': value, ...)` over every property.
    EntityLiteral,
    /// `<name>` from `Variable`.
    Variable,
    /// `<>`
    AutomaticVariable,
    /// `<name> = value` from `Variable` and `Value`.
    Assignment,
    /// One `- step` line per `InitialSteps` item, then `FinalStep`.
    Sequence,
}

/// Render `step` as SCL text.
pub fn serialize(step: &FreezableStep, store: &StepFactoryStore) -> String {
    Writer { store }.top(step)
}

struct Writer<'a> {
    store: &'a StepFactoryStore,
}

impl Writer<'_> {
    fn top(&self, step: &FreezableStep) -> String {
        match step {
            FreezableStep::Compound(c) if self.serializer(c) == Serializer::Sequence => {
                match self.sequence(c) {
                    Some(lines) => lines,
                    None => self.function(c, false),
                }
            }
            _ => self.step(step, false),
        }
    }

    fn serializer(&self, step: &CompoundStep) -> Serializer {
        self.store.get(&step.kind).map(|f| f.serializer).unwrap_or_default()
    }

    fn step(&self, step: &FreezableStep, nested: bool) -> String {
        let c = match step {
            FreezableStep::Constant(value) => return constant(value),
            FreezableStep::Compound(c) => c,
        };
        let rendered = match self.serializer(c) {
            Serializer::Function | Serializer::Sequence => None,
            Serializer::Infix(op) => self.infix(c, op),
            Serializer::ArrayLiteral => match c.args.get("Elements") {
                Some(FreezableProperty::List(items)) => Some(self.list(items)),
                _ => None,
            },
            Serializer::EntityLiteral => Some(self.entity(c)),
            Serializer::Variable => match c.args.get("Variable") {
                Some(FreezableProperty::Variable(v)) => Some(v.var.to_string()),
                _ => None,
            },
            Serializer::AutomaticVariable => Some("<>".to_owned()),
            Serializer::Assignment => match (c.args.get("Variable"), c.args.get("Value")) {
                (Some(FreezableProperty::Variable(v)), Some(value)) => {
                    let text = format!("{} = {}", v.var, self.property(value));
                    Some(if nested { format!("({text})") } else { text })
                }
                _ => None,
            },
        };
        rendered.unwrap_or_else(|| self.function(c, nested))
    }

    fn function(&self, c: &CompoundStep, nested: bool) -> String {
        if c.args.is_empty() {
            return c.kind.clone();
        }
        let mut text = c.kind.clone();
        for (name, value) in self.ordered(c) {
            text.push(' ');
            text.push_str(name);
            text.push_str(": ");
            text.push_str(&self.property(value));
        }
        if nested {
            format!("({text})")
        } else {
            text
        }
    }

    /// Declared properties first, in declaration order, then any others.
    fn ordered<'c>(&self, c: &'c CompoundStep) -> Vec<(&'c str, &'c FreezableProperty)> {
        let mut out: Vec<(&str, &FreezableProperty)> = Vec::with_capacity(c.args.len());
        if let Some(factory) = self.store.get(&c.kind) {
            for info in &factory.properties {
                if let Some((name, value)) = c.args.iter().find(|(k, _)| info.answers_to(k)) {
                    out.push((name.as_str(), value));
                }
            }
        }
        for (name, value) in &c.args {
            if !out.iter().any(|(n, _)| *n == name.as_str()) {
                out.push((name.as_str(), value));
            }
        }
        out
    }

    fn property(&self, value: &FreezableProperty) -> String {
        match value {
            FreezableProperty::Step(step) => self.step(step, true),
            FreezableProperty::List(items) => self.list(items),
            FreezableProperty::Variable(v) => v.var.to_string(),
            FreezableProperty::Lambda(l) => {
                let binding = l.lambda.as_ref().map(|v| v.to_string()).unwrap_or_else(|| "<>".into());
                format!("({binding} => {})", self.step(&l.body, false))
            }
        }
    }

    fn list(&self, items: &[FreezableStep]) -> String {
        let parts: Vec<String> = items.iter().map(|i| self.step(i, true)).collect();
        format!("[{}]", parts.join(", "))
    }

    fn infix(&self, c: &CompoundStep, op: &str) -> Option<String> {
        let Some(FreezableProperty::List(terms)) = c.args.get("Terms") else { return None };
        if terms.is_empty() || c.args.len() != 1 {
            return None;
        }
        let parts: Vec<String> = terms.iter().map(|t| self.step(t, true)).collect();
        Some(format!("({})", parts.join(&format!(" {op} "))))
    }

    fn entity(&self, c: &CompoundStep) -> String {
        let parts: Vec<String> = c
            .args
            .iter()
            .map(|(name, value)| format!("{}: {}", quote(name), self.property(value)))
            .collect();
        format!("({})", parts.join(", "))
    }

    fn sequence(&self, c: &CompoundStep) -> Option<String> {
        let mut lines: Vec<&FreezableStep> = Vec::new();
        match c.args.get("InitialSteps") {
            Some(FreezableProperty::List(items)) => lines.extend(items.iter()),
            Some(_) => return None,
            None => {}
        }
        match c.args.get("FinalStep") {
            Some(FreezableProperty::Step(last)) => lines.push(last.as_ref()),
            Some(_) => return None,
            None => {}
        }
        if c.args.keys().any(|k| k != "InitialSteps" && k != "FinalStep") {
            return None;
        }
        Some(
            lines
                .into_iter()
                .map(|step| format!("- {}", self.step(step, false)))
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }
}

fn constant(value: &ConstantValue) -> String {
    match value {
        ConstantValue::Bool(b) => b.to_string(),
        ConstantValue::Int(n) => n.to_string(),
        ConstantValue::Double(x) if x.fract() == 0.0 && x.abs() < 1e15 => format!("{x:.1}"),
        ConstantValue::Double(x) => x.to_string(),
        ConstantValue::Str(s) => quote(s),
        ConstantValue::Enum { value } => value.clone(),
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn render(json: serde_json::Value) -> String {
        let step: FreezableStep = serde_json::from_value(json).unwrap();
        serialize(&step, &StepFactoryStore::core())
    }

    #[test]
    fn function_form() {
        assert_eq!(
            render(json!({"step": "ArrayLength", "args": {"Array": {"step": "Array", "args": {"Elements": [1, 2]}}}})),
            "ArrayLength Array: [1, 2]"
        );
    }

    #[test]
    fn declared_property_order() {
        let tree = json!({"step": "Range", "args": {"To": 3, "From": 1}});
        assert_eq!(render(tree), "Range From: 1 To: 3");
    }

    #[test]
    fn nested_functions_are_parenthesized() {
        let tree = json!({"step": "Print", "args": {"Value": {"step": "Range", "args": {"From": 1, "To": 2}}}});
        assert_eq!(render(tree), "Print Value: (Range From: 1 To: 2)");
    }

    #[test]
    fn operators_and_literals() {
        assert_eq!(render(json!({"step": "Sum", "args": {"Terms": [1, 2]}})), "(1 + 2)");
        assert_eq!(render(json!({"step": "CreateEntity", "args": {"a": 1}})), "('a': 1)");
        assert_eq!(render(json!("it's")), r"'it\'s'");
        assert_eq!(render(json!(2.0)), "2.0");
        assert_eq!(render(json!({"enum": "ErrorBehavior.Skip"})), "ErrorBehavior.Skip");
    }

    #[test]
    fn variables_and_lambdas() {
        let set = json!({"step": "SetVariable", "args": {"Variable": {"var": "x"}, "Value": 1}});
        assert_eq!(render(set), "<x> = 1");
        let map = json!({"step": "ArrayMap", "args": {
            "Array": {"step": "Array", "args": {"Elements": [1]}},
            "Function": {"lambda": "x", "body": {"step": "GetVariable", "args": {"Variable": {"var": "x"}}}}}});
        assert_eq!(render(map), "ArrayMap Array: [1] Function: (<x> => <x>)");
        let auto = json!({"step": "ArrayFilter", "args": {
            "Array": {"step": "Array", "args": {"Elements": [true]}},
            "Predicate": {"body": {"step": "GetAutomaticVariable", "args": {}}}}});
        assert_eq!(render(auto), "ArrayFilter Array: [true] Predicate: (<> => <>)");
    }

    #[test]
    fn sequences_render_one_step_per_line() {
        let tree = json!({"step": "Sequence", "args": {
            "InitialSteps": [
                {"step": "SetVariable", "args": {"Variable": {"var": "x"}, "Value": 1}},
                {"step": "Print", "args": {"Value": {"step": "GetVariable", "args": {"Variable": {"var": "x"}}}}}
            ],
            "FinalStep": {"step": "Product", "args": {"Terms": [{"step": "GetVariable", "args": {"Variable": {"var": "x"}}}, 2]}}}});
        assert_eq!(render(tree), "- <x> = 1\n- Print Value: <x>\n- (<x> * 2)");
    }

    #[test]
    fn unknown_kinds_use_function_form() {
        assert_eq!(render(json!({"step": "Frobnicate", "args": {"Level": 3}})), "Frobnicate Level: 3");
        assert_eq!(render(json!({"step": "Frobnicate"})), "Frobnicate");
    }
}
