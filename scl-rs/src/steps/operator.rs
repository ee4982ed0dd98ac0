//! Chain operators: one step kind per operator, all sharing [`ChainOperator`].
//!
//! `Sum Terms: [a, b, c]` folds left to right.  Arithmetic evaluates every
//! term and reports all failures together; `And`/`Or` stop at the first term
//! that decides the result; comparisons hold when every adjacent pair does.

use std::cmp::Ordering;

use crate::error::{collect_all, ErrorCode, Result, StructuredError};
use crate::freeze::{BuildRequest, InferRequest, PropertyInfo, StepFactory};
use crate::serialize::Serializer;
use crate::step::{ExecutableStep, StepBody};
use crate::types::TypeReference;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Sum,
    Product,
    Subtract,
    Divide,
    Modulo,
    And,
    Or,
    Equals,
    NotEquals,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

impl Operator {
    const ALL: [Operator; 13] = [
        Operator::Sum,
        Operator::Product,
        Operator::Subtract,
        Operator::Divide,
        Operator::Modulo,
        Operator::And,
        Operator::Or,
        Operator::Equals,
        Operator::NotEquals,
        Operator::LessThan,
        Operator::LessThanOrEqual,
        Operator::GreaterThan,
        Operator::GreaterThanOrEqual,
    ];

    fn kind(self) -> &'static str {
        match self {
            Operator::Sum => "Sum",
            Operator::Product => "Product",
            Operator::Subtract => "Subtract",
            Operator::Divide => "Divide",
            Operator::Modulo => "Modulo",
            Operator::And => "And",
            Operator::Or => "Or",
            Operator::Equals => "Equals",
            Operator::NotEquals => "NotEquals",
            Operator::LessThan => "LessThan",
            Operator::LessThanOrEqual => "LessThanOrEqual",
            Operator::GreaterThan => "GreaterThan",
            Operator::GreaterThanOrEqual => "GreaterThanOrEqual",
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Operator::Sum => "+",
            Operator::Product => "*",
            Operator::Subtract => "-",
            Operator::Divide => "/",
            Operator::Modulo => "%",
            Operator::And => "&&",
            Operator::Or => "||",
            Operator::Equals => "==",
            Operator::NotEquals => "!=",
            Operator::LessThan => "<",
            Operator::LessThanOrEqual => "<=",
            Operator::GreaterThan => ">",
            Operator::GreaterThanOrEqual => ">=",
        }
    }

    fn from_kind(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.kind() == kind)
    }

    fn is_arithmetic(self) -> bool {
        matches!(
            self,
            Operator::Sum | Operator::Product | Operator::Subtract | Operator::Divide | Operator::Modulo
        )
    }

    fn is_logical(self) -> bool {
        matches!(self, Operator::And | Operator::Or)
    }

    fn combine(self, acc: &Value, rhs: &Value) -> Result<Value> {
        match self {
            Operator::Sum => acc.arith_add(rhs),
            Operator::Product => acc.arith_mul(rhs),
            Operator::Subtract => acc.arith_sub(rhs),
            Operator::Divide => acc.arith_div(rhs),
            Operator::Modulo => acc.arith_rem(rhs),
            _ => Err(StructuredError::new(
                ErrorCode::InvalidTree,
                format!("{} is not an arithmetic operator", self.kind()),
            )),
        }
    }

    fn holds(self, ord: Ordering) -> bool {
        match self {
            Operator::Equals => ord == Ordering::Equal,
            Operator::NotEquals => ord != Ordering::Equal,
            Operator::LessThan => ord == Ordering::Less,
            Operator::LessThanOrEqual => ord != Ordering::Greater,
            Operator::GreaterThan => ord == Ordering::Greater,
            Operator::GreaterThanOrEqual => ord != Ordering::Less,
            _ => false,
        }
    }
}

fn numeric() -> TypeReference {
    TypeReference::candidates([TypeReference::INT, TypeReference::DOUBLE])
}

pub(crate) fn factories() -> Vec<StepFactory> {
    let mut all: Vec<StepFactory> = Operator::ALL
        .into_iter()
        .map(|op| {
            let (terms, factory) = if op.is_arithmetic() {
                (numeric(), StepFactory::generic(op.kind(), infer_arithmetic, build_chain))
            } else if op.is_logical() {
                (TypeReference::BOOL, StepFactory::simple(op.kind(), TypeReference::BOOL, build_chain))
            } else {
                (TypeReference::Any, StepFactory::generic(op.kind(), infer_comparison, build_chain))
            };
            factory
                .prop(PropertyInfo::list("Terms", terms))
                .serialized_as(Serializer::Infix(op.symbol()))
        })
        .collect();
    all.push(
        StepFactory::simple("StringJoin", TypeReference::STRING, build_string_join)
            .prop(PropertyInfo::step("Strings", TypeReference::array(TypeReference::STRING)))
            .prop(PropertyInfo::step("Delimiter", TypeReference::STRING).default_to("")),
    );
    all
}

// ── Typing ────────────────────────────────────────────────────────────────────

/// The numeric type every term shares.  Ints and doubles do not mix.
fn infer_arithmetic(req: &InferRequest<'_>) -> Result<TypeReference> {
    let expected = if req.expected().is_concrete() { req.expected().clone() } else { numeric() };
    let terms = req.list_types_with("Terms", &expected)?;
    Ok(TypeReference::candidates(terms))
}

/// Terms must be mutually comparable.
fn infer_comparison(req: &InferRequest<'_>) -> Result<TypeReference> {
    let terms = req.list_types_with("Terms", &TypeReference::Any)?;
    TypeReference::candidates(terms).resolve(req.resolver())?;
    Ok(TypeReference::BOOL)
}

fn build_chain(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    let op = Operator::from_kind(req.kind()).ok_or_else(|| {
        StructuredError::new(ErrorCode::UnknownStep, format!("{} is not an operator", req.kind()))
    })?;
    let expected = if op.is_arithmetic() { req.output().clone() } else { TypeReference::Any };
    let terms = if op.is_logical() { req.list("Terms")? } else { req.list_with("Terms", &expected)? };
    if terms.is_empty() {
        return Err(StructuredError::new(
            ErrorCode::MissingParameter,
            format!("{} needs at least one term", op.kind()),
        ));
    }
    Ok(Box::new(ChainOperator { op, terms }))
}

// ── Evaluation ────────────────────────────────────────────────────────────────

/// A binary operator applied across a list of terms.
#[derive(Debug)]
struct ChainOperator {
    op: Operator,
    terms: Vec<ExecutableStep>,
}

step_body!(ChainOperator, |this, scope, ctx| {
    match this.op {
        Operator::And | Operator::Or => {
            let stop_on = this.op == Operator::Or;
            for term in &this.terms {
                if term.run_bool(scope, ctx).await? == stop_on {
                    return Ok(Value::Bool(stop_on));
                }
            }
            Ok(Value::Bool(!stop_on))
        }
        op if op.is_arithmetic() => {
            let mut results = Vec::with_capacity(this.terms.len());
            for term in &this.terms {
                results.push(term.run(scope, ctx).await);
            }
            let values = collect_all(results)?;
            let mut acc = values[0].clone();
            for value in &values[1..] {
                acc = op.combine(&acc, value)?;
            }
            Ok(acc)
        }
        op => {
            let mut previous: Option<Value> = None;
            let mut holds = true;
            for term in &this.terms {
                let value = term.run(scope, ctx).await?.materialize(ctx).await?;
                if let Some(prev) = &previous {
                    holds &= op.holds(prev.cmp_value(&value));
                }
                previous = Some(value);
            }
            Ok(Value::Bool(holds))
        }
    }
});

// ── StringJoin ────────────────────────────────────────────────────────────────

fn build_string_join(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    Ok(Box::new(StringJoin { strings: req.step("Strings")?, delimiter: req.step("Delimiter")? }))
}

#[derive(Debug)]
struct StringJoin {
    strings: ExecutableStep,
    delimiter: ExecutableStep,
}

step_body!(StringJoin, |this, scope, ctx| {
    let strings = this.strings.run_array(scope, ctx).await?.to_vec(ctx).await?;
    let delimiter = this.delimiter.run_string(scope, ctx).await?;
    let parts = collect_all(strings.iter().map(|s| s.as_str().map(str::to_owned)))?;
    Ok(Value::Str(parts.join(&delimiter)))
});

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::testing::{freeze, run};
    use serde_json::json;

    fn op(kind: &str, terms: serde_json::Value) -> serde_json::Value {
        json!({"step": kind, "args": {"Terms": terms}})
    }

    #[tokio::test]
    async fn arithmetic_folds_left() {
        assert_eq!(run(op("Sum", json!([1, 2, 3]))).await.unwrap(), Value::Int(6));
        assert_eq!(run(op("Subtract", json!([10, 3, 2]))).await.unwrap(), Value::Int(5));
        assert_eq!(run(op("Divide", json!([7.5, 2.5]))).await.unwrap(), Value::Double(3.0));
        assert_eq!(run(op("Modulo", json!([7, 4]))).await.unwrap(), Value::Int(3));
    }

    #[tokio::test]
    async fn int_overflow_is_reported() {
        let e = run(op("Sum", json!([i64::MAX, 1]))).await.unwrap_err();
        assert_eq!(e.code(), Some(ErrorCode::ArithmeticOverflow));
        assert!(e.as_user_message().starts_with("ArithmeticOverflow: 9223372036854775807 + 1 overflows an int"));
    }

    #[tokio::test]
    async fn divide_by_zero_is_reported() {
        let e = run(op("Divide", json!([1, 0]))).await.unwrap_err();
        assert_eq!(e.code(), Some(ErrorCode::DivideByZero));
    }

    #[test]
    fn ints_and_doubles_do_not_mix() {
        let e = freeze(op("Sum", json!([1, 2.5]))).unwrap_err();
        assert!(e.has_code(ErrorCode::ConflictingTypes));
        let e = freeze(op("Sum", json!(["a"]))).unwrap_err();
        assert!(e.has_code(ErrorCode::WrongType));
    }

    #[tokio::test]
    async fn arithmetic_collects_every_failing_term() {
        let bad = |i: i64| json!({"step": "ArrayElementAtIndex", "args": {
            "Array": {"step": "Array", "args": {"Elements": [1]}}, "Index": i}});
        let e = run(op("Sum", json!([bad(5), 1, bad(9)]))).await.unwrap_err();
        assert_eq!(e.errors().len(), 2);
        assert!(e.errors().iter().all(|e| e.code == ErrorCode::IndexOutOfBounds));
    }

    #[tokio::test]
    async fn logical_short_circuits() {
        let boom = json!({"step": "AssertTrue", "args": {"Boolean": false}});
        let and = json!({"step": "And", "args": {"Terms": [false, {"step": "Sequence", "args": {
            "InitialSteps": [boom], "FinalStep": true}}]}});
        assert_eq!(run(and).await.unwrap(), Value::Bool(false));
        assert_eq!(run(op("Or", json!([false, true]))).await.unwrap(), Value::Bool(true));
        assert_eq!(run(op("And", json!([true, true]))).await.unwrap(), Value::Bool(true));
    }

    #[tokio::test]
    async fn comparisons_are_pairwise() {
        assert_eq!(run(op("LessThan", json!([1, 2, 3]))).await.unwrap(), Value::Bool(true));
        assert_eq!(run(op("LessThan", json!([1, 3, 2]))).await.unwrap(), Value::Bool(false));
        assert_eq!(run(op("Equals", json!(["a", "a"]))).await.unwrap(), Value::Bool(true));
        assert_eq!(run(op("GreaterThanOrEqual", json!([3, 3, 1]))).await.unwrap(), Value::Bool(true));
        assert!(freeze(op("Equals", json!([1, "1"]))).is_err());
    }

    #[tokio::test]
    async fn string_join() {
        let tree = json!({"step": "StringJoin", "args": {
            "Strings": {"step": "Array", "args": {"Elements": ["a", "b", "c"]}},
            "Delimiter": ", "}});
        assert_eq!(run(tree).await.unwrap(), Value::from("a, b, c"));
    }

    #[test]
    fn every_operator_has_a_symbol() {
        for op in Operator::ALL {
            assert_eq!(Operator::from_kind(op.kind()), Some(op));
            assert!(!op.symbol().is_empty());
        }
    }
}
