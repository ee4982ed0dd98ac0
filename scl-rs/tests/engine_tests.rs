//! End-to-end behaviour through the public [`Engine`] API: JSON trees in,
//! outcomes and located errors out.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use scl::cancel::CancellationToken;
use scl::config::EngineConfig;
use scl::context::MemoryConsole;
use scl::engine::{Engine, RunOutcome};
use scl::error::{ErrorCode, Result, SingleError, StructuredError};
use scl::freeze::FreezableStep;
use scl::scope::{Disposable, Scope};
use scl::types::{TypeReference, VariableName};
use scl::value::Value;

// ── Helpers ───────────────────────────────────────────────────────────────────

fn tree(json: serde_json::Value) -> FreezableStep {
    serde_json::from_value(json).expect("valid step tree")
}

fn engine() -> (Engine, Arc<MemoryConsole>) {
    let console = Arc::new(MemoryConsole::new());
    (Engine::new(EngineConfig::default()).with_console(console.clone()), console)
}

async fn run(json: serde_json::Value) -> Result<RunOutcome> {
    engine().0.run_tree(&tree(json), CancellationToken::new()).await
}

async fn value(json: serde_json::Value) -> Value {
    run(json).await.expect("run succeeds").value
}

fn get(name: &str) -> serde_json::Value {
    json!({"step": "GetVariable", "args": {"Variable": {"var": name}}})
}

fn set(name: &str, value: serde_json::Value) -> serde_json::Value {
    json!({"step": "SetVariable", "args": {"Variable": {"var": name}, "Value": value}})
}

fn seq(initial: Vec<serde_json::Value>, last: serde_json::Value) -> serde_json::Value {
    json!({"step": "Sequence", "args": {"InitialSteps": initial, "FinalStep": last}})
}

fn array(items: serde_json::Value) -> serde_json::Value {
    json!({"step": "Array", "args": {"Elements": items}})
}

fn ints(values: &[i64]) -> Value {
    Value::from(values.to_vec())
}

// ── Freezing ──────────────────────────────────────────────────────────────────

#[test]
fn freeze_is_deterministic() {
    let (engine, _) = engine();
    let t = tree(seq(
        vec![set("xs", array(json!([3, 1, 2])))],
        json!({"step": "ArrayMap", "args": {
            "Array": {"step": "ArraySort", "args": {"Array": get("xs")}},
            "Function": {"lambda": "x", "body": {"step": "Product", "args": {"Terms": [get("x"), 2]}}}}}),
    ));
    let first = format!("{:?}", engine.freeze(&t, &TypeReference::Any).unwrap());
    let second = format!("{:?}", engine.freeze(&t, &TypeReference::Any).unwrap());
    assert_eq!(first, second);

    let bad = tree(seq(vec![set("x", json!(1)), set("x", json!("a"))], get("x")));
    assert_eq!(
        engine.freeze(&bad, &TypeReference::Any).unwrap_err(),
        engine.freeze(&bad, &TypeReference::Any).unwrap_err()
    );
}

#[test]
fn conflicting_assignments_name_both_types() {
    let (engine, _) = engine();
    let bad = tree(seq(vec![set("x", json!(1)), set("x", json!("a"))], get("x")));
    let e = engine.freeze(&bad, &TypeReference::Any).unwrap_err();
    assert_eq!(e.code(), Some(ErrorCode::ConflictingTypes));
    let message = &e.errors()[0].message;
    assert!(message.contains("int") && message.contains("string"), "{message}");
    assert!(e.errors()[0].location.is_some());
}

#[test]
fn compatible_candidates_unify() {
    let (engine, _) = engine();
    let t = tree(array(json!([1, 2, {"step": "Sum", "args": {"Terms": [1, 2]}}])));
    let frozen = engine.freeze(&t, &TypeReference::Any).unwrap();
    assert_eq!(frozen.output_type(), &TypeReference::array(TypeReference::INT));
}

#[test]
fn empty_literal_without_context_cannot_infer() {
    let (engine, _) = engine();
    let e = engine.freeze(&tree(array(json!([]))), &TypeReference::Unknown).unwrap_err();
    assert_eq!(e.code(), Some(ErrorCode::CannotInferType));
    assert!(e.as_user_message().contains("cannot infer"));
}

#[test]
fn unknown_steps_and_parameters_are_all_reported() {
    let (engine, _) = engine();
    let t = tree(array(json!([
        {"step": "Frobnicate"},
        {"step": "ArrayLength", "args": {"Array": array(json!([1])), "Colour": "red"}}
    ])));
    let e = engine.freeze(&t, &TypeReference::Any).unwrap_err();
    assert!(e.has_code(ErrorCode::UnknownStep));
    assert!(e.has_code(ErrorCode::UnexpectedParameter));
}

// ── Scopes ────────────────────────────────────────────────────────────────────

fn for_each_setting_last() -> serde_json::Value {
    json!({"step": "ForEach", "args": {
        "Array": array(json!([1, 2, 3])),
        "Action": {"lambda": "item", "body": set("last", get("item"))}}})
}

#[tokio::test]
async fn writes_in_a_child_scope_stay_there() {
    let e = run(seq(vec![for_each_setting_last()], get("last"))).await.unwrap_err();
    assert_eq!(e.code(), Some(ErrorCode::MissingVariable));
}

#[tokio::test]
async fn writes_reach_a_parent_that_declared_the_name() {
    let outcome = run(seq(vec![set("last", json!(0)), for_each_setting_last()], get("last")))
        .await
        .unwrap();
    assert_eq!(outcome.value, Value::Int(3));
    assert!(!outcome.variables.contains_key(&VariableName::new("item")));
}

#[derive(Debug, Default)]
struct Counter(AtomicUsize);

impl Disposable for Counter {
    fn dispose(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn scopes_dispose_exactly_once() {
    let root = Scope::root();
    let counter = Arc::new(Counter::default());
    {
        let child = root.child();
        child.own(counter.clone());
        child.dispose();
        assert!(child.is_disposed());
    }
    assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    root.dispose();
    assert_eq!(counter.0.load(Ordering::SeqCst), 1);
}

// ── Lazy arrays ───────────────────────────────────────────────────────────────

fn twice_length(source: serde_json::Value) -> serde_json::Value {
    let length = json!({"step": "ArrayLength", "args": {"Array": get("xs")}});
    seq(vec![set("xs", source)], json!({"step": "Sum", "args": {"Terms": [length.clone(), length]}}))
}

#[tokio::test]
async fn rerunnable_sources_iterate_again() {
    let range = json!({"step": "Range", "args": {"From": 1, "To": 4}});
    assert_eq!(value(twice_length(range)).await, Value::Int(8));
}

#[tokio::test]
async fn single_pass_sources_refuse_a_second_read() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "one\ntwo").unwrap();
    let read = json!({"step": "ReadLines", "args": {"Path": file.path().to_str().unwrap()}});
    let e = run(twice_length(read)).await.unwrap_err();
    assert!(e.has_code(ErrorCode::StreamConsumed), "{}", e.as_user_message());
}

#[tokio::test]
async fn distinct_is_idempotent() {
    let words = array(json!(["b", "A", "a", "B", "c", "b"]));
    let distinct = |a: serde_json::Value| {
        json!({"step": "ArrayDistinct", "args": {"Array": a, "IgnoreCase": true}})
    };
    let once = value(distinct(words.clone())).await;
    let twice = value(distinct(distinct(words))).await;
    assert_eq!(once, Value::from(vec!["b", "A", "c"]));
    assert_eq!(once, twice);
}

#[tokio::test]
async fn skip_take_find() {
    let xs = || array(json!([1, 2, 3]));
    let skip = json!({"step": "ArraySkip", "args": {"Array": xs(), "Count": 2}});
    let take = json!({"step": "ArrayTake", "args": {"Array": xs(), "Count": 2}});
    let find = json!({"step": "ArrayFind", "args": {"Array": array(json!(["a", "b", "c"])), "Element": "d"}});
    assert_eq!(value(skip).await, ints(&[3]));
    assert_eq!(value(take).await, ints(&[1, 2]));
    assert_eq!(value(find).await, Value::Int(-1));
}

#[tokio::test]
async fn group_by_keeps_first_appearance_order() {
    let t = json!({"step": "ArrayGroupBy", "args": {
        "Array": array(json!([3, 4, 5, 6, 7])),
        "Function": {"body": {"step": "Modulo", "args": {"Terms": [{"step": "GetAutomaticVariable"}, 2]}}}}});
    let Value::Array(groups) = value(t).await else { panic!("expected an array") };
    let groups = groups.evaluated_items().unwrap();
    let keys: Vec<_> = groups.iter().map(|g| g.as_entity().unwrap().get("Key").cloned()).collect();
    assert_eq!(keys, vec![Some(Value::Int(1)), Some(Value::Int(0))]);
    assert_eq!(groups[0].as_entity().unwrap().get("Values"), Some(&ints(&[3, 5, 7])));
}

#[tokio::test]
async fn lazy_keys_compare_by_contents() {
    let range = |from: i64, to: serde_json::Value| json!({"step": "Range", "args": {"From": from, "To": to}});
    let length = |a: serde_json::Value| json!({"step": "ArrayLength", "args": {"Array": a}});
    let up_to_item = json!({"body": range(1, json!({"step": "GetAutomaticVariable"}))});

    let ranges = array(json!([range(1, json!(2)), range(3, json!(4)), range(1, json!(2))]));
    let distinct = json!({"step": "ArrayDistinct", "args": {"Array": ranges}});
    assert_eq!(value(length(distinct)).await, Value::Int(2));

    let keyed = json!({"step": "ArrayDistinct", "args": {
        "Array": array(json!([1, 2, 1])), "KeySelector": up_to_item.clone()}});
    assert_eq!(value(keyed).await, ints(&[1, 2]));

    let grouped = json!({"step": "ArrayGroupBy", "args": {
        "Array": array(json!([1, 2, 1])), "Function": up_to_item}});
    assert_eq!(value(length(grouped)).await, Value::Int(2));
}

// ── Control flow ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn for_with_zero_increment_fails_before_iterating() {
    let (engine, console) = engine();
    let t = tree(json!({"step": "For", "args": {
        "Variable": {"var": "i"}, "From": 1, "To": 3, "Increment": 0,
        "Action": {"step": "Print", "args": {"Value": get("i")}}}}));
    let e = engine.run_tree(&t, CancellationToken::new()).await.unwrap_err();
    assert_eq!(
        e.as_user_message(),
        "DivideByZero: For cannot step by an increment of zero (For at For)"
    );
    assert!(console.lines().is_empty());
}

#[tokio::test]
async fn and_short_circuits_while_literals_collect_every_error() {
    let out_of_range = |i: i64| {
        json!({"step": "ArrayElementAtIndex", "args": {"Array": array(json!([1])), "Index": i}})
    };
    let failing_bool = json!({"step": "Equals", "args": {"Terms": [out_of_range(9), 1]}});
    let and = json!({"step": "And", "args": {"Terms": [false, failing_bool]}});
    assert_eq!(value(and).await, Value::Bool(false));

    let e = run(array(json!([out_of_range(5), out_of_range(7)]))).await.unwrap_err();
    assert_eq!(
        e.as_user_message(),
        "IndexOutOfBounds: index 5 is outside an array of length 1 \
         (ArrayElementAtIndex at Array.Elements[0].ArrayElementAtIndex)\n\
         IndexOutOfBounds: index 7 is outside an array of length 1 \
         (ArrayElementAtIndex at Array.Elements[1].ArrayElementAtIndex)"
    );
}

#[tokio::test]
async fn try_recovers_from_failures() {
    let (engine, console) = engine();
    let t = tree(json!({"step": "Try", "args": {
        "Statement": {"step": "AssertTrue", "args": {"Boolean": false}},
        "Recover": {"lambda": "message", "body": {"step": "Print", "args": {"Value": get("message")}}}}}));
    engine.run_tree(&t, CancellationToken::new()).await.unwrap();
    let lines = console.lines();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("AssertionFailed: "), "{lines:?}");
}

#[tokio::test]
async fn try_never_catches_cancellation() {
    let (engine, console) = engine();
    let t = tree(json!({"step": "Try", "args": {
        "Statement": {"step": "Delay", "args": {"Milliseconds": 60_000}},
        "Recover": {"lambda": "message", "body": {"step": "Print", "args": {"Value": get("message")}}}}}));
    let cancel = CancellationToken::new();
    let _timer = cancel.cancel_after(Duration::from_millis(20));
    let e = engine.run_tree(&t, cancel).await.unwrap_err();
    assert!(e.is_cancellation());
    assert!(console.lines().is_empty());
}

#[tokio::test]
async fn run_scl_exports_by_name() {
    let inner = serde_json::to_string(&seq(vec![set("answer", json!(41))], set("answer", json!({
        "step": "Sum", "args": {"Terms": [get("answer"), 1]}}))))
    .unwrap();
    let outer = seq(
        vec![json!({"step": "RunScl", "args": {"Tree": inner, "Export": ["answer"]}})],
        get("answer"),
    );
    let outcome = run(outer).await.unwrap();
    assert_eq!(outcome.value, Value::Int(42));
    assert_eq!(outcome.variables.get(&VariableName::new("answer")), Some(&Value::Int(42)));
}

// ── Validation ────────────────────────────────────────────────────────────────

fn enforce(behavior: &str) -> serde_json::Value {
    json!({"step": "EnforceSchema", "args": {
        "EntityStream": array(json!([
            {"step": "CreateEntity", "args": {"id": 1}},
            {"step": "CreateEntity", "args": {"id": "two"}},
            {"step": "CreateEntity", "args": {"id": 3}},
            {"step": "CreateEntity", "args": {"name": "four"}}
        ])),
        "Schema": {"step": "CreateEntity", "args": {"id": "int"}},
        "ErrorBehavior": {"enum": format!("ErrorBehavior.{behavior}")}}})
}

#[tokio::test]
async fn skip_drops_invalid_elements_quietly() {
    let outcome = run(enforce("Skip")).await.unwrap();
    let Value::Array(kept) = &outcome.value else { panic!("expected an array") };
    let ids: Vec<_> = kept
        .evaluated_items()
        .unwrap()
        .iter()
        .map(|e| e.as_entity().unwrap().get("id").cloned())
        .collect();
    assert_eq!(ids, vec![Some(Value::Int(1)), Some(Value::Int(3))]);
    assert!(outcome.diagnostics.is_empty());
}

#[tokio::test]
async fn fail_reports_every_violation_at_once() {
    let e = run(enforce("Fail")).await.unwrap_err();
    assert_eq!(e.errors().len(), 2);
    assert!(e.errors().iter().all(|s| s.code == ErrorCode::SchemaViolation));
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[test]
fn combining_errors_is_associative() {
    let err = |n: i64| StructuredError::from(SingleError::new(ErrorCode::AssertionFailed, n.to_string()));
    let nested = StructuredError::combine([StructuredError::combine([err(1), err(2)]).unwrap(), err(3)]);
    let flat = StructuredError::combine([err(1), err(2), err(3)]);
    assert_eq!(nested, flat);
    assert_eq!(flat.unwrap().errors().len(), 3);
}
