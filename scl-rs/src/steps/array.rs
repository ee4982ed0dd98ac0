//! Array literals and the array/stream operations.
//!
//! `Map`, `Filter`, `SelectMany`, `Distinct`, `Concat`, `Skip` and `Take`
//! return lazy arrays: nothing is pulled until a consumer iterates.  The
//! rest consume their input when they run.

use crate::error::{collect_all, ErrorCode, Result, StructuredError};
use crate::freeze::{BuildRequest, InferRequest, LambdaBinding, PropertyInfo, StepFactory};
use crate::serialize::Serializer;
use crate::step::{ExecutableStep, FrozenLambda, StepBody};
use crate::types::{TypeReference, VariableName};
use crate::value::{CaseSensitivity, ElementSource, IterSource, LazyArray, Value};

use super::element_hint;

fn any_array() -> TypeReference {
    TypeReference::array(TypeReference::Any)
}

fn array_prop() -> PropertyInfo {
    PropertyInfo::step("Array", any_array())
}

fn item_lambda(name: &'static str, body: TypeReference) -> PropertyInfo {
    PropertyInfo::lambda(name, LambdaBinding::ElementOf("Array"), body)
}

pub(crate) fn factories() -> Vec<StepFactory> {
    let mut all = vec![
        StepFactory::generic("Array", infer_array_literal, build_array_literal)
            .prop(PropertyInfo::list("Elements", TypeReference::Any))
            .serialized_as(Serializer::ArrayLiteral),
        StepFactory::simple("Range", TypeReference::array(TypeReference::INT), build_range)
            .prop(PropertyInfo::step("From", TypeReference::INT))
            .prop(PropertyInfo::step("To", TypeReference::INT)),
    ];
    for (kind, output) in [
        ("ArrayLength", Some(TypeReference::INT)),
        ("ArrayIsEmpty", Some(TypeReference::BOOL)),
        ("ArrayFirst", None),
        ("ArrayLast", None),
        ("ArrayReverse", None),
        ("ArrayEvaluate", None),
    ] {
        let factory = match output {
            Some(ty) => StepFactory::simple(kind, ty, build_query),
            None if kind == "ArrayFirst" || kind == "ArrayLast" => {
                StepFactory::generic(kind, infer_element, build_query)
            }
            None => StepFactory::generic(kind, infer_same_array, build_query),
        };
        all.push(factory.prop(array_prop()));
    }
    all.extend([
        StepFactory::generic("ArrayElementAtIndex", infer_element, build_element_at)
            .prop(array_prop())
            .prop(PropertyInfo::step("Index", TypeReference::INT)),
        StepFactory::simple("ArrayFind", TypeReference::INT, build_find)
            .prop(array_prop())
            .prop(PropertyInfo::step("Element", TypeReference::Any)),
        StepFactory::generic("ArrayMap", infer_map, build_map)
            .prop(array_prop())
            .prop(item_lambda("Function", TypeReference::Any)),
        StepFactory::generic("ArrayFilter", infer_same_array, build_filter)
            .prop(array_prop())
            .prop(item_lambda("Predicate", TypeReference::BOOL)),
        StepFactory::generic("ArraySelectMany", infer_select_many, build_select_many)
            .prop(array_prop())
            .prop(item_lambda("Function", any_array())),
        StepFactory::generic("ArrayDistinct", infer_same_array, build_distinct)
            .prop(array_prop())
            .prop(item_lambda("KeySelector", TypeReference::Any).optional())
            .prop(PropertyInfo::step("IgnoreCase", TypeReference::BOOL).default_to(false)),
        StepFactory::simple("ArrayGroupBy", TypeReference::array(TypeReference::ENTITY), build_group_by)
            .prop(array_prop())
            .prop(item_lambda("Function", TypeReference::Any)),
        StepFactory::generic("ArrayConcat", infer_concat, build_concat)
            .prop(PropertyInfo::step("Arrays", TypeReference::array(any_array()))),
        StepFactory::generic("ArraySkip", infer_same_array, build_slice)
            .prop(array_prop())
            .prop(PropertyInfo::step("Count", TypeReference::INT)),
        StepFactory::generic("ArrayTake", infer_same_array, build_slice)
            .prop(array_prop())
            .prop(PropertyInfo::step("Count", TypeReference::INT)),
        StepFactory::generic("ArraySort", infer_same_array, build_sort)
            .prop(array_prop())
            .prop(PropertyInfo::step("Descending", TypeReference::BOOL).default_to(false))
            .prop(item_lambda("KeySelector", TypeReference::Any).optional()),
        StepFactory::generic("ArrayFold", |req| req.child_type_with("Initial", req.expected()), build_fold)
            .prop(array_prop())
            .prop(PropertyInfo::step("Initial", TypeReference::Any))
            .prop(PropertyInfo::variable("Accumulator"))
            .prop(item_lambda("Function", TypeReference::Any))
            .declaring(|req| match req.variable_name("Accumulator") {
                Ok(name) => vec![(name, req.child_type_with("Initial", &TypeReference::Any))],
                Err(_) => Vec::new(),
            }),
    ]);
    all
}

// ── Typing ────────────────────────────────────────────────────────────────────

/// Elements are unified; an empty literal takes its element type from the
/// parent, and fails to infer if the parent has none.
fn infer_array_literal(req: &InferRequest<'_>) -> Result<TypeReference> {
    let element = match req.expected() {
        TypeReference::Array(element) => element.as_ref().clone(),
        TypeReference::Unknown => TypeReference::Unknown,
        _ => TypeReference::Any,
    };
    if req.children("Elements")?.is_empty() {
        return Ok(TypeReference::array(element));
    }
    let types = req.list_types_with("Elements", &element)?;
    Ok(TypeReference::array(TypeReference::candidates(types)))
}

fn infer_element(req: &InferRequest<'_>) -> Result<TypeReference> {
    req.element_type_with("Array", req.expected())
}

fn infer_same_array(req: &InferRequest<'_>) -> Result<TypeReference> {
    req.child_type_with("Array", &TypeReference::array(element_hint(req.expected())))
}

fn infer_map(req: &InferRequest<'_>) -> Result<TypeReference> {
    let body = req.lambda_type_with("Function", &element_hint(req.expected()))?;
    Ok(TypeReference::array(body))
}

fn infer_select_many(req: &InferRequest<'_>) -> Result<TypeReference> {
    req.lambda_type_with("Function", &TypeReference::array(element_hint(req.expected())))
}

fn infer_concat(req: &InferRequest<'_>) -> Result<TypeReference> {
    let hint = TypeReference::array(element_hint(req.expected()));
    let arrays = req.child_type_with("Arrays", &TypeReference::array(hint))?;
    Ok(arrays.element_type().cloned().unwrap_or(TypeReference::Unknown))
}

/// The output's element type, for steps that return an array.
fn output_element(req: &BuildRequest<'_>) -> TypeReference {
    element_hint(req.output())
}

fn unknown_kind(req: &BuildRequest<'_>) -> StructuredError {
    StructuredError::new(ErrorCode::UnknownStep, format!("{} is not an array step", req.kind()))
}

// ── Literals and sources ──────────────────────────────────────────────────────

fn build_array_literal(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    let elements = req.list_with("Elements", &output_element(req))?;
    Ok(Box::new(ArrayLiteral(elements)))
}

#[derive(Debug)]
struct ArrayLiteral(Vec<ExecutableStep>);

step_body!(ArrayLiteral, |this, scope, ctx| {
    let mut results = Vec::with_capacity(this.0.len());
    for element in &this.0 {
        results.push(element.run(scope, ctx).await);
    }
    Ok(Value::Array(LazyArray::from_vec(collect_all(results)?)))
});

fn build_range(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    Ok(Box::new(Range { from: req.step("From")?, to: req.step("To")? }))
}

/// Inclusive, and re-runnable: each iteration counts from the start.
#[derive(Debug)]
struct Range {
    from: ExecutableStep,
    to: ExecutableStep,
}

step_body!(Range, |this, scope, ctx| {
    let from = this.from.run_int(scope, ctx).await?;
    let to = this.to.run_int(scope, ctx).await?;
    Ok(Value::Array(LazyArray::rerunnable(format!("Range {from}..={to}"), move || {
        Box::new(IterSource::new((from..=to).map(Value::Int))) as Box<dyn ElementSource>
    })))
});

// ── Eager queries ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Query {
    Length,
    IsEmpty,
    First,
    Last,
    Reverse,
    Evaluate,
}

fn build_query(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    let (query, expected) = match req.kind() {
        "ArrayLength" => (Query::Length, any_array()),
        "ArrayIsEmpty" => (Query::IsEmpty, any_array()),
        "ArrayFirst" => (Query::First, TypeReference::array(req.output().clone())),
        "ArrayLast" => (Query::Last, TypeReference::array(req.output().clone())),
        "ArrayReverse" => (Query::Reverse, req.output().clone()),
        "ArrayEvaluate" => (Query::Evaluate, req.output().clone()),
        _ => return Err(unknown_kind(req)),
    };
    Ok(Box::new(ArrayQuery { query, array: req.step_with("Array", &expected)? }))
}

#[derive(Debug)]
struct ArrayQuery {
    query: Query,
    array: ExecutableStep,
}

step_body!(ArrayQuery, |this, scope, ctx| {
    let array = this.array.run_array(scope, ctx).await?;
    match this.query {
        Query::Length => {
            let len = array.len(ctx).await?;
            Ok(Value::Int(i64::try_from(len).unwrap_or(i64::MAX)))
        }
        Query::IsEmpty => Ok(Value::Bool(array.cursor()?.next(ctx).await?.is_none())),
        Query::First => array.first(ctx).await,
        Query::Last => array.last(ctx).await,
        Query::Reverse => Ok(Value::Array(array.reverse(ctx).await?)),
        Query::Evaluate => Ok(Value::Array(array.evaluate(ctx).await?)),
    }
});

fn build_element_at(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    Ok(Box::new(ElementAt {
        array: req.step_with("Array", &TypeReference::array(req.output().clone()))?,
        index: req.step("Index")?,
    }))
}

#[derive(Debug)]
struct ElementAt {
    array: ExecutableStep,
    index: ExecutableStep,
}

step_body!(ElementAt, |this, scope, ctx| {
    let array = this.array.run_array(scope, ctx).await?;
    let index = this.index.run_int(scope, ctx).await?;
    array.element_at(index, ctx).await
});

fn build_find(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    let array_type = req.child_type("Array")?;
    let element = element_hint(&array_type);
    Ok(Box::new(Find { array: req.step("Array")?, element: req.step_with("Element", &element)? }))
}

#[derive(Debug)]
struct Find {
    array: ExecutableStep,
    element: ExecutableStep,
}

step_body!(Find, |this, scope, ctx| {
    let array = this.array.run_array(scope, ctx).await?;
    let needle = this.element.run(scope, ctx).await?;
    Ok(Value::Int(array.find(&needle, ctx).await?))
});

// ── Lazy transforms ───────────────────────────────────────────────────────────

fn build_map(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    Ok(Box::new(Map {
        array: req.step("Array")?,
        function: req.lambda_with("Function", &output_element(req))?,
    }))
}

#[derive(Debug)]
struct Map {
    array: ExecutableStep,
    function: FrozenLambda,
}

step_body!(Map, |this, scope, ctx| {
    let array = this.array.run_array(scope, ctx).await?;
    Ok(Value::Array(array.map(this.function.capture(scope))))
});

fn build_filter(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    Ok(Box::new(Filter {
        array: req.step_with("Array", req.output())?,
        predicate: req.lambda("Predicate")?,
    }))
}

#[derive(Debug)]
struct Filter {
    array: ExecutableStep,
    predicate: FrozenLambda,
}

step_body!(Filter, |this, scope, ctx| {
    let array = this.array.run_array(scope, ctx).await?;
    Ok(Value::Array(array.filter(this.predicate.capture(scope))))
});

fn build_select_many(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    Ok(Box::new(SelectMany {
        array: req.step("Array")?,
        function: req.lambda_with("Function", req.output())?,
    }))
}

#[derive(Debug)]
struct SelectMany {
    array: ExecutableStep,
    function: FrozenLambda,
}

step_body!(SelectMany, |this, scope, ctx| {
    let array = this.array.run_array(scope, ctx).await?;
    Ok(Value::Array(array.flat_map(this.function.capture(scope))))
});

fn build_distinct(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    Ok(Box::new(Distinct {
        array: req.step_with("Array", req.output())?,
        key: req.optional_lambda("KeySelector")?,
        ignore_case: req.step("IgnoreCase")?,
    }))
}

#[derive(Debug)]
struct Distinct {
    array: ExecutableStep,
    key: Option<FrozenLambda>,
    ignore_case: ExecutableStep,
}

step_body!(Distinct, |this, scope, ctx| {
    let array = this.array.run_array(scope, ctx).await?;
    let case = if this.ignore_case.run_bool(scope, ctx).await? {
        CaseSensitivity::Insensitive
    } else {
        CaseSensitivity::Sensitive
    };
    let key = this.key.as_ref().map(|k| k.capture(scope));
    Ok(Value::Array(array.distinct(key, case)))
});

fn build_concat(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    let arrays = req.step_with("Arrays", &TypeReference::array(req.output().clone()))?;
    Ok(Box::new(Concat(arrays)))
}

#[derive(Debug)]
struct Concat(ExecutableStep);

step_body!(Concat, |this, scope, ctx| {
    Ok(Value::Array(LazyArray::concat(this.0.run_array(scope, ctx).await?)))
});

fn build_slice(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    let skip = match req.kind() {
        "ArraySkip" => true,
        "ArrayTake" => false,
        _ => return Err(unknown_kind(req)),
    };
    Ok(Box::new(Slice { array: req.step_with("Array", req.output())?, count: req.step("Count")?, skip }))
}

#[derive(Debug)]
struct Slice {
    array: ExecutableStep,
    count: ExecutableStep,
    skip: bool,
}

step_body!(Slice, |this, scope, ctx| {
    let array = this.array.run_array(scope, ctx).await?;
    // negative counts act as zero
    let count = usize::try_from(this.count.run_int(scope, ctx).await?).unwrap_or(0);
    Ok(Value::Array(if this.skip { array.skip(count) } else { array.take(count) }))
});

// ── Eager transforms ──────────────────────────────────────────────────────────

fn build_group_by(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    Ok(Box::new(GroupBy { array: req.step("Array")?, key: req.lambda("Function")? }))
}

#[derive(Debug)]
struct GroupBy {
    array: ExecutableStep,
    key: FrozenLambda,
}

step_body!(GroupBy, |this, scope, ctx| {
    let array = this.array.run_array(scope, ctx).await?;
    Ok(Value::Array(array.group_by(&this.key.capture(scope), ctx).await?))
});

fn build_sort(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    Ok(Box::new(Sort {
        array: req.step_with("Array", req.output())?,
        descending: req.step("Descending")?,
        key: req.optional_lambda("KeySelector")?,
    }))
}

#[derive(Debug)]
struct Sort {
    array: ExecutableStep,
    descending: ExecutableStep,
    key: Option<FrozenLambda>,
}

step_body!(Sort, |this, scope, ctx| {
    let array = this.array.run_array(scope, ctx).await?;
    let descending = this.descending.run_bool(scope, ctx).await?;
    let key = this.key.as_ref().map(|k| k.capture(scope));
    Ok(Value::Array(array.sort(key.as_ref(), descending, ctx).await?))
});

fn build_fold(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    Ok(Box::new(Fold {
        array: req.step("Array")?,
        initial: req.step_with("Initial", req.output())?,
        accumulator: req.variable_name("Accumulator")?,
        function: req.lambda_with("Function", req.output())?,
    }))
}

/// Threads an accumulator through the elements: the function sees the
/// element as its item and the running value as `Accumulator`.
#[derive(Debug)]
struct Fold {
    array: ExecutableStep,
    initial: ExecutableStep,
    accumulator: VariableName,
    function: FrozenLambda,
}

step_body!(Fold, |this, scope, ctx| {
    let array = this.array.run_array(scope, ctx).await?;
    let mut acc = this.initial.run(scope, ctx).await?;
    let mut cursor = array.cursor()?;
    while let Some(item) = cursor.next(ctx).await? {
        let extra = [(this.accumulator.clone(), acc)];
        acc = this.function.invoke_with(scope, item, &extra, ctx).await?;
    }
    Ok(acc)
});

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freeze::StepFactoryStore;
    use crate::steps::testing::{freeze, ints, run, tree};
    use crate::types::TypeResolver;
    use serde_json::json;

    fn array(elements: serde_json::Value) -> serde_json::Value {
        json!({"step": "Array", "args": {"Elements": elements}})
    }

    fn get(name: &str) -> serde_json::Value {
        json!({"step": "GetVariable", "args": {"Variable": {"var": name}}})
    }

    fn auto() -> serde_json::Value {
        json!({"step": "GetAutomaticVariable"})
    }

    #[tokio::test]
    async fn skip_take_find() {
        let skip = json!({"step": "ArraySkip", "args": {"Array": array(json!([1, 2, 3])), "Count": 2}});
        assert_eq!(run(skip).await.unwrap(), ints(&[3]));
        let take = json!({"step": "ArrayTake", "args": {"Array": array(json!([1, 2, 3])), "Count": 2}});
        assert_eq!(run(take).await.unwrap(), ints(&[1, 2]));
        let find = json!({"step": "ArrayFind", "args": {"Array": array(json!([1, 2, 3])), "Element": 4}});
        assert_eq!(run(find).await.unwrap(), Value::Int(-1));
    }

    #[test]
    fn empty_literal_needs_an_element_type() {
        let store = StepFactoryStore::core();
        let empty = tree(array(json!([])));
        let e = store
            .freeze(&empty, &TypeReference::Unknown, &TypeResolver::new())
            .unwrap_err();
        assert_eq!(e.code(), Some(ErrorCode::CannotInferType));
        let typed = store
            .freeze(&empty, &TypeReference::array(TypeReference::INT), &TypeResolver::new())
            .unwrap();
        assert_eq!(typed.output_type(), &TypeReference::array(TypeReference::INT));
    }

    #[test]
    fn literal_elements_unify() {
        let e = freeze(array(json!([1, "two"]))).unwrap_err();
        assert!(e.has_code(ErrorCode::ConflictingTypes));
        let ok = freeze(array(json!([array(json!([1])), array(json!([2, 3]))]))).unwrap();
        assert_eq!(
            ok.output_type(),
            &TypeReference::array(TypeReference::array(TypeReference::INT))
        );
    }

    #[tokio::test]
    async fn literal_collects_all_element_errors() {
        let bad = json!({"step": "ArrayFirst", "args": {"Array": array(json!([])) }});
        let nested = json!({"step": "Array", "args": {"Elements": [
            {"step": "ArrayElementAtIndex", "args": {"Array": array(json!([1])), "Index": 3}},
            {"step": "ArrayElementAtIndex", "args": {"Array": array(json!([1])), "Index": 4}},
        ]}});
        assert!(freeze(bad).is_err());
        let e = run(nested).await.unwrap_err();
        assert_eq!(e.errors().len(), 2);
    }

    #[tokio::test]
    async fn map_filter_chain() {
        let tree = json!({"step": "ArrayFilter", "args": {
            "Array": {"step": "ArrayMap", "args": {
                "Array": {"step": "Range", "args": {"From": 1, "To": 6}},
                "Function": {"lambda": "x", "body": {"step": "Product", "args": {"Terms": [get("x"), 10]}}},
            }},
            "Predicate": {"body": {"step": "GreaterThan", "args": {"Terms": [auto(), 30]}}},
        }});
        assert_eq!(run(tree).await.unwrap(), ints(&[40, 50, 60]));
    }

    #[tokio::test]
    async fn range_is_rerunnable() {
        let tree = json!({"step": "Sequence", "args": {
            "InitialSteps": [{"step": "SetVariable", "args": {"Variable": {"var": "r"},
                "Value": {"step": "Range", "args": {"From": 1, "To": 3}}}}],
            "FinalStep": {"step": "Sum", "args": {"Terms": [
                {"step": "ArrayLength", "args": {"Array": get("r")}},
                {"step": "ArrayLength", "args": {"Array": get("r")}},
            ]}},
        }});
        assert_eq!(run(tree).await.unwrap(), Value::Int(6));
    }

    #[tokio::test]
    async fn distinct_by_key_ignoring_case() {
        let tree = json!({"step": "ArrayDistinct", "args": {
            "Array": array(json!(["a", "B", "A", "b", "c"])),
            "IgnoreCase": true,
        }});
        assert_eq!(run(tree).await.unwrap(), Value::from(vec!["a", "B", "c"]));
    }

    #[tokio::test]
    async fn select_many_and_concat_flatten() {
        let select = json!({"step": "ArraySelectMany", "args": {
            "Array": array(json!([1, 2])),
            "Function": {"lambda": "x", "body": {"step": "Array", "args": {"Elements": [get("x"), get("x")]}}},
        }});
        assert_eq!(run(select).await.unwrap(), ints(&[1, 1, 2, 2]));
        let concat = json!({"step": "ArrayConcat", "args": {"Arrays": {"step": "Array", "args": {
            "Elements": [array(json!([1])), array(json!([2, 3]))]}}}});
        assert_eq!(run(concat).await.unwrap(), ints(&[1, 2, 3]));
    }

    #[tokio::test]
    async fn group_by_keeps_first_appearance_order() {
        let tree = json!({"step": "ArrayGroupBy", "args": {
            "Array": array(json!([3, 1, 4, 1, 5, 9, 2, 6])),
            "Function": {"lambda": "n", "body": {"step": "Modulo", "args": {"Terms": [get("n"), 2]}}},
        }});
        let Value::Array(groups) = run(tree).await.unwrap() else { panic!("expected an array") };
        let groups = groups.evaluated_items().cloned().unwrap();
        assert_eq!(groups.len(), 2);
        let first = groups[0].as_entity().unwrap();
        assert_eq!(first.get("Key"), Some(&Value::Int(1)));
        assert_eq!(first.get("Values"), Some(&ints(&[3, 1, 1, 5, 9])));
    }

    #[tokio::test]
    async fn sort_is_stable_and_descending() {
        let tree = json!({"step": "ArraySort", "args": {
            "Array": array(json!(["bb", "a", "cc", "d"])),
            "Descending": true,
            "KeySelector": {"lambda": "s", "body": {"step": "ArrayLength", "args": {
                "Array": {"step": "Array", "args": {"Elements": [get("s")]}}}}},
        }});
        // every key is 1, so descending keeps the original order
        assert_eq!(run(tree).await.unwrap(), Value::from(vec!["bb", "a", "cc", "d"]));
        let plain = json!({"step": "ArraySort", "args": {"Array": array(json!([3, 1, 2]))}});
        assert_eq!(run(plain).await.unwrap(), ints(&[1, 2, 3]));
    }

    #[tokio::test]
    async fn fold_threads_accumulator() {
        let tree = json!({"step": "ArrayFold", "args": {
            "Array": array(json!([1, 2, 3, 4])),
            "Initial": 0,
            "Accumulator": {"var": "acc"},
            "Function": {"lambda": "n", "body": {"step": "Sum", "args": {"Terms": [get("acc"), get("n")]}}},
        }});
        assert_eq!(run(tree).await.unwrap(), Value::Int(10));
    }

    #[tokio::test]
    async fn element_lookups() {
        let at = json!({"step": "ArrayElementAtIndex", "args": {"Array": array(json!([5, 6])), "Index": 1}});
        assert_eq!(run(at).await.unwrap(), Value::Int(6));
        let first = json!({"step": "ArrayFirst", "args": {"Array": array(json!([5, 6]))}});
        assert_eq!(run(first).await.unwrap(), Value::Int(5));
        let last = json!({"step": "ArrayLast", "args": {"Array": array(json!([5, 6]))}});
        assert_eq!(run(last).await.unwrap(), Value::Int(6));
        let empty = json!({"step": "ArrayIsEmpty", "args": {"Array": array(json!([]))}});
        assert_eq!(run(empty).await.unwrap(), Value::Bool(true));
        let reverse = json!({"step": "ArrayReverse", "args": {"Array": array(json!([1, 2]))}});
        assert_eq!(run(reverse).await.unwrap(), ints(&[2, 1]));
    }

    #[test]
    fn nested_automatic_lambdas_are_ambiguous() {
        let tree = json!({"step": "ArrayMap", "args": {
            "Array": {"step": "Array", "args": {"Elements": [array(json!([1]))]}},
            "Function": {"body": {"step": "ArrayMap", "args": {
                "Array": auto(),
                "Function": {"body": auto()},
            }}},
        }});
        let e = freeze(tree).unwrap_err();
        assert!(e.has_code(ErrorCode::AmbiguousAutomaticVariable));
    }
}
