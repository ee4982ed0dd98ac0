//! Runtime values.
//!
//! SCL is statically typed: by the time a step runs, freezing has already
//! proved its inputs have the right shape.  The accessors below still check
//! and report [`ErrorCode::InvalidCast`] instead of panicking, since hosts
//! can hand the engine arbitrary initial variables.

mod array;
mod entity;

pub use array::{
    ArrayCursor, ArraySource, ElementSource, ElementValidator, ErrorBehavior, IterSource,
    LazyArray, OnceSource,
};
pub use entity::{CaseSensitivity, Entity};

use std::cmp::Ordering;
use std::fmt;

use crate::context::RunContext;
use crate::error::{ErrorCode, Result, StructuredError};
use crate::step::BoxFuture;
use crate::types::{ActualType, TypeReference};

// ── EnumValue ─────────────────────────────────────────────────────────────────

/// A member of a named enumeration, written `Type.Variant`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnumValue {
    pub type_name: String,
    pub variant: String,
}

impl EnumValue {
    pub fn new(type_name: impl Into<String>, variant: impl Into<String>) -> Self {
        EnumValue { type_name: type_name.into(), variant: variant.into() }
    }

    /// Parse `Type.Variant`.
    pub fn parse(s: &str) -> Option<Self> {
        let (t, v) = s.split_once('.')?;
        if t.is_empty() || v.is_empty() {
            return None;
        }
        Some(EnumValue::new(t, v))
    }
}

impl fmt::Display for EnumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.type_name, self.variant)
    }
}

// ── Value ─────────────────────────────────────────────────────────────────────

/// An SCL runtime value.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Unit,
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
    Enum(EnumValue),
    Entity(Entity),
    Array(LazyArray),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Unit, Value::Unit) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Enum(a), Value::Enum(b)) => a == b,
            (Value::Entity(a), Value::Entity(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => f.write_str("()"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Double(x) => {
                if x.fract() == 0.0 && x.abs() < 1e15 {
                    write!(f, "{x:.1}")
                } else {
                    write!(f, "{x}")
                }
            }
            Value::Str(s) => f.write_str(s),
            Value::Enum(e) => write!(f, "{e}"),
            Value::Entity(e) => write!(f, "{e}"),
            Value::Array(a) => write!(f, "{a}"),
        }
    }
}

impl Value {
    /// Display form used inside arrays and entities: strings are quoted.
    pub(crate) fn fmt_nested(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{s:?}"),
            other => write!(f, "{other}"),
        }
    }

    /// Name of the value's kind, for messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::Enum(_) => "enum",
            Value::Entity(_) => "entity",
            Value::Array(_) => "array",
        }
    }

    /// The type a host-supplied value has at freeze time.  Arrays are
    /// `array<any>` unless already evaluated and non-empty.
    pub fn type_reference(&self) -> TypeReference {
        match self {
            Value::Unit => TypeReference::UNIT,
            Value::Bool(_) => TypeReference::BOOL,
            Value::Int(_) => TypeReference::INT,
            Value::Double(_) => TypeReference::DOUBLE,
            Value::Str(_) => TypeReference::STRING,
            Value::Enum(e) => TypeReference::Actual(ActualType::Enum(e.type_name.clone())),
            Value::Entity(_) => TypeReference::ENTITY,
            Value::Array(a) => {
                let element = a
                    .evaluated_items()
                    .and_then(|items| items.first().map(Value::type_reference))
                    .unwrap_or(TypeReference::Any);
                TypeReference::array(element)
            }
        }
    }

    fn cast_error(&self, target: &str) -> StructuredError {
        StructuredError::invalid_cast(self.type_name(), target)
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(other.cast_error("bool")),
        }
    }

    pub fn as_int(&self) -> Result<i64> {
        match self {
            Value::Int(n) => Ok(*n),
            other => Err(other.cast_error("int")),
        }
    }

    /// Ints widen to doubles here; the type checker never does it implicitly.
    pub fn as_double(&self) -> Result<f64> {
        match self {
            Value::Int(n) => Ok(*n as f64),
            Value::Double(x) => Ok(*x),
            other => Err(other.cast_error("double")),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(other.cast_error("string")),
        }
    }

    pub fn as_entity(&self) -> Result<&Entity> {
        match self {
            Value::Entity(e) => Ok(e),
            other => Err(other.cast_error("entity")),
        }
    }

    pub fn as_array(&self) -> Result<&LazyArray> {
        match self {
            Value::Array(a) => Ok(a),
            other => Err(other.cast_error("array")),
        }
    }

    pub fn as_enum(&self) -> Result<&EnumValue> {
        match self {
            Value::Enum(e) => Ok(e),
            other => Err(other.cast_error("enum")),
        }
    }

    /// Force every array reachable from this value (through entities and
    /// nested arrays) into its evaluated form.
    pub fn materialize<'a>(self, ctx: &'a RunContext) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            match self {
                Value::Array(array) => {
                    let items = array.to_vec(ctx).await?;
                    let mut out = Vec::with_capacity(items.len());
                    for item in items.iter() {
                        out.push(item.clone().materialize(ctx).await?);
                    }
                    Ok(Value::Array(LazyArray::from_vec(out)))
                }
                Value::Entity(entity) => {
                    let mut out = Vec::with_capacity(entity.len());
                    for (name, value) in entity.iter() {
                        out.push((name.to_owned(), value.clone().materialize(ctx).await?));
                    }
                    Ok(Value::Entity(Entity::new(out)))
                }
                other => Ok(other),
            }
        })
    }

    /// `true` if an unevaluated array is reachable from this value.
    pub fn holds_lazy(&self) -> bool {
        match self {
            Value::Array(a) => a.evaluated_items().map_or(true, |items| items.iter().any(Value::holds_lazy)),
            Value::Entity(e) => e.iter().any(|(_, v)| v.holds_lazy()),
            _ => false,
        }
    }

    /// Materialize this value and compute its structural key.  Returns the
    /// materialized value alongside, so single-pass streams are read once.
    pub async fn keyed(self, case: CaseSensitivity, ctx: &RunContext) -> Result<(Value, ValueKey)> {
        let value = self.materialize(ctx).await?;
        let key = ValueKey::of(&value, case);
        Ok((value, key))
    }

    // ── Arithmetic helpers ────────────────────────────────────────────────────

    /// Determine the common numeric type for a binary operation.
    fn numeric_promote(a: &Value, b: &Value) -> Result<Numeric> {
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => Ok(Numeric::Ints(*x, *y)),
            _ => Ok(Numeric::Doubles(a.as_double()?, b.as_double()?)),
        }
    }

    pub fn arith_add(&self, rhs: &Value) -> Result<Value> {
        Ok(match Self::numeric_promote(self, rhs)? {
            Numeric::Ints(a, b) => Value::Int(a.checked_add(b).ok_or_else(|| overflow(a, "+", b))?),
            Numeric::Doubles(a, b) => Value::Double(a + b),
        })
    }

    pub fn arith_sub(&self, rhs: &Value) -> Result<Value> {
        Ok(match Self::numeric_promote(self, rhs)? {
            Numeric::Ints(a, b) => Value::Int(a.checked_sub(b).ok_or_else(|| overflow(a, "-", b))?),
            Numeric::Doubles(a, b) => Value::Double(a - b),
        })
    }

    pub fn arith_mul(&self, rhs: &Value) -> Result<Value> {
        Ok(match Self::numeric_promote(self, rhs)? {
            Numeric::Ints(a, b) => Value::Int(a.checked_mul(b).ok_or_else(|| overflow(a, "*", b))?),
            Numeric::Doubles(a, b) => Value::Double(a * b),
        })
    }

    pub fn arith_div(&self, rhs: &Value) -> Result<Value> {
        match Self::numeric_promote(self, rhs)? {
            Numeric::Ints(_, 0) => Err(divide_by_zero("division")),
            Numeric::Ints(a, b) => a.checked_div(b).map(Value::Int).ok_or_else(|| overflow(a, "/", b)),
            Numeric::Doubles(_, b) if b == 0.0 => Err(divide_by_zero("division")),
            Numeric::Doubles(a, b) => Ok(Value::Double(a / b)),
        }
    }

    pub fn arith_rem(&self, rhs: &Value) -> Result<Value> {
        match Self::numeric_promote(self, rhs)? {
            Numeric::Ints(_, 0) => Err(divide_by_zero("modulo")),
            Numeric::Ints(a, b) => Ok(Value::Int(a.wrapping_rem(b))),
            Numeric::Doubles(_, b) if b == 0.0 => Err(divide_by_zero("modulo")),
            Numeric::Doubles(a, b) => Ok(Value::Double(a % b)),
        }
    }

    /// Total order used by comparison operators, sorting and grouping.
    ///
    /// Numbers compare numerically across int/double, with NaN above every
    /// other number and equal to itself.  Strings compare lexicographically,
    /// entities property by property.  Lazy arrays must be materialized
    /// first; values of different kinds fall back to their display text.
    pub fn cmp_value(&self, rhs: &Value) -> Ordering {
        match (self, rhs) {
            (Value::Unit, Value::Unit) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Int(_) | Value::Double(_), Value::Int(_) | Value::Double(_)) => {
                let a = self.as_double().unwrap_or_default();
                let b = rhs.as_double().unwrap_or_default();
                a.partial_cmp(&b).unwrap_or_else(|| a.total_cmp(&b))
            }
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Enum(a), Value::Enum(b)) => a.to_string().cmp(&b.to_string()),
            (Value::Entity(a), Value::Entity(b)) => {
                for ((an, av), (bn, bv)) in a.iter().zip(b.iter()) {
                    let ord = an.cmp(bn).then_with(|| av.cmp_value(bv));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Array(a), Value::Array(b)) => match (a.evaluated_items(), b.evaluated_items()) {
                (Some(x), Some(y)) => {
                    for (xv, yv) in x.iter().zip(y.iter()) {
                        let ord = xv.cmp_value(yv);
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                    x.len().cmp(&y.len())
                }
                _ => self.to_string().cmp(&rhs.to_string()),
            },
            _ => self.to_string().cmp(&rhs.to_string()),
        }
    }
}

// ── ValueKey ──────────────────────────────────────────────────────────────────

/// Hashable structural identity of a materialized value, used by distinct
/// and grouping.  Values of different kinds never share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueKey {
    Unit,
    Bool(bool),
    Int(i64),
    /// Bit pattern, with `-0.0` folded into `0.0` and every NaN into one.
    Double(u64),
    Str(String),
    Enum(EnumValue),
    Entity(Vec<(String, ValueKey)>),
    Array(Vec<ValueKey>),
}

impl ValueKey {
    /// Key of an already materialized value.  Only string contents are
    /// case-folded.
    pub fn of(value: &Value, case: CaseSensitivity) -> Self {
        match value {
            Value::Unit => ValueKey::Unit,
            Value::Bool(b) => ValueKey::Bool(*b),
            Value::Int(n) => ValueKey::Int(*n),
            Value::Double(x) => ValueKey::Double(if x.is_nan() {
                f64::NAN.to_bits()
            } else if *x == 0.0 {
                0f64.to_bits()
            } else {
                x.to_bits()
            }),
            Value::Str(s) => ValueKey::Str(case.fold(s)),
            Value::Enum(e) => ValueKey::Enum(e.clone()),
            Value::Entity(e) => ValueKey::Entity(
                e.iter().map(|(n, v)| (n.to_owned(), ValueKey::of(v, case))).collect(),
            ),
            Value::Array(a) => ValueKey::Array(
                a.evaluated_items()
                    .map(|items| items.iter().map(|v| ValueKey::of(v, case)).collect())
                    .unwrap_or_default(),
            ),
        }
    }
}

enum Numeric {
    Ints(i64, i64),
    Doubles(f64, f64),
}

fn overflow(a: i64, op: &str, b: i64) -> StructuredError {
    StructuredError::new(ErrorCode::ArithmeticOverflow, format!("{a} {op} {b} overflows an int"))
}

fn divide_by_zero(what: &str) -> StructuredError {
    StructuredError::new(ErrorCode::DivideByZero, format!("{what} by zero"))
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Double(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<Entity> for Value {
    fn from(e: Entity) -> Self {
        Value::Entity(e)
    }
}

impl From<LazyArray> for Value {
    fn from(a: LazyArray) -> Self {
        Value::Array(a)
    }
}

impl From<EnumValue> for Value {
    fn from(e: EnumValue) -> Self {
        Value::Enum(e)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(LazyArray::from_vec(items.into_iter().map(Into::into).collect()))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
