//! Structured errors shared by the freezing and execution phases.
//!
//! Every failure the engine reports is a [`StructuredError`]: either a single
//! [`SingleError`] or a flat aggregate of them.  Aggregates never nest:
//! [`StructuredError::combine`] flattens its inputs, so combining is
//! associative and two aggregates compare equal whenever they list the same
//! errors in the same order.
//!
//! Locations are attached on the way up the step tree by
//! [`StructuredError::with_location`], which only fills in errors that do not
//! have one yet: the innermost step that failed is the one reported.

use std::fmt;

use itertools::Itertools;
use thiserror::Error;

// ── ErrorCode ─────────────────────────────────────────────────────────────────

/// The closed set of error kinds the engine can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorCode {
    // Freezing (type) errors.
    WrongType,
    ConflictingTypes,
    CannotInferType,
    AutomaticVariableNotSet,
    AmbiguousAutomaticVariable,
    UndeclaredVariable,
    UnresolvableVariable,
    UnknownStep,
    MissingParameter,
    UnexpectedParameter,
    InvalidTree,

    // Runtime errors.
    MissingVariable,
    MissingProperty,
    IndexOutOfBounds,
    DivideByZero,
    ArithmeticOverflow,
    InvalidCast,
    AssertionFailed,
    ExternalFailure,
    StreamConsumed,
    ScopeDisposed,
    SchemaViolation,
    Cancelled,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::WrongType => "WrongType",
            ErrorCode::ConflictingTypes => "ConflictingTypes",
            ErrorCode::CannotInferType => "CannotInferType",
            ErrorCode::AutomaticVariableNotSet => "AutomaticVariableNotSet",
            ErrorCode::AmbiguousAutomaticVariable => "AmbiguousAutomaticVariable",
            ErrorCode::UndeclaredVariable => "UndeclaredVariable",
            ErrorCode::UnresolvableVariable => "UnresolvableVariable",
            ErrorCode::UnknownStep => "UnknownStep",
            ErrorCode::MissingParameter => "MissingParameter",
            ErrorCode::UnexpectedParameter => "UnexpectedParameter",
            ErrorCode::InvalidTree => "InvalidTree",
            ErrorCode::MissingVariable => "MissingVariable",
            ErrorCode::MissingProperty => "MissingProperty",
            ErrorCode::IndexOutOfBounds => "IndexOutOfBounds",
            ErrorCode::DivideByZero => "DivideByZero",
            ErrorCode::ArithmeticOverflow => "ArithmeticOverflow",
            ErrorCode::InvalidCast => "InvalidCast",
            ErrorCode::AssertionFailed => "AssertionFailed",
            ErrorCode::ExternalFailure => "ExternalFailure",
            ErrorCode::StreamConsumed => "StreamConsumed",
            ErrorCode::ScopeDisposed => "ScopeDisposed",
            ErrorCode::SchemaViolation => "SchemaViolation",
            ErrorCode::Cancelled => "Cancelled",
        }
    }

    /// `true` for errors raised while freezing (type resolution).
    pub fn is_type_error(self) -> bool {
        matches!(
            self,
            ErrorCode::WrongType
                | ErrorCode::ConflictingTypes
                | ErrorCode::CannotInferType
                | ErrorCode::AutomaticVariableNotSet
                | ErrorCode::AmbiguousAutomaticVariable
                | ErrorCode::UndeclaredVariable
                | ErrorCode::UnresolvableVariable
                | ErrorCode::UnknownStep
                | ErrorCode::MissingParameter
                | ErrorCode::UnexpectedParameter
                | ErrorCode::InvalidTree
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── ErrorLocation ─────────────────────────────────────────────────────────────

/// Line/column of a step in its source text, when the parser supplied one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TextPosition {
    pub line: usize,
    pub column: usize,
}

/// Which step failed, and where it sits in the tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ErrorLocation {
    /// Step kind, e.g. `ArrayMap`.
    pub step: String,
    /// Tree path from the root, e.g. `Sequence.InitialSteps[1].ArrayMap.Function`.
    pub path: String,
    pub position: Option<TextPosition>,
}

impl ErrorLocation {
    pub fn new(step: impl Into<String>, path: impl Into<String>) -> Self {
        Self { step: step.into(), path: path.into(), position: None }
    }

    pub fn with_position(mut self, position: Option<TextPosition>) -> Self {
        self.position = position;
        self
    }
}

impl fmt::Display for ErrorLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.step, self.path)?;
        if let Some(pos) = self.position {
            write!(f, " (line {}, column {})", pos.line, pos.column)?;
        }
        Ok(())
    }
}

// ── SingleError ───────────────────────────────────────────────────────────────

/// One located error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}{}", location_suffix(.location))]
pub struct SingleError {
    pub code: ErrorCode,
    pub message: String,
    pub location: Option<ErrorLocation>,
}

impl SingleError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), location: None }
    }

    /// `CODE: message (Step at path)`; the location suffix is omitted when
    /// the error was never located.
    pub fn user_message(&self) -> String {
        self.to_string()
    }
}

fn location_suffix(location: &Option<ErrorLocation>) -> String {
    match location {
        Some(loc) => format!(" ({loc})"),
        None => String::new(),
    }
}

fn render_all(errors: &[SingleError]) -> String {
    errors.iter().map(SingleError::user_message).join("\n")
}

// ── StructuredError ───────────────────────────────────────────────────────────

/// An error produced anywhere in the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuredError {
    #[error("{0}")]
    Single(SingleError),
    #[error("{}", render_all(.0))]
    Aggregate(Vec<SingleError>),
}

pub type Result<T, E = StructuredError> = std::result::Result<T, E>;

impl From<SingleError> for StructuredError {
    fn from(e: SingleError) -> Self {
        StructuredError::Single(e)
    }
}

impl StructuredError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        StructuredError::Single(SingleError::new(code, message))
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "execution was cancelled")
    }

    pub fn wrong_type(expected: impl fmt::Display, actual: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::WrongType,
            format!("expected {expected} but found {actual}"),
        )
    }

    pub fn missing_variable(name: impl fmt::Display) -> Self {
        Self::new(ErrorCode::MissingVariable, format!("variable {name} has not been set"))
    }

    pub fn index_out_of_bounds(index: i64, length: usize) -> Self {
        Self::new(
            ErrorCode::IndexOutOfBounds,
            format!("index {index} is outside an array of length {length}"),
        )
    }

    pub fn invalid_cast(value: impl fmt::Display, target: impl fmt::Display) -> Self {
        Self::new(ErrorCode::InvalidCast, format!("could not convert '{value}' to {target}"))
    }

    /// Merge errors into one, flattening any aggregates among them.
    ///
    /// Returns `None` for an empty input.  A single surviving error is
    /// returned as [`StructuredError::Single`].
    pub fn combine(errors: impl IntoIterator<Item = StructuredError>) -> Option<Self> {
        let mut flat: Vec<SingleError> = errors.into_iter().flat_map(|e| e.into_errors()).collect();
        match flat.len() {
            0 => None,
            1 => flat.pop().map(StructuredError::Single),
            _ => Some(StructuredError::Aggregate(flat)),
        }
    }

    /// Attach `location` to every contained error that has none yet.
    pub fn with_location(self, location: &ErrorLocation) -> Self {
        let fill = |mut e: SingleError| {
            if e.location.is_none() {
                e.location = Some(location.clone());
            }
            e
        };
        match self {
            StructuredError::Single(e) => StructuredError::Single(fill(e)),
            StructuredError::Aggregate(es) => {
                StructuredError::Aggregate(es.into_iter().map(fill).collect())
            }
        }
    }

    pub fn errors(&self) -> &[SingleError] {
        match self {
            StructuredError::Single(e) => std::slice::from_ref(e),
            StructuredError::Aggregate(es) => es,
        }
    }

    pub fn into_errors(self) -> Vec<SingleError> {
        match self {
            StructuredError::Single(e) => vec![e],
            StructuredError::Aggregate(es) => es,
        }
    }

    /// The code of a single error; `None` for aggregates.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            StructuredError::Single(e) => Some(e.code),
            StructuredError::Aggregate(_) => None,
        }
    }

    pub fn has_code(&self, code: ErrorCode) -> bool {
        self.errors().iter().any(|e| e.code == code)
    }

    /// Host-requested shutdown; generic recovery steps must not swallow it.
    pub fn is_cancellation(&self) -> bool {
        self.has_code(ErrorCode::Cancelled)
    }

    /// Deterministic rendering, one line per contained error.
    pub fn as_user_message(&self) -> String {
        self.errors().iter().map(SingleError::user_message).join("\n")
    }
}

/// Evaluate every result, returning all values or every error combined.
///
/// Used by steps whose children are independent, so a single run reports
/// all of their failures instead of the first one.
pub fn collect_all<T>(results: impl IntoIterator<Item = Result<T>>) -> Result<Vec<T>> {
    let mut values = Vec::new();
    let mut errors = Vec::new();
    for r in results {
        match r {
            Ok(v) => values.push(v),
            Err(e) => errors.push(e),
        }
    }
    match StructuredError::combine(errors) {
        Some(e) => Err(e),
        None => Ok(values),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn err(code: ErrorCode, msg: &str) -> StructuredError {
        StructuredError::new(code, msg)
    }

    #[test]
    fn combine_flattens_aggregates() {
        let a = err(ErrorCode::WrongType, "a");
        let b = err(ErrorCode::DivideByZero, "b");
        let c = err(ErrorCode::MissingVariable, "c");
        let nested = StructuredError::combine([a.clone(), b.clone()]).unwrap();
        let left = StructuredError::combine([nested, c.clone()]).unwrap();
        let flat = StructuredError::combine([a, b, c]).unwrap();
        assert_eq!(left, flat);
        assert_eq!(flat.errors().len(), 3);
    }

    #[test]
    fn combine_single_and_empty() {
        assert!(StructuredError::combine(Vec::new()).is_none());
        let one = StructuredError::combine([err(ErrorCode::WrongType, "x")]).unwrap();
        assert_eq!(one.code(), Some(ErrorCode::WrongType));
    }

    #[test]
    fn innermost_location_wins() {
        let inner = ErrorLocation::new("ArrayMap", "Sequence.FinalStep");
        let outer = ErrorLocation::new("Sequence", "Sequence");
        let e = err(ErrorCode::DivideByZero, "boom")
            .with_location(&inner)
            .with_location(&outer);
        assert_eq!(e.errors()[0].location.as_ref(), Some(&inner));
    }

    #[test]
    fn location_fills_only_missing_entries() {
        let inner = ErrorLocation::new("Divide", "root.Terms[0]");
        let outer = ErrorLocation::new("Array", "root");
        let located = err(ErrorCode::DivideByZero, "a").with_location(&inner);
        let bare = err(ErrorCode::WrongType, "b");
        let agg = StructuredError::combine([located, bare]).unwrap().with_location(&outer);
        let locs: Vec<_> = agg.errors().iter().map(|e| e.location.clone().unwrap()).collect();
        assert_eq!(locs, vec![inner, outer]);
    }

    #[test]
    fn user_message_is_stable() {
        let e = StructuredError::combine([
            err(ErrorCode::DivideByZero, "attempted to divide by zero")
                .with_location(&ErrorLocation::new("Divide", "Sequence.FinalStep")),
            err(ErrorCode::Cancelled, "execution was cancelled"),
        ])
        .unwrap();
        assert_eq!(
            e.as_user_message(),
            "DivideByZero: attempted to divide by zero (Divide at Sequence.FinalStep)\n\
             Cancelled: execution was cancelled"
        );
        assert_eq!(e.to_string(), e.as_user_message());
    }

    #[test]
    fn cancellation_detected_inside_aggregate() {
        let e = StructuredError::combine([
            err(ErrorCode::WrongType, "x"),
            StructuredError::cancelled(),
        ])
        .unwrap();
        assert!(e.is_cancellation());
        assert!(!err(ErrorCode::AssertionFailed, "y").is_cancellation());
    }

    #[test]
    fn collect_all_reports_every_failure() {
        let results = vec![
            Ok(1),
            Err(err(ErrorCode::WrongType, "first")),
            Ok(2),
            Err(err(ErrorCode::InvalidCast, "second")),
        ];
        let e = collect_all(results).unwrap_err();
        assert_eq!(e.errors().len(), 2);
        assert_eq!(collect_all(vec![Ok::<_, StructuredError>(1), Ok(2)]).unwrap(), vec![1, 2]);
    }

    #[test]
    fn type_error_classification() {
        assert!(ErrorCode::ConflictingTypes.is_type_error());
        assert!(!ErrorCode::IndexOutOfBounds.is_type_error());
    }
}
