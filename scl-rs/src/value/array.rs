//! The lazy array/stream engine.
//!
//! A [`LazyArray`] is either evaluated (an `Arc`'d vector, re-iterable for
//! free) or a lazy node: a source or an operator over another array.
//! Operators build new nodes without touching any element; work happens when
//! an [`ArrayCursor`] is pulled.
//!
//! Re-iterating a lazy array re-runs its source when the source is
//! re-runnable (`Range`) and fails with `StreamConsumed` when it is single
//! pass (`ReadLines`).  Element failures are returned from
//! [`ArrayCursor::next`] and end the cursor: the error is the pipeline's
//! terminal result.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::context::RunContext;
use crate::error::{ErrorCode, Result, StructuredError};
use crate::scope::Disposable;
use crate::step::{BoxFuture, Lambda};

use super::{CaseSensitivity, Entity, EnumValue, Value, ValueKey};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poison| poison.into_inner())
}

// ── ErrorBehavior ─────────────────────────────────────────────────────────────

/// What a validating array does with an element that fails validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorBehavior {
    /// Raise one error listing every violation in the array.
    #[default]
    Fail,
    /// Log an error and drop the element.
    Error,
    /// Log a warning and keep the element.
    Warning,
    /// Drop the element silently.
    Skip,
    /// Keep the element silently.
    Ignore,
}

impl ErrorBehavior {
    pub const TYPE_NAME: &'static str = "ErrorBehavior";

    pub const ALL: [ErrorBehavior; 5] = [
        ErrorBehavior::Fail,
        ErrorBehavior::Error,
        ErrorBehavior::Warning,
        ErrorBehavior::Skip,
        ErrorBehavior::Ignore,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorBehavior::Fail => "Fail",
            ErrorBehavior::Error => "Error",
            ErrorBehavior::Warning => "Warning",
            ErrorBehavior::Skip => "Skip",
            ErrorBehavior::Ignore => "Ignore",
        }
    }

    pub fn from_enum(value: &EnumValue) -> Result<Self> {
        if value.type_name == Self::TYPE_NAME {
            if let Some(b) = Self::ALL.into_iter().find(|b| b.as_str() == value.variant) {
                return Ok(b);
            }
        }
        Err(StructuredError::invalid_cast(value, Self::TYPE_NAME))
    }

    pub fn to_enum(self) -> EnumValue {
        EnumValue::new(Self::TYPE_NAME, self.as_str())
    }
}

// ── Sources ───────────────────────────────────────────────────────────────────

/// Produces the elements at the bottom of a lazy pipeline.
pub trait ElementSource: Send {
    fn next<'a>(&'a mut self, ctx: &'a RunContext) -> BoxFuture<'a, Result<Option<Value>>>;
}

/// An in-memory iterator as a source.
pub struct IterSource<I>(I);

impl<I> IterSource<I> {
    pub fn new(iter: I) -> Self {
        IterSource(iter)
    }
}

impl<I: Iterator<Item = Value> + Send> ElementSource for IterSource<I> {
    fn next<'a>(&'a mut self, _ctx: &'a RunContext) -> BoxFuture<'a, Result<Option<Value>>> {
        let item = self.0.next();
        Box::pin(async move { Ok(item) })
    }
}

/// Checks elements of a validating array.
pub trait ElementValidator: Send + Sync + fmt::Debug {
    /// Violation messages for `element`; empty when it is valid.
    fn violations(&self, element: &Value) -> Vec<String>;
}

type SourceFactory = Arc<dyn Fn() -> Box<dyn ElementSource> + Send + Sync>;

#[derive(Clone)]
pub enum ArraySource {
    /// Opened afresh for every cursor.
    Rerunnable { description: String, open: SourceFactory },
    /// Can be read by exactly one cursor.
    Once(Arc<OnceSource>),
}

impl fmt::Debug for ArraySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArraySource::Rerunnable { description, .. } => {
                f.debug_tuple("Rerunnable").field(description).finish()
            }
            ArraySource::Once(once) => f.debug_tuple("Once").field(once).finish(),
        }
    }
}

/// A single-pass source, owned by the scope that opened it.
pub struct OnceSource {
    description: String,
    source: Mutex<Option<Box<dyn ElementSource>>>,
    disposed: AtomicBool,
}

impl OnceSource {
    pub fn new(description: impl Into<String>, source: Box<dyn ElementSource>) -> Arc<Self> {
        Arc::new(OnceSource {
            description: description.into(),
            source: Mutex::new(Some(source)),
            disposed: AtomicBool::new(false),
        })
    }

    fn take(&self) -> Result<Box<dyn ElementSource>> {
        if let Some(source) = lock(&self.source).take() {
            return Ok(source);
        }
        if self.disposed.load(Ordering::Acquire) {
            Err(StructuredError::new(
                ErrorCode::ScopeDisposed,
                format!("{} was closed when its scope ended", self.description),
            ))
        } else {
            Err(StructuredError::new(
                ErrorCode::StreamConsumed,
                format!("{} has already been read; evaluate it to read it twice", self.description),
            ))
        }
    }
}

impl fmt::Debug for OnceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnceSource").field("description", &self.description).finish()
    }
}

impl Disposable for OnceSource {
    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        if lock(&self.source).take().is_some() {
            tracing::debug!(source = %self.description, "closed unread stream");
        }
    }
}

// ── LazyArray ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum LazyNode {
    Source(ArraySource),
    Map { source: LazyArray, f: Lambda },
    Filter { source: LazyArray, predicate: Lambda },
    FlatMap { source: LazyArray, f: Lambda },
    Distinct { source: LazyArray, key: Option<Lambda>, case: CaseSensitivity },
    Concat { arrays: LazyArray },
    Skip { source: LazyArray, count: usize },
    Take { source: LazyArray, count: usize },
    Validate { source: LazyArray, validator: Arc<dyn ElementValidator>, behavior: ErrorBehavior },
}

#[derive(Debug, Clone)]
enum Repr {
    Evaluated(Arc<Vec<Value>>),
    Lazy(Arc<LazyNode>),
}

/// An array value: evaluated, or a deferred pipeline.
#[derive(Debug, Clone)]
pub struct LazyArray(Repr);

impl PartialEq for LazyArray {
    /// Evaluated arrays compare by elements; lazy ones by identity.  Steps
    /// that compare contents materialize both sides first.
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (Repr::Evaluated(a), Repr::Evaluated(b)) => a == b,
            (Repr::Lazy(a), Repr::Lazy(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for LazyArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Repr::Evaluated(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    item.fmt_nested(f)?;
                }
                f.write_str("]")
            }
            Repr::Lazy(_) => f.write_str("[...]"),
        }
    }
}

impl Default for LazyArray {
    fn default() -> Self {
        LazyArray::from_vec(Vec::new())
    }
}

impl LazyArray {
    pub fn from_vec(items: Vec<Value>) -> Self {
        LazyArray(Repr::Evaluated(Arc::new(items)))
    }

    fn lazy(node: LazyNode) -> Self {
        LazyArray(Repr::Lazy(Arc::new(node)))
    }

    /// A source that is opened again for every iteration.
    pub fn rerunnable<F>(description: impl Into<String>, open: F) -> Self
    where
        F: Fn() -> Box<dyn ElementSource> + Send + Sync + 'static,
    {
        Self::lazy(LazyNode::Source(ArraySource::Rerunnable {
            description: description.into(),
            open: Arc::new(open),
        }))
    }

    /// A single-pass source.
    pub fn once(source: Arc<OnceSource>) -> Self {
        Self::lazy(LazyNode::Source(ArraySource::Once(source)))
    }

    pub fn is_evaluated(&self) -> bool {
        matches!(self.0, Repr::Evaluated(_))
    }

    pub fn evaluated_items(&self) -> Option<&Arc<Vec<Value>>> {
        match &self.0 {
            Repr::Evaluated(items) => Some(items),
            Repr::Lazy(_) => None,
        }
    }

    /// The disposable resource behind a single-pass source array.
    pub fn resource(&self) -> Option<Arc<dyn Disposable>> {
        match &self.0 {
            Repr::Lazy(node) => match node.as_ref() {
                LazyNode::Source(ArraySource::Once(once)) => {
                    Some(once.clone() as Arc<dyn Disposable>)
                }
                _ => None,
            },
            Repr::Evaluated(_) => None,
        }
    }

    // ── Lazy operators ────────────────────────────────────────────────────────

    pub fn map(&self, f: Lambda) -> Self {
        Self::lazy(LazyNode::Map { source: self.clone(), f })
    }

    pub fn filter(&self, predicate: Lambda) -> Self {
        Self::lazy(LazyNode::Filter { source: self.clone(), predicate })
    }

    /// `f` must return an array for each element; the results are flattened.
    pub fn flat_map(&self, f: Lambda) -> Self {
        Self::lazy(LazyNode::FlatMap { source: self.clone(), f })
    }

    /// Keep the first element for each key.  Keys are materialized and
    /// compared by structure, with strings case-folded when `case` is
    /// insensitive.  Without a key selector the surviving elements come out
    /// materialized.
    pub fn distinct(&self, key: Option<Lambda>, case: CaseSensitivity) -> Self {
        Self::lazy(LazyNode::Distinct { source: self.clone(), key, case })
    }

    /// Flatten an array of arrays.
    pub fn concat(arrays: LazyArray) -> Self {
        Self::lazy(LazyNode::Concat { arrays })
    }

    pub fn skip(&self, count: usize) -> Self {
        match &self.0 {
            Repr::Evaluated(items) => {
                Self::from_vec(items.iter().skip(count).cloned().collect())
            }
            Repr::Lazy(_) => Self::lazy(LazyNode::Skip { source: self.clone(), count }),
        }
    }

    pub fn take(&self, count: usize) -> Self {
        match &self.0 {
            Repr::Evaluated(items) => {
                Self::from_vec(items.iter().take(count).cloned().collect())
            }
            Repr::Lazy(_) => Self::lazy(LazyNode::Take { source: self.clone(), count }),
        }
    }

    pub fn validate(&self, validator: Arc<dyn ElementValidator>, behavior: ErrorBehavior) -> Self {
        Self::lazy(LazyNode::Validate { source: self.clone(), validator, behavior })
    }

    /// Start an iteration.  Fails for a single-pass source read before.
    pub fn cursor(&self) -> Result<ArrayCursor> {
        let state = match &self.0 {
            Repr::Evaluated(items) => CursorState::Evaluated { items: items.clone(), index: 0 },
            Repr::Lazy(node) => match node.as_ref() {
                LazyNode::Source(ArraySource::Rerunnable { open, .. }) => {
                    CursorState::Source(open())
                }
                LazyNode::Source(ArraySource::Once(once)) => CursorState::Source(once.take()?),
                LazyNode::Map { source, f } => {
                    CursorState::Map { inner: Box::new(source.cursor()?), f: f.clone() }
                }
                LazyNode::Filter { source, predicate } => CursorState::Filter {
                    inner: Box::new(source.cursor()?),
                    predicate: predicate.clone(),
                },
                LazyNode::FlatMap { source, f } => CursorState::FlatMap {
                    inner: Box::new(source.cursor()?),
                    f: f.clone(),
                    current: None,
                },
                LazyNode::Distinct { source, key, case } => CursorState::Distinct {
                    inner: Box::new(source.cursor()?),
                    key: key.clone(),
                    case: *case,
                    seen: HashSet::new(),
                },
                LazyNode::Concat { arrays } => {
                    CursorState::Concat { outer: Box::new(arrays.cursor()?), current: None }
                }
                LazyNode::Skip { source, count } => {
                    CursorState::Skip { inner: Box::new(source.cursor()?), remaining: *count }
                }
                LazyNode::Take { source, count } => {
                    CursorState::Take { inner: Box::new(source.cursor()?), remaining: *count }
                }
                LazyNode::Validate { source, validator, behavior: ErrorBehavior::Fail } => {
                    CursorState::ValidateAll {
                        inner: Box::new(source.cursor()?),
                        validator: validator.clone(),
                        checked: None,
                    }
                }
                LazyNode::Validate { source, validator, behavior } => CursorState::Validate {
                    inner: Box::new(source.cursor()?),
                    validator: validator.clone(),
                    behavior: *behavior,
                    index: 0,
                },
            },
        };
        Ok(ArrayCursor { state })
    }

    // ── Eager operations ──────────────────────────────────────────────────────

    /// All elements, pulling the pipeline once if it is lazy.
    pub async fn to_vec(&self, ctx: &RunContext) -> Result<Arc<Vec<Value>>> {
        if let Repr::Evaluated(items) = &self.0 {
            return Ok(items.clone());
        }
        let mut cursor = self.cursor()?;
        let mut out = Vec::new();
        while let Some(item) = cursor.next(ctx).await? {
            out.push(item);
        }
        Ok(Arc::new(out))
    }

    /// The evaluated, re-iterable form of this array.
    pub async fn evaluate(&self, ctx: &RunContext) -> Result<LazyArray> {
        Ok(LazyArray(Repr::Evaluated(self.to_vec(ctx).await?)))
    }

    pub async fn len(&self, ctx: &RunContext) -> Result<usize> {
        Ok(self.to_vec(ctx).await?.len())
    }

    pub async fn element_at(&self, index: i64, ctx: &RunContext) -> Result<Value> {
        let items = self.to_vec(ctx).await?;
        usize::try_from(index)
            .ok()
            .and_then(|i| items.get(i).cloned())
            .ok_or_else(|| StructuredError::index_out_of_bounds(index, items.len()))
    }

    pub async fn first(&self, ctx: &RunContext) -> Result<Value> {
        let mut cursor = self.cursor()?;
        cursor
            .next(ctx)
            .await?
            .ok_or_else(|| StructuredError::index_out_of_bounds(0, 0))
    }

    pub async fn last(&self, ctx: &RunContext) -> Result<Value> {
        let items = self.to_vec(ctx).await?;
        items
            .last()
            .cloned()
            .ok_or_else(|| StructuredError::index_out_of_bounds(-1, 0))
    }

    /// Index of the first element equal to `needle`, or -1.  Array elements
    /// are compared by contents.
    pub async fn find(&self, needle: &Value, ctx: &RunContext) -> Result<i64> {
        let needle = needle.clone().materialize(ctx).await?;
        let mut cursor = self.cursor()?;
        let mut index = 0i64;
        while let Some(item) = cursor.next(ctx).await? {
            if item.materialize(ctx).await? == needle {
                return Ok(index);
            }
            index += 1;
        }
        Ok(-1)
    }

    pub async fn reverse(&self, ctx: &RunContext) -> Result<LazyArray> {
        let items = self.to_vec(ctx).await?;
        Ok(LazyArray::from_vec(items.iter().rev().cloned().collect()))
    }

    /// Stable sort by `key` (or the element itself), compared after
    /// materializing.
    pub async fn sort(
        &self,
        key: Option<&Lambda>,
        descending: bool,
        ctx: &RunContext,
    ) -> Result<LazyArray> {
        let items = self.to_vec(ctx).await?;
        let mut keyed = Vec::with_capacity(items.len());
        for item in items.iter() {
            let entry = match key {
                Some(f) => (f.invoke(item.clone(), ctx).await?.materialize(ctx).await?, item.clone()),
                None => {
                    let item = item.clone().materialize(ctx).await?;
                    (item.clone(), item)
                }
            };
            keyed.push(entry);
        }
        keyed.sort_by(|a, b| {
            let ord = a.0.cmp_value(&b.0);
            if descending {
                ord.reverse()
            } else {
                ord
            }
        });
        Ok(LazyArray::from_vec(keyed.into_iter().map(|(_, v)| v).collect()))
    }

    /// Group elements by `key`.  Groups appear in order of their key's first
    /// occurrence; each group keeps the original element order.  The result
    /// is an array of `('Key': k 'Values': [...])` entities.
    pub async fn group_by(&self, key: &Lambda, ctx: &RunContext) -> Result<LazyArray> {
        let items = self.to_vec(ctx).await?;
        let mut slots: HashMap<ValueKey, usize> = HashMap::new();
        let mut groups: Vec<(Value, Vec<Value>)> = Vec::new();
        for item in items.iter() {
            let (k, identity) =
                key.invoke(item.clone(), ctx).await?.keyed(CaseSensitivity::Sensitive, ctx).await?;
            let slot = match slots.get(&identity) {
                Some(&slot) => slot,
                None => {
                    groups.push((k, Vec::new()));
                    slots.insert(identity, groups.len() - 1);
                    groups.len() - 1
                }
            };
            groups[slot].1.push(item.clone());
        }
        Ok(LazyArray::from_vec(
            groups
                .into_iter()
                .map(|(k, values)| {
                    Value::Entity(Entity::new([
                        ("Key".to_owned(), k),
                        ("Values".to_owned(), Value::Array(LazyArray::from_vec(values))),
                    ]))
                })
                .collect(),
        ))
    }
}

// ── ArrayCursor ───────────────────────────────────────────────────────────────

enum CursorState {
    Done,
    Evaluated { items: Arc<Vec<Value>>, index: usize },
    Source(Box<dyn ElementSource>),
    Map { inner: Box<ArrayCursor>, f: Lambda },
    Filter { inner: Box<ArrayCursor>, predicate: Lambda },
    FlatMap { inner: Box<ArrayCursor>, f: Lambda, current: Option<Box<ArrayCursor>> },
    Distinct {
        inner: Box<ArrayCursor>,
        key: Option<Lambda>,
        case: CaseSensitivity,
        seen: HashSet<ValueKey>,
    },
    Concat { outer: Box<ArrayCursor>, current: Option<Box<ArrayCursor>> },
    Skip { inner: Box<ArrayCursor>, remaining: usize },
    Take { inner: Box<ArrayCursor>, remaining: usize },
    /// `ErrorBehavior::Fail`: the whole input is checked before the first
    /// element is released.
    ValidateAll {
        inner: Box<ArrayCursor>,
        validator: Arc<dyn ElementValidator>,
        checked: Option<std::vec::IntoIter<Value>>,
    },
    Validate {
        inner: Box<ArrayCursor>,
        validator: Arc<dyn ElementValidator>,
        behavior: ErrorBehavior,
        index: usize,
    },
}

/// One pass over a [`LazyArray`].
pub struct ArrayCursor {
    state: CursorState,
}

impl fmt::Debug for ArrayCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ArrayCursor")
    }
}

impl ArrayCursor {
    /// The next element, `None` at the end.  Every call checks cancellation
    /// first and fails with `Cancelled` once the token has fired.  Otherwise,
    /// after an error or the end, further calls return `Ok(None)`.
    pub fn next<'a>(&'a mut self, ctx: &'a RunContext) -> BoxFuture<'a, Result<Option<Value>>> {
        Box::pin(async move {
            if let Err(e) = ctx.check_cancelled() {
                self.state = CursorState::Done;
                return Err(e);
            }
            let result = self.advance(ctx).await;
            if !matches!(result, Ok(Some(_))) {
                self.state = CursorState::Done;
            }
            result
        })
    }

    async fn advance(&mut self, ctx: &RunContext) -> Result<Option<Value>> {
        match &mut self.state {
            CursorState::Done => Ok(None),
            CursorState::Evaluated { items, index } => {
                let item = items.get(*index).cloned();
                *index += 1;
                Ok(item)
            }
            CursorState::Source(source) => source.next(ctx).await,
            CursorState::Map { inner, f } => match inner.next(ctx).await? {
                Some(item) => Ok(Some(f.invoke(item, ctx).await?)),
                None => Ok(None),
            },
            CursorState::Filter { inner, predicate } => loop {
                let Some(item) = inner.next(ctx).await? else {
                    return Ok(None);
                };
                if predicate.invoke(item.clone(), ctx).await?.as_bool()? {
                    return Ok(Some(item));
                }
            },
            CursorState::FlatMap { inner, f, current } => loop {
                if let Some(cursor) = current.as_mut() {
                    if let Some(item) = cursor.next(ctx).await? {
                        return Ok(Some(item));
                    }
                }
                let Some(item) = inner.next(ctx).await? else {
                    return Ok(None);
                };
                let produced = f.invoke(item, ctx).await?;
                *current = Some(Box::new(produced.as_array()?.cursor()?));
            },
            CursorState::Distinct { inner, key, case, seen } => loop {
                let Some(item) = inner.next(ctx).await? else {
                    return Ok(None);
                };
                let (item, k) = match key {
                    Some(f) => {
                        let (_, k) = f.invoke(item.clone(), ctx).await?.keyed(*case, ctx).await?;
                        (item, k)
                    }
                    None => item.keyed(*case, ctx).await?,
                };
                if seen.insert(k) {
                    return Ok(Some(item));
                }
            },
            CursorState::Concat { outer, current } => loop {
                if let Some(cursor) = current.as_mut() {
                    if let Some(item) = cursor.next(ctx).await? {
                        return Ok(Some(item));
                    }
                }
                let Some(next) = outer.next(ctx).await? else {
                    return Ok(None);
                };
                *current = Some(Box::new(next.as_array()?.cursor()?));
            },
            CursorState::Skip { inner, remaining } => {
                while *remaining > 0 {
                    *remaining -= 1;
                    if inner.next(ctx).await?.is_none() {
                        return Ok(None);
                    }
                }
                inner.next(ctx).await
            }
            CursorState::Take { inner, remaining } => {
                if *remaining == 0 {
                    return Ok(None);
                }
                *remaining -= 1;
                inner.next(ctx).await
            }
            CursorState::ValidateAll { inner, validator, checked } => {
                if checked.is_none() {
                    let mut items = Vec::new();
                    let mut errors = Vec::new();
                    while let Some(item) = inner.next(ctx).await? {
                        for message in validator.violations(&item) {
                            errors.push(violation(items.len(), &message));
                        }
                        items.push(item);
                    }
                    if let Some(e) = StructuredError::combine(errors) {
                        return Err(e);
                    }
                    *checked = Some(items.into_iter());
                }
                Ok(checked.as_mut().and_then(Iterator::next))
            }
            CursorState::Validate { inner, validator, behavior, index } => loop {
                let Some(item) = inner.next(ctx).await? else {
                    return Ok(None);
                };
                let position = *index;
                *index += 1;
                let violations = validator.violations(&item);
                if violations.is_empty() {
                    return Ok(Some(item));
                }
                let message = format!("element {position}: {}", violations.join("; "));
                match behavior {
                    ErrorBehavior::Fail | ErrorBehavior::Error => ctx.diagnostics().error(message),
                    ErrorBehavior::Warning => {
                        ctx.diagnostics().warning(message);
                        return Ok(Some(item));
                    }
                    ErrorBehavior::Skip => {}
                    ErrorBehavior::Ignore => return Ok(Some(item)),
                }
            },
        }
    }
}

fn violation(index: usize, message: &str) -> StructuredError {
    StructuredError::new(ErrorCode::SchemaViolation, format!("element {index}: {message}"))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
