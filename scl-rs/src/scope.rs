//! The scoped variable environment.
//!
//! A [`Scope`] is one frame in a chain of frames.  Reads walk outward to the
//! nearest binding; writes go to the nearest frame that already holds the
//! name, or to the current frame if none does.  Lambda and loop bodies run in
//! child frames and bind their item with [`Scope::declare`], which always
//! shadows instead of writing through.
//!
//! Frames own disposable resources (open streams).  A frame is disposed
//! exactly once: when its [`ScopeGuard`] drops, or explicitly with
//! [`Scope::dispose`].  Bindings stay readable afterwards so lazy values that
//! captured the frame can still see them; only resources are released.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{ErrorCode, Result, StructuredError};
use crate::types::VariableName;
use crate::value::Value;

/// A resource released when the frame that owns it is torn down.
pub trait Disposable: Send + Sync + fmt::Debug {
    fn dispose(&self);
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding a frame lock leaves the map intact.
    m.lock().unwrap_or_else(|poison| poison.into_inner())
}

fn same_resource(a: &Arc<dyn Disposable>, b: &Arc<dyn Disposable>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[derive(Debug)]
struct Frame {
    parent: Option<Scope>,
    depth: usize,
    bindings: Mutex<HashMap<VariableName, Value>>,
    automatic: Mutex<Option<Value>>,
    owned: Mutex<Vec<Arc<dyn Disposable>>>,
    disposed: AtomicBool,
}

/// Handle to one frame.  Clones refer to the same frame.
#[derive(Debug, Clone)]
pub struct Scope(Arc<Frame>);

impl Scope {
    pub fn root() -> Self {
        Scope(Arc::new(Frame {
            parent: None,
            depth: 0,
            bindings: Mutex::new(HashMap::new()),
            automatic: Mutex::new(None),
            owned: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        }))
    }

    /// A root frame pre-populated with `variables`.
    pub fn with_variables(variables: impl IntoIterator<Item = (VariableName, Value)>) -> Self {
        let scope = Scope::root();
        lock(&scope.0.bindings).extend(variables);
        scope
    }

    /// Open a child frame.  It is disposed when the guard drops.
    pub fn child(&self) -> ScopeGuard {
        let scope = Scope(Arc::new(Frame {
            parent: Some(self.clone()),
            depth: self.0.depth + 1,
            bindings: Mutex::new(HashMap::new()),
            automatic: Mutex::new(None),
            owned: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        }));
        ScopeGuard { scope }
    }

    pub fn depth(&self) -> usize {
        self.0.depth
    }

    fn frames(&self) -> impl Iterator<Item = &Scope> {
        std::iter::successors(Some(self), |s| s.0.parent.as_ref())
    }

    pub fn try_get(&self, name: &VariableName) -> Option<Value> {
        self.frames().find_map(|s| lock(&s.0.bindings).get(name).cloned())
    }

    /// The value bound to `name` in the nearest frame that has it.
    pub fn get(&self, name: &VariableName) -> Result<Value> {
        self.try_get(name)
            .ok_or_else(|| StructuredError::missing_variable(name))
    }

    pub fn contains(&self, name: &VariableName) -> bool {
        self.frames().any(|s| lock(&s.0.bindings).contains_key(name))
    }

    /// Assign `name`: in the nearest frame that already binds it, otherwise
    /// in this frame.
    pub fn set(&self, name: &VariableName, value: Value) -> Result<()> {
        let target = self
            .frames()
            .find(|s| lock(&s.0.bindings).contains_key(name))
            .unwrap_or(self);
        target.bind(name, value)
    }

    /// Bind `name` in this frame, shadowing any outer binding.
    pub fn declare(&self, name: &VariableName, value: Value) -> Result<()> {
        self.bind(name, value)
    }

    fn bind(&self, name: &VariableName, value: Value) -> Result<()> {
        if self.is_disposed() {
            return Err(StructuredError::new(
                ErrorCode::ScopeDisposed,
                format!("cannot set {name}: its scope has already been disposed"),
            ));
        }
        lock(&self.0.bindings).insert(name.clone(), value);
        Ok(())
    }

    /// Unbind `name` from the nearest frame that has it.  With `dispose`,
    /// a resource behind the value that this frame owns is released now
    /// instead of at teardown.
    pub fn remove(&self, name: &VariableName, dispose: bool) -> Option<Value> {
        for frame in self.frames() {
            let removed = lock(&frame.0.bindings).remove(name);
            if let Some(value) = removed {
                if dispose {
                    if let Some(resource) = value.as_array().ok().and_then(|a| a.resource()) {
                        frame.release(&resource);
                    }
                }
                return Some(value);
            }
        }
        None
    }

    /// Dispose `resource` now if this frame owns it.
    fn release(&self, resource: &Arc<dyn Disposable>) {
        let found = {
            let mut owned = lock(&self.0.owned);
            owned
                .iter()
                .position(|r| same_resource(r, resource))
                .map(|i| owned.remove(i))
        };
        if let Some(r) = found {
            r.dispose();
        }
    }

    /// Bind the implicit lambda item `<>` in this frame.
    pub fn set_automatic(&self, value: Value) {
        *lock(&self.0.automatic) = Some(value);
    }

    pub fn automatic(&self) -> Result<Value> {
        self.frames()
            .find_map(|s| lock(&s.0.automatic).clone())
            .ok_or_else(|| {
                StructuredError::new(ErrorCode::AutomaticVariableNotSet, "<> is not set")
            })
    }

    /// Hand `resource` to this frame; it is disposed with the frame.  A
    /// resource offered to an already-disposed frame is disposed at once.
    pub fn own(&self, resource: Arc<dyn Disposable>) {
        if self.is_disposed() {
            resource.dispose();
            return;
        }
        lock(&self.0.owned).push(resource);
    }

    /// Take over every resource `other` owns, so they live as long as this
    /// frame instead of `other`.
    pub fn adopt(&self, other: &Scope) {
        let moved = std::mem::take(&mut *lock(&other.0.owned));
        if !moved.is_empty() {
            tracing::trace!(from = other.0.depth, to = self.0.depth, resources = moved.len(), "adopting resources");
        }
        for resource in moved {
            self.own(resource);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.0.disposed.load(Ordering::Acquire)
    }

    /// Release owned resources, most recent first.  Later calls are no-ops.
    pub fn dispose(&self) {
        if self.0.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let owned = std::mem::take(&mut *lock(&self.0.owned));
        if !owned.is_empty() {
            tracing::debug!(depth = self.0.depth, resources = owned.len(), "disposing scope");
        }
        for resource in owned.into_iter().rev() {
            resource.dispose();
        }
    }

    /// Every visible binding, inner frames overriding outer ones.
    pub fn variables(&self) -> BTreeMap<VariableName, Value> {
        let mut frames: Vec<&Scope> = self.frames().collect();
        frames.reverse();
        let mut out = BTreeMap::new();
        for frame in frames {
            for (k, v) in lock(&frame.0.bindings).iter() {
                out.insert(k.clone(), v.clone());
            }
        }
        out
    }
}

/// Owns a child [`Scope`] and disposes it on drop, on every exit path.
#[derive(Debug)]
pub struct ScopeGuard {
    scope: Scope,
}

impl Deref for ScopeGuard {
    type Target = Scope;

    fn deref(&self) -> &Scope {
        &self.scope
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.scope.dispose();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
