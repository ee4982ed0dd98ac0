//! The explicit context threaded through every step run.
//!
//! Nothing in the engine reaches for globals: the console, the diagnostics
//! sink and the factory store arrive through [`RunContext`], together with
//! the cancellation token for the run.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::freeze::StepFactoryStore;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poison| poison.into_inner())
}

// ── Console ───────────────────────────────────────────────────────────────────

/// Where `Print` writes.
pub trait Console: Send + Sync + fmt::Debug {
    fn write_line(&self, line: &str);
}

#[derive(Debug, Default)]
pub struct StdoutConsole;

impl Console for StdoutConsole {
    fn write_line(&self, line: &str) {
        println!("{line}");
    }
}

/// Collects lines in memory instead of printing.
#[derive(Debug, Default)]
pub struct MemoryConsole {
    output: Mutex<Vec<String>>,
}

impl MemoryConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        lock(&self.output).clone()
    }
}

impl Console for MemoryConsole {
    fn write_line(&self, line: &str) {
        lock(&self.output).push(line.to_owned());
    }
}

// ── Diagnostics ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLevel {
    Warning,
    Error,
}

/// One logged validation problem.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
}

/// In-memory record of the validation problems logged during a run.
#[derive(Debug, Default)]
pub struct Diagnostics {
    entries: Mutex<Vec<Diagnostic>>,
}

impl Diagnostics {
    pub fn warning(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(%message, "validation warning");
        lock(&self.entries).push(Diagnostic { level: DiagnosticLevel::Warning, message });
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(%message, "validation error");
        lock(&self.entries).push(Diagnostic { level: DiagnosticLevel::Error, message });
    }

    pub fn entries(&self) -> Vec<Diagnostic> {
        lock(&self.entries).clone()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }
}

// ── ExternalContext / RunContext ──────────────────────────────────────────────

/// Host-provided collaborators, shared by every step of a run.
#[derive(Debug)]
pub struct ExternalContext {
    pub console: Arc<dyn Console>,
    pub diagnostics: Diagnostics,
    pub store: Arc<StepFactoryStore>,
}

impl ExternalContext {
    pub fn new(console: Arc<dyn Console>, store: Arc<StepFactoryStore>) -> Self {
        ExternalContext { console, diagnostics: Diagnostics::default(), store }
    }
}

#[derive(Debug, Clone)]
pub struct RunContext {
    pub cancel: CancellationToken,
    pub external: Arc<ExternalContext>,
}

impl RunContext {
    pub fn new(external: Arc<ExternalContext>, cancel: CancellationToken) -> Self {
        RunContext { cancel, external }
    }

    /// A context over the core store with an in-memory console.
    pub fn with_memory_console() -> (Self, Arc<MemoryConsole>) {
        let console = Arc::new(MemoryConsole::new());
        let external = ExternalContext::new(console.clone(), Arc::new(StepFactoryStore::core()));
        (RunContext::new(Arc::new(external), CancellationToken::new()), console)
    }

    pub fn check_cancelled(&self) -> Result<()> {
        self.cancel.check()
    }

    pub fn console(&self) -> &dyn Console {
        self.external.console.as_ref()
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.external.diagnostics
    }

    pub fn store(&self) -> &Arc<StepFactoryStore> {
        &self.external.store
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
