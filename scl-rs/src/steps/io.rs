//! File input.

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

use crate::context::RunContext;
use crate::error::{ErrorCode, Result, StructuredError};
use crate::freeze::{BuildRequest, PropertyInfo, StepFactory};
use crate::step::{BoxFuture, ExecutableStep, StepBody};
use crate::types::TypeReference;
use crate::value::{ElementSource, LazyArray, OnceSource, Value};

pub(crate) fn factories() -> Vec<StepFactory> {
    vec![StepFactory::simple(
        "ReadLines",
        TypeReference::array(TypeReference::STRING),
        build_read_lines,
    )
    .prop(PropertyInfo::step("Path", TypeReference::STRING))]
}

fn build_read_lines(req: &BuildRequest<'_>) -> Result<Box<dyn StepBody>> {
    Ok(Box::new(ReadLines { path: req.step("Path")? }))
}

/// Opens the file when the step runs; lines are read as the array is pulled.
/// The open file belongs to the running scope and is closed when it ends.
#[derive(Debug)]
struct ReadLines {
    path: ExecutableStep,
}

step_body!(ReadLines, |this, scope, ctx| {
    let path = this.path.run_string(scope, ctx).await?;
    let file = File::open(&path).await.map_err(|e| {
        StructuredError::new(ErrorCode::ExternalFailure, format!("could not open {path}: {e}"))
    })?;
    tracing::debug!(%path, "opened");
    let source = OnceSource::new(
        format!("ReadLines {path}"),
        Box::new(LinesSource { path, lines: BufReader::new(file).lines() }),
    );
    scope.own(source.clone());
    Ok(Value::Array(LazyArray::once(source)))
});

struct LinesSource {
    path: String,
    lines: Lines<BufReader<File>>,
}

impl ElementSource for LinesSource {
    fn next<'a>(&'a mut self, ctx: &'a RunContext) -> BoxFuture<'a, Result<Option<Value>>> {
        Box::pin(async move {
            let line = tokio::select! {
                line = self.lines.next_line() => line,
                _ = ctx.cancel.cancelled() => return Err(StructuredError::cancelled()),
            };
            line.map(|l| l.map(Value::Str)).map_err(|e| {
                StructuredError::new(
                    ErrorCode::ExternalFailure,
                    format!("could not read {}: {e}", self.path),
                )
            })
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
