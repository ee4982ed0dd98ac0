use std::path::Path;

use tracing_subscriber::EnvFilter;

use scl::cancel::CancellationToken;
use scl::cli::{self, CliArgs, ConfigFile};
use scl::config::EngineConfig;
use scl::engine::Engine;
use scl::freeze::FreezableStep;
use scl::serialize::serialize;
use scl::value::Value;

#[tokio::main]
async fn main() {
    let args = match cli::parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("scl: {e}");
            eprintln!("{}", cli::USAGE);
            std::process::exit(1);
        }
    };

    let mut config = load_config(&args);
    if let Some(level) = args.log_level() {
        config.log_level = Some(level.to_owned());
    }
    if args.timeout_ms.is_some() {
        config.timeout_ms = args.timeout_ms;
    }

    // RUST_LOG wins over flags and config.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let tree = match read_tree(&args.tree) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("scl: {e}");
            std::process::exit(1);
        }
    };

    let engine = Engine::new(config);

    if args.print {
        println!("{}", serialize(&tree, engine.store()));
        return;
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    match engine.run_tree(&tree, cancel).await {
        Ok(outcome) => {
            if outcome.value != Value::Unit {
                println!("{}", outcome.value);
            }
        }
        Err(e) => {
            eprintln!("{}", e.as_user_message());
            std::process::exit(1);
        }
    }
}

/// The user config named by `-f`, or found by searching.  Problems are
/// reported and otherwise ignored.
fn load_config(args: &CliArgs) -> EngineConfig {
    let path = match &args.config {
        ConfigFile::Skip => return EngineConfig::default(),
        ConfigFile::Explicit(path) => Some(path.clone()),
        ConfigFile::Search => cli::find_user_config(),
    };
    let Some(path) = path else { return EngineConfig::default() };
    match EngineConfig::load_file(&path) {
        Ok((config, errors)) => {
            for e in errors {
                eprintln!("scl: {}: {e}", path.display());
            }
            config
        }
        Err(e) => {
            eprintln!("scl: warning: {}: {e}", path.display());
            EngineConfig::default()
        }
    }
}

fn read_tree(path: &Path) -> Result<FreezableStep, String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))?;
    FreezableStep::from_json(&text).map_err(|e| e.as_user_message())
}
