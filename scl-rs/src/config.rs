//! `.sclrc` configuration file parser.
//!
//! | Directive | Action |
//! |-----------|--------|
//! | `/set <name>=<value>` or `/set <name> <value>` | seed a global variable |
//! | `/option <key>=<value>` or `/option <key> <value>` | set an engine option |
//! | Lines starting with `;` or `#` | comment, ignored |
//! | Any other `/command` | silently skipped |
//!
//! Values are typed by shape: integers, then doubles, then `true`/`false`;
//! anything else is a string.  Options are `log_level`, `timeout_ms` and
//! `trace_steps`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::types::VariableName;
use crate::value::Value;

// ── Public API ────────────────────────────────────────────────────────────────

/// A non-fatal error encountered while loading a config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ConfigError {}

const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

/// Engine settings: initial globals plus run options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineConfig {
    /// Seeded into the root scope of every run.
    pub variables: BTreeMap<VariableName, Value>,
    /// Default log filter when neither `RUST_LOG` nor `-v`/`-q` says otherwise.
    pub log_level: Option<String>,
    pub timeout_ms: Option<u64>,
    /// Log every step run at `trace`.
    pub trace_steps: bool,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a config string.
    ///
    /// Unknown directives are skipped.  Returns the config and a list of any
    /// errors on recognised lines; those lines are otherwise ignored.
    pub fn load_str(s: &str) -> (Self, Vec<ConfigError>) {
        let mut config = EngineConfig::new();
        let mut errors = Vec::new();

        for (i, raw) in s.lines().enumerate() {
            let lineno = i + 1;
            let line = raw.trim();

            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            let Some(rest) = line.strip_prefix('/') else { continue };

            let (cmd, args_str) = rest
                .split_once(|c: char| c.is_ascii_whitespace())
                .unwrap_or((rest, ""));
            let tokens = split_args(args_str.trim());

            let result = match cmd {
                "set" => parse_set(&tokens, &mut config),
                "option" => parse_option(&tokens, &mut config),
                _ => Ok(()),
            };
            if let Err(message) = result {
                errors.push(ConfigError { line: lineno, message });
            }
        }

        (config, errors)
    }

    /// Read and parse a config file from disk.
    pub fn load_file(path: &Path) -> std::io::Result<(Self, Vec<ConfigError>)> {
        let s = std::fs::read_to_string(path)?;
        Ok(Self::load_str(&s))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// `tracing_subscriber::EnvFilter` directive for these settings.
    pub fn filter_directive(&self) -> String {
        let mut directive = self.log_level.clone().unwrap_or_else(|| "warn".to_owned());
        if self.trace_steps {
            directive.push_str(",scl::step=trace");
        }
        directive
    }
}

// ── Argument tokenizer ────────────────────────────────────────────────────────

/// Split `s` into whitespace-delimited tokens, honouring double-quoted strings
/// and `\"` escapes within them.
fn split_args(s: &str) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    let mut quoted = false;
    let mut chars = s.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if !in_quotes => {
                in_quotes = true;
                quoted = true;
            }
            '"' if in_quotes => in_quotes = false,
            '\\' if in_quotes => {
                if let Some(escaped) = chars.next() {
                    cur.push(escaped);
                }
            }
            c if c.is_ascii_whitespace() && !in_quotes => {
                if !cur.is_empty() || quoted {
                    args.push(std::mem::take(&mut cur));
                    quoted = false;
                }
            }
            c => cur.push(c),
        }
    }
    if !cur.is_empty() || quoted {
        args.push(cur);
    }
    args
}

/// `name=value` in one token, or `name value...`.
fn key_value(directive: &str, tokens: &[String]) -> Result<(String, String), String> {
    let Some(first) = tokens.first() else {
        return Err(format!("/{directive}: requires an argument"));
    };
    let (key, value) = if let Some((k, v)) = first.split_once('=') {
        let mut value = v.to_owned();
        for rest in &tokens[1..] {
            value.push(' ');
            value.push_str(rest);
        }
        (k.to_owned(), value)
    } else if tokens.len() >= 2 {
        (first.clone(), tokens[1..].join(" "))
    } else {
        return Err(format!("/{directive}: missing value for '{first}'"));
    };
    if key.is_empty() {
        return Err(format!("/{directive}: name cannot be empty"));
    }
    Ok((key, value))
}

// ── /set ─────────────────────────────────────────────────────────────────────

fn parse_set(tokens: &[String], config: &mut EngineConfig) -> Result<(), String> {
    let (name, value) = key_value("set", tokens)?;
    let name = VariableName::parse(&name).map_err(|e| format!("/set: {e}"))?;
    config.variables.insert(name, parse_value(&value));
    Ok(())
}

/// `inf` and `NaN` stay strings.
fn parse_value(s: &str) -> Value {
    if let Ok(n) = s.parse::<i64>() {
        Value::Int(n)
    } else if let Some(x) = s.parse::<f64>().ok().filter(|x| x.is_finite()) {
        Value::Double(x)
    } else {
        match s {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::Str(s.to_owned()),
        }
    }
}

// ── /option ──────────────────────────────────────────────────────────────────

fn parse_option(tokens: &[String], config: &mut EngineConfig) -> Result<(), String> {
    let (key, value) = key_value("option", tokens)?;
    match key.as_str() {
        "log_level" => {
            let level = value.to_ascii_lowercase();
            if !LOG_LEVELS.contains(&level.as_str()) {
                return Err(format!("/option: unknown log level '{value}'"));
            }
            config.log_level = Some(level);
        }
        "timeout_ms" => {
            let ms = value
                .parse::<u64>()
                .map_err(|_| format!("/option: timeout_ms must be a whole number, not '{value}'"))?;
            config.timeout_ms = Some(ms);
        }
        "trace_steps" => {
            config.trace_steps = match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => true,
                "0" | "false" | "off" | "no" => false,
                _ => return Err(format!("/option: trace_steps must be on or off, not '{value}'")),
            };
        }
        other => return Err(format!("/option: unknown option '{other}'")),
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
