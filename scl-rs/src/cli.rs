//! Command-line argument parsing.
//!
//! Usage:
//!   scl [-f[<file>]] [-p] [-v...] [-q] [-t<ms>] <tree.json>

use std::path::PathBuf;

use directories::ProjectDirs;

pub const USAGE: &str = "Usage: scl [-f[<file>]] [-p] [-v...] [-q] [-t<ms>] <tree.json>";

// ── Public types ──────────────────────────────────────────────────────────────

/// Parsed command-line arguments.
#[derive(Debug, Default)]
pub struct CliArgs {
    /// Which config file to load.
    pub config: ConfigFile,
    /// Print the tree as SCL instead of running it (`-p`).
    pub print: bool,
    /// Each `-v` raises the log level one step.
    pub verbose: u8,
    /// Only errors are logged (`-q`).
    pub quiet: bool,
    /// Cancel the run after this many milliseconds (`-t<ms>`).
    pub timeout_ms: Option<u64>,
    /// The step tree to run, in JSON form.
    pub tree: PathBuf,
}

impl CliArgs {
    /// Log filter chosen by `-v`/`-q`, if either was given.
    pub fn log_level(&self) -> Option<&'static str> {
        if self.quiet {
            return Some("error");
        }
        match self.verbose {
            0 => None,
            1 => Some("info"),
            2 => Some("debug"),
            _ => Some("trace"),
        }
    }
}

/// How to choose the user config file.
#[derive(Debug, Default)]
pub enum ConfigFile {
    /// Search `./.sclrc`, then the platform config directory (default).
    #[default]
    Search,
    /// `-f` with no file argument: skip user config.
    Skip,
    /// `-f<file>`: load this specific file.
    Explicit(PathBuf),
}

// ── Parsing ───────────────────────────────────────────────────────────────────

/// Parse `std::env::args()` and return [`CliArgs`] or an error message.
pub fn parse_args() -> Result<CliArgs, String> {
    let raw: Vec<String> = std::env::args().collect();
    parse_argv(raw.get(1..).unwrap_or_default())
}

/// Parse a slice of argument strings (exposed for testing).
pub fn parse_argv(argv: &[String]) -> Result<CliArgs, String> {
    let mut args = CliArgs::default();
    let mut positional: Vec<String> = Vec::new();
    let mut i = 0;

    while i < argv.len() {
        let arg = argv[i].as_str();

        if arg == "--" {
            i += 1;
            positional.extend(argv[i..].iter().cloned());
            break;
        }

        if !arg.starts_with('-') || arg == "-" {
            positional.push(arg.to_owned());
            i += 1;
            continue;
        }

        let chars: Vec<char> = arg[1..].chars().collect();
        let mut j = 0;
        while j < chars.len() {
            match chars[j] {
                'p' => args.print = true,
                'q' => args.quiet = true,
                'v' => args.verbose = args.verbose.saturating_add(1),

                // -f[<file>]
                'f' => {
                    if j + 1 < chars.len() {
                        let file: String = chars[j + 1..].iter().collect();
                        args.config = ConfigFile::Explicit(PathBuf::from(file));
                        j = chars.len();
                    } else if i + 1 < argv.len()
                        && !argv[i + 1].starts_with('-')
                        && argv.len() - (i + 1) > 1
                    {
                        // `-f <file> <tree>`; a lone trailing argument is the tree
                        i += 1;
                        args.config = ConfigFile::Explicit(PathBuf::from(&argv[i]));
                    } else {
                        args.config = ConfigFile::Skip;
                    }
                }

                // -t<ms>
                't' => {
                    let ms = if j + 1 < chars.len() {
                        let s: String = chars[j + 1..].iter().collect();
                        j = chars.len();
                        s
                    } else if i + 1 < argv.len() {
                        i += 1;
                        argv[i].clone()
                    } else {
                        return Err("-t requires a number of milliseconds".to_owned());
                    };
                    let ms = ms.parse().map_err(|_| format!("invalid timeout: {ms}"))?;
                    args.timeout_ms = Some(ms);
                }

                c => return Err(format!("unknown option: -{c}")),
            }
            j += 1;
        }
        i += 1;
    }

    match positional.len() {
        0 => return Err("missing step tree file".to_owned()),
        1 => args.tree = PathBuf::from(positional.remove(0)),
        n => return Err(format!("too many arguments ({n})")),
    }

    Ok(args)
}

// ── Path helpers ──────────────────────────────────────────────────────────────

/// Search for the user config file in the standard locations.
/// Returns the first path that exists, or `None`.
pub fn find_user_config() -> Option<PathBuf> {
    let local = PathBuf::from("./.sclrc");
    let platform = ProjectDirs::from("", "", "scl").map(|dirs| dirs.config_dir().join("sclrc"));
    std::iter::once(local).chain(platform).find(|p| p.exists())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
