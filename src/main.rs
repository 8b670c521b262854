//! Purpose: `cabinet` CLI entry point for inspecting and editing databases.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Commands emit JSON on stdout, pretty-printed on a TTY.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: Every record access goes through `api::Database` over `FileEngine`.
#![allow(clippy::result_large_err)]
use std::error::Error as StdError;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};

use clap::{
    CommandFactory, Parser, Subcommand, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind,
};
use clap_complete::aot::Shell;
use serde::Serialize;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

mod command_dispatch;
mod db_info_json;
mod db_paths;

use cabinet::api::{Error, ErrorKind, FileDatabase, FileEngine, OpenMode, runtime, to_exit_code};
use db_paths::{DbRefError, default_db_dir, resolve_db_path};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome { exit_code });
            }
            _ => {
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(clap_error_summary(&err))
                        .with_hint("Try `cabinet --help`."),
                    ColorMode::Auto,
                ));
            }
        },
    };

    let db_dir = cli.dir.unwrap_or_else(default_db_dir);
    let color_mode = cli.color;

    command_dispatch::dispatch_command(cli.command, db_dir)
        .and_then(|outcome| runtime::teardown().map(|()| outcome))
        .map_err(add_corrupt_hint)
        .map_err(add_io_hint)
        .map_err(add_internal_hint)
        .map_err(|err| (err, color_mode))
}

#[derive(Parser)]
#[command(
    name = "cabinet",
    version,
    about = "Inspect and edit ordered key-value database files",
    long_about = None,
    after_help = r#"EXAMPLES
  $ cabinet set casket foo hop --create
  $ cabinet get casket foo
  $ cabinet list casket --prefix f --max 10
  $ cabinet info casket

Databases are named files under --dir (`casket` -> casket.kct), or any path
containing a separator."#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        help = "Directory for named databases (default: $CABINET_DIR or ~/.cabinet)",
        value_hint = ValueHint::DirPath
    )]
    dir: Option<PathBuf>,
    #[arg(
        long,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Print the value stored under a key")]
    Get {
        #[arg(help = "Database name or path")]
        db: String,
        key: String,
    },
    #[command(about = "Store a value under a key")]
    Set {
        #[arg(help = "Database name or path")]
        db: String,
        key: String,
        value: String,
        #[arg(long, help = "Create the database file if it does not exist")]
        create: bool,
    },
    #[command(about = "Remove a key")]
    Remove {
        #[arg(help = "Database name or path")]
        db: String,
        key: String,
    },
    #[command(about = "List records in key order")]
    List {
        #[arg(help = "Database name or path")]
        db: String,
        #[arg(long, help = "Only keys starting with this prefix")]
        prefix: Option<String>,
        #[arg(long, help = "Stop after this many records")]
        max: Option<usize>,
    },
    #[command(about = "Print the number of records")]
    Count {
        #[arg(help = "Database name or path")]
        db: String,
    },
    #[command(about = "Print path, mode, record count, and size")]
    Info {
        #[arg(help = "Database name or path")]
        db: String,
    },
    #[command(about = "Generate shell completions")]
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
    #[command(about = "Print version info")]
    Version,
}

fn resolve_dbref(input: &str, db_dir: &Path) -> Result<PathBuf, Error> {
    resolve_db_path(input, db_dir).map_err(|err| match err {
        DbRefError::Empty => Error::new(ErrorKind::Usage)
            .with_message("database ref is empty")
            .with_hint("Pass a database name like `casket` or a path like `./casket.kct`."),
    })
}

/// Opens a file database with blocking locks so concurrent commands serialize.
fn open_db(db_ref: &str, db_dir: &Path, mode: OpenMode) -> Result<FileDatabase, Error> {
    let path = resolve_dbref(db_ref, db_dir)?;
    if mode.contains(OpenMode::CREATE) {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| {
                Error::from_io(err, parent).with_message("failed to create database directory")
            })?;
        }
    }
    let db = FileDatabase::new(FileEngine::new());
    db.open(&path, mode)
        .map_err(|err| add_missing_db_hint(err, db_ref, &path))?;
    Ok(db)
}

fn add_missing_db_hint(err: Error, db_ref: &str, path: &Path) -> Error {
    if err.kind() != ErrorKind::Io || err.hint().is_some() || path.exists() {
        return err;
    }
    err.with_hint(format!(
        "Database not found. Create it with `cabinet set {db_ref} <key> <value> --create`."
    ))
}

fn add_io_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::PermissionDenied => err.with_hint(
            "Permission denied. Check file permissions or use --dir to a writable location.",
        ),
        ErrorKind::LockContention => {
            err.with_hint("Database is locked by another process. Retry with backoff.")
        }
        ErrorKind::Io => err.with_hint("I/O error. Check the path, filesystem, and disk space."),
        _ => err,
    }
}

fn add_corrupt_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Corruption || err.hint().is_some() {
        return err;
    }
    err.with_hint("Database file is damaged beyond repair. Restore it from a backup.")
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint(
        "Unexpected internal failure. Retry with RUST_LOG=debug and share command/context if it persists.",
    )
}

fn emit_version_output() {
    if io::stdout().is_terminal() {
        println!("cabinet {}", runtime::version());
    } else {
        emit_json(
            json!({
                "name": "cabinet",
                "version": runtime::version(),
            }),
        );
    }
}

fn emit_json(value: Value) {
    let rendered = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    };
    let json = rendered.unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

/// Everything a caller needs to act on a failed command, in render order.
#[derive(Serialize)]
struct ErrorReport {
    kind: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    causes: Vec<String>,
}

impl ErrorReport {
    fn from_error(err: &Error) -> Self {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        Self {
            kind: err.kind().name(),
            message: err
                .message()
                .map_or_else(|| default_message(err.kind()).to_string(), str::to_string),
            hint: err.hint().map(str::to_string),
            path: err.path().map(|path| path.display().to_string()),
            key: err.key().map(|key| String::from_utf8_lossy(key).into_owned()),
            causes,
        }
    }

    /// Labelled detail lines shown under the headline on a terminal.
    fn details(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("hint:", self.hint.as_deref()),
            ("path:", self.path.as_deref()),
            ("key:", self.key.as_deref()),
            ("caused by:", self.causes.first().map(String::as_str)),
        ]
        .into_iter()
        .filter_map(|(label, value)| value.map(|value| (label, value)))
    }
}

fn default_message(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Success => "success",
        ErrorKind::NotOpened => "database is not opened",
        ErrorKind::AlreadyOpen => "database is already opened",
        ErrorKind::InvalidMode => "invalid open mode",
        ErrorKind::PermissionDenied => "permission denied",
        ErrorKind::CursorInvalid => "cursor is invalid",
        ErrorKind::KeyNotFound => "no record",
        ErrorKind::DuplicateRecord => "record already exists",
        ErrorKind::Logic => "logical inconsistency",
        ErrorKind::Usage => "usage error",
        ErrorKind::Io => "i/o error",
        ErrorKind::Corruption => "corrupt data",
        ErrorKind::LockContention => "database is locked",
        ErrorKind::Internal => "internal error",
    }
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
    } else {
        eprintln!("{}", error_json(err));
    }
}

fn error_json(err: &Error) -> Value {
    json!({ "error": ErrorReport::from_error(err) })
}

/// Headline in red, detail labels in yellow when `use_color` is set.
fn error_text(err: &Error, use_color: bool) -> String {
    let paint = |label: &str, code: &str| {
        if use_color {
            format!("\u{1b}[{code}m{label}\u{1b}[0m")
        } else {
            label.to_string()
        }
    };
    let report = ErrorReport::from_error(err);
    let mut text = format!("{} {}", paint("error:", "31"), report.message);
    for (label, value) in report.details() {
        text.push('\n');
        text.push_str(&paint(label, "33"));
        text.push(' ');
        text.push_str(value);
    }
    text
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}
