//! Structured logging for luabridge
//!
//! The bridge core only emits `tracing` events; hosts decide where they go.
//! [`init_logging`] installs a ready-made subscriber for binaries that do not
//! bring their own:
//!
//! - **Pretty format**: human-friendly output on stderr
//! - **JSON format**: one JSON object per line, for tooling
//! - **File output**: optional append-mode log file next to stderr
//!
//! Script output routed through [`print_hook`] is logged at `info` level
//! under the `luabridge::script` target, so it can be filtered separately:
//! `RUST_LOG=luabridge::script=off`.
//!
//! Field names used throughout the crate: `engine` (engine id), `key`
//! (registry key), `nargs`/`nresults` (protected calls), `kind` (error
//! classification).

use crate::callable::HostFunction;
use crate::value::HostValue;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::Level;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt as subscriber_fmt};

/// Target used for lines printed by scripts.
pub const SCRIPT_TARGET: &str = "luabridge::script";

/// Global flag to track if logging has been initialized
static LOGGING_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Output format of the installed subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
        })
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level filter (trace, debug, info, warn, error)
    /// Can be overridden by RUST_LOG environment variable
    pub level: String,

    /// Output format (pretty or json)
    pub format: LogFormat,

    /// Optional path to log file
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

/// Error type for logging initialization
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("failed to create log file: {0}")]
    FileCreate(#[from] io::Error),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

fn ensure_parent_dir(path: &std::path::Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &std::path::Path, mode: u32) -> io::Result<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

/// Initialize the global logging subscriber
///
/// Call once at startup. Subsequent calls return
/// `Err(LogError::AlreadyInitialized)`.
///
/// The `RUST_LOG` environment variable overrides the configured level.
/// Example: `RUST_LOG=luabridge_core=debug,luabridge::script=info`
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    // An unparseable configured level is an error; RUST_LOG wins when set.
    let configured =
        EnvFilter::try_new(&config.level).map_err(|_| LogError::InvalidLevel(config.level.clone()))?;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or(configured);

    let file_writer = if let Some(path) = &config.file {
        ensure_parent_dir(path)?;
        let existed = path.exists();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        #[cfg(unix)]
        if !existed {
            set_file_permissions(path, 0o600)?;
        }
        Some(file)
    } else {
        None
    };

    match config.format {
        LogFormat::Pretty => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                subscriber_fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_ansi(true),
            );

            if let Some(file) = file_writer {
                let file_layer = subscriber_fmt::layer()
                    .with_writer(file)
                    .with_target(true)
                    .with_ansi(false);
                tracing::subscriber::set_global_default(subscriber.with(file_layer))?;
            } else {
                tracing::subscriber::set_global_default(subscriber)?;
            }
        }
        LogFormat::Json => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                subscriber_fmt::layer()
                    .json()
                    .with_timer(SystemTime)
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_current_span(true)
                    .with_span_list(false)
                    .flatten_event(true),
            );

            if let Some(file) = file_writer {
                let file_layer = subscriber_fmt::layer()
                    .json()
                    .with_writer(file)
                    .with_timer(SystemTime)
                    .with_target(true)
                    .flatten_event(true);
                tracing::subscriber::set_global_default(subscriber.with(file_layer))?;
            } else {
                tracing::subscriber::set_global_default(subscriber)?;
            }
        }
    }

    let _ = LOGGING_INITIALIZED.set(true);

    tracing::debug!(
        log_level = %config.level,
        log_format = %config.format,
        log_file = ?config.file,
        "Logging initialized"
    );

    Ok(())
}

/// Check if logging has been initialized
pub fn is_logging_initialized() -> bool {
    LOGGING_INITIALIZED.get().is_some()
}

/// Log levels that can be used for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        })
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!(
                "unknown log level: {s}. Expected one of: trace, debug, info, warn, error"
            )),
        }
    }
}

/// Join `print` arguments the way scripts expect: tab separated, each value
/// rendered as text.
pub fn render_print_line(args: &[HostValue]) -> String {
    args.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\t")
}

/// Host function replacing the script global `print`.
pub fn print_hook() -> HostFunction {
    HostFunction::new("print", |ctx, args| {
        let line = render_print_line(&args);
        tracing::info!(target: SCRIPT_TARGET, engine = %ctx.engine().id(), "{line}");
        Ok(Vec::new())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    /// A mock writer that captures output to a shared buffer for testing
    #[derive(Clone)]
    struct MockLogWriter {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl MockLogWriter {
        fn new() -> Self {
            Self {
                buffer: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn contents(&self) -> String {
            String::from_utf8(self.buffer.lock().unwrap().clone()).unwrap()
        }
    }

    impl io::Write for MockLogWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.buffer.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for MockLogWriter {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn log_format_display() {
        assert_eq!(LogFormat::Pretty.to_string(), "pretty");
        assert_eq!(LogFormat::Json.to_string(), "json");
    }

    #[test]
    fn log_level_from_str() {
        assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("Error".parse::<LogLevel>().unwrap(), LogLevel::Error);
        let err = "verbose".parse::<LogLevel>().unwrap_err();
        assert!(err.contains("unknown log level: verbose"));
    }

    #[test]
    fn log_level_into_tracing_level() {
        assert_eq!(Level::from(LogLevel::Debug), Level::DEBUG);
        assert_eq!(Level::from(LogLevel::Warn), Level::WARN);
        assert!(LogLevel::Trace < LogLevel::Error);
        assert_eq!(LogLevel::Warn.to_string(), "warn");
    }

    #[test]
    fn log_config_serde_defaults_from_empty_toml() {
        let config: LogConfig = toml::from_str("").unwrap();
        assert_eq!(config, LogConfig::default());
        let config: LogConfig = toml::from_str("format = \"json\"\nlevel = \"debug\"").unwrap();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, "debug");
    }

    #[test]
    fn log_config_serde_roundtrip() {
        let config = LogConfig {
            level: "debug".to_string(),
            format: LogFormat::Json,
            file: Some(PathBuf::from("/tmp/luabridge.log")),
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: LogConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn log_error_display() {
        assert_eq!(
            LogError::AlreadyInitialized.to_string(),
            "logging already initialized"
        );
        let err: LogError = io::Error::new(io::ErrorKind::NotFound, "no such file").into();
        assert!(matches!(err, LogError::FileCreate(_)));
    }

    #[test]
    fn print_lines_are_tab_separated() {
        let line = render_print_line(&[
            HostValue::from("a"),
            HostValue::Number(1.0),
            HostValue::Nil,
            HostValue::from(true),
        ]);
        assert_eq!(line, "a\t1\tnil\ttrue");
    }

    #[test]
    fn print_hook_logs_under_script_target() {
        let writer = MockLogWriter::new();
        let subscriber = tracing_subscriber::registry()
            .with(EnvFilter::new("luabridge::script=info"))
            .with(
                subscriber_fmt::layer()
                    .json()
                    .with_target(true)
                    .flatten_event(true)
                    .with_writer(writer.clone()),
            );

        tracing::subscriber::with_default(subscriber, || {
            let engine = Engine::new().unwrap();
            engine.install_print_hook().unwrap();
            engine.evaluate("print('hello', 42, {})").unwrap();
        });

        let output = writer.contents();
        let line = output.lines().find(|line| !line.trim().is_empty()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(
            parsed.get("target").and_then(|v| v.as_str()),
            Some(SCRIPT_TARGET)
        );
        assert_eq!(
            parsed.get("message").and_then(|v| v.as_str()),
            Some("hello\t42\tLua Table")
        );
    }
}
