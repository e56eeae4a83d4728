//! Error types for luabridge-core

use crate::engine::EngineId;
use crate::registry::RegistryKey;
use crate::value::ValueKind;
use std::fmt;
use std::os::raw::c_int;
use thiserror::Error;

/// Result type alias using the library's error type
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Classification of a failure reported by the engine through a protected
/// call or a chunk load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineErrorKind {
    /// Error raised while running script code (`LUA_ERRRUN`)
    Runtime,
    /// Allocation failure inside the engine (`LUA_ERRMEM`)
    Memory,
    /// Source text failed to compile (`LUA_ERRSYNTAX`)
    Syntax,
    /// A yield escaped a protected call outside any coroutine (`LUA_YIELD`)
    Yield,
    /// The message handler itself failed (`LUA_ERRERR`)
    Handler,
    /// A status code this bridge does not know about
    Unknown(i32),
}

impl EngineErrorKind {
    /// Map a Lua 5.4 status code onto the taxonomy.
    ///
    /// `0` (success) is not an error and maps to `Unknown(0)`; callers only
    /// classify nonzero statuses.
    pub fn from_status(status: c_int) -> Self {
        match status {
            mlua_sys::LUA_ERRRUN => Self::Runtime,
            mlua_sys::LUA_ERRMEM => Self::Memory,
            mlua_sys::LUA_ERRSYNTAX => Self::Syntax,
            mlua_sys::LUA_YIELD => Self::Yield,
            mlua_sys::LUA_ERRERR => Self::Handler,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Runtime => f.write_str("runtime error"),
            Self::Memory => f.write_str("memory error"),
            Self::Syntax => f.write_str("syntax error"),
            Self::Yield => f.write_str("unexpected yield"),
            Self::Handler => f.write_str("error in error handler"),
            Self::Unknown(code) => write!(f, "unknown engine error {code}"),
        }
    }
}

/// Flat classification of every [`BridgeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    IllegalArgument,
    RuntimeError,
    MemoryError,
    SyntaxError,
    YieldError,
    HandlerError,
    UnknownEngineError(i32),
    UseAfterRelease,
    CrossHandleMismatch,
    InterfaceResolutionError,
    MarshalError,
    EngineClosed,
    Io,
}

/// Main error type for luabridge-core
#[derive(Error, Debug)]
pub enum BridgeError {
    /// A host-side precondition was violated (blank name, wrong value kind for
    /// the operation, ...). Always detected before the engine is touched.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// The engine reported a failure from a protected call or a load.
    #[error("{kind}: {message}")]
    Engine {
        kind: EngineErrorKind,
        message: String,
    },

    /// A registry key was used (or released) after it had been released.
    #[error("{operation} on released reference {key}")]
    UseAfterRelease {
        key: RegistryKey,
        operation: &'static str,
    },

    /// A reference or proxy was used against an engine that did not create it.
    #[error("reference belongs to engine {found}, not engine {expected}")]
    CrossHandleMismatch { expected: EngineId, found: EngineId },

    /// A proxy contract or method could not be resolved.
    #[error("cannot resolve interface {contract}{}", method_suffix(.method))]
    InterfaceResolution {
        contract: String,
        method: Option<String>,
    },

    /// A value could not be represented as the requested host type.
    #[error("cannot marshal {found} value as {expected}")]
    Marshal {
        expected: &'static str,
        found: ValueKind,
    },

    /// The engine was closed; its stack and references are gone.
    #[error("engine {engine} is closed")]
    EngineClosed { engine: EngineId },

    /// I/O errors while reading script sources
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub(crate) fn engine(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self::Engine {
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn illegal(message: impl Into<String>) -> Self {
        Self::IllegalArgument(message.into())
    }

    pub(crate) fn stack_overflow() -> Self {
        Self::engine(EngineErrorKind::Memory, "stack overflow")
    }

    /// Flat classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IllegalArgument(_) => ErrorKind::IllegalArgument,
            Self::Engine { kind, .. } => match kind {
                EngineErrorKind::Runtime => ErrorKind::RuntimeError,
                EngineErrorKind::Memory => ErrorKind::MemoryError,
                EngineErrorKind::Syntax => ErrorKind::SyntaxError,
                EngineErrorKind::Yield => ErrorKind::YieldError,
                EngineErrorKind::Handler => ErrorKind::HandlerError,
                EngineErrorKind::Unknown(code) => ErrorKind::UnknownEngineError(*code),
            },
            Self::UseAfterRelease { .. } => ErrorKind::UseAfterRelease,
            Self::CrossHandleMismatch { .. } => ErrorKind::CrossHandleMismatch,
            Self::InterfaceResolution { .. } => ErrorKind::InterfaceResolutionError,
            Self::Marshal { .. } => ErrorKind::MarshalError,
            Self::EngineClosed { .. } => ErrorKind::EngineClosed,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// The engine's own message text for engine-reported failures.
    #[must_use]
    pub fn engine_message(&self) -> Option<&str> {
        match self {
            Self::Engine { message, .. } => Some(message),
            _ => None,
        }
    }
}

fn method_suffix(method: &Option<String>) -> String {
    method.as_deref().map(|m| format!(".{m}")).unwrap_or_default()
}

/// Require a non-blank host-side name.
pub(crate) fn require_name<'a>(what: &str, name: &'a str) -> Result<&'a str> {
    if name.trim().is_empty() {
        return Err(BridgeError::illegal(format!("{what} must not be blank")));
    }
    Ok(name)
}
