//! The protected call protocol.
//!
//! Every host-initiated invocation of engine code goes through [`invoke`]:
//! inputs are validated before the stack is touched, the callee and
//! arguments are pushed, the call runs in protected mode with an optional
//! traceback handler, and the stack is restored to its entry depth on every
//! path. Indexing and assignment run as protected calls of small native
//! helpers so that metamethod errors surface as ordinary engine errors.

#![allow(unsafe_code)]

use crate::engine::Engine;
use crate::error::{BridgeError, EngineErrorKind, Result};
use crate::reference::{FieldKey, ManagedReference};
use crate::stack::StackView;
use crate::value::{HostValue, ValueKind, format_number};
use mlua_sys as ffi;
use std::ffi::CString;
use std::os::raw::c_int;

/// How many results a call should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCount {
    /// Adjust to exactly this many, padding with `nil`
    Exactly(u16),
    /// Everything the callee returns
    All,
}

impl ResultCount {
    fn as_raw(self) -> c_int {
        match self {
            Self::Exactly(n) => c_int::from(n),
            Self::All => ffi::LUA_MULTRET,
        }
    }
}

/// What a protected call runs.
pub(crate) enum Callee<'a> {
    Reference(&'a ManagedReference),
    /// Source compiled just before the call
    Chunk { source: &'a [u8], chunk_name: &'a str },
    Native(ffi::lua_CFunction),
}

/// One argument of a protected call.
pub(crate) enum Arg<'a> {
    Value(&'a HostValue),
    Reference(&'a ManagedReference),
    Key(&'a FieldKey<'a>),
    Globals,
}

fn check_reference(reference: &ManagedReference, engine: &Engine) -> Result<()> {
    reference.ensure_live("call")?;
    reference.ensure_engine(engine)
}

impl Arg<'_> {
    fn check(&self, engine: &Engine) -> Result<()> {
        match self {
            Self::Value(HostValue::Reference(reference)) => check_reference(reference, engine),
            Self::Reference(reference) | Self::Key(FieldKey::Value(reference)) => {
                check_reference(reference, engine)
            }
            _ => Ok(()),
        }
    }

    fn push(&self, stack: &StackView<'_>) -> Result<()> {
        match self {
            Self::Value(value) => stack.encode(value),
            Self::Reference(reference) => reference.push_onto(stack),
            Self::Key(FieldKey::Name(name)) => {
                stack.push_text(name);
                Ok(())
            }
            Self::Key(FieldKey::Index(index)) => {
                stack.push_integer(*index);
                Ok(())
            }
            Self::Key(FieldKey::Value(reference)) => reference.push_onto(stack),
            Self::Globals => {
                stack.push_globals();
                Ok(())
            }
        }
    }
}

fn chunk_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| BridgeError::illegal("chunk name contains a NUL byte"))
}

/// Run one protected call and hand the results to `collect` as
/// `(stack, first_result_index, result_count)`.
pub(crate) fn invoke<R>(
    stack: &StackView<'_>,
    callee: Callee<'_>,
    args: &[Arg<'_>],
    results: ResultCount,
    collect: impl FnOnce(&StackView<'_>, i32, usize) -> Result<R>,
) -> Result<R> {
    let engine = stack.engine();
    let name = match &callee {
        Callee::Reference(reference) => {
            check_reference(reference, engine)?;
            None
        }
        Callee::Chunk { chunk_name: name, .. } => Some(chunk_name(name)?),
        Callee::Native(_) => None,
    };
    for arg in args {
        arg.check(engine)?;
    }

    let base = stack.depth();
    // Handler, callee and arguments, then room for padded results.
    let padded = match results {
        ResultCount::Exactly(n) => usize::from(n),
        ResultCount::All => 0,
    };
    stack.reserve(args.len() + 2 + padded)?;
    let outcome = run(stack, &callee, name.as_deref(), args, results, base, collect);
    stack.truncate(base);
    outcome
}

fn run<R>(
    stack: &StackView<'_>,
    callee: &Callee<'_>,
    chunk_name: Option<&std::ffi::CStr>,
    args: &[Arg<'_>],
    results: ResultCount,
    base: usize,
    collect: impl FnOnce(&StackView<'_>, i32, usize) -> Result<R>,
) -> Result<R> {
    let handler = if stack.core().traceback() {
        stack.push_native(traceback_handler);
        base as i32 + 1
    } else {
        0
    };

    match (callee, chunk_name) {
        (Callee::Reference(reference), _) => reference.push_onto(stack)?,
        (Callee::Chunk { source, .. }, Some(name)) => {
            let status = stack.load(source, name);
            if status != ffi::LUA_OK {
                return Err(error_from_top(stack, status));
            }
        }
        (Callee::Chunk { .. }, None) => unreachable!("chunk names are resolved before the call"),
        (Callee::Native(function), _) => stack.push_native(*function),
    }
    for arg in args {
        arg.push(stack)?;
    }

    tracing::trace!(
        engine = %stack.engine().id(),
        nargs = args.len(),
        nresults = ?results,
        "protected call"
    );
    let status = {
        let _in_flight = stack.core().begin_call();
        stack.pcall(args.len(), results.as_raw(), handler)
    };
    if status != ffi::LUA_OK {
        return Err(error_from_top(stack, status));
    }

    let first = base + usize::from(handler != 0) + 1;
    let count = (stack.depth() + 1).saturating_sub(first);
    collect(stack, first as i32, count)
}

fn error_from_top(stack: &StackView<'_>, status: c_int) -> BridgeError {
    let kind = EngineErrorKind::from_status(status);
    let message = error_message(stack, -1);
    tracing::debug!(engine = %stack.engine().id(), %kind, %message, "engine call failed");
    BridgeError::engine(kind, message)
}

/// Text of the error object at `index`.
pub(crate) fn error_message(stack: &StackView<'_>, index: i32) -> String {
    match stack.kind(index) {
        ValueKind::Text => stack.peek_text(index).unwrap_or_default(),
        ValueKind::Number => format_number(stack.peek_number(index).unwrap_or_default()),
        ValueKind::HostObject => stack
            .host_object_at(index)
            .map(|object| object.to_string())
            .unwrap_or_default(),
        kind => format!("(error object is a {kind} value)"),
    }
}

/// Call `callee` and decode every result.
pub(crate) fn call(
    stack: &StackView<'_>,
    callee: Callee<'_>,
    args: &[Arg<'_>],
    results: ResultCount,
) -> Result<Vec<HostValue>> {
    invoke(stack, callee, args, results, |stack, first, count| {
        (0..count)
            .map(|offset| stack.decode(first + offset as i32))
            .collect()
    })
}

/// Pin `target[key]`.
pub(crate) fn get_field(
    stack: &StackView<'_>,
    target: Arg<'_>,
    key: &FieldKey<'_>,
) -> Result<ManagedReference> {
    invoke(
        stack,
        Callee::Native(index_value),
        &[target, Arg::Key(key)],
        ResultCount::Exactly(1),
        |stack, first, _| Ok(stack.reference(first)),
    )
}

/// `target[key] = value`.
pub(crate) fn set_field(
    stack: &StackView<'_>,
    target: Arg<'_>,
    key: &FieldKey<'_>,
    value: &HostValue,
) -> Result<()> {
    invoke(
        stack,
        Callee::Native(assign_value),
        &[target, Arg::Key(key), Arg::Value(value)],
        ResultCount::Exactly(0),
        |_, _, _| Ok(()),
    )
}

/// Compile `source` and pin the resulting function.
pub(crate) fn load(stack: &StackView<'_>, source: &[u8], name: &str) -> Result<ManagedReference> {
    let name = chunk_name(name)?;
    let base = stack.depth();
    let status = stack.load(source, &name);
    let outcome = if status == ffi::LUA_OK {
        Ok(stack.reference(-1))
    } else {
        Err(error_from_top(stack, status))
    };
    stack.truncate(base);
    outcome
}

unsafe extern "C-unwind" fn index_value(state: *mut ffi::lua_State) -> c_int {
    unsafe {
        ffi::lua_gettable(state, 1);
    }
    1
}

unsafe extern "C-unwind" fn assign_value(state: *mut ffi::lua_State) -> c_int {
    unsafe {
        ffi::lua_settable(state, 1);
    }
    0
}

/// Message handler that appends a traceback to string errors.
unsafe extern "C-unwind" fn traceback_handler(state: *mut ffi::lua_State) -> c_int {
    unsafe {
        if ffi::lua_type(state, 1) == ffi::LUA_TSTRING {
            let message = ffi::lua_tolstring(state, 1, std::ptr::null_mut());
            ffi::luaL_traceback(state, state, message, 1);
        }
    }
    1
}
