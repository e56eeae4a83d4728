//! Host functions callable from script code.

#![allow(unsafe_code)]

use crate::engine::Engine;
use crate::host_object::{
    HOST_FUNCTION_META, HostCell, cell_in_slot, panic_message, push_cell, run_host_entry,
};
use crate::reference::ManagedReference;
use crate::stack::StackView;
use crate::value::HostValue;
use mlua_sys as ffi;
use std::fmt;
use std::os::raw::c_int;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

type HostFn =
    dyn Fn(&CallContext<'_>, Vec<HostValue>) -> anyhow::Result<Vec<HostValue>> + Send + Sync;

/// A Rust closure that script code can call like any other function.
///
/// Arguments arrive decoded, in order; the returned values are pushed back
/// in order. Returning `Err` raises an engine error carrying the error's
/// message, which the calling script may catch with `pcall`. A panic is
/// caught and raised the same way.
#[derive(Clone)]
pub struct HostFunction {
    name: Arc<str>,
    receiver: bool,
    callback: Arc<HostFn>,
}

impl HostFunction {
    pub fn new<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&CallContext<'_>, Vec<HostValue>) -> anyhow::Result<Vec<HostValue>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: Arc::from(name.into()),
            receiver: false,
            callback: Arc::new(callback),
        }
    }

    /// A function meant to be called with method syntax (`obj:name(...)`).
    /// The first argument is split off and offered as
    /// [`CallContext::receiver`].
    pub fn method<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&CallContext<'_>, Vec<HostValue>) -> anyhow::Result<Vec<HostValue>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            receiver: true,
            ..Self::new(name, callback)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_method(&self) -> bool {
        self.receiver
    }

    /// Whether both handles wrap the same closure.
    pub fn same_function(&self, other: &HostFunction) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.callback), Arc::as_ptr(&other.callback))
    }

    /// Invoke the closure directly, bypassing the engine.
    pub fn call(&self, context: &CallContext<'_>, args: Vec<HostValue>) -> anyhow::Result<Vec<HostValue>> {
        (self.callback)(context, args)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("name", &self.name)
            .field("method", &self.receiver)
            .finish_non_exhaustive()
    }
}

/// What a host function can see of its caller.
pub struct CallContext<'a> {
    engine: &'a Engine,
    receiver: Option<HostValue>,
}

impl<'a> CallContext<'a> {
    pub fn new(engine: &'a Engine) -> Self {
        Self {
            engine,
            receiver: None,
        }
    }

    /// The engine the call came from. Re-entering it is allowed.
    pub fn engine(&self) -> &'a Engine {
        self.engine
    }

    /// The receiver of a method call.
    pub fn receiver(&self) -> Option<&HostValue> {
        self.receiver.as_ref()
    }

    /// Compile a chunk in the calling engine.
    pub fn load_chunk(&self, source: &[u8], chunk_name: &str) -> crate::Result<ManagedReference> {
        self.engine.load_chunk(source, chunk_name)
    }
}

impl fmt::Debug for CallContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("engine", &self.engine.id())
            .field("receiver", &self.receiver)
            .finish()
    }
}

impl StackView<'_> {
    /// Push `function` as an engine closure.
    pub(crate) fn push_host_function(&self, function: HostFunction) {
        self.grow(2);
        let state = self.raw();
        unsafe {
            push_cell(state, self.engine().id(), function, HOST_FUNCTION_META);
            ffi::lua_pushcclosure(state, host_function_entry, 1);
        }
    }
}

/// The host function behind the engine function at `index`, if any.
///
/// Needs three free stack slots.
pub(crate) unsafe fn function_in_slot(state: *mut ffi::lua_State, index: c_int) -> Option<HostFunction> {
    unsafe {
        if ffi::lua_iscfunction(state, index) == 0 {
            return None;
        }
        if ffi::lua_getupvalue(state, index, 1).is_null() {
            return None;
        }
        let function = cell_in_slot::<HostFunction>(state, -1, HOST_FUNCTION_META)
            .and_then(|cell| cell.payload.clone());
        ffi::lua_pop(state, 1);
        function
    }
}

unsafe extern "C-unwind" fn host_function_entry(state: *mut ffi::lua_State) -> c_int {
    unsafe { run_host_entry(state, || dispatch(state)) }
}

fn dispatch(state: *mut ffi::lua_State) -> Result<c_int, String> {
    let cell: &HostCell<HostFunction> = unsafe {
        cell_in_slot(state, ffi::lua_upvalueindex(1), HOST_FUNCTION_META)
            .ok_or_else(|| "host function cell is missing".to_string())?
    };
    let engine = Engine::from_callback(cell.engine)?;
    let function = cell
        .payload
        .clone()
        .ok_or_else(|| "host function was finalized".to_string())?;

    let guard = engine.lock();
    let _thread = guard.enter_thread(state);
    let stack = guard.stack().map_err(|err| err.to_string())?;

    let mut args = (1..=stack.depth() as i32)
        .map(|index| stack.decode(index))
        .collect::<crate::Result<Vec<_>>>()
        .map_err(|err| err.to_string())?;
    let receiver = (function.is_method() && !args.is_empty()).then(|| args.remove(0));
    stack.truncate(0);

    let context = CallContext {
        engine: &engine,
        receiver,
    };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| function.call(&context, args)));
    let results = match outcome {
        Ok(Ok(results)) => results,
        Ok(Err(err)) => {
            return Err(format!("host function '{}' failed: {err:#}", function.name()));
        }
        Err(payload) => {
            return Err(format!(
                "host function '{}' panicked: {}",
                function.name(),
                panic_message(payload.as_ref())
            ));
        }
    };
    drop(context);

    stack
        .reserve(results.len())
        .map_err(|err| err.to_string())?;
    for value in &results {
        stack.encode(value).map_err(|err| {
            format!("host function '{}' returned an unusable value: {err}", function.name())
        })?;
    }
    c_int::try_from(results.len()).map_err(|_| "too many results".to_string())
}
