//! Host objects exposed to script code as opaque userdata.
//!
//! A host object travels into the engine as a userdata block that owns a
//! strong handle to the object. The block's metatable gives scripts
//! `tostring(obj)` and `obj.field` access and drops the handle when the
//! engine collects the block. Coming back out, the block yields the very
//! same `Arc`, so identity survives any number of round trips.

#![allow(unsafe_code)]

use crate::engine::{Engine, EngineId};
use crate::stack::StackView;
use crate::value::HostValue;
use mlua_sys as ffi;
use std::any::{Any, type_name};
use std::ffi::CStr;
use std::fmt;
use std::os::raw::c_int;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::{mem, ptr};

pub(crate) const HOST_OBJECT_META: &CStr = c"luabridge.HostObject";
pub(crate) const HOST_FUNCTION_META: &CStr = c"luabridge.HostFunction";

/// A host value that scripts can hold, print and index.
pub trait HostObject: fmt::Display + Send + Sync + 'static {
    /// Downcasting hook for hosts that get their objects back.
    fn as_any(&self) -> &dyn Any;

    /// Value scripts see for `obj.name`; `None` reads as `nil`.
    fn get(&self, _name: &str) -> Option<HostValue> {
        None
    }
}

/// Userdata layout shared by host objects and host functions.
pub(crate) struct HostCell<T> {
    pub(crate) engine: EngineId,
    /// Emptied by the finalizer.
    pub(crate) payload: Option<T>,
}

/// Push a new userdata owning `payload`, with the metatable `meta`.
pub(crate) unsafe fn push_cell<T>(
    state: *mut ffi::lua_State,
    engine: EngineId,
    payload: T,
    meta: &CStr,
) {
    unsafe {
        let block = ffi::lua_newuserdatauv(state, mem::size_of::<HostCell<T>>(), 0)
            .cast::<HostCell<T>>();
        debug_assert!(block.is_aligned(), "{} is over-aligned", type_name::<T>());
        ptr::write(
            block,
            HostCell {
                engine,
                payload: Some(payload),
            },
        );
        ffi::luaL_setmetatable(state, meta.as_ptr());
    }
}

/// The cell at `index` when it carries the metatable `meta`.
///
/// Needs two free stack slots.
pub(crate) unsafe fn cell_in_slot<'a, T>(
    state: *mut ffi::lua_State,
    index: c_int,
    meta: &CStr,
) -> Option<&'a HostCell<T>> {
    unsafe {
        let block = ffi::luaL_testudata(state, index, meta.as_ptr()).cast::<HostCell<T>>();
        block.as_ref()
    }
}

pub(crate) unsafe fn object_in_slot(
    state: *mut ffi::lua_State,
    index: c_int,
) -> Option<Arc<dyn HostObject>> {
    let cell = unsafe { cell_in_slot::<Arc<dyn HostObject>>(state, index, HOST_OBJECT_META)? };
    cell.payload.clone()
}

/// `__gc` for every cell type.
pub(crate) unsafe extern "C-unwind" fn gc_cell<T>(state: *mut ffi::lua_State) -> c_int {
    let payload = unsafe {
        let block = ffi::lua_touserdata(state, 1).cast::<HostCell<T>>();
        block.as_mut().and_then(|cell| cell.payload.take())
    };
    // A panicking destructor must not unwind into the engine.
    let _ = panic::catch_unwind(AssertUnwindSafe(move || drop(payload)));
    0
}

/// Run a callback body on behalf of the engine. Panics and `Err` become
/// engine errors; the error is raised only after every Rust value created by
/// `body` has been dropped.
pub(crate) unsafe fn run_host_entry<F>(state: *mut ffi::lua_State, body: F) -> c_int
where
    F: FnOnce() -> Result<c_int, String>,
{
    let message = match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(count)) => return count,
        Ok(Err(message)) => message,
        Err(payload) => panic_message(payload.as_ref()),
    };
    unsafe { raise(state, message) }
}

unsafe fn raise(state: *mut ffi::lua_State, message: String) -> c_int {
    unsafe {
        ffi::lua_pushlstring(state, message.as_ptr().cast(), message.len());
        drop(message);
        ffi::lua_error(state)
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

impl StackView<'_> {
    /// Push `object` as userdata owned by this engine.
    pub(crate) fn push_host_object(&self, object: Arc<dyn HostObject>) {
        self.grow(2);
        unsafe { push_cell(self.raw(), self.engine().id(), object, HOST_OBJECT_META) };
    }
}

unsafe fn set_metamethod(state: *mut ffi::lua_State, name: &CStr, function: ffi::lua_CFunction) {
    unsafe {
        ffi::lua_pushcclosure(state, function, 0);
        ffi::lua_setfield(state, -2, name.as_ptr());
    }
}

/// Install the metatables for host objects and host function cells.
pub(crate) fn register_metatables(stack: &StackView<'_>) {
    stack.grow(2);
    let state = stack.raw();
    unsafe {
        ffi::luaL_newmetatable(state, HOST_OBJECT_META.as_ptr());
        set_metamethod(state, c"__gc", gc_cell::<Arc<dyn HostObject>>);
        set_metamethod(state, c"__tostring", host_object_tostring);
        set_metamethod(state, c"__index", host_object_index);
        ffi::lua_pop(state, 1);

        ffi::luaL_newmetatable(state, HOST_FUNCTION_META.as_ptr());
        set_metamethod(state, c"__gc", gc_cell::<crate::callable::HostFunction>);
        ffi::lua_pop(state, 1);
    }
}

unsafe extern "C-unwind" fn host_object_tostring(state: *mut ffi::lua_State) -> c_int {
    unsafe {
        run_host_entry(state, || {
            let object = object_in_slot(state, 1).ok_or_else(|| "not a host object".to_string())?;
            let text = object.to_string();
            ffi::lua_pushlstring(state, text.as_ptr().cast(), text.len());
            Ok(1)
        })
    }
}

unsafe extern "C-unwind" fn host_object_index(state: *mut ffi::lua_State) -> c_int {
    unsafe {
        run_host_entry(state, || {
            let cell = cell_in_slot::<Arc<dyn HostObject>>(state, 1, HOST_OBJECT_META)
                .ok_or_else(|| "not a host object".to_string())?;
            let engine_id = cell.engine;
            let object = cell
                .payload
                .clone()
                .ok_or_else(|| "host object was finalized".to_string())?;

            let name = (ffi::lua_type(state, 2) == ffi::LUA_TSTRING).then(|| {
                let mut len = 0usize;
                let data = ffi::lua_tolstring(state, 2, &mut len);
                String::from_utf8_lossy(std::slice::from_raw_parts(data.cast::<u8>(), len))
                    .into_owned()
            });
            let Some(value) = name.and_then(|name| object.get(&name)) else {
                ffi::lua_pushnil(state);
                return Ok(1);
            };

            let engine = Engine::from_callback(engine_id)?;
            let guard = engine.lock();
            let _thread = guard.enter_thread(state);
            let stack = guard.stack().map_err(|err| err.to_string())?;
            stack.encode(&value).map_err(|err| err.to_string())?;
            Ok(1)
        })
    }
}
