//! Bounds-checked view over one engine's value stack.
//!
//! Every other component reaches the engine through [`StackView`]. Indices
//! follow the engine's own convention: `1` is the bottom slot, `-1` the top.
//! An index of `0` or one beyond the current depth is a stack-discipline bug
//! and panics immediately instead of reading garbage.

#![allow(unsafe_code)]

use crate::callable;
use crate::engine::{Engine, EngineCore};
use crate::error::{BridgeError, Result};
use crate::host_object;
use crate::value::{ValueKind, format_number};
use bstr::ByteSlice;
use mlua_sys as ffi;
use std::ffi::CStr;
use std::fmt::Write;
use std::os::raw::c_int;
use std::ptr;

/// Capability over the current stack of a locked engine.
///
/// A `StackView` only exists while the engine's lock is held (see
/// [`Engine::lock`]), so every operation on it is serialized with respect to
/// other threads using the same engine.
pub struct StackView<'a> {
    state: *mut ffi::lua_State,
    engine: &'a Engine,
    core: &'a EngineCore,
}

impl<'a> StackView<'a> {
    pub(crate) fn new(
        state: *mut ffi::lua_State,
        engine: &'a Engine,
        core: &'a EngineCore,
    ) -> Self {
        Self {
            state,
            engine,
            core,
        }
    }

    /// The engine this stack belongs to.
    pub fn engine(&self) -> &'a Engine {
        self.engine
    }

    pub(crate) fn core(&self) -> &'a EngineCore {
        self.core
    }

    pub(crate) fn raw(&self) -> *mut ffi::lua_State {
        self.state
    }

    /// Number of values currently on the stack.
    pub fn depth(&self) -> usize {
        let top = unsafe { ffi::lua_gettop(self.state) };
        usize::try_from(top).unwrap_or_default()
    }

    /// Resolve `index` to its positive form, panicking when it does not name
    /// a live slot.
    pub(crate) fn absolute(&self, index: i32) -> i32 {
        let depth = self.depth();
        let resolved = if index < 0 {
            i64::try_from(depth).unwrap_or(i64::MAX) + i64::from(index) + 1
        } else {
            i64::from(index)
        };
        if index == 0 || resolved < 1 || resolved > depth as i64 {
            panic!("stack index {index} out of range (depth {depth})");
        }
        resolved as i32
    }

    /// Discard every value above `depth`.
    pub fn truncate(&self, depth: usize) {
        let current = self.depth();
        assert!(
            depth <= current,
            "cannot truncate stack to {depth}: depth is only {current}"
        );
        unsafe { ffi::lua_settop(self.state, depth as c_int) };
    }

    /// Pop `n` values off the top.
    pub fn pop(&self, n: usize) {
        let current = self.depth();
        assert!(n <= current, "cannot pop {n} values: depth is only {current}");
        self.truncate(current - n);
    }

    /// Ensure room for `extra` more values, reporting failure as an engine
    /// memory error.
    pub(crate) fn reserve(&self, extra: usize) -> Result<()> {
        let extra = c_int::try_from(extra).map_err(|_| BridgeError::stack_overflow())?;
        if unsafe { ffi::lua_checkstack(self.state, extra) } == 0 {
            return Err(BridgeError::stack_overflow());
        }
        Ok(())
    }

    /// Like [`reserve`](Self::reserve) for the infallible push helpers.
    pub(crate) fn grow(&self, extra: usize) {
        if self.reserve(extra).is_err() {
            panic!(
                "engine stack cannot grow by {extra} (depth {})",
                self.depth()
            );
        }
    }

    pub fn push_nil(&self) {
        self.grow(1);
        unsafe { ffi::lua_pushnil(self.state) };
    }

    pub fn push_boolean(&self, value: bool) {
        self.grow(1);
        unsafe { ffi::lua_pushboolean(self.state, c_int::from(value)) };
    }

    pub fn push_number(&self, value: f64) {
        self.grow(1);
        unsafe { ffi::lua_pushnumber(self.state, value) };
    }

    pub fn push_integer(&self, value: i64) {
        self.grow(1);
        unsafe { ffi::lua_pushinteger(self.state, value as ffi::lua_Integer) };
    }

    pub fn push_text(&self, value: &str) {
        self.push_bytes(value.as_bytes());
    }

    pub fn push_bytes(&self, value: &[u8]) {
        self.grow(1);
        unsafe {
            ffi::lua_pushlstring(self.state, value.as_ptr().cast(), value.len());
        }
    }

    /// The boolean at `index`, or `None` when the slot holds another kind.
    pub fn peek_boolean(&self, index: i32) -> Option<bool> {
        let index = self.absolute(index);
        (self.type_code(index) == ffi::LUA_TBOOLEAN).then(|| self.to_boolean(index))
    }

    /// The number at `index`, or `None` when the slot holds another kind.
    /// Numeric strings are not coerced.
    pub fn peek_number(&self, index: i32) -> Option<f64> {
        let index = self.absolute(index);
        if self.type_code(index) != ffi::LUA_TNUMBER {
            return None;
        }
        Some(unsafe { ffi::lua_tonumberx(self.state, index, ptr::null_mut()) })
    }

    /// The text at `index`; engine strings that are not UTF-8 are converted
    /// lossily. `None` when the slot holds another kind.
    pub fn peek_text(&self, index: i32) -> Option<String> {
        self.with_bytes(index, |bytes| bytes.to_str_lossy().into_owned())
    }

    /// The raw bytes of the string at `index`.
    pub fn peek_bytes(&self, index: i32) -> Option<Vec<u8>> {
        self.with_bytes(index, <[u8]>::to_vec)
    }

    fn with_bytes<R>(&self, index: i32, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let index = self.absolute(index);
        if self.type_code(index) != ffi::LUA_TSTRING {
            return None;
        }
        let mut len = 0usize;
        let data = unsafe { ffi::lua_tolstring(self.state, index, &mut len) };
        if data.is_null() {
            return None;
        }
        // The string stays alive while it sits on the stack, which outlasts `f`.
        let bytes = unsafe { std::slice::from_raw_parts(data.cast::<u8>(), len) };
        Some(f(bytes))
    }

    /// Engine truthiness: everything but `nil` and `false` is true.
    pub(crate) fn to_boolean(&self, index: i32) -> bool {
        let index = self.absolute(index);
        unsafe { ffi::lua_toboolean(self.state, index) != 0 }
    }

    /// Numeric value at `index`, coercing numeric strings as the engine does.
    pub(crate) fn to_number(&self, index: i32) -> Option<f64> {
        let index = self.absolute(index);
        let mut is_number: c_int = 0;
        let n = unsafe { ffi::lua_tonumberx(self.state, index, &mut is_number) };
        (is_number != 0).then_some(n)
    }

    pub(crate) fn type_code(&self, index: i32) -> c_int {
        let index = self.absolute(index);
        unsafe { ffi::lua_type(self.state, index) }
    }

    /// Classify the value at `index`.
    pub fn kind(&self, index: i32) -> ValueKind {
        let index = self.absolute(index);
        match unsafe { ffi::lua_type(self.state, index) } {
            ffi::LUA_TNIL => ValueKind::Nil,
            ffi::LUA_TBOOLEAN => ValueKind::Boolean,
            ffi::LUA_TNUMBER => ValueKind::Number,
            ffi::LUA_TSTRING => ValueKind::Text,
            ffi::LUA_TTABLE => ValueKind::Table,
            ffi::LUA_TFUNCTION => {
                if self.host_function_at(index).is_some() {
                    ValueKind::HostCallable
                } else {
                    ValueKind::Callable
                }
            }
            ffi::LUA_TUSERDATA => {
                if self.host_object_at(index).is_some() {
                    ValueKind::HostObject
                } else {
                    ValueKind::Other
                }
            }
            _ => ValueKind::Other,
        }
    }

    /// Push a copy of the value at `index`.
    pub fn duplicate(&self, index: i32) {
        let index = self.absolute(index);
        self.grow(1);
        unsafe { ffi::lua_pushvalue(self.state, index) };
    }

    /// Move the top value into `index`, shifting the values above it up.
    pub fn insert(&self, index: i32) {
        let index = self.absolute(index);
        unsafe { ffi::lua_rotate(self.state, index, 1) };
    }

    /// Remove the value at `index`, shifting the values above it down.
    pub fn remove(&self, index: i32) {
        let index = self.absolute(index);
        unsafe {
            ffi::lua_rotate(self.state, index, -1);
            ffi::lua_settop(self.state, -2);
        }
    }

    /// One line per slot, bottom first: `"<i>: <kind>[ = <value>]"`.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for index in 1..=self.depth() as i32 {
            let kind = self.kind(index);
            let _ = write!(out, "{index}: {kind}");
            match kind {
                ValueKind::Number => {
                    let n = self.peek_number(index).unwrap_or_default();
                    let _ = write!(out, " = {}", format_number(n));
                }
                ValueKind::Text => {
                    let text = self.peek_text(index).unwrap_or_default();
                    let _ = write!(out, " = '{text}'");
                }
                _ => {}
            }
            out.push('\n');
        }
        out
    }

    pub(crate) fn push_native(&self, function: ffi::lua_CFunction) {
        self.grow(1);
        unsafe { ffi::lua_pushcclosure(self.state, function, 0) };
    }

    /// Push the global environment table.
    pub(crate) fn push_globals(&self) {
        self.grow(1);
        unsafe {
            ffi::lua_rawgeti(
                self.state,
                ffi::LUA_REGISTRYINDEX,
                ffi::LUA_RIDX_GLOBALS as ffi::lua_Integer,
            );
        }
    }

    /// Compile `source` and push the resulting function, or the error
    /// message on failure. Returns the engine status.
    pub(crate) fn load(&self, source: &[u8], chunk_name: &CStr) -> c_int {
        self.grow(1);
        unsafe {
            ffi::luaL_loadbufferx(
                self.state,
                source.as_ptr().cast(),
                source.len(),
                chunk_name.as_ptr(),
                ptr::null(),
            )
        }
    }

    pub(crate) fn pcall(&self, nargs: usize, nresults: c_int, handler: i32) -> c_int {
        unsafe { ffi::lua_pcall(self.state, nargs as c_int, nresults, handler) }
    }

    pub(crate) fn open_libs(&self) {
        unsafe { ffi::luaL_openlibs(self.state) };
    }

    /// Length of the table at `index` without invoking `__len`.
    pub(crate) fn raw_len(&self, index: i32) -> usize {
        let index = self.absolute(index);
        unsafe { ffi::lua_rawlen(self.state, index) as usize }
    }

    /// `t[n] = v` without metamethods, where `t` is at `index` and `v` is
    /// popped from the top.
    pub(crate) fn raw_set_index(&self, index: i32, n: i64) {
        let index = self.absolute(index);
        unsafe { ffi::lua_rawseti(self.state, index, n as ffi::lua_Integer) };
    }

    pub(crate) fn raw_equal(&self, a: i32, b: i32) -> bool {
        let (a, b) = (self.absolute(a), self.absolute(b));
        unsafe { ffi::lua_rawequal(self.state, a, b) != 0 }
    }

    /// Pop the top value into the engine registry, returning its slot.
    pub(crate) fn registry_ref(&self) -> c_int {
        self.absolute(-1);
        unsafe { ffi::luaL_ref(self.state, ffi::LUA_REGISTRYINDEX) }
    }

    pub(crate) fn registry_get(&self, slot: c_int) {
        self.grow(1);
        if slot == ffi::LUA_REFNIL {
            unsafe { ffi::lua_pushnil(self.state) };
        } else {
            unsafe {
                ffi::lua_rawgeti(self.state, ffi::LUA_REGISTRYINDEX, slot as ffi::lua_Integer);
            }
        }
    }

    pub(crate) fn registry_unref(&self, slot: c_int) {
        unsafe { ffi::luaL_unref(self.state, ffi::LUA_REGISTRYINDEX, slot) };
    }

    pub(crate) fn host_object_at(
        &self,
        index: i32,
    ) -> Option<std::sync::Arc<dyn host_object::HostObject>> {
        let index = self.absolute(index);
        self.grow(2);
        unsafe { host_object::object_in_slot(self.state, index) }
    }

    pub(crate) fn host_function_at(&self, index: i32) -> Option<callable::HostFunction> {
        let index = self.absolute(index);
        self.grow(3);
        unsafe { callable::function_in_slot(self.state, index) }
    }
}

impl std::fmt::Debug for StackView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackView")
            .field("engine", &self.engine.id())
            .field("depth", &self.depth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::Engine;
    use crate::value::ValueKind;
    use proptest::prelude::*;

    #[test]
    fn push_peek_and_kinds() {
        let engine = Engine::new().unwrap();
        let guard = engine.lock();
        let stack = guard.stack().unwrap();
        assert_eq!(stack.depth(), 0);

        stack.push_nil();
        stack.push_boolean(true);
        stack.push_number(1.5);
        stack.push_text("hello");
        assert_eq!(stack.depth(), 4);

        assert_eq!(stack.kind(1), ValueKind::Nil);
        assert_eq!(stack.kind(-3), ValueKind::Boolean);
        assert_eq!(stack.peek_boolean(2), Some(true));
        assert_eq!(stack.peek_number(-2), Some(1.5));
        assert_eq!(stack.peek_text(-1).as_deref(), Some("hello"));
        assert_eq!(stack.peek_number(-1), None);
        assert_eq!(stack.peek_text(3), None);

        stack.truncate(0);
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn duplicate_insert_remove() {
        let engine = Engine::new().unwrap();
        let guard = engine.lock();
        let stack = guard.stack().unwrap();

        stack.push_number(1.0);
        stack.push_number(2.0);
        stack.push_number(3.0);

        stack.duplicate(1);
        assert_eq!(stack.depth(), 4);
        assert_eq!(stack.peek_number(-1), Some(1.0));

        // move the duplicated 1 to the bottom: 1 1 2 3
        stack.insert(1);
        assert_eq!(stack.peek_number(1), Some(1.0));
        assert_eq!(stack.peek_number(2), Some(1.0));
        assert_eq!(stack.peek_number(4), Some(3.0));

        stack.remove(2);
        assert_eq!(stack.depth(), 3);
        assert_eq!(stack.peek_number(2), Some(2.0));
        stack.pop(3);
    }

    #[test]
    fn dump_lists_every_slot() {
        let engine = Engine::new().unwrap();
        let guard = engine.lock();
        let stack = guard.stack().unwrap();
        stack.push_number(2.0);
        stack.push_text("x");
        stack.push_boolean(false);
        assert_eq!(stack.dump(), "1: number = 2\n2: text = 'x'\n3: boolean\n");
        stack.pop(3);
    }

    #[test]
    fn non_utf8_text_is_lossy() {
        let engine = Engine::new().unwrap();
        let guard = engine.lock();
        let stack = guard.stack().unwrap();
        stack.push_bytes(&[0x61, 0xff, 0x62]);
        assert_eq!(stack.peek_bytes(-1), Some(vec![0x61, 0xff, 0x62]));
        assert_eq!(stack.peek_text(-1).as_deref(), Some("a\u{FFFD}b"));
        stack.pop(1);
    }

    #[test]
    #[should_panic(expected = "stack index 0 out of range")]
    fn index_zero_panics() {
        let engine = Engine::new().unwrap();
        let guard = engine.lock();
        let stack = guard.stack().unwrap();
        stack.push_nil();
        stack.kind(0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn index_beyond_top_panics() {
        let engine = Engine::new().unwrap();
        let guard = engine.lock();
        let stack = guard.stack().unwrap();
        stack.push_nil();
        stack.peek_number(-2);
    }

    #[test]
    #[should_panic(expected = "cannot pop 2 values")]
    fn over_pop_panics() {
        let engine = Engine::new().unwrap();
        let guard = engine.lock();
        let stack = guard.stack().unwrap();
        stack.push_nil();
        stack.pop(2);
    }

    #[derive(Debug, Clone)]
    enum Op {
        PushNil,
        PushBool(bool),
        PushNumber(f64),
        PushText(String),
        Pop(usize),
        Duplicate(usize),
        Remove(usize),
        Insert(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::PushNil),
            any::<bool>().prop_map(Op::PushBool),
            any::<f64>().prop_map(Op::PushNumber),
            "[a-z]{0,8}".prop_map(Op::PushText),
            (0usize..4).prop_map(Op::Pop),
            (0usize..8).prop_map(Op::Duplicate),
            (0usize..8).prop_map(Op::Remove),
            (0usize..8).prop_map(Op::Insert),
        ]
    }

    proptest! {
        #[test]
        fn stack_balance_holds_for_random_sequences(ops in prop::collection::vec(op_strategy(), 0..64)) {
            let engine = Engine::new().unwrap();
            let guard = engine.lock();
            let stack = guard.stack().unwrap();
            let mut expected = 0usize;

            for op in ops {
                let before = stack.depth();
                prop_assert_eq!(before, expected);
                match op {
                    Op::PushNil => { stack.push_nil(); expected += 1; }
                    Op::PushBool(b) => { stack.push_boolean(b); expected += 1; }
                    Op::PushNumber(n) => { stack.push_number(n); expected += 1; }
                    Op::PushText(s) => { stack.push_text(&s); expected += 1; }
                    Op::Pop(n) => {
                        let n = n.min(expected);
                        stack.pop(n);
                        expected -= n;
                    }
                    Op::Duplicate(i) if expected > 0 => {
                        stack.duplicate((i % expected) as i32 + 1);
                        expected += 1;
                    }
                    Op::Remove(i) if expected > 0 => {
                        stack.remove(-((i % expected) as i32) - 1);
                        expected -= 1;
                    }
                    Op::Insert(i) if expected > 0 => {
                        stack.insert((i % expected) as i32 + 1);
                    }
                    _ => {}
                }
                prop_assert_eq!(stack.depth(), expected);
            }
            stack.truncate(0);
        }
    }
}
