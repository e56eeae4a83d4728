//! Host-held leases on engine values.

use crate::engine::Engine;
use crate::error::{BridgeError, Result};
use crate::protocol::{self, Arg, Callee, ResultCount};
use crate::registry::RegistryKey;
use crate::stack::StackView;
use crate::value::{HostValue, ValueKind, format_number};
use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Key used to index a table-like engine value.
#[derive(Debug)]
pub enum FieldKey<'a> {
    Name(Cow<'a, str>),
    Index(i64),
    /// Any engine value, used as the key verbatim
    Value(&'a ManagedReference),
}

impl<'a> From<&'a str> for FieldKey<'a> {
    fn from(name: &'a str) -> Self {
        Self::Name(Cow::Borrowed(name))
    }
}

impl From<String> for FieldKey<'_> {
    fn from(name: String) -> Self {
        Self::Name(Cow::Owned(name))
    }
}

impl From<i64> for FieldKey<'_> {
    fn from(index: i64) -> Self {
        Self::Index(index)
    }
}

impl From<i32> for FieldKey<'_> {
    fn from(index: i32) -> Self {
        Self::Index(i64::from(index))
    }
}

impl<'a> From<&'a ManagedReference> for FieldKey<'a> {
    fn from(key: &'a ManagedReference) -> Self {
        Self::Value(key)
    }
}

impl fmt::Display for FieldKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "'{name}'"),
            Self::Index(index) => write!(f, "[{index}]"),
            Self::Value(reference) => write!(f, "[{}]", reference.key()),
        }
    }
}

/// A lease on one engine value pinned in the registry.
///
/// The pin is dropped exactly once: either by [`release`](Self::release) or
/// when the lease itself is dropped. Every operation checks liveness first
/// and fails with `UseAfterRelease` once the lease has been released.
///
/// A lease keeps its engine handle alive, so the engine it points into can
/// only be closed explicitly while leases are outstanding.
pub struct ManagedReference {
    engine: Engine,
    key: RegistryKey,
    kind: ValueKind,
    released: AtomicBool,
}

impl ManagedReference {
    pub(crate) fn new(engine: Engine, key: RegistryKey, kind: ValueKind) -> Self {
        Self {
            engine,
            key,
            kind,
            released: AtomicBool::new(false),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn key(&self) -> RegistryKey {
        self.key
    }

    /// Kind of the value when it was pinned. Pinned values never change kind.
    pub fn pinned_kind(&self) -> ValueKind {
        self.kind
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_live(&self, operation: &'static str) -> Result<()> {
        if self.is_released() {
            return Err(BridgeError::UseAfterRelease {
                key: self.key,
                operation,
            });
        }
        Ok(())
    }

    /// Fail unless this lease belongs to `engine`.
    pub(crate) fn ensure_engine(&self, engine: &Engine) -> Result<()> {
        if !self.engine.same_engine(engine) {
            return Err(BridgeError::CrossHandleMismatch {
                expected: engine.id(),
                found: self.engine.id(),
            });
        }
        Ok(())
    }

    /// Push the leased value onto `stack`.
    pub(crate) fn push_onto(&self, stack: &StackView<'_>) -> Result<()> {
        self.ensure_live("push")?;
        stack.push_by_key(&self.key)
    }

    fn with_stack<R>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&StackView<'_>) -> Result<R>,
    ) -> Result<R> {
        self.ensure_live(operation)?;
        let guard = self.engine.lock();
        let stack = guard.stack()?;
        f(&stack)
    }

    /// Current kind, read from the engine.
    pub fn kind(&self) -> Result<ValueKind> {
        self.with_stack("kind", |stack| {
            self.push_onto(stack)?;
            let kind = stack.kind(-1);
            stack.pop(1);
            Ok(kind)
        })
    }

    pub fn is_nil(&self) -> Result<bool> {
        Ok(self.kind()? == ValueKind::Nil)
    }

    pub fn is_boolean(&self) -> Result<bool> {
        Ok(self.kind()? == ValueKind::Boolean)
    }

    pub fn is_number(&self) -> Result<bool> {
        Ok(self.kind()? == ValueKind::Number)
    }

    pub fn is_text(&self) -> Result<bool> {
        Ok(self.kind()? == ValueKind::Text)
    }

    pub fn is_table(&self) -> Result<bool> {
        Ok(self.kind()? == ValueKind::Table)
    }

    /// Script functions and host functions alike.
    pub fn is_callable(&self) -> Result<bool> {
        Ok(matches!(
            self.kind()?,
            ValueKind::Callable | ValueKind::HostCallable
        ))
    }

    pub fn is_host_object(&self) -> Result<bool> {
        Ok(self.kind()? == ValueKind::HostObject)
    }

    pub fn is_host_callable(&self) -> Result<bool> {
        Ok(self.kind()? == ValueKind::HostCallable)
    }

    /// Decode the leased value. Composite values come back as a fresh lease.
    pub fn value(&self) -> Result<HostValue> {
        self.with_stack("value", |stack| {
            self.push_onto(stack)?;
            stack.pop_value()
        })
    }

    /// Engine truthiness of the value.
    pub fn as_boolean(&self) -> Result<bool> {
        self.with_stack("as_boolean", |stack| {
            self.push_onto(stack)?;
            let truthy = stack.to_boolean(-1);
            stack.pop(1);
            Ok(truthy)
        })
    }

    /// The value as a number, converting numeric strings.
    pub fn as_number(&self) -> Result<Option<f64>> {
        self.with_stack("as_number", |stack| {
            self.push_onto(stack)?;
            let n = stack.to_number(-1);
            stack.pop(1);
            Ok(n)
        })
    }

    /// The value as text; numbers are rendered, other kinds give `None`.
    pub fn as_text(&self) -> Result<Option<String>> {
        self.with_stack("as_text", |stack| {
            self.push_onto(stack)?;
            let text = match stack.kind(-1) {
                ValueKind::Text => stack.peek_text(-1),
                ValueKind::Number => stack.peek_number(-1).map(format_number),
                _ => None,
            };
            stack.pop(1);
            Ok(text)
        })
    }

    /// Pin `self[key]`. Metamethods are honored.
    pub fn field<'k>(&self, key: impl Into<FieldKey<'k>>) -> Result<ManagedReference> {
        let key = key.into();
        self.ensure_indexable("field")?;
        self.with_stack("field", |stack| {
            protocol::get_field(stack, Arg::Reference(self), &key)
        })
    }

    /// `self[key] = value`. Metamethods are honored.
    pub fn set_field<'k>(
        &self,
        key: impl Into<FieldKey<'k>>,
        value: impl Into<HostValue>,
    ) -> Result<()> {
        let key = key.into();
        let value = value.into();
        self.ensure_indexable("set_field")?;
        self.with_stack("set_field", |stack| {
            protocol::set_field(stack, Arg::Reference(self), &key, &value)
        })
    }

    fn ensure_indexable(&self, operation: &'static str) -> Result<()> {
        self.ensure_live(operation)?;
        if !self.kind.is_indexable() {
            return Err(BridgeError::illegal(format!(
                "{operation} needs a table-like value, found {}",
                self.kind
            )));
        }
        Ok(())
    }

    /// Call the leased value with `args`.
    pub fn call(&self, args: &[HostValue], results: ResultCount) -> Result<Vec<HostValue>> {
        self.with_stack("call", |stack| {
            let args: Vec<Arg<'_>> = args.iter().map(Arg::Value).collect();
            protocol::call(stack, Callee::Reference(self), &args, results)
        })
    }

    /// Call `self[name](self, args...)`.
    pub fn call_method(
        &self,
        name: &str,
        args: &[HostValue],
        results: ResultCount,
    ) -> Result<Vec<HostValue>> {
        crate::error::require_name("method name", name)?;
        self.ensure_indexable("call_method")?;
        self.with_stack("call_method", |stack| {
            let method = protocol::get_field(stack, Arg::Reference(self), &name.into())?;
            let mut call_args = Vec::with_capacity(args.len() + 1);
            call_args.push(Arg::Reference(self));
            call_args.extend(args.iter().map(Arg::Value));
            protocol::call(stack, Callee::Reference(&method), &call_args, results)
        })
    }

    /// Pin the same value again under a new key.
    pub fn try_clone(&self) -> Result<ManagedReference> {
        self.with_stack("clone", |stack| {
            self.push_onto(stack)?;
            Ok(stack.pop_reference())
        })
    }

    /// Drop the pin now. A second release fails with `UseAfterRelease`.
    pub fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Err(BridgeError::UseAfterRelease {
                key: self.key,
                operation: "release",
            });
        }
        self.unpin()
    }

    fn unpin(&self) -> Result<()> {
        let guard = self.engine.lock();
        match guard.stack() {
            Ok(stack) => stack.unpin(self.key),
            Err(BridgeError::EngineClosed { .. }) => {
                tracing::warn!(key = %self.key, "reference outlived its engine");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Primitive equality in the engine, without metamethods.
    pub fn raw_equals(&self, other: &ManagedReference) -> Result<bool> {
        other.ensure_live("raw_equals")?;
        other.ensure_engine(&self.engine)?;
        self.with_stack("raw_equals", |stack| {
            self.push_onto(stack)?;
            other.push_onto(stack)?;
            let equal = stack.raw_equal(-1, -2);
            stack.pop(2);
            Ok(equal)
        })
    }

    /// Human readable rendering: primitives as their value, composites as a
    /// placeholder, host objects through their own `Display`.
    pub fn render(&self) -> Result<String> {
        self.with_stack("render", |stack| {
            self.push_onto(stack)?;
            let text = match stack.kind(-1) {
                ValueKind::Nil => "nil".to_string(),
                ValueKind::Boolean => stack.to_boolean(-1).to_string(),
                ValueKind::Number => format_number(stack.peek_number(-1).unwrap_or_default()),
                ValueKind::Text => stack.peek_text(-1).unwrap_or_default(),
                ValueKind::Callable => "Lua Function".to_string(),
                ValueKind::HostCallable => "Host Function".to_string(),
                ValueKind::Table => "Lua Table".to_string(),
                ValueKind::HostObject => stack
                    .host_object_at(-1)
                    .map(|object| object.to_string())
                    .unwrap_or_default(),
                ValueKind::Other => "Userdata".to_string(),
            };
            stack.pop(1);
            Ok(text)
        })
    }
}

impl Drop for ManagedReference {
    fn drop(&mut self) {
        if *self.released.get_mut() {
            return;
        }
        *self.released.get_mut() = true;
        if let Err(err) = self.unpin() {
            tracing::warn!(key = %self.key, error = %err, "failed to release reference on drop");
        }
    }
}

impl fmt::Display for ManagedReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.render() {
            Ok(text) => f.write_str(&text),
            Err(_) => write!(f, "<released {}>", self.kind),
        }
    }
}

impl fmt::Debug for ManagedReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedReference")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn engine_with_libs() -> Engine {
        let engine = Engine::new().unwrap();
        engine.open_standard_libraries().unwrap();
        engine
    }

    #[test]
    fn field_reads_and_writes() {
        let engine = engine_with_libs();
        let table = engine.evaluate("return { a = 1, [2] = 'two' }").unwrap().remove(0);
        let table = table.into_reference().unwrap();

        assert_eq!(table.field("a").unwrap().as_number().unwrap(), Some(1.0));
        assert_eq!(table.field(2).unwrap().as_text().unwrap().as_deref(), Some("two"));
        assert!(table.field("missing").unwrap().is_nil().unwrap());

        table.set_field("b", "bee").unwrap();
        assert_eq!(table.field("b").unwrap().as_text().unwrap().as_deref(), Some("bee"));
    }

    #[test]
    fn field_honors_index_metamethod() {
        let engine = engine_with_libs();
        let proxy = engine
            .evaluate("return setmetatable({}, { __index = function(_, k) return k .. '!' end })")
            .unwrap()
            .remove(0)
            .into_reference()
            .unwrap();
        assert_eq!(
            proxy.field("hey").unwrap().as_text().unwrap().as_deref(),
            Some("hey!")
        );
    }

    #[test]
    fn field_on_non_table_is_illegal() {
        let engine = engine_with_libs();
        let function = engine.evaluate("return print").unwrap().remove(0);
        let function = function.into_reference().unwrap();
        assert_eq!(
            function.field("x").unwrap_err().kind(),
            ErrorKind::IllegalArgument
        );
    }

    #[test]
    fn release_then_use_fails() {
        let engine = engine_with_libs();
        let table = engine.global("string").unwrap();
        let before = engine.live_references().unwrap();
        table.release().unwrap();
        assert_eq!(engine.live_references().unwrap(), before - 1);
        assert!(table.is_released());
        assert_eq!(table.kind().unwrap_err().kind(), ErrorKind::UseAfterRelease);
        assert_eq!(table.field("len").unwrap_err().kind(), ErrorKind::UseAfterRelease);
        assert_eq!(table.release().unwrap_err().kind(), ErrorKind::UseAfterRelease);
    }

    #[test]
    fn drop_releases_the_pin() {
        let engine = engine_with_libs();
        let before = engine.live_references().unwrap();
        {
            let _table = engine.global("math").unwrap();
            assert_eq!(engine.live_references().unwrap(), before + 1);
        }
        assert_eq!(engine.live_references().unwrap(), before);
    }

    #[test]
    fn call_method_passes_receiver() {
        let engine = engine_with_libs();
        let counter = engine
            .evaluate("return { n = 10, add = function(self, k) self.n = self.n + k; return self.n end }")
            .unwrap()
            .remove(0)
            .into_reference()
            .unwrap();
        let results = counter
            .call_method("add", &[HostValue::from(5)], ResultCount::Exactly(1))
            .unwrap();
        assert_eq!(results, vec![HostValue::Number(15.0)]);
        assert_eq!(counter.field("n").unwrap().as_number().unwrap(), Some(15.0));
    }

    #[test]
    fn rendering_uses_placeholders() {
        let engine = engine_with_libs();
        let values = engine
            .evaluate("return {}, function() end, 3, 'x', true")
            .unwrap();
        let rendered: Vec<String> = values.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, ["Lua Table", "Lua Function", "3", "x", "true"]);
        let print = engine.global("print").unwrap();
        assert_eq!(print.render().unwrap(), "Lua Function");
    }

    #[test]
    fn clones_are_independent() {
        let engine = engine_with_libs();
        let table = engine.global("table").unwrap();
        let copy = table.try_clone().unwrap();
        assert!(table.raw_equals(&copy).unwrap());
        table.release().unwrap();
        assert!(copy.is_table().unwrap());
    }

    #[test]
    fn raw_equals_rejects_other_engines() {
        let a = engine_with_libs();
        let b = engine_with_libs();
        let x = a.global("string").unwrap();
        let y = b.global("string").unwrap();
        assert_eq!(
            x.raw_equals(&y).unwrap_err().kind(),
            ErrorKind::CrossHandleMismatch
        );
    }

    #[test]
    fn numeric_strings_convert() {
        let engine = engine_with_libs();
        engine.set_global("n", "42").unwrap();
        let n = engine.global("n").unwrap();
        assert_eq!(n.as_number().unwrap(), Some(42.0));
        assert!(n.as_boolean().unwrap());
        engine.set_global("nothing", HostValue::Nil).unwrap();
        assert!(!engine.global("nothing").unwrap().as_boolean().unwrap());
    }
}
