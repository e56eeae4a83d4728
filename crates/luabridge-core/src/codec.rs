//! Marshaling between [`HostValue`] and engine stack slots.

use crate::error::{BridgeError, Result};
use crate::stack::StackView;
use crate::value::{HostValue, ValueKind};
use std::sync::Arc;

impl StackView<'_> {
    /// Push `value`. Exactly one slot is added on success and none on error.
    pub fn encode(&self, value: &HostValue) -> Result<()> {
        match value {
            HostValue::Nil => self.push_nil(),
            HostValue::Boolean(b) => self.push_boolean(*b),
            HostValue::Number(n) => self.push_number(*n),
            HostValue::Text(s) => self.push_text(s),
            HostValue::Reference(reference) => reference.push_onto(self)?,
            HostValue::HostObject(object) => self.push_host_object(Arc::clone(object)),
            HostValue::HostCallable(function) => self.push_host_function(function.clone()),
        }
        Ok(())
    }

    /// Read the value at `index` without popping it. Tables, script
    /// functions and foreign userdata come back pinned.
    pub fn decode(&self, index: i32) -> Result<HostValue> {
        let index = self.absolute(index);
        let kind = self.kind(index);
        let lost = || BridgeError::Marshal {
            expected: "host identity",
            found: kind,
        };
        Ok(match kind {
            ValueKind::Nil => HostValue::Nil,
            ValueKind::Boolean => HostValue::Boolean(self.to_boolean(index)),
            ValueKind::Number => HostValue::Number(self.peek_number(index).ok_or_else(lost)?),
            ValueKind::Text => HostValue::Text(self.peek_text(index).ok_or_else(lost)?),
            ValueKind::HostObject => HostValue::HostObject(self.host_object_at(index).ok_or_else(lost)?),
            ValueKind::HostCallable => {
                HostValue::HostCallable(self.host_function_at(index).ok_or_else(lost)?)
            }
            ValueKind::Callable | ValueKind::Table | ValueKind::Other => {
                HostValue::Reference(self.reference(index))
            }
        })
    }

    /// Decode the top value and pop it.
    pub fn pop_value(&self) -> Result<HostValue> {
        let value = self.decode(-1);
        self.pop(1);
        value
    }
}
