//! Pinning engine values so the host can hold them across calls.
//!
//! The engine's own registry table keeps pinned values alive. The host never
//! sees raw registry slots: it gets a [`RegistryKey`] whose token is never
//! reused, so a key that outlives its release is always detected instead of
//! silently aliasing whatever took its slot.

use crate::engine::EngineId;
use crate::error::{BridgeError, Result};
use crate::reference::ManagedReference;
use crate::stack::StackView;
use std::collections::HashMap;
use std::fmt;
use std::os::raw::c_int;

/// Opaque handle to a value pinned in one engine's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistryKey {
    engine: EngineId,
    token: u64,
}

impl RegistryKey {
    /// The engine that issued this key.
    pub fn engine(&self) -> EngineId {
        self.engine
    }
}

impl fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.engine, self.token)
    }
}

/// Token to registry slot bookkeeping for one engine.
#[derive(Debug, Default)]
pub(crate) struct RegistryTable {
    next_token: u64,
    slots: HashMap<u64, c_int>,
}

impl RegistryTable {
    fn insert(&mut self, slot: c_int) -> u64 {
        self.next_token += 1;
        self.slots.insert(self.next_token, slot);
        self.next_token
    }

    fn get(&self, token: u64) -> Option<c_int> {
        self.slots.get(&token).copied()
    }

    fn remove(&mut self, token: u64) -> Option<c_int> {
        self.slots.remove(&token)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Forget every entry, returning how many were still pinned. Used when
    /// the whole engine goes away.
    pub(crate) fn clear(&mut self) -> usize {
        let pinned = self.slots.len();
        self.slots.clear();
        pinned
    }
}

impl StackView<'_> {
    fn check_owner(&self, key: &RegistryKey) -> Result<()> {
        let expected = self.engine().id();
        if key.engine != expected {
            return Err(BridgeError::CrossHandleMismatch {
                expected,
                found: key.engine,
            });
        }
        Ok(())
    }

    /// Pin a copy of the value at `index`, leaving the stack unchanged.
    pub fn pin(&self, index: i32) -> RegistryKey {
        self.duplicate(index);
        let slot = self.registry_ref();
        let (token, live) = {
            let mut registry = self.core().registry.borrow_mut();
            (registry.insert(slot), registry.len())
        };
        tracing::trace!(engine = %self.engine().id(), token, live, "pinned");
        RegistryKey {
            engine: self.engine().id(),
            token,
        }
    }

    /// Push the value pinned under `key`.
    pub fn push_by_key(&self, key: &RegistryKey) -> Result<()> {
        self.check_owner(key)?;
        let slot = self
            .core()
            .registry
            .borrow()
            .get(key.token)
            .ok_or(BridgeError::UseAfterRelease {
                key: *key,
                operation: "push",
            })?;
        self.registry_get(slot);
        Ok(())
    }

    /// Release the pin held under `key`. Releasing twice is an error.
    pub fn unpin(&self, key: RegistryKey) -> Result<()> {
        self.check_owner(&key)?;
        let slot = self
            .core()
            .registry
            .borrow_mut()
            .remove(key.token)
            .ok_or(BridgeError::UseAfterRelease {
                key,
                operation: "release",
            })?;
        self.registry_unref(slot);
        tracing::trace!(key = %key, live = self.live_references(), "unpinned");
        Ok(())
    }

    /// Pin the value at `index` and wrap it in a [`ManagedReference`].
    pub fn reference(&self, index: i32) -> ManagedReference {
        let kind = self.kind(index);
        let key = self.pin(index);
        ManagedReference::new(self.engine().clone(), key, kind)
    }

    /// Pin and pop the top value.
    pub fn pop_reference(&self) -> ManagedReference {
        let reference = self.reference(-1);
        self.pop(1);
        reference
    }

    /// Number of values currently pinned for the host.
    pub fn live_references(&self) -> usize {
        self.core().registry.borrow().len()
    }
}
