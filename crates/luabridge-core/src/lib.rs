//! luabridge-core: host bridge to an embedded Lua 5.4 engine
//!
//! The host talks to the engine only through its value stack. This crate
//! layers typed, checked access on top of that protocol.
//!
//! # Architecture
//!
//! ```text
//! Engine (handle, lock, close)
//!    ↓
//! StackView ── codec (HostValue ⇄ stack slot)
//!    ↓
//! registry (pins) → ManagedReference
//!    ↓
//! protocol (protected calls) ← callable / host_object (host → engine)
//!    ↓
//! proxy (host interfaces backed by script tables)
//! ```
//!
//! # Modules
//!
//! - `engine`: engine handles, host surface, `EngineCell`
//! - `stack`: bounds-checked stack view
//! - `codec`: encoding and decoding of [`HostValue`]
//! - `registry`: pinning values for the host
//! - `reference`: [`ManagedReference`], scoped handles to pinned values
//! - `protocol`: the protected call entry point
//! - `callable`: host functions callable from scripts
//! - `host_object`: host objects living in engine userdata
//! - `modules`: module sources for `require`
//! - `proxy`: interface contracts and [`ScriptProxy`]
//! - `config`: TOML configuration
//! - `logging`: tracing subscriber setup and the script `print` hook
//!
//! # Safety
//!
//! Unsafe code is confined to the modules that call the C API; each opts in
//! with a module-level `allow`.

pub mod callable;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod host_object;
pub mod logging;
pub mod modules;
pub mod protocol;
pub mod proxy;
pub mod reference;
pub mod registry;
pub mod stack;
pub mod value;

pub use callable::{CallContext, HostFunction};
pub use config::{BridgeConfig, ConfigError, EngineOptions, ModuleRoot};
pub use engine::{Engine, EngineCell, EngineGuard, EngineId};
pub use error::{BridgeError, EngineErrorKind, ErrorKind, Result};
pub use host_object::HostObject;
pub use logging::{LogConfig, LogError, LogFormat, LogLevel, init_logging};
pub use modules::{DirectoryModuleSource, ModuleSource};
pub use protocol::ResultCount;
pub use proxy::{
    FromHostValues, InterfaceCatalog, InterfaceContract, MethodSignature, ReturnShape,
    ScriptProxy,
};
pub use reference::{FieldKey, ManagedReference};
pub use registry::RegistryKey;
pub use stack::StackView;
pub use value::{FromHostValue, HostValue, ValueKind};
