//! Engine handles: ownership of one embedded Lua state and the host-facing
//! surface built on top of it.

#![allow(unsafe_code)]

use crate::callable::HostFunction;
use crate::config::EngineOptions;
use crate::error::{BridgeError, Result, require_name};
use crate::host_object;
use crate::modules::{DirectoryModuleSource, ModuleSource};
use crate::protocol::{self, Arg, Callee, ResultCount};
use crate::reference::ManagedReference;
use crate::registry::RegistryTable;
use crate::stack::StackView;
use crate::value::{HostValue, ValueKind};
use mlua_sys as ffi;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::path::{MAIN_SEPARATOR, Path};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Weak};

/// Process-unique identity of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineId(u64);

impl EngineId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Engines alive in this process, keyed by id, so that callbacks entering
/// from the engine can find their way back to the owning handle.
static DIRECTORY: LazyLock<RwLock<HashMap<EngineId, Weak<EngineShared>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// State reachable only while the engine lock is held.
pub(crate) struct EngineCore {
    main: Cell<*mut ffi::lua_State>,
    /// The thread currently running code; differs from `main` while a
    /// callback entered from a coroutine is being served.
    active: Cell<*mut ffi::lua_State>,
    in_flight: Cell<u32>,
    traceback: Cell<bool>,
    pub(crate) registry: RefCell<RegistryTable>,
}

// The raw state pointer is only dereferenced while the owning
// `ReentrantMutex` is held.
unsafe impl Send for EngineCore {}

impl EngineCore {
    pub(crate) fn traceback(&self) -> bool {
        self.traceback.get()
    }

    pub(crate) fn begin_call(&self) -> CallScope<'_> {
        self.in_flight.set(self.in_flight.get() + 1);
        CallScope { core: self }
    }
}

/// Marks a protected call as in flight for as long as it lives.
pub(crate) struct CallScope<'a> {
    core: &'a EngineCore,
}

impl Drop for CallScope<'_> {
    fn drop(&mut self) {
        self.core.in_flight.set(self.core.in_flight.get() - 1);
    }
}

/// Switches the active thread for a callback and restores it afterwards.
pub(crate) struct ThreadScope<'a> {
    core: &'a EngineCore,
    previous: *mut ffi::lua_State,
}

impl Drop for ThreadScope<'_> {
    fn drop(&mut self) {
        self.core.active.set(self.previous);
    }
}

pub(crate) struct EngineShared {
    id: EngineId,
    core: ReentrantMutex<EngineCore>,
}

impl Drop for EngineShared {
    fn drop(&mut self) {
        DIRECTORY.write().remove(&self.id);
        let core = self.core.get_mut();
        let state = core.main.replace(ptr::null_mut());
        if !state.is_null() {
            tracing::debug!(engine = %self.id, "closing engine on last handle drop");
            unsafe { ffi::lua_close(state) };
        }
    }
}

/// Owning handle to one embedded engine.
///
/// Handles are cheap to clone and may be shared across threads; all access
/// to the engine is serialized through a reentrant lock, so a host function
/// called from script code on the locking thread can use the same handle
/// again. The engine closes when [`close`](Self::close) is called or when the
/// last handle (including the ones held by live references) is dropped.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    /// Create a fresh engine with no standard libraries opened.
    pub fn new() -> Result<Self> {
        let state = unsafe { ffi::luaL_newstate() };
        if state.is_null() {
            return Err(BridgeError::engine(
                crate::error::EngineErrorKind::Memory,
                "cannot allocate engine state",
            ));
        }
        let id = EngineId::next();
        let shared = Arc::new(EngineShared {
            id,
            core: ReentrantMutex::new(EngineCore {
                main: Cell::new(state),
                active: Cell::new(state),
                in_flight: Cell::new(0),
                traceback: Cell::new(true),
                registry: RefCell::new(RegistryTable::default()),
            }),
        });
        DIRECTORY.write().insert(id, Arc::downgrade(&shared));
        let engine = Self { shared };
        {
            let guard = engine.lock();
            let stack = guard.stack()?;
            host_object::register_metatables(&stack);
        }
        tracing::debug!(engine = %id, "engine created");
        Ok(engine)
    }

    /// Create an engine and apply `options` to it.
    pub fn with_options(options: &EngineOptions) -> Result<Self> {
        options
            .validate()
            .map_err(|err| BridgeError::illegal(err.to_string()))?;
        let engine = Self::new()?;
        engine.set_traceback(options.traceback);
        if options.open_standard_libraries {
            engine.open_standard_libraries()?;
        }
        for path in &options.search_paths {
            engine.add_search_path(&path.to_string_lossy())?;
        }
        for root in &options.module_roots {
            engine.add_module_source(DirectoryModuleSource::from(root))?;
        }
        if options.print_hook {
            engine.install_print_hook()?;
        }
        Ok(engine)
    }

    /// Find a live engine by id.
    pub(crate) fn lookup(id: EngineId) -> Option<Self> {
        let shared = DIRECTORY.read().get(&id)?.upgrade()?;
        Some(Self { shared })
    }

    pub fn id(&self) -> EngineId {
        self.shared.id
    }

    /// Whether `other` is a handle to the same engine.
    pub fn same_engine(&self, other: &Engine) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Acquire exclusive access to the engine for the current thread.
    ///
    /// Reentrant: the thread that holds the guard may lock again.
    pub fn lock(&self) -> EngineGuard<'_> {
        EngineGuard {
            engine: self,
            core: self.shared.core.lock(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().core.main.get().is_null()
    }

    /// Close the engine, invalidating every outstanding reference.
    ///
    /// Fails with `IllegalArgument` when called from inside a call on this
    /// engine, and with `EngineClosed` when the engine is already closed.
    pub fn close(&self) -> Result<()> {
        let guard = self.lock();
        let core = &*guard.core;
        let state = core.main.get();
        if state.is_null() {
            return Err(BridgeError::EngineClosed { engine: self.id() });
        }
        if core.in_flight.get() > 0 {
            return Err(BridgeError::illegal(
                "cannot close an engine from inside one of its own calls",
            ));
        }
        let leaked = core.registry.borrow_mut().clear();
        core.main.set(ptr::null_mut());
        core.active.set(ptr::null_mut());
        unsafe { ffi::lua_close(state) };
        tracing::debug!(engine = %self.id(), leaked, "engine closed");
        Ok(())
    }

    pub(crate) fn set_traceback(&self, enabled: bool) {
        self.lock().core.traceback.set(enabled);
    }

    /// Open the engine's standard libraries (`base`, `package`, `string`,
    /// `table`, `math`, `io`, `os`, `coroutine`, `utf8`, `debug`).
    pub fn open_standard_libraries(&self) -> Result<()> {
        let guard = self.lock();
        let stack = guard.stack()?;
        stack.open_libs();
        Ok(())
    }

    fn package(&self) -> Result<ManagedReference> {
        let package = self.global("package")?;
        if package.pinned_kind() != ValueKind::Table {
            return Err(BridgeError::illegal("the package library is not open"));
        }
        Ok(package)
    }

    /// Append `<fragment>/?.lua` to the module search path.
    pub fn add_search_path(&self, fragment: &str) -> Result<()> {
        require_name("search path", fragment)?;
        let _guard = self.lock();
        let package = self.package()?;
        let current = package.field("path")?.as_text()?.unwrap_or_default();
        let pattern = format!("{fragment}{MAIN_SEPARATOR}?.lua");
        let updated = if current.is_empty() {
            pattern
        } else {
            format!("{current};{pattern}")
        };
        package.set_field("path", updated)?;
        tracing::debug!(engine = %self.id(), fragment, "search path added");
        Ok(())
    }

    /// Append `loader` to the engine's module searchers.
    ///
    /// The loader is called with the module name and returns either a
    /// function that produces the module, or a string explaining why the
    /// module was not found.
    pub fn add_module_loader(&self, loader: HostFunction) -> Result<()> {
        let guard = self.lock();
        let stack = guard.stack()?;
        let searchers = self.package()?.field("searchers")?;
        if searchers.pinned_kind() != ValueKind::Table {
            return Err(BridgeError::illegal("package.searchers is not a table"));
        }
        searchers.push_onto(&stack)?;
        let next = stack.raw_len(-1) as i64 + 1;
        stack.push_host_function(loader);
        stack.raw_set_index(-2, next);
        stack.pop(1);
        Ok(())
    }

    /// Serve `require` from `source` after the built-in searchers.
    pub fn add_module_source(&self, source: impl ModuleSource) -> Result<()> {
        self.add_module_loader(crate::modules::searcher(Arc::new(source)))
    }

    /// Bind `function` to the global `name`.
    pub fn register_global(&self, name: &str, function: HostFunction) -> Result<()> {
        self.set_global(name, function)
    }

    pub fn set_global(&self, name: &str, value: impl Into<HostValue>) -> Result<()> {
        require_name("global name", name)?;
        let value = value.into();
        let guard = self.lock();
        let stack = guard.stack()?;
        protocol::set_field(&stack, Arg::Globals, &name.into(), &value)
    }

    /// Pin the current value of the global `name`.
    pub fn global(&self, name: &str) -> Result<ManagedReference> {
        require_name("global name", name)?;
        let guard = self.lock();
        let stack = guard.stack()?;
        protocol::get_field(&stack, Arg::Globals, &name.into())
    }

    /// Compile and run `source`, returning every value it returns.
    pub fn evaluate(&self, source: &str) -> Result<Vec<HostValue>> {
        self.evaluate_named(source, "=(eval)")
    }

    /// Like [`evaluate`](Self::evaluate) with an explicit chunk name
    /// (`"=name"` is shown verbatim, `"@path"` as a file).
    pub fn evaluate_named(&self, source: &str, chunk_name: &str) -> Result<Vec<HostValue>> {
        self.run_chunk(source.as_bytes(), chunk_name)
    }

    /// Run a script file. A leading byte-order mark and `#!` line are skipped.
    pub fn execute_file(&self, path: impl AsRef<Path>) -> Result<Vec<HostValue>> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let chunk_name = format!("@{}", path.display());
        self.run_chunk(strip_preamble(&bytes).as_ref(), &chunk_name)
    }

    fn run_chunk(&self, source: &[u8], chunk_name: &str) -> Result<Vec<HostValue>> {
        let guard = self.lock();
        let stack = guard.stack()?;
        protocol::call(
            &stack,
            Callee::Chunk { source, chunk_name },
            &[],
            ResultCount::All,
        )
    }

    /// Compile `source` without running it.
    pub fn load_chunk(&self, source: &[u8], chunk_name: &str) -> Result<ManagedReference> {
        let guard = self.lock();
        let stack = guard.stack()?;
        protocol::load(&stack, source, chunk_name)
    }

    /// Call the global function `name` with `args`.
    pub fn call_global(&self, name: &str, args: &[HostValue]) -> Result<Vec<HostValue>> {
        let _guard = self.lock();
        self.global(name)?.call(args, ResultCount::All)
    }

    /// Call `module:function(args...)`, where `module` is a global: the
    /// module itself is passed as the first argument.
    pub fn call_module_function(
        &self,
        module: &str,
        function: &str,
        args: &[HostValue],
    ) -> Result<Vec<HostValue>> {
        require_name("function name", function)?;
        let _guard = self.lock();
        self.global(module)?
            .call_method(function, args, ResultCount::All)
    }

    /// Call `module.function(args...)` with positional arguments only.
    pub fn call_module_field(
        &self,
        module: &str,
        function: &str,
        args: &[HostValue],
    ) -> Result<Vec<HostValue>> {
        require_name("function name", function)?;
        let guard = self.lock();
        let target = self.global(module)?;
        let stack = guard.stack()?;
        let callee = protocol::get_field(&stack, Arg::Reference(&target), &function.into())?;
        protocol::call(
            &stack,
            Callee::Reference(&callee),
            &args.iter().map(Arg::Value).collect::<Vec<_>>(),
            ResultCount::All,
        )
    }

    /// Route the engine's `print` through `tracing`.
    pub fn install_print_hook(&self) -> Result<()> {
        self.register_global("print", crate::logging::print_hook())
    }

    /// Number of registry entries currently pinned for the host.
    pub fn live_references(&self) -> Result<usize> {
        let guard = self.lock();
        let stack = guard.stack()?;
        Ok(stack.live_references())
    }
}

fn strip_preamble(bytes: &[u8]) -> std::borrow::Cow<'_, [u8]> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    if bytes.first() == Some(&b'#') {
        // Keep the newline so line numbers in messages stay accurate.
        let rest = bytes
            .iter()
            .position(|&b| b == b'\n')
            .map_or(&[][..], |newline| &bytes[newline..]);
        return std::borrow::Cow::Owned(rest.to_vec());
    }
    std::borrow::Cow::Borrowed(bytes)
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}

/// Exclusive access to an engine held by the current thread.
pub struct EngineGuard<'a> {
    engine: &'a Engine,
    core: ReentrantMutexGuard<'a, EngineCore>,
}

impl<'a> EngineGuard<'a> {
    pub fn engine(&self) -> &'a Engine {
        self.engine
    }

    /// The stack of the thread currently running on this engine.
    pub fn stack(&self) -> Result<StackView<'_>> {
        let state = self.core.active.get();
        if state.is_null() {
            return Err(BridgeError::EngineClosed {
                engine: self.engine.id(),
            });
        }
        Ok(StackView::new(state, self.engine, &self.core))
    }

    /// Make `state` the active thread until the returned scope drops.
    pub(crate) fn enter_thread(&self, state: *mut ffi::lua_State) -> ThreadScope<'_> {
        let previous = self.core.active.replace(state);
        ThreadScope {
            core: &self.core,
            previous,
        }
    }
}

impl fmt::Debug for EngineGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineGuard")
            .field("engine", &self.engine.id())
            .finish_non_exhaustive()
    }
}

/// Lazily created engine shared by a whole host, with an initialize-once
/// guard instead of a hidden global.
pub struct EngineCell {
    options: EngineOptions,
    slot: Mutex<Option<Engine>>,
}

impl EngineCell {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            options,
            slot: Mutex::new(None),
        }
    }

    /// The shared engine, created on first use or when the previous one
    /// was closed.
    pub fn get(&self) -> Result<Engine> {
        let mut slot = self.slot.lock();
        if let Some(engine) = slot.as_ref().filter(|engine| !engine.is_closed()) {
            return Ok(engine.clone());
        }
        let engine = Engine::with_options(&self.options)?;
        *slot = Some(engine.clone());
        Ok(engine)
    }

    /// Remove the engine so the caller can close it.
    pub fn take(&self) -> Option<Engine> {
        self.slot.lock().take()
    }
}

impl Default for EngineCell {
    fn default() -> Self {
        Self::new(EngineOptions::default())
    }
}

impl fmt::Debug for EngineCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineCell")
            .field("options", &self.options)
            .field("occupied", &self.slot.lock().is_some())
            .finish()
    }
}

impl Engine {
    /// Resolve the engine a callback belongs to.
    pub(crate) fn from_callback(id: EngineId) -> std::result::Result<Self, String> {
        Self::lookup(id).ok_or_else(|| format!("engine {id} is no longer alive"))
    }
}
