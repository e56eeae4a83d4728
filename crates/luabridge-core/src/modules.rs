//! Module sources for `require`.
//!
//! A [`ModuleSource`] turns a module name into chunk bytes. Installed with
//! [`Engine::add_module_source`](crate::Engine::add_module_source), it is
//! consulted after the engine's built-in searchers.

use crate::callable::HostFunction;
use crate::config::ModuleRoot;
use crate::value::HostValue;
use std::io;
use std::path::{MAIN_SEPARATOR, PathBuf};
use std::sync::Arc;

/// Supplies module source by name.
pub trait ModuleSource: Send + Sync + 'static {
    /// Chunk bytes for `module`. `NotFound` is the expected answer for
    /// modules this source does not serve.
    fn load(&self, module: &str) -> io::Result<Vec<u8>>;
}

impl<F> ModuleSource for F
where
    F: Fn(&str) -> io::Result<Vec<u8>> + Send + Sync + 'static,
{
    fn load(&self, module: &str) -> io::Result<Vec<u8>> {
        self(module)
    }
}

/// Serves `<root>/<subdirectory>/<a/b>.lua` for module `a.b`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryModuleSource {
    root: PathBuf,
    subdirectory: Option<PathBuf>,
}

impl DirectoryModuleSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            subdirectory: None,
        }
    }

    /// Look modules up below `subdirectory` of the root. Blank values are
    /// ignored.
    pub fn with_subdirectory(mut self, subdirectory: impl Into<PathBuf>) -> Self {
        let subdirectory = subdirectory.into();
        if !subdirectory.as_os_str().to_string_lossy().trim().is_empty() {
            self.subdirectory = Some(subdirectory);
        }
        self
    }

    /// File that would serve `module`.
    pub fn resolve(&self, module: &str) -> PathBuf {
        let mut path = self.root.clone();
        if let Some(subdirectory) = &self.subdirectory {
            path.push(subdirectory);
        }
        path.push(format!("{}.lua", module.replace('.', &MAIN_SEPARATOR.to_string())));
        path
    }
}

impl From<&ModuleRoot> for DirectoryModuleSource {
    fn from(root: &ModuleRoot) -> Self {
        let source = Self::new(&root.path);
        match &root.subdirectory {
            Some(subdirectory) => source.with_subdirectory(subdirectory),
            None => source,
        }
    }
}

impl ModuleSource for DirectoryModuleSource {
    fn load(&self, module: &str) -> io::Result<Vec<u8>> {
        let malformed = module
            .split('.')
            .any(|part| part.is_empty() || part.contains(['/', '\\']));
        if malformed {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid module name '{module}'"),
            ));
        }
        let path = self.resolve(module);
        std::fs::read(&path)
            .map_err(|err| io::Error::new(err.kind(), format!("{}: {err}", path.display())))
    }
}

/// Searcher that adapts `source` to the engine's searcher protocol: return
/// a loader function, or a string explaining why nothing was found.
pub(crate) fn searcher(source: Arc<dyn ModuleSource>) -> HostFunction {
    HostFunction::new("module source", move |ctx, args| {
        let name = args.first().and_then(HostValue::as_str).unwrap_or_default();
        let bytes = match source.load(name) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::debug!(module = name, error = %err, "module source miss");
                return Ok(vec![format!("Cannot load module {name}:\n\t{err}").into()]);
            }
        };
        let chunk = ctx
            .load_chunk(&bytes, &format!("@{name}"))
            .map_err(|err| anyhow::anyhow!("error loading module '{name}': {err}"))?;
        Ok(vec![chunk.into(), name.into()])
    })
}
