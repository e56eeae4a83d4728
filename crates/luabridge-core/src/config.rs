//! Engine and host configuration, loadable from TOML.
//!
//! ```toml
//! [engine]
//! traceback = true
//! search_paths = ["scripts"]
//!
//! [[engine.module_roots]]
//! path = "assets"
//! subdirectory = "lua"
//!
//! [logging]
//! level = "debug"
//! format = "json"
//! ```

use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How a new engine is prepared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    pub open_standard_libraries: bool,
    /// Append a traceback to error messages from protected calls
    pub traceback: bool,
    /// Route script `print` through `tracing`
    pub print_hook: bool,
    /// Directories appended to `package.path`
    pub search_paths: Vec<PathBuf>,
    /// Directories served through a module source
    pub module_roots: Vec<ModuleRoot>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            open_standard_libraries: true,
            traceback: true,
            print_hook: true,
            search_paths: Vec::new(),
            module_roots: Vec::new(),
        }
    }
}

/// A directory scripts can `require` modules from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRoot {
    pub path: PathBuf,
    #[serde(default)]
    pub subdirectory: Option<PathBuf>,
}

fn is_blank(path: &Path) -> bool {
    path.as_os_str().to_string_lossy().trim().is_empty()
}

impl EngineOptions {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let options: Self = toml::from_str(source)?;
        options.validate()?;
        Ok(options)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_str(&read(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.search_paths.iter().any(|path| is_blank(path)) {
            return Err(ConfigError::Invalid("search paths must not be blank".into()));
        }
        if self.module_roots.iter().any(|root| is_blank(&root.path)) {
            return Err(ConfigError::Invalid("module roots must not be blank".into()));
        }
        if (!self.search_paths.is_empty() || !self.module_roots.is_empty())
            && !self.open_standard_libraries
        {
            return Err(ConfigError::Invalid(
                "search paths and module roots need the standard libraries".into(),
            ));
        }
        Ok(())
    }
}

/// Whole-host configuration: the engine plus logging.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub engine: EngineOptions,
    pub logging: LogConfig,
}

impl BridgeConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.engine.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_str(&read(path)?)
    }
}

fn read(path: &Path) -> Result<String, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(text.trim_start_matches('\u{FEFF}').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogFormat;

    #[test]
    fn defaults_from_empty_document() {
        let options = EngineOptions::from_toml_str("").unwrap();
        assert_eq!(options, EngineOptions::default());
        assert!(options.open_standard_libraries);
        assert!(options.print_hook);
    }

    #[test]
    fn full_document_parses() {
        let config = BridgeConfig::from_toml_str(
            r#"
            [engine]
            traceback = false
            search_paths = ["scripts", "vendor/lua"]

            [[engine.module_roots]]
            path = "assets"
            subdirectory = "lua"

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();
        assert!(!config.engine.traceback);
        assert_eq!(config.engine.search_paths.len(), 2);
        assert_eq!(
            config.engine.module_roots[0].subdirectory.as_deref(),
            Some(Path::new("lua"))
        );
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn blank_search_paths_are_invalid() {
        let err = EngineOptions::from_toml_str("search_paths = [\"  \"]").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn search_paths_need_libraries() {
        let err = EngineOptions::from_toml_str(
            "open_standard_libraries = false\nsearch_paths = [\"x\"]",
        )
        .unwrap_err();
        assert!(err.to_string().contains("standard libraries"));
    }

    #[test]
    fn unknown_types_are_parse_errors() {
        let err = EngineOptions::from_toml_str("traceback = \"yes\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let err = BridgeConfig::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("missing.toml"));
    }

    #[test]
    fn load_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("luabridge.toml");
        std::fs::write(&path, "\u{FEFF}[engine]\nprint_hook = false\n").unwrap();
        let config = BridgeConfig::load(&path).unwrap();
        assert!(!config.engine.print_hook);
    }
}
