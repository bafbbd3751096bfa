//! Registry configuration
//!
//! [`RegistryConfig`] can be built in code with the `with_*` setters or
//! loaded from a file. Files may be TOML, YAML or JSON (detected from the
//! extension); every field can be overridden through `PLEXUS_<FIELD>`
//! environment variables, with list fields comma separated:
//!
//! ```text
//! PLEXUS_PREFER_DYNAMIC=true
//! PLEXUS_DYNAMIC_MODULES=greeter,counter
//! ```

use std::path::{Path, PathBuf};

use config::{Config as Cfg, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::reload::ReloadPolicy;

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "PLEXUS";

/// Configuration error types
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Settings of a [`ModuleRegistry`](crate::ModuleRegistry)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Directory holding module libraries
    pub modules_dir: PathBuf,
    /// Entry symbol of module `name` is `<symbol_prefix><name>`
    pub symbol_prefix: String,
    pub reload_policy: ReloadPolicy,
    /// Skip watch-triggered reloads when the library file hash is unchanged
    pub skip_unchanged: bool,
    /// Watch `<name>.flag` next to the library instead of the library itself.
    ///
    /// Needed where the OS refuses to overwrite a mapped library and the
    /// build touches a flag file once it has written a new one.
    pub watch_flag_files: bool,
    /// Whether hosts should load modules dynamically when both are possible
    pub prefer_dynamic: bool,
    /// Libraries mapped for the life of the registry
    pub persistent_libraries: Vec<String>,
    /// Modules a host loads dynamically at startup
    pub dynamic_modules: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            modules_dir: PathBuf::from("./modules"),
            symbol_prefix: "plexus_module_register_".to_string(),
            reload_policy: ReloadPolicy::default(),
            skip_unchanged: true,
            watch_flag_files: cfg!(windows),
            prefer_dynamic: false,
            persistent_libraries: Vec::new(),
            dynamic_modules: Vec::new(),
        }
    }
}

impl RegistryConfig {
    /// Create a config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a file, then apply environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let format = detect_format(path)?;
        let content = std::fs::read_to_string(path)?;

        build(Some((&content, format)), environment())
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> ConfigResult<Self> {
        build(None, environment())
    }

    /// Parse from a string in the given format, without environment overrides
    pub fn from_str(content: &str, format: FileFormat) -> ConfigResult<Self> {
        let config = Cfg::builder()
            .add_source(File::from_str(content, format))
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| ConfigError::Serialization(e.to_string()))
    }

    /// Set modules directory
    pub fn with_modules_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.modules_dir = dir.into();
        self
    }

    /// Set entry symbol prefix
    pub fn with_symbol_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.symbol_prefix = prefix.into();
        self
    }

    /// Set reload policy
    pub fn with_reload_policy(mut self, policy: ReloadPolicy) -> Self {
        self.reload_policy = policy;
        self
    }

    /// Enable or disable unchanged-file skipping
    pub fn with_skip_unchanged(mut self, skip: bool) -> Self {
        self.skip_unchanged = skip;
        self
    }

    /// Watch flag files instead of libraries
    pub fn with_watch_flag_files(mut self, enabled: bool) -> Self {
        self.watch_flag_files = enabled;
        self
    }

    /// Prefer dynamic loading
    pub fn with_prefer_dynamic(mut self, enabled: bool) -> Self {
        self.prefer_dynamic = enabled;
        self
    }

    /// Add a persistent library
    pub fn with_persistent_library(mut self, name: impl Into<String>) -> Self {
        self.persistent_libraries.push(name.into());
        self
    }

    /// Add a module to load dynamically at startup
    pub fn with_dynamic_module(mut self, name: impl Into<String>) -> Self {
        self.dynamic_modules.push(name.into());
        self
    }

    /// Library path of module `name`: `<modules_dir>/<lib><name><ext>`
    pub fn library_path(&self, name: &str) -> PathBuf {
        self.modules_dir.join(format!(
            "{}{}{}",
            std::env::consts::DLL_PREFIX,
            name,
            std::env::consts::DLL_SUFFIX
        ))
    }

    /// Entry symbol of module `name`
    pub fn entry_symbol(&self, name: &str) -> String {
        format!("{}{}", self.symbol_prefix, name)
    }

    /// File to watch for a module library
    pub fn watch_target(&self, library_path: &Path, name: &str) -> PathBuf {
        if self.watch_flag_files {
            library_path.with_file_name(format!("{name}.flag"))
        } else {
            library_path.to_path_buf()
        }
    }
}

/// Detect configuration format from file extension
pub fn detect_format(path: &Path) -> ConfigResult<FileFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("persistent_libraries")
        .with_list_parse_key("dynamic_modules")
}

fn build(file: Option<(&str, FileFormat)>, env: Environment) -> ConfigResult<RegistryConfig> {
    let mut builder = Cfg::builder();
    if let Some((content, format)) = file {
        builder = builder.add_source(File::from_str(content, format));
    }

    let config = builder
        .add_source(env)
        .build()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    config
        .try_deserialize()
        .map_err(|e| ConfigError::Serialization(e.to_string()))
}
