//! Runtime configuration, loadable from TOML.
//!
//! ```toml
//! opt-level = "speed"
//! debug-info = false
//! fuel = 1000000
//! max-memory-size = 67108864
//! module-dir = "build/components"
//! ```

use crate::loader::DirectoryResolver;
use anyhow::{Context, Result};
use serde_derive::Deserialize;
use std::path::{Path, PathBuf};
use wasmtime::{StoreLimits, StoreLimitsBuilder};

/// Cranelift optimization level for compiled core modules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OptLevel {
    None,
    #[default]
    Speed,
    SpeedAndSize,
}

impl From<OptLevel> for wasmtime::OptLevel {
    fn from(level: OptLevel) -> wasmtime::OptLevel {
        match level {
            OptLevel::None => wasmtime::OptLevel::None,
            OptLevel::Speed => wasmtime::OptLevel::Speed,
            OptLevel::SpeedAndSize => wasmtime::OptLevel::SpeedAndSize,
        }
    }
}

/// Settings for a [`Runtime`](crate::Runtime). Every field is optional in
/// the TOML form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct RuntimeConfig {
    pub opt_level: OptLevel,
    pub debug_info: bool,
    /// Fuel given to each instance's store. `None` disables fuel metering.
    pub fuel: Option<u64>,
    /// Upper bound in bytes on any single linear memory.
    pub max_memory_size: Option<usize>,
    /// Directory that [`RuntimeConfig::directory_resolver`] loads modules
    /// from.
    pub module_dir: Option<PathBuf>,
}

impl RuntimeConfig {
    pub fn from_toml(source: &str) -> Result<RuntimeConfig> {
        toml::from_str(source).context("failed to parse runtime configuration")
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<RuntimeConfig> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read `{}`", path.display()))?;
        RuntimeConfig::from_toml(&source)
            .with_context(|| format!("invalid configuration in `{}`", path.display()))
    }

    /// The engine configuration these settings describe.
    pub fn engine_config(&self) -> wasmtime::Config {
        let mut config = wasmtime::Config::new();
        config
            .cranelift_opt_level(self.opt_level.into())
            .debug_info(self.debug_info)
            .consume_fuel(self.fuel.is_some());
        config
    }

    pub fn store_limits(&self) -> StoreLimits {
        let mut builder = StoreLimitsBuilder::new();
        if let Some(max) = self.max_memory_size {
            builder = builder.memory_size(max);
        }
        builder.build()
    }

    /// A resolver over `module_dir`, if one was configured.
    pub fn directory_resolver(&self) -> Option<DirectoryResolver> {
        self.module_dir.as_ref().map(DirectoryResolver::new)
    }
}
