//! Runtime configuration system
//!
//! Centralized configuration for the runtime components: JIT selection and hardening,
//! the executable pack allocator, the interpreter's bounds and the deferred release
//! worker.

use std::path::Path;

use serde::{Deserialize, Serialize};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const PAGE_SIZE: usize = 4096;

/// Complete runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// JIT selection, hardening and symbol export
    pub jit: JitConfig,

    /// Executable pack allocator geometry
    pub pack: PackConfig,

    /// Interpreter bounds
    pub interpreter: InterpreterConfig,

    /// Deferred release worker
    pub release: ReleaseConfig,
}

impl RuntimeConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            jit: JitConfig::from_env(),
            pack: PackConfig::from_env(),
            interpreter: InterpreterConfig::from_env(),
            release: ReleaseConfig::default(),
        }
    }

    /// Load configuration from TOML file
    #[cfg(feature = "toml-config")]
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from TOML file (stub when toml feature is disabled)
    #[cfg(not(feature = "toml-config"))]
    pub fn from_file(_path: &Path) -> anyhow::Result<Self> {
        anyhow::bail!("TOML support not enabled. Enable the 'toml-config' feature.")
    }

    /// Save configuration to TOML file
    #[cfg(feature = "toml-config")]
    pub fn save_to_file(&self, path: &Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Save configuration to TOML file (stub when toml feature is disabled)
    #[cfg(not(feature = "toml-config"))]
    pub fn save_to_file(&self, _path: &Path) -> anyhow::Result<()> {
        anyhow::bail!("TOML support not enabled. Enable the 'toml-config' feature.")
    }

    /// Merge with environment variables (env vars take precedence)
    #[must_use]
    pub fn merge_with_env(mut self) -> Self {
        let env_config = Self::from_env();

        if std::env::var("VBPF_JIT_ENABLE").is_ok() {
            self.jit.enabled = env_config.jit.enabled;
        }
        if std::env::var("VBPF_JIT_REQUIRED").is_ok() {
            self.jit.required = env_config.jit.required;
        }
        if std::env::var("VBPF_JIT_HARDEN").is_ok() {
            self.jit.blinding = env_config.jit.blinding;
        }
        if std::env::var("VBPF_PACK_SIZE").is_ok() {
            self.pack.pack_size = env_config.pack.pack_size;
        }
        if std::env::var("VBPF_MAX_TAIL_CALLS").is_ok() {
            self.interpreter.max_tail_calls = env_config.interpreter.max_tail_calls;
        }

        self
    }

    /// Reject geometries the allocator cannot honour.
    pub fn validate(&self) -> anyhow::Result<()> {
        let chunk = self.pack.chunk_size;
        if chunk == 0 || !chunk.is_power_of_two() {
            anyhow::bail!("pack chunk size {chunk} is not a power of two");
        }
        if self.pack.pack_size == 0 || self.pack.pack_size % PAGE_SIZE != 0 {
            anyhow::bail!(
                "pack size {} is not a multiple of the page size",
                self.pack.pack_size
            );
        }
        if self.pack.pack_size % chunk != 0 {
            anyhow::bail!("pack size is not a multiple of the chunk size");
        }
        if self.interpreter.max_call_frames == 0 {
            anyhow::bail!("at least one call frame is required");
        }
        Ok(())
    }
}

/// JIT configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JitConfig {
    /// Ask the JIT backend to compile programs
    pub enabled: bool,

    /// Fail finalization when the backend produces no native code
    pub required: bool,

    /// Blind immediate operands before handing a program to the backend
    pub blinding: bool,

    /// Export JIT images to the symbol directory
    pub kallsyms: bool,

    /// Upper bound on bytes of executable memory charged to JIT images (0 = unlimited)
    pub memory_limit: usize,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            required: false,
            blinding: false,
            kallsyms: true,
            memory_limit: 0,
        }
    }
}

impl JitConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("VBPF_JIT_ENABLE") {
            config.enabled = parse_flag(&val).unwrap_or(config.enabled);
        }

        if let Ok(val) = std::env::var("VBPF_JIT_REQUIRED") {
            config.required = parse_flag(&val).unwrap_or(config.required);
        }

        if let Ok(val) = std::env::var("VBPF_JIT_HARDEN") {
            config.blinding = parse_flag(&val).unwrap_or(config.blinding);
        }

        if let Ok(val) = std::env::var("VBPF_JIT_KALLSYMS") {
            config.kallsyms = parse_flag(&val).unwrap_or(config.kallsyms);
        }

        if let Ok(val) = std::env::var("VBPF_JIT_LIMIT") {
            config.memory_limit = val.parse().unwrap_or(config.memory_limit);
        }

        config
    }
}

/// Pack allocator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PackConfig {
    /// Bytes per pack; must be a multiple of the page size
    pub pack_size: usize,

    /// Allocation granularity inside a pack; must be a power of two
    pub chunk_size: usize,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            pack_size: 2 * 1024 * 1024,
            chunk_size: 64,
        }
    }
}

impl PackConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("VBPF_PACK_SIZE") {
            config.pack_size = val.parse().unwrap_or(config.pack_size);
        }

        config
    }

    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.pack_size / self.chunk_size
    }
}

/// Interpreter configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Maximum number of tail calls taken by one invocation
    pub max_tail_calls: u32,

    /// Maximum depth of program-local call frames
    pub max_call_frames: usize,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            max_tail_calls: 33,
            max_call_frames: 8,
        }
    }
}

impl InterpreterConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("VBPF_MAX_TAIL_CALLS") {
            config.max_tail_calls = val.parse().unwrap_or(config.max_tail_calls);
        }

        config
    }
}

/// Deferred release worker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReleaseConfig {
    pub thread_name: String,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            thread_name: "vbpf-release".to_string(),
        }
    }
}

fn parse_flag(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pack.chunk_count(), 32 * 1024);
        assert_eq!(config.interpreter.max_tail_calls, 33);
    }

    #[test]
    fn test_validate_rejects_bad_geometry() {
        let mut config = RuntimeConfig::default();
        config.pack.chunk_size = 48;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.pack.pack_size = 4096 + 64;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("1"), Some(true));
        assert_eq!(parse_flag(" Off "), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[cfg(not(feature = "toml-config"))]
    #[test]
    fn test_file_io_requires_feature() {
        let config = RuntimeConfig::default();
        assert!(config.save_to_file(Path::new("unused.toml")).is_err());
        assert!(RuntimeConfig::from_file(Path::new("unused.toml")).is_err());
    }
}
