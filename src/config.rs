use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Size of each piece handed to a stream consumer (4 KB).
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024;

/// Content type reported when the backend (or a cache hit) does not declare one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Header carrying the session token on authenticated requests.
pub const DEFAULT_SESSION_HEADER: &str = "X-Session-Token";

/// Number of retired tokens whose terminal state stays queryable.
pub const DEFAULT_FINISHED_HISTORY: usize = 1024;

/// Where streamed payloads are written through to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// No write-through cache; every stream goes to the network.
    Disabled,
    /// In-process cache, lost when the client is dropped.
    Memory,
    /// One file per stream id under `cache_dir`.
    Disk,
}

/// Top-level configuration for a client instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base URL every request endpoint is resolved against.
    pub base_url: String,
    /// Number of worker loops executing queued tasks.
    pub max_workers: u32,
    /// Upper bound on the size of a single consumer chunk.
    pub chunk_size: usize,
    pub cache_mode: CacheMode,
    /// Directory used by the disk cache.
    pub cache_dir: String,
    pub session_header: String,
    /// Per-request timeout applied by the HTTP transport. Zero disables it.
    pub request_timeout_secs: u64,
    pub finished_history: usize,
    /// Headers sent with every request, e.g. an application code.
    pub default_headers: HashMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9000/".to_string(),
            max_workers: 4,
            chunk_size: DEFAULT_CHUNK_SIZE,
            cache_mode: CacheMode::Memory,
            cache_dir: String::new(),
            session_header: DEFAULT_SESSION_HEADER.to_string(),
            request_timeout_secs: 30,
            finished_history: DEFAULT_FINISHED_HISTORY,
            default_headers: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document; missing keys fall back to defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("invalid engine config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            anyhow::bail!("max_workers must be > 0");
        }
        if self.chunk_size == 0 {
            anyhow::bail!("chunk_size must be > 0");
        }
        if self.cache_mode == CacheMode::Disk && self.cache_dir.trim().is_empty() {
            anyhow::bail!("cache_dir is required when cache_mode = \"disk\"");
        }
        Ok(())
    }
}
