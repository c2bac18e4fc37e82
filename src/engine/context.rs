// Per-client context threaded through every execution instead of a process-wide singleton.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use tracing::info;

use super::cache::{Cache, DiskCache, MemoryCache};
use super::stats::StatsCollector;
use crate::config::{CacheMode, EngineConfig};
use crate::transport::http_transport::HttpTransport;
use crate::transport::traits::Transport;

pub struct ClientContext {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    cache: Option<Arc<dyn Cache>>,
    session: RwLock<Option<String>>,
    stats: Arc<StatsCollector>,
}

impl ClientContext {
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        cache: Option<Arc<dyn Cache>>,
    ) -> Self {
        Self {
            config,
            transport,
            cache,
            session: RwLock::new(None),
            stats: Arc::new(StatsCollector::new()),
        }
    }

    /// Build the HTTP transport and the cache selected by `config`.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::from_config(&config)?);
        let cache: Option<Arc<dyn Cache>> = match config.cache_mode {
            CacheMode::Disabled => None,
            CacheMode::Memory => Some(Arc::new(MemoryCache::new())),
            CacheMode::Disk => Some(Arc::new(DiskCache::new(Path::new(&config.cache_dir))?)),
        };
        info!(
            "client context base_url={} workers={} cache={:?}",
            config.base_url, config.max_workers, config.cache_mode
        );
        Ok(Self::new(config, transport, cache))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn cache(&self) -> Option<&Arc<dyn Cache>> {
        self.cache.as_ref()
    }

    pub fn stats(&self) -> &Arc<StatsCollector> {
        &self.stats
    }

    /// Install the session token obtained by the login flow.
    pub fn set_session(&self, token: impl Into<String>) {
        *self.session.write() = Some(token.into());
    }

    pub fn clear_session(&self) {
        *self.session.write() = None;
    }

    pub fn session(&self) -> Option<String> {
        self.session.read().clone()
    }

    pub fn has_session(&self) -> bool {
        self.session.read().is_some()
    }
}
