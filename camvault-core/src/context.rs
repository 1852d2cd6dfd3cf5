use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::CamvaultConfig;
use crate::pool::{HandleRetention, PoolConfig};

/// Explicit application context threaded into every component at
/// construction; there is no ambient global state.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<CamvaultConfig>,
    /// Process-wide stop signal. Pools consult it before admitting work,
    /// so an interrupt never races new external-process launches against
    /// runtime teardown.
    pub shutdown: CancellationToken,
}

impl AppContext {
    pub fn new(config: CamvaultConfig) -> Self {
        Self {
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn pool_config(&self, limit: usize) -> PoolConfig {
        let retention = match self.config.pool.handle_window {
            0 => HandleRetention::All,
            n => HandleRetention::Window(n),
        };
        PoolConfig::new(limit)
            .grace(Duration::from_millis(self.config.pool.grace_timeout_ms))
            .retention(retention)
    }
}
