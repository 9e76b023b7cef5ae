use std::sync::Arc;
use std::time::Duration;

use super::executor::{Backoff, JitteredBackoff};
use crate::core::config::ClientConfig;
use crate::pool::PoolConfig;

/// Default number of attempts per command.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default wall-clock budget for one command, retries included.
pub const DEFAULT_MAX_TOTAL_RETRY_DURATION: Duration = Duration::from_secs(10);

/// Cluster client settings.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Attempts per command before giving up with `MaxAttemptsExceeded`.
    pub max_attempts: u32,
    /// Deadline for one command across all its attempts.
    pub max_total_retry_duration: Duration,
    /// Period of the background topology refresh. `None` refreshes only on
    /// redirects and failures.
    pub topology_refresh_interval: Option<Duration>,
    /// Delay policy after transport failures.
    pub backoff: Arc<dyn Backoff>,
    /// Reject slot tables leaving slots without an owner.
    pub require_full_coverage: bool,
    /// Settings of every per-node pool.
    pub pool: PoolConfig,
    /// Settings of every connection.
    pub client: ClientConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_total_retry_duration: DEFAULT_MAX_TOTAL_RETRY_DURATION,
            topology_refresh_interval: None,
            backoff: Arc::new(JitteredBackoff),
            require_full_coverage: true,
            pool: PoolConfig::default(),
            client: ClientConfig::default(),
        }
    }
}
