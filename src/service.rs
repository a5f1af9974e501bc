//! Shared bootstrap for both daemons.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::ServiceConfig;
use crate::error::ConfigError;
use crate::stats::StatsClient;
use crate::store::{RedisJobStore, StoreClient};

/// Everything a daemon needs, built once at startup.
pub struct ServiceContext {
    pub config: ServiceConfig,
    /// Local host name, used in counter names.
    pub host: String,
    pub stats: StatsClient,
    pub store: Arc<RedisJobStore>,
    pub clock: Arc<dyn Clock>,
}

impl ServiceContext {
    /// Loads the configuration file and builds the context.
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config = ServiceConfig::load(path)?;
        Ok(Self::new(config))
    }

    /// Builds the store facade and stats sink for `config`.
    pub fn new(config: ServiceConfig) -> Self {
        let host = local_hostname();
        let stats = StatsClient::new(config.statsd.clone());
        let client = Arc::new(StoreClient::new(
            config.password.clone(),
            stats.clone(),
            host.clone(),
        ));
        let store = Arc::new(RedisJobStore::new(
            client,
            config.queue_servers.clone(),
            config.aggregator_servers.clone(),
        ));
        info!(
            host = %host,
            partitions = config.queue_servers.len(),
            aggregators = config.aggregator_servers.len(),
            statsd = stats.is_enabled(),
            "Service context ready"
        );
        Self {
            config,
            host,
            stats,
            store,
            clock: Arc::new(SystemClock),
        }
    }
}

/// Host name of this machine, or `unknown`.
pub fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
