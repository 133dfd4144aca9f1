use std::{sync::Arc, time::Duration};

use crate::{
    database::Database,
    persist::PersistenceStore,
    remote::{NullConnector, RemoteConnector},
    utils::{
        get_default_activation_delay, get_default_activation_spacing,
        get_default_link_retry_period, get_default_link_update_interval,
        get_default_max_blocking_threads, get_default_worker_threads,
    },
};

/// Delay before the first run of a periodic trigger
pub const FIRST_TRIGGER_DELAY: Duration = Duration::from_secs(1);

/// Tuning knobs for a [`Database`]. Defaults come from the environment.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Minimum time between two activations
    pub activation_spacing: Duration,
    /// Fixed wait after every activation
    pub activation_delay: Duration,
    pub worker_threads: usize,
    pub max_blocking_threads: usize,
    /// Minimum time between coalesced link notifications
    pub link_update_interval: Duration,
    /// How often unresolved links are retried
    pub link_retry_period: Duration,
    pub first_trigger_delay: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            activation_spacing: get_default_activation_spacing(),
            activation_delay: get_default_activation_delay(),
            worker_threads: get_default_worker_threads(),
            max_blocking_threads: get_default_max_blocking_threads(),
            link_update_interval: get_default_link_update_interval(),
            link_retry_period: get_default_link_retry_period(),
            first_trigger_delay: FIRST_TRIGGER_DELAY,
        }
    }
}

pub struct DatabaseBuilder {
    name: String,
    config: DatabaseConfig,
    store: Option<Arc<dyn PersistenceStore>>,
    connector: Option<Arc<dyn RemoteConnector>>,
}

impl DatabaseBuilder {
    pub fn new(name: &str) -> Self {
        DatabaseBuilder {
            name: name.to_string(),
            config: DatabaseConfig::default(),
            store: None,
            connector: None,
        }
    }
    pub fn config(mut self, config: DatabaseConfig) -> Self {
        self.config = config;
        self
    }
    pub fn activation_spacing(mut self, spacing: Duration) -> Self {
        self.config.activation_spacing = spacing;
        self
    }
    pub fn activation_delay(mut self, delay: Duration) -> Self {
        self.config.activation_delay = delay;
        self
    }
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.config.worker_threads = threads;
        self
    }
    pub fn max_blocking_threads(mut self, threads: usize) -> Self {
        self.config.max_blocking_threads = threads;
        self
    }
    pub fn link_update_interval(mut self, interval: Duration) -> Self {
        self.config.link_update_interval = interval;
        self
    }
    pub fn link_retry_period(mut self, period: Duration) -> Self {
        self.config.link_retry_period = period;
        self
    }
    pub fn first_trigger_delay(mut self, delay: Duration) -> Self {
        self.config.first_trigger_delay = delay;
        self
    }
    pub fn store(mut self, store: Arc<dyn PersistenceStore>) -> Self {
        self.store = Some(store);
        self
    }
    /// Where names not found locally are looked up. Defaults to nowhere.
    pub fn connector(mut self, connector: Arc<dyn RemoteConnector>) -> Self {
        self.connector = Some(connector);
        self
    }
    pub fn build(self) -> Database {
        Database::new(
            &self.name,
            self.config,
            self.store,
            self.connector.unwrap_or_else(|| Arc::new(NullConnector)),
        )
    }
}
