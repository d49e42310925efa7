//! Driver factory registry
//!
//! Maps a backend identifier to a factory that builds a [`PubSubDriver`].
//! Identifiers match case-sensitively. Built-in backend options are validated
//! before the factory runs, so a misconfigured deployment fails at startup
//! instead of on first connect.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use pubguard_domain::constants::{DRIVER_GOOGLE_PUBSUB, DRIVER_KAFKA, DRIVER_REDIS};
use pubguard_domain::{DriverOptions, PubSubConfig};
use tracing::{debug, info};

use crate::driver::PubSubDriver;
use crate::error::{PubSubError, Result};

/// Builds drivers for one backend identifier
pub trait DriverFactory: Send + Sync {
    /// Extra option checks on top of the built-in rules
    fn validate(&self, _config: &PubSubConfig) -> Result<()> {
        Ok(())
    }

    fn create(&self, config: &PubSubConfig) -> Result<Arc<dyn PubSubDriver>>;
}

impl<F> DriverFactory for F
where
    F: Fn(&PubSubConfig) -> Result<Arc<dyn PubSubDriver>> + Send + Sync,
{
    fn create(&self, config: &PubSubConfig) -> Result<Arc<dyn PubSubDriver>> {
        self(config)
    }
}

/// Registry of driver factories keyed by identifier
#[derive(Default)]
pub struct DriverRegistry {
    factories: RwLock<BTreeMap<String, Arc<dyn DriverFactory>>>,
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry").field("drivers", &self.list_drivers()).finish()
    }
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `id`
    ///
    /// # Errors
    /// `PubSubError::Config` when `id` is empty or already registered.
    pub fn register(
        &self,
        id: impl Into<String>,
        factory: impl DriverFactory + 'static,
    ) -> Result<()> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(PubSubError::Config("driver id must not be empty".into()));
        }

        let mut factories = self.factories.write();
        if factories.contains_key(&id) {
            return Err(PubSubError::Config(format!("driver '{id}' is already registered")));
        }
        factories.insert(id.clone(), Arc::new(factory));
        drop(factories);

        info!(driver = %id, "driver_registered");
        Ok(())
    }

    pub fn has_driver(&self, id: &str) -> bool {
        self.factories.read().contains_key(id)
    }

    /// Registered identifiers in sorted order
    pub fn list_drivers(&self) -> Vec<String> {
        self.factories.read().keys().cloned().collect()
    }

    /// Build the driver named by `config.driver`
    ///
    /// # Errors
    /// - `DriverNotFound` listing every registered id when the id is unknown
    /// - `Config` when backend options are missing or invalid
    pub fn create_driver(&self, config: &PubSubConfig) -> Result<Arc<dyn PubSubDriver>> {
        let factory = {
            let factories = self.factories.read();
            factories.get(&config.driver).cloned().ok_or_else(|| PubSubError::DriverNotFound {
                driver: config.driver.clone(),
                known: factories.keys().cloned().collect(),
            })?
        };

        validate_driver_options(&config.driver, &config.options)?;
        factory.validate(config)?;

        debug!(driver = %config.driver, "creating_driver");
        factory.create(config)
    }
}

/// Check the required options of the built-in backends
///
/// Unknown identifiers pass; their factories validate themselves.
pub fn validate_driver_options(id: &str, options: &DriverOptions) -> Result<()> {
    match id {
        DRIVER_REDIS => {
            let redis = options
                .redis
                .as_ref()
                .ok_or_else(|| missing(id, "options.redis section is required"))?;
            let has_url = redis.url.as_deref().is_some_and(|url| !url.trim().is_empty());
            let has_host = redis.host.as_deref().is_some_and(|host| !host.trim().is_empty());
            if !has_url && !has_host {
                return Err(missing(id, "either url or host must be set"));
            }
            if redis.port == 0 {
                return Err(missing(id, "port must be non-zero"));
            }
        }
        DRIVER_KAFKA => {
            let kafka = options
                .kafka
                .as_ref()
                .ok_or_else(|| missing(id, "options.kafka section is required"))?;
            if kafka.brokers.iter().all(|broker| broker.trim().is_empty()) {
                return Err(missing(id, "brokers must contain at least one address"));
            }
            if kafka.client_id.trim().is_empty() {
                return Err(missing(id, "client_id must not be empty"));
            }
        }
        DRIVER_GOOGLE_PUBSUB => {
            let google = options
                .google_pubsub
                .as_ref()
                .ok_or_else(|| missing(id, "options.google_pubsub section is required"))?;
            if google.project_id.trim().is_empty() {
                return Err(missing(id, "project_id must not be empty"));
            }
        }
        _ => {}
    }
    Ok(())
}

fn missing(driver: &str, detail: &str) -> PubSubError {
    PubSubError::Config(format!("invalid options for driver '{driver}': {detail}"))
}
