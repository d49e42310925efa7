//! Built-in drivers and registry wiring

pub mod memory;

use std::sync::Arc;

use pubguard_core::{DriverFactory, DriverRegistry, PubSubDriver, PubSubError, Result};
use pubguard_domain::{PubSubConfig, DRIVER_MEMORY};

pub use memory::{InMemoryDriver, MemoryDriverStats};

/// Factory for [`InMemoryDriver`]
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryDriverFactory;

impl DriverFactory for MemoryDriverFactory {
    fn validate(&self, config: &PubSubConfig) -> Result<()> {
        if config.options.memory.buffer_size == 0 {
            return Err(PubSubError::Config("memory buffer_size must be at least 1".into()));
        }
        Ok(())
    }

    fn create(&self, config: &PubSubConfig) -> Result<Arc<dyn PubSubDriver>> {
        Ok(Arc::new(InMemoryDriver::new(config.options.memory.clone())))
    }
}

/// Register every driver shipped with this crate
///
/// # Errors
/// `PubSubError::Config` when one of the ids is already registered.
pub fn register_builtin_drivers(registry: &DriverRegistry) -> Result<()> {
    registry.register(DRIVER_MEMORY, MemoryDriverFactory)
}

/// A registry holding the built-in drivers
pub fn default_registry() -> Result<DriverRegistry> {
    let registry = DriverRegistry::new();
    register_builtin_drivers(&registry)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_lists_memory() {
        let registry = default_registry().unwrap();
        assert_eq!(registry.list_drivers(), vec![DRIVER_MEMORY.to_string()]);

        let err = register_builtin_drivers(&registry).unwrap_err();
        assert!(matches!(err, PubSubError::Config(_)));
    }

    #[test]
    fn test_zero_buffer_is_rejected() {
        let registry = default_registry().unwrap();
        let mut config = PubSubConfig::for_driver(DRIVER_MEMORY);
        config.options.memory.buffer_size = 0;

        let err = registry.create_driver(&config).err().unwrap();
        assert!(matches!(err, PubSubError::Config(ref msg) if msg.contains("buffer_size")));
    }
}
