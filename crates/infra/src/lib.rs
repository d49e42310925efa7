//! # PubGuard Infrastructure
//!
//! Concrete adapters for `pubguard-core` ports.
//!
//! This crate contains:
//! - The in-process [`InMemoryDriver`] and built-in registry wiring
//! - Configuration loading from `PUBGUARD_*` variables and JSON/TOML files
//! - Tracing subscriber initialisation
//!
//! ## Architecture
//! - Implements traits defined in `pubguard-core`
//! - Contains all "impure" code (environment, files, spawned tasks)

pub mod config;
pub mod drivers;
pub mod observability;

pub use drivers::{
    default_registry, register_builtin_drivers, InMemoryDriver, MemoryDriverFactory,
    MemoryDriverStats,
};
pub use observability::init_tracing;

use pubguard_core::{PubSubService, Result};
use pubguard_domain::PubSubConfig;

/// Build a service for `config` using the built-in drivers
///
/// # Errors
/// `DriverNotFound` for an unknown driver id, `Config` for invalid driver
/// options or resilience settings.
pub fn service_from_config(config: &PubSubConfig) -> Result<PubSubService> {
    PubSubService::from_registry(&default_registry()?, config)
}
