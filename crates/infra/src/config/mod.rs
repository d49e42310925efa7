//! Configuration loading
//!
//! Builds a [`pubguard_domain::PubSubConfig`] from environment variables and
//! JSON or TOML files.

pub mod loader;

pub use loader::{load, load_from_env, load_from_file, probe_config_paths};
