//! # PubGuard Domain
//!
//! Data types shared by every PubGuard crate.
//!
//! This crate contains:
//! - The [`Message`] envelope delivered to handlers and its wire shape
//! - Publish / subscribe / unsubscribe options
//! - Configuration structures (driver selection, resilience knobs, logging)
//! - Domain error types and Result definitions
//!
//! ## Architecture
//! - No dependencies on other PubGuard crates
//! - Only external dependencies allowed
//! - Pure data structures, no I/O

pub mod config;
pub mod constants;
pub mod errors;
pub mod types;

// Re-export commonly used items
pub use config::*;
pub use constants::*;
pub use errors::*;
pub use types::*;
