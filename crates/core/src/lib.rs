//! # PubGuard Core
//!
//! Resilient publish/subscribe orchestration - no backend code.
//!
//! This crate contains:
//! - The [`PubSubDriver`] port every backend adapter implements
//! - The [`DriverRegistry`] mapping backend identifiers to factories
//! - Guard assembly from configuration ([`guards`])
//! - The [`PubSubService`] orchestrator and per-message fan-out
//! - The [`Consumer`] lifecycle abstraction
//!
//! ## Architecture Principles
//! - Depends only on `pubguard-common` and `pubguard-domain`
//! - Backends plug in through [`PubSubDriver`] and [`DriverFactory`]
//! - Every public operation returns [`PubSubError`]

pub mod consumer;
pub mod delivery;
pub mod driver;
pub mod error;
pub mod guards;
pub mod registry;
pub mod service;

pub use consumer::{Consumer, ConsumerSet, ConsumerState, ManagedConsumer};
pub use delivery::{DeliveryReport, HandlerFailure};
pub use driver::{handler_fn, HandlerResult, MessageHandler, PubSubDriver};
pub use error::{PubSubError, Result};
pub use guards::{Attempted, GuardSet, GuardSnapshot};
pub use registry::{validate_driver_options, DriverFactory, DriverRegistry};
pub use service::{GuardStats, PublishReceipt, PubSubService};
