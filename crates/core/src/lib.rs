//! permctl Core - execution contexts and shared types
//!
//! This crate provides what every other permctl crate builds on: the
//! single-threaded main context that owns reactive state, the background
//! pool for platform queries, platform events, configuration and errors.

pub mod executor;
pub mod config;
pub mod events;
pub mod error;
pub mod ids;

pub use executor::{BackgroundPool, MainContext, MainThread};
pub use config::ControllerConfig;
pub use events::{EventBus, EventSubscription, PackageChange, PlatformEvent};
pub use error::{PermctlError, Result};
pub use ids::{Uid, UserId};

/// permctl version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
