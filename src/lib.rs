//! permctl - reactive permission-state core
//!
//! Observes package, permission and app-op state of the platform and keeps
//! the permission screens' data up to date through a graph of reactive
//! nodes.
//!
//! ## Architecture
//!
//! permctl is organized into specialized crates:
//!
//! - `permctl-core`: main context, background pool, events, config, errors
//! - `permctl-reactive`: reactive values, async values and node caches
//! - `permctl-platform`: domain snapshots, permission table, OS service traits
//! - `permctl-data`: change hubs, derived nodes, repository and auto-revoke
//!
//! This crate adds the [`PermissionController`] service and the mutation
//! commands.

#![warn(clippy::all)]

pub mod commands;
pub mod controller;

// Re-export main components for library usage
pub use permctl_core as core;
pub use permctl_data as data;
pub use permctl_platform as platform;
pub use permctl_reactive as reactive;

pub use controller::PermissionController;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::commands::{
        GrantGroupCommand, RevokeGroupCommand, SetAppOpModeCommand, SetAutoRevokeExemptionCommand,
    };
    pub use crate::controller::PermissionController;
    pub use permctl_core::{ControllerConfig, EventBus, PlatformEvent, UserId};
    pub use permctl_data::PermissionRepository;
    pub use permctl_platform::{FakePlatform, Platform};
}
