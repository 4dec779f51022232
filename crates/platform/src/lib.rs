//! permctl Platform - what the permission core knows about the OS
//!
//! Snapshot types, the platform permission table, the service traits the
//! data layer queries and an in-memory implementation of all of them.

pub mod model;
pub mod permissions;
pub mod services;
pub mod fake;

pub use model::{
    AppOpMode, LightPackageInfo, LightPermGroupInfo, LightPermInfo, OpAccess, PermGroup,
    PermState, PermissionFlags, ProtectionFlags, ProtectionLevel,
};
pub use permissions::names;
pub use services::{AppOpsManager, PackageManager, Platform, PlatformEvents, UsageStats, UserManager};
pub use fake::FakePlatform;
