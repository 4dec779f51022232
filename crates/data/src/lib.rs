//! permctl Data - derived permission state
//!
//! Everything between the OS services and the screens:
//! - change hubs multiplexing OS broadcasts onto reactive nodes
//! - one node type per derived value, built on `permctl-reactive`
//! - pure permission rules the nodes apply
//! - [`PermissionRepository`], owner of every node cache
//! - the auto-revoke pass over unused apps

pub mod keys;
pub mod model;
pub mod rules;
pub mod hubs;
pub mod nodes;
pub mod repository;
pub mod auto_revoke;

pub use auto_revoke::{revoke_unused, AutoRevokeReport, RevokedApp};
pub use hubs::ChangeHubs;
pub use keys::{AppPermGroupKey, OpUsageKey, PackageKey, PackageScoped, PermGroupKey, UidKey, UserKey};
pub use model::{
    AllPackages, AppPermGroupUiInfo, AutoRevokeState, LightAppPermGroup, LightPermission, OpUsage,
    PermGrantState, PermGroupPackages, PermGroupUiSummary, PermGroupsUiSummary, UidSensitivity,
};
pub use nodes::NodeEnv;
pub use repository::PermissionRepository;
