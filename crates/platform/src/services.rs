//! OS service interfaces
//!
//! Every query may block and is only ever called from the background pool.
//! Registration calls come from the main context through the change hubs.

use chrono::{DateTime, Utc};
use permctl_core::{Result, Uid, UserId};

use crate::model::{AppOpMode, LightPackageInfo, OpAccess, PermGroup, PermissionFlags};

/// Package and permission state
pub trait PackageManager: Send + Sync {
    /// Package metadata; `NotFound` once the package is gone for that user
    fn package_info(&self, package: &str, user: UserId) -> Result<LightPackageInfo>;

    fn installed_packages(&self, user: UserId) -> Result<Vec<LightPackageInfo>>;

    /// Names of all packages sharing the uid
    fn packages_for_uid(&self, uid: Uid) -> Result<Vec<String>>;

    /// Group definition with its members, platform-defined or custom
    fn permission_group(&self, group: &str) -> Result<PermGroup>;

    fn permission_flags(&self, permission: &str, package: &str, user: UserId) -> Result<PermissionFlags>;

    fn grant_runtime_permission(&self, package: &str, permission: &str, user: UserId) -> Result<()>;

    fn revoke_runtime_permission(&self, package: &str, permission: &str, user: UserId) -> Result<()>;

    /// Replace the bits in `mask` with the matching bits of `values`
    fn update_permission_flags(
        &self,
        permission: &str,
        package: &str,
        mask: PermissionFlags,
        values: PermissionFlags,
        user: UserId,
    ) -> Result<()>;
}

/// App-op state
pub trait AppOpsManager: Send + Sync {
    fn check_op(&self, op: &str, uid: Uid, package: &str) -> Result<AppOpMode>;

    fn set_mode(&self, op: &str, uid: Uid, package: &str, mode: AppOpMode) -> Result<()>;

    /// Recorded accesses of one op; `UnsupportedOp` when the platform lacks it
    fn op_accesses(&self, op: &str) -> Result<Vec<OpAccess>>;
}

/// User profiles
pub trait UserManager: Send + Sync {
    fn user_profiles(&self) -> Result<Vec<UserId>>;
}

/// App usage history
pub trait UsageStats: Send + Sync {
    fn last_time_used(&self, package: &str, user: UserId) -> Result<Option<DateTime<Utc>>>;
}

/// OS-level change registrations.
///
/// Each pair is called at most once per first-subscribe / last-unsubscribe
/// cycle of the matching hub.
pub trait PlatformEvents: Send + Sync {
    fn register_package_receiver(&self);
    fn unregister_package_receiver(&self);

    fn register_permission_listener(&self);
    fn unregister_permission_listener(&self);

    fn register_app_op_listener(&self, op: &str);
    fn unregister_app_op_listener(&self, op: &str);

    fn register_user_receiver(&self);
    fn unregister_user_receiver(&self);
}

/// Everything the data layer needs from the OS
pub trait Platform: PackageManager + AppOpsManager + UserManager + UsageStats + PlatformEvents {}

impl<T> Platform for T where T: PackageManager + AppOpsManager + UserManager + UsageStats + PlatformEvents {}
