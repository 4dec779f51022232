//! Derived Model
//!
//! Snapshots published by the data nodes. Everything here is computed from
//! the platform snapshots in `permctl_platform::model`.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use permctl_core::UserId;
use permctl_platform::{
    LightPackageInfo, LightPermGroupInfo, LightPermInfo, OpAccess, PermState, PermissionFlags,
};
use serde::Serialize;

use crate::keys::PackageKey;

/// Grant state of each requested permission of one group, by permission name
pub type PermStates = IndexMap<String, PermState>;

/// One requested permission with its grant state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LightPermission {
    pub perm_info: LightPermInfo,
    pub granted: bool,
    pub flags: PermissionFlags,
    /// Requested foreground permissions this one is the background counterpart of
    pub foreground_perms: Vec<String>,
}

impl LightPermission {
    pub fn name(&self) -> &str {
        &self.perm_info.name
    }

    pub fn is_background(&self) -> bool {
        !self.foreground_perms.is_empty()
    }

    pub fn background_permission(&self) -> Option<&str> {
        self.perm_info.background_permission.as_deref()
    }

    pub fn is_user_set(&self) -> bool {
        self.flags.contains(PermissionFlags::USER_SET)
    }

    pub fn is_user_fixed(&self) -> bool {
        self.flags.contains(PermissionFlags::USER_FIXED)
    }

    pub fn is_policy_fixed(&self) -> bool {
        self.flags.contains(PermissionFlags::POLICY_FIXED)
    }

    pub fn is_system_fixed(&self) -> bool {
        self.flags.contains(PermissionFlags::SYSTEM_FIXED)
    }

    pub fn is_one_time(&self) -> bool {
        self.flags.contains(PermissionFlags::ONE_TIME)
    }

    pub fn is_granted_by_default(&self) -> bool {
        self.flags.contains(PermissionFlags::GRANTED_BY_DEFAULT)
    }

    pub fn is_granted_by_role(&self) -> bool {
        self.flags.contains(PermissionFlags::GRANTED_BY_ROLE)
    }

    pub fn is_auto_revoked(&self) -> bool {
        self.flags.contains(PermissionFlags::AUTO_REVOKED)
    }

    pub fn is_user_sensitive(&self) -> bool {
        self.flags.is_user_sensitive(self.granted)
    }
}

/// Roll-up of either the foreground or the background half of a group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AppPermSubGroup {
    pub permissions: Vec<String>,
    pub is_granted: bool,
    pub is_user_set: bool,
    pub is_user_fixed: bool,
    pub is_policy_fixed: bool,
    pub is_system_fixed: bool,
    pub is_one_time: bool,
    pub is_granted_by_default: bool,
    pub is_granted_by_role: bool,
}

impl AppPermSubGroup {
    fn from_permissions<'a>(permissions: impl Iterator<Item = &'a LightPermission>) -> Self {
        permissions.fold(AppPermSubGroup::default(), |mut sub, p| {
            sub.permissions.push(p.name().to_string());
            sub.is_granted |= p.granted;
            sub.is_user_set |= p.is_user_set();
            sub.is_user_fixed |= p.is_user_fixed();
            sub.is_policy_fixed |= p.is_policy_fixed();
            sub.is_system_fixed |= p.is_system_fixed();
            sub.is_one_time |= p.is_one_time();
            sub.is_granted_by_default |= p.is_granted_by_default();
            sub.is_granted_by_role |= p.is_granted_by_role();
            sub
        })
    }
}

/// One permission group as one app sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LightAppPermGroup {
    pub package_info: LightPackageInfo,
    pub group_info: LightPermGroupInfo,
    /// Requested member permissions, in group order
    pub permissions: IndexMap<String, LightPermission>,
    /// Shown with foreground states even without a background permission
    pub foreground_only: bool,
}

impl LightAppPermGroup {
    pub fn name(&self) -> &str {
        &self.group_info.name
    }

    pub fn foreground(&self) -> AppPermSubGroup {
        AppPermSubGroup::from_permissions(self.permissions.values().filter(|p| !p.is_background()))
    }

    pub fn background(&self) -> AppPermSubGroup {
        AppPermSubGroup::from_permissions(self.permissions.values().filter(|p| p.is_background()))
    }

    /// Whether some requested permission has a requested background counterpart
    pub fn has_background_group(&self) -> bool {
        self.permissions.values().any(LightPermission::is_background)
    }

    pub fn is_granted(&self) -> bool {
        self.permissions.values().any(|p| p.granted)
    }

    pub fn is_one_time(&self) -> bool {
        self.foreground().is_one_time
    }

    pub fn is_policy_fixed(&self) -> bool {
        self.permissions.values().any(LightPermission::is_policy_fixed)
    }

    pub fn is_user_fixed(&self) -> bool {
        self.foreground().is_user_fixed
    }

    pub fn grant_state(&self) -> PermGrantState {
        crate::rules::classify_grant_state(self)
    }
}

/// What the UI shows for one group of one app
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PermGrantState {
    Allowed,
    AllowedAlways,
    AllowedForeground,
    Denied,
    AskEveryTime,
}

impl PermGrantState {
    pub fn is_granted(self) -> bool {
        matches!(
            self,
            PermGrantState::Allowed | PermGrantState::AllowedAlways | PermGrantState::AllowedForeground
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AppPermGroupUiInfo {
    pub should_show: bool,
    pub grant_state: PermGrantState,
    /// Grants of this app are not user-sensitive
    pub is_system: bool,
}

/// Merged user-sensitivity flags of every package sharing one uid
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UidSensitivity(pub BTreeMap<String, PermissionFlags>);

impl UidSensitivity {
    pub fn flags(&self, permission: &str) -> PermissionFlags {
        self.0.get(permission).copied().unwrap_or_default()
    }

    pub fn is_user_sensitive(&self, permission: &str, granted: bool) -> bool {
        self.flags(permission).is_user_sensitive(granted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AutoRevokeState {
    pub enabled_globally: bool,
    pub enabled_for_app: bool,
    /// Groups that would lose their grants if the app goes unused
    pub revocable_groups: Vec<String>,
    /// Groups already revoked for disuse
    pub auto_revoked_groups: Vec<String>,
}

impl AutoRevokeState {
    pub fn should_revoke(&self) -> bool {
        self.enabled_globally && self.enabled_for_app && !self.revocable_groups.is_empty()
    }
}

/// Installed packages of every user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AllPackages {
    pub by_user: BTreeMap<UserId, Vec<LightPackageInfo>>,
}

impl AllPackages {
    pub fn iter(&self) -> impl Iterator<Item = (UserId, &LightPackageInfo)> {
        self.by_user
            .iter()
            .flat_map(|(user, packages)| packages.iter().map(move |p| (*user, p)))
    }

    pub fn len(&self) -> usize {
        self.by_user.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Packages requesting at least one permission of each group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PermGroupPackages {
    pub groups: IndexMap<String, Vec<PackageKey>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PermGroupUiSummary {
    /// Apps for which the group is shown
    pub shown: usize,
    /// Shown apps currently granted the group
    pub granted: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PermGroupsUiSummary {
    pub groups: IndexMap<String, PermGroupUiSummary>,
}

/// Recorded accesses for a set of app-ops
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OpUsage {
    pub by_op: BTreeMap<String, Vec<OpAccess>>,
}

impl OpUsage {
    /// Packages using any of the ops right now
    pub fn running_packages(&self) -> Vec<&str> {
        let mut packages: Vec<&str> = self
            .by_op
            .values()
            .flatten()
            .filter(|access| access.is_running)
            .map(|access| access.package_name.as_str())
            .collect();
        packages.sort_unstable();
        packages.dedup();
        packages
    }
}
