//! Platform Model
//!
//! Lightweight snapshots of what the platform services report. Every
//! snapshot is immutable; a reload produces a new value.

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use permctl_core::{Uid, UserId};
use serde::{Deserialize, Serialize};

/// Target SDK from which runtime permissions exist
pub const SDK_RUNTIME_PERMISSIONS: u32 = 23;

/// Package owning every platform-defined permission and group
pub const PLATFORM_PACKAGE: &str = "android";

bitflags! {
    /// Per-package permission flags kept by the package manager
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct PermissionFlags: u32 {
        const USER_SET = 1 << 0;
        const USER_FIXED = 1 << 1;
        const POLICY_FIXED = 1 << 2;
        const REVOKED_COMPAT = 1 << 3;
        const SYSTEM_FIXED = 1 << 4;
        const GRANTED_BY_DEFAULT = 1 << 5;
        const REVIEW_REQUIRED = 1 << 6;
        const REVOKE_WHEN_REQUESTED = 1 << 7;
        const USER_SENSITIVE_WHEN_GRANTED = 1 << 8;
        const USER_SENSITIVE_WHEN_DENIED = 1 << 9;
        const GRANTED_BY_ROLE = 1 << 15;
        const ONE_TIME = 1 << 16;
        const AUTO_REVOKED = 1 << 17;
    }
}

impl PermissionFlags {
    /// Both user-sensitivity bits
    pub const USER_SENSITIVE_MASK: PermissionFlags = PermissionFlags::USER_SENSITIVE_WHEN_GRANTED
        .union(PermissionFlags::USER_SENSITIVE_WHEN_DENIED);

    /// Whether the grant state is meaningful to the user for this grant
    pub fn is_user_sensitive(self, granted: bool) -> bool {
        if granted {
            self.contains(PermissionFlags::USER_SENSITIVE_WHEN_GRANTED)
        } else {
            self.contains(PermissionFlags::USER_SENSITIVE_WHEN_DENIED)
        }
    }
}

bitflags! {
    /// Protection flags of a permission definition
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ProtectionFlags: u32 {
        /// Introduced after runtime permissions; never granted at install
        const RUNTIME_ONLY = 1 << 0;
        /// Grantable to instant apps
        const INSTANT = 1 << 1;
    }
}

/// Permission protection level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtectionLevel {
    Normal,
    Dangerous,
    Signature,
    SignatureOrSystem,
}

impl ProtectionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtectionLevel::Normal => "normal",
            ProtectionLevel::Dangerous => "dangerous",
            ProtectionLevel::Signature => "signature",
            ProtectionLevel::SignatureOrSystem => "signatureOrSystem",
        }
    }

    /// Whether the permission is granted at runtime rather than install time
    pub fn is_runtime(&self) -> bool {
        matches!(self, ProtectionLevel::Dangerous)
    }
}

/// Definition of one permission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightPermInfo {
    pub name: String,
    /// Package defining the permission
    pub package_name: String,
    pub group: Option<String>,
    /// Background counterpart of a foreground permission
    pub background_permission: Option<String>,
    pub protection: ProtectionLevel,
    pub protection_flags: ProtectionFlags,
}

impl LightPermInfo {
    pub fn is_runtime(&self) -> bool {
        self.protection.is_runtime()
    }
}

/// Definition of one permission group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightPermGroupInfo {
    pub name: String,
    /// Package defining the group
    pub package_name: String,
    /// Synthesized group wrapping a single ungrouped permission
    pub is_single_permission: bool,
}

/// A group with the definitions of all its member permissions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermGroup {
    pub group_info: LightPermGroupInfo,
    pub permission_infos: IndexMap<String, LightPermInfo>,
}

impl PermGroup {
    pub fn name(&self) -> &str {
        &self.group_info.name
    }

    pub fn contains(&self, permission: &str) -> bool {
        self.permission_infos.contains_key(permission)
    }
}

/// Package metadata relevant to permissions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightPackageInfo {
    pub package_name: String,
    pub uid: Uid,
    pub target_sdk: u32,
    pub is_instant_app: bool,
    pub enabled: bool,
    /// Requested permissions in manifest order, mapped to their grant state
    pub requested_permissions: IndexMap<String, bool>,
    /// Permissions this package defines
    pub declared_permissions: Vec<LightPermInfo>,
}

impl LightPackageInfo {
    pub fn new(package_name: impl Into<String>, uid: Uid) -> Self {
        Self {
            package_name: package_name.into(),
            uid,
            target_sdk: SDK_RUNTIME_PERMISSIONS,
            is_instant_app: false,
            enabled: true,
            requested_permissions: IndexMap::new(),
            declared_permissions: Vec::new(),
        }
    }

    pub fn with_target_sdk(mut self, target_sdk: u32) -> Self {
        self.target_sdk = target_sdk;
        self
    }

    pub fn with_requested(mut self, permission: impl Into<String>, granted: bool) -> Self {
        self.requested_permissions.insert(permission.into(), granted);
        self
    }

    pub fn with_declared(mut self, permission: LightPermInfo) -> Self {
        self.declared_permissions.push(permission);
        self
    }

    pub fn instant(mut self) -> Self {
        self.is_instant_app = true;
        self
    }

    pub fn user(&self) -> UserId {
        UserId::of_uid(self.uid)
    }

    pub fn requests(&self, permission: &str) -> bool {
        self.requested_permissions.contains_key(permission)
    }

    pub fn is_granted(&self, permission: &str) -> bool {
        self.requested_permissions.get(permission).copied().unwrap_or(false)
    }
}

/// Grant state of one permission for one package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermState {
    pub flags: PermissionFlags,
    pub granted: bool,
}

/// App-op modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppOpMode {
    Allowed,
    Ignored,
    Errored,
    Default,
    Foreground,
}

/// One recorded access of an app-op
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpAccess {
    pub op: String,
    pub package_name: String,
    pub uid: Uid,
    pub last_access: Option<DateTime<Utc>>,
    /// The op is being used right now
    pub is_running: bool,
}

impl OpAccess {
    pub fn user(&self) -> UserId {
        UserId::of_uid(self.uid)
    }
}
