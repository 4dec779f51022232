//! Platform Permission Table
//!
//! The permissions and groups the platform itself defines. Everything the
//! data layer treats as "platform runtime" is decided here.

use indexmap::IndexMap;

use crate::model::{
    LightPermGroupInfo, LightPermInfo, PermGroup, ProtectionFlags, ProtectionLevel,
    PLATFORM_PACKAGE, SDK_RUNTIME_PERMISSIONS,
};

/// Well-known permission and group names
pub mod names {
    pub const ACCESS_FINE_LOCATION: &str = "android.permission.ACCESS_FINE_LOCATION";
    pub const ACCESS_COARSE_LOCATION: &str = "android.permission.ACCESS_COARSE_LOCATION";
    pub const ACCESS_BACKGROUND_LOCATION: &str = "android.permission.ACCESS_BACKGROUND_LOCATION";
    pub const CAMERA: &str = "android.permission.CAMERA";
    pub const RECORD_AUDIO: &str = "android.permission.RECORD_AUDIO";
    pub const READ_CONTACTS: &str = "android.permission.READ_CONTACTS";
    pub const READ_CALENDAR: &str = "android.permission.READ_CALENDAR";
    pub const READ_SMS: &str = "android.permission.READ_SMS";
    pub const READ_PHONE_STATE: &str = "android.permission.READ_PHONE_STATE";
    pub const POST_NOTIFICATIONS: &str = "android.permission.POST_NOTIFICATIONS";
    pub const INTERNET: &str = "android.permission.INTERNET";

    pub const GROUP_LOCATION: &str = "android.permission-group.LOCATION";
    pub const GROUP_CAMERA: &str = "android.permission-group.CAMERA";
    pub const GROUP_MICROPHONE: &str = "android.permission-group.MICROPHONE";
    pub const GROUP_CONTACTS: &str = "android.permission-group.CONTACTS";
    pub const GROUP_CALENDAR: &str = "android.permission-group.CALENDAR";
    pub const GROUP_SMS: &str = "android.permission-group.SMS";
    pub const GROUP_PHONE: &str = "android.permission-group.PHONE";
    pub const GROUP_NETWORK: &str = "android.permission-group.NETWORK";

    /// App-op deciding whether unused apps lose their permissions
    pub const OP_AUTO_REVOKE_PERMISSIONS_IF_UNUSED: &str = "android:auto_revoke_permissions_if_unused";
    pub const OP_CAMERA: &str = "android:camera";
    pub const OP_RECORD_AUDIO: &str = "android:record_audio";
    pub const OP_FINE_LOCATION: &str = "android:fine_location";
}

struct PlatformPermission {
    name: &'static str,
    added_in_api: u32,
    background: Option<&'static str>,
    instant: bool,
}

struct PlatformGroup {
    name: &'static str,
    /// Runtime groups are the only platform groups ever shown to users
    runtime: bool,
    /// Shown with foreground/always states even without a background permission
    foreground_only: bool,
    permissions: &'static [PlatformPermission],
}

macro_rules! perm {
    ($name:expr, $api:expr) => {
        PlatformPermission {
            name: $name,
            added_in_api: $api,
            background: None,
            instant: false,
        }
    };
}

macro_rules! instant {
    ($name:expr, $api:expr) => {
        PlatformPermission {
            name: $name,
            added_in_api: $api,
            background: None,
            instant: true,
        }
    };
}

macro_rules! with_background {
    ($name:expr, $background:expr) => {
        PlatformPermission {
            name: $name,
            added_in_api: 1,
            background: Some($background),
            instant: true,
        }
    };
}

macro_rules! runtime {
    ($name:expr, $permissions:expr $(,)?) => {
        PlatformGroup {
            name: $name,
            runtime: true,
            foreground_only: false,
            permissions: $permissions,
        }
    };
}

static GROUPS: &[PlatformGroup] = &[
    runtime!(
        names::GROUP_LOCATION,
        &[
            with_background!(names::ACCESS_FINE_LOCATION, names::ACCESS_BACKGROUND_LOCATION),
            with_background!(names::ACCESS_COARSE_LOCATION, names::ACCESS_BACKGROUND_LOCATION),
            perm!(names::ACCESS_BACKGROUND_LOCATION, 29),
        ],
    ),
    PlatformGroup {
        name: names::GROUP_CAMERA,
        runtime: true,
        foreground_only: true,
        permissions: &[instant!(names::CAMERA, 1)],
    },
    PlatformGroup {
        name: names::GROUP_MICROPHONE,
        runtime: true,
        foreground_only: true,
        permissions: &[instant!(names::RECORD_AUDIO, 1)],
    },
    runtime!(
        names::GROUP_CONTACTS,
        &[
            perm!(names::READ_CONTACTS, 1),
            perm!("android.permission.WRITE_CONTACTS", 1),
            perm!("android.permission.GET_ACCOUNTS", 1),
        ],
    ),
    runtime!(
        names::GROUP_CALENDAR,
        &[
            perm!(names::READ_CALENDAR, 1),
            perm!("android.permission.WRITE_CALENDAR", 1),
        ],
    ),
    runtime!(
        names::GROUP_PHONE,
        &[
            perm!(names::READ_PHONE_STATE, 1),
            perm!("android.permission.CALL_PHONE", 1),
            instant!("android.permission.READ_PHONE_NUMBERS", 26),
        ],
    ),
    runtime!(
        "android.permission-group.CALL_LOG",
        &[
            perm!("android.permission.READ_CALL_LOG", 16),
            perm!("android.permission.WRITE_CALL_LOG", 16),
        ],
    ),
    runtime!(
        names::GROUP_SMS,
        &[
            perm!("android.permission.SEND_SMS", 1),
            perm!("android.permission.RECEIVE_SMS", 1),
            perm!(names::READ_SMS, 1),
        ],
    ),
    runtime!(
        "android.permission-group.SENSORS",
        &[perm!("android.permission.BODY_SENSORS", 20)],
    ),
    runtime!(
        "android.permission-group.STORAGE",
        &[
            perm!("android.permission.READ_EXTERNAL_STORAGE", 16),
            perm!("android.permission.WRITE_EXTERNAL_STORAGE", 4),
        ],
    ),
    runtime!(
        "android.permission-group.READ_MEDIA_VISUAL",
        &[
            perm!("android.permission.READ_MEDIA_IMAGES", 33),
            perm!("android.permission.READ_MEDIA_VIDEO", 33),
        ],
    ),
    runtime!(
        "android.permission-group.READ_MEDIA_AURAL",
        &[perm!("android.permission.READ_MEDIA_AUDIO", 33)],
    ),
    runtime!(
        "android.permission-group.ACTIVITY_RECOGNITION",
        &[perm!("android.permission.ACTIVITY_RECOGNITION", 29)],
    ),
    runtime!(
        "android.permission-group.NEARBY_DEVICES",
        &[
            perm!("android.permission.BLUETOOTH_CONNECT", 31),
            perm!("android.permission.BLUETOOTH_SCAN", 31),
        ],
    ),
    runtime!(
        "android.permission-group.NOTIFICATIONS",
        &[perm!(names::POST_NOTIFICATIONS, 33)],
    ),
    PlatformGroup {
        name: names::GROUP_NETWORK,
        runtime: false,
        foreground_only: false,
        permissions: &[
            perm!(names::INTERNET, 1),
            perm!("android.permission.ACCESS_NETWORK_STATE", 1),
        ],
    },
];

fn find_group(group: &str) -> Option<&'static PlatformGroup> {
    GROUPS.iter().find(|g| g.name == group)
}

fn find_permission(permission: &str) -> Option<(&'static PlatformGroup, &'static PlatformPermission)> {
    GROUPS.iter().find_map(|group| {
        group
            .permissions
            .iter()
            .find(|p| p.name == permission)
            .map(|p| (group, p))
    })
}

/// Names of the platform runtime groups, in display order
pub fn runtime_groups() -> impl Iterator<Item = &'static str> {
    GROUPS.iter().filter(|g| g.runtime).map(|g| g.name)
}

/// Platform group a platform permission belongs to
pub fn group_of_permission(permission: &str) -> Option<&'static str> {
    find_permission(permission).map(|(group, _)| group.name)
}

/// Whether the group is a platform runtime group
pub fn is_runtime_group(group: &str) -> bool {
    find_group(group).map(|g| g.runtime).unwrap_or(false)
}

/// Whether the group is defined by the platform, runtime or not
pub fn is_platform_group(group: &str) -> bool {
    find_group(group).is_some()
}

pub fn is_runtime_platform_permission(permission: &str) -> bool {
    find_permission(permission)
        .map(|(group, _)| group.runtime)
        .unwrap_or(false)
}

/// Groups shown with foreground states although they have no background permission
pub fn is_foreground_only_group(group: &str) -> bool {
    find_group(group).map(|g| g.foreground_only).unwrap_or(false)
}

fn to_perm_info(group: &PlatformGroup, permission: &PlatformPermission) -> LightPermInfo {
    let mut protection_flags = ProtectionFlags::empty();
    if permission.added_in_api > SDK_RUNTIME_PERMISSIONS {
        protection_flags |= ProtectionFlags::RUNTIME_ONLY;
    }
    if permission.instant {
        protection_flags |= ProtectionFlags::INSTANT;
    }
    LightPermInfo {
        name: permission.name.to_string(),
        package_name: PLATFORM_PACKAGE.to_string(),
        group: Some(group.name.to_string()),
        background_permission: permission.background.map(str::to_string),
        protection: if group.runtime {
            ProtectionLevel::Dangerous
        } else {
            ProtectionLevel::Normal
        },
        protection_flags,
    }
}

/// Definition of one platform permission
pub fn perm_info(permission: &str) -> Option<LightPermInfo> {
    find_permission(permission).map(|(group, p)| to_perm_info(group, p))
}

/// Definition of a platform group with all its permissions
pub fn perm_group(group: &str) -> Option<PermGroup> {
    let group = find_group(group)?;
    let permission_infos: IndexMap<String, LightPermInfo> = group
        .permissions
        .iter()
        .map(|p| (p.name.to_string(), to_perm_info(group, p)))
        .collect();
    Some(PermGroup {
        group_info: LightPermGroupInfo {
            name: group.name.to_string(),
            package_name: PLATFORM_PACKAGE.to_string(),
            is_single_permission: false,
        },
        permission_infos,
    })
}

/// Every platform group, runtime or not
pub fn platform_groups() -> Vec<PermGroup> {
    GROUPS.iter().filter_map(|g| perm_group(g.name)).collect()
}
