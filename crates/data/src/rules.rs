//! Permission rules
//!
//! Pure functions turning platform snapshots into derived state. Nodes call
//! these from their recompute; nothing here touches a node or the platform.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use permctl_core::config::AutoRevokeConfig;
use permctl_core::{ids, Uid};
use permctl_platform::model::{PLATFORM_PACKAGE, SDK_RUNTIME_PERMISSIONS};
use permctl_platform::{
    permissions, AppOpMode, LightPackageInfo, LightPermInfo, PermGroup, PermissionFlags,
    ProtectionFlags,
};

use crate::model::{
    AppPermGroupUiInfo, AutoRevokeState, LightAppPermGroup, LightPermission, PermGrantState,
    PermStates, UidSensitivity,
};

/// Flags keeping a granted permission from being revoked for disuse
pub const AUTO_REVOKE_EXEMPT_FLAGS: PermissionFlags = PermissionFlags::USER_FIXED
    .union(PermissionFlags::POLICY_FIXED)
    .union(PermissionFlags::SYSTEM_FIXED)
    .union(PermissionFlags::GRANTED_BY_DEFAULT)
    .union(PermissionFlags::GRANTED_BY_ROLE)
    .union(PermissionFlags::ONE_TIME);

/// Whether the package can be granted any of `permissions` at runtime
pub fn is_grantable<'a>(
    package: &LightPackageInfo,
    permissions: impl IntoIterator<Item = &'a LightPermInfo>,
) -> bool {
    let (mut has_instant_perm, mut has_pre_runtime_perm) = (false, false);
    for info in permissions {
        has_instant_perm |= info.protection_flags.contains(ProtectionFlags::INSTANT);
        has_pre_runtime_perm |= !info.protection_flags.contains(ProtectionFlags::RUNTIME_ONLY);
    }
    (!package.is_instant_app || has_instant_perm)
        && (package.target_sdk >= SDK_RUNTIME_PERMISSIONS || has_pre_runtime_perm)
}

/// Whether the group appears at all in the package's permission list
pub fn should_show_group(package: &LightPackageInfo, group: &PermGroup) -> bool {
    if group.group_info.package_name == PLATFORM_PACKAGE && !permissions::is_runtime_group(group.name()) {
        return false;
    }
    let requested: Vec<&LightPermInfo> = group
        .permission_infos
        .values()
        .filter(|info| info.is_runtime() && package.requests(&info.name))
        .collect();
    !requested.is_empty() && is_grantable(package, requested)
}

/// Runtime platform groups the package requests a permission of, in request order
pub fn requested_runtime_groups(package: &LightPackageInfo) -> Vec<String> {
    let mut groups: Vec<String> = Vec::new();
    for permission in package.requested_permissions.keys() {
        let Some(group) = permissions::group_of_permission(permission) else { continue };
        if permissions::is_runtime_group(group) && !groups.iter().any(|g| g == group) {
            groups.push(group.to_string());
        }
    }
    groups
}

/// Assemble the app's view of a group. `None` when it requests no member.
pub fn build_app_perm_group(
    package: &LightPackageInfo,
    group: &PermGroup,
    states: &PermStates,
) -> Option<LightAppPermGroup> {
    let mut permissions: IndexMap<String, LightPermission> = IndexMap::new();
    for (name, info) in &group.permission_infos {
        if !package.requests(name) {
            continue;
        }
        let (granted, flags) = match states.get(name) {
            Some(state) => (state.granted, state.flags),
            None => (package.is_granted(name), PermissionFlags::empty()),
        };
        let foreground_perms = group
            .permission_infos
            .values()
            .filter(|fg| fg.background_permission.as_deref() == Some(name.as_str()))
            .filter(|fg| package.requests(&fg.name))
            .map(|fg| fg.name.clone())
            .collect();
        permissions.insert(
            name.clone(),
            LightPermission {
                perm_info: info.clone(),
                granted,
                flags,
                foreground_perms,
            },
        );
    }
    if permissions.is_empty() {
        return None;
    }
    Some(LightAppPermGroup {
        package_info: package.clone(),
        group_info: group.group_info.clone(),
        permissions,
        foreground_only: permissions::is_foreground_only_group(group.name()),
    })
}

pub fn classify_grant_state(group: &LightAppPermGroup) -> PermGrantState {
    let foreground = group.foreground();
    if foreground.is_granted {
        if group.has_background_group() || group.foreground_only {
            if group.background().is_granted {
                PermGrantState::AllowedAlways
            } else if foreground.is_one_time {
                PermGrantState::AskEveryTime
            } else {
                PermGrantState::AllowedForeground
            }
        } else if foreground.is_one_time {
            PermGrantState::AskEveryTime
        } else {
            PermGrantState::Allowed
        }
    } else if foreground.is_user_fixed {
        PermGrantState::Denied
    } else if foreground.is_one_time {
        PermGrantState::AskEveryTime
    } else {
        PermGrantState::Denied
    }
}

/// Merge user-sensitivity flags of every package sharing `uid`.
///
/// A permission of a system uid is sensitive only if every package says so;
/// for an app uid one package is enough.
pub fn merge_user_sensitivity<I>(uid: Uid, flags: I) -> UidSensitivity
where
    I: IntoIterator<Item = (String, PermissionFlags)>,
{
    let system = ids::is_system_uid(uid);
    let mut merged: BTreeMap<String, PermissionFlags> = BTreeMap::new();
    for (permission, flags) in flags {
        let flags = flags & PermissionFlags::USER_SENSITIVE_MASK;
        let entry = merged.entry(permission).or_insert(if system {
            PermissionFlags::USER_SENSITIVE_MASK
        } else {
            PermissionFlags::empty()
        });
        if system {
            *entry &= flags;
        } else {
            *entry |= flags;
        }
    }
    UidSensitivity(merged)
}

/// UI state of one group of one app
pub fn ui_info(
    package: &LightPackageInfo,
    group: &PermGroup,
    states: &PermStates,
    sensitivity: Option<&UidSensitivity>,
) -> AppPermGroupUiInfo {
    let app_group = build_app_perm_group(package, group, states);
    let grant_state = app_group
        .as_ref()
        .map(classify_grant_state)
        .unwrap_or(PermGrantState::Denied);
    let is_user_sensitive = match (sensitivity, &app_group) {
        (Some(sensitivity), Some(app_group)) => app_group
            .permissions
            .values()
            .any(|p| sensitivity.is_user_sensitive(p.name(), p.granted)),
        (None, _) => !ids::is_system_uid(package.uid),
        (Some(_), None) => false,
    };
    AppPermGroupUiInfo {
        should_show: should_show_group(package, group),
        grant_state,
        is_system: !is_user_sensitive,
    }
}

/// Whether disuse may take this grant away
pub fn is_revocable_permission(permission: &LightPermission) -> bool {
    permission.granted && !permission.flags.intersects(AUTO_REVOKE_EXEMPT_FLAGS)
}

/// Whether disuse may take the grants of this group away
pub fn is_revocable_group(group: &str, states: &PermStates) -> bool {
    permissions::is_runtime_group(group)
        && states.values().any(|s| s.granted)
        && !states
            .values()
            .any(|s| s.granted && s.flags.intersects(AUTO_REVOKE_EXEMPT_FLAGS))
}

pub fn is_auto_revoke_enabled(mode: AppOpMode, target_sdk: u32, config: &AutoRevokeConfig) -> bool {
    match mode {
        AppOpMode::Allowed => true,
        AppOpMode::Default => target_sdk >= config.min_target_sdk,
        _ => false,
    }
}

pub fn auto_revoke_state(
    config: &AutoRevokeConfig,
    package: &LightPackageInfo,
    mode: AppOpMode,
    groups: &IndexMap<String, PermStates>,
) -> AutoRevokeState {
    let revocable_groups = groups
        .iter()
        .filter(|(group, states)| is_revocable_group(group, states))
        .map(|(group, _)| group.clone())
        .collect();
    let auto_revoked_groups = groups
        .iter()
        .filter(|(_, states)| {
            states
                .values()
                .any(|s| !s.granted && s.flags.contains(PermissionFlags::AUTO_REVOKED))
        })
        .map(|(group, _)| group.clone())
        .collect();
    AutoRevokeState {
        enabled_globally: config.enabled,
        enabled_for_app: is_auto_revoke_enabled(mode, package.target_sdk, config),
        revocable_groups,
        auto_revoked_groups,
    }
}

/// Whether an app last used at `last_used` counts as unused at `now`
pub fn is_unused(last_used: Option<DateTime<Utc>>, now: DateTime<Utc>, threshold_days: u32) -> bool {
    match last_used {
        Some(at) => now - at >= Duration::days(i64::from(threshold_days)),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use permctl_platform::names;
    use permctl_platform::PermState;

    fn state(granted: bool, flags: PermissionFlags) -> PermState {
        PermState { flags, granted }
    }

    fn location_app(fine: bool, background: bool) -> LightPackageInfo {
        LightPackageInfo::new("com.maps", 10_050)
            .with_target_sdk(30)
            .with_requested(names::ACCESS_FINE_LOCATION, fine)
            .with_requested(names::ACCESS_BACKGROUND_LOCATION, background)
    }

    fn group_state(package: &LightPackageInfo, group: &str, flags: PermissionFlags) -> PermGrantState {
        let group = permissions::perm_group(group).unwrap();
        let states: PermStates = package
            .requested_permissions
            .iter()
            .map(|(name, granted)| (name.clone(), state(*granted, flags)))
            .collect();
        build_app_perm_group(package, &group, &states).unwrap().grant_state()
    }

    #[test]
    fn test_camera_denied() {
        let package = LightPackageInfo::new("com.example", 10_001)
            .with_target_sdk(30)
            .with_requested(names::CAMERA, false);
        let group = permissions::perm_group(names::GROUP_CAMERA).unwrap();
        let states: PermStates = [(names::CAMERA.to_string(), state(false, PermissionFlags::empty()))]
            .into_iter()
            .collect();

        let app_group = build_app_perm_group(&package, &group, &states).unwrap();
        assert_eq!(app_group.grant_state(), PermGrantState::Denied);
        assert!(!app_group.is_one_time());
        assert!(!app_group.is_policy_fixed());
        assert!(should_show_group(&package, &group));
    }

    #[test]
    fn test_background_location_states() {
        let always = location_app(true, true);
        assert_eq!(
            group_state(&always, names::GROUP_LOCATION, PermissionFlags::empty()),
            PermGrantState::AllowedAlways
        );

        let foreground = location_app(true, false);
        assert_eq!(
            group_state(&foreground, names::GROUP_LOCATION, PermissionFlags::empty()),
            PermGrantState::AllowedForeground
        );
        assert_eq!(
            group_state(&foreground, names::GROUP_LOCATION, PermissionFlags::ONE_TIME),
            PermGrantState::AskEveryTime
        );
    }

    #[test]
    fn test_plain_group_states() {
        let granted = LightPackageInfo::new("com.chat", 10_060).with_requested(names::READ_CONTACTS, true);
        assert_eq!(
            group_state(&granted, names::GROUP_CONTACTS, PermissionFlags::empty()),
            PermGrantState::Allowed
        );
        assert_eq!(
            group_state(&granted, names::GROUP_CONTACTS, PermissionFlags::ONE_TIME),
            PermGrantState::AskEveryTime
        );

        let denied = LightPackageInfo::new("com.chat", 10_060).with_requested(names::READ_CONTACTS, false);
        assert_eq!(
            group_state(&denied, names::GROUP_CONTACTS, PermissionFlags::USER_FIXED | PermissionFlags::ONE_TIME),
            PermGrantState::Denied
        );
        assert_eq!(
            group_state(&denied, names::GROUP_CONTACTS, PermissionFlags::ONE_TIME),
            PermGrantState::AskEveryTime
        );
    }

    #[test]
    fn test_foreground_only_group() {
        let package = LightPackageInfo::new("com.camera", 10_070).with_requested(names::CAMERA, true);
        assert_eq!(
            group_state(&package, names::GROUP_CAMERA, PermissionFlags::empty()),
            PermGrantState::AllowedForeground
        );
    }

    #[test]
    fn test_grantable() {
        let camera = permissions::perm_info(names::CAMERA).unwrap();
        let background = permissions::perm_info(names::ACCESS_BACKGROUND_LOCATION).unwrap();

        let instant = LightPackageInfo::new("com.instant", 10_080).instant();
        assert!(is_grantable(&instant, [&camera]));
        assert!(!is_grantable(&instant, [&background]));

        let legacy = LightPackageInfo::new("com.legacy", 10_090).with_target_sdk(22);
        assert!(is_grantable(&legacy, [&camera]));
        assert!(!is_grantable(&legacy, [&background]));
    }

    #[test]
    fn test_legacy_platform_group_hidden() {
        let package = LightPackageInfo::new("com.web", 10_100).with_requested(names::INTERNET, true);
        let network = permissions::perm_group(names::GROUP_NETWORK).unwrap();
        assert!(!should_show_group(&package, &network));
    }

    #[test]
    fn test_shared_uid_merge() {
        let granted_only = PermissionFlags::USER_SENSITIVE_WHEN_GRANTED;
        let both = PermissionFlags::USER_SENSITIVE_MASK;
        let flags = || {
            vec![
                (names::CAMERA.to_string(), granted_only),
                (names::CAMERA.to_string(), both | PermissionFlags::USER_SET),
                (names::READ_SMS.to_string(), PermissionFlags::empty()),
            ]
        };

        let system = merge_user_sensitivity(1_000, flags());
        assert_eq!(system.flags(names::CAMERA), granted_only);
        assert_eq!(system.flags(names::READ_SMS), PermissionFlags::empty());

        let app = merge_user_sensitivity(10_001, flags());
        assert_eq!(app.flags(names::CAMERA), both);
        assert!(app.is_user_sensitive(names::CAMERA, false));
    }

    #[test]
    fn test_revocable_group() {
        let granted = |flags| -> PermStates {
            [(names::READ_CONTACTS.to_string(), state(true, flags))].into_iter().collect()
        };
        assert!(is_revocable_group(names::GROUP_CONTACTS, &granted(PermissionFlags::USER_SET)));
        for exempt in [
            PermissionFlags::USER_FIXED,
            PermissionFlags::POLICY_FIXED,
            PermissionFlags::SYSTEM_FIXED,
            PermissionFlags::GRANTED_BY_DEFAULT,
            PermissionFlags::GRANTED_BY_ROLE,
            PermissionFlags::ONE_TIME,
        ] {
            assert!(!is_revocable_group(names::GROUP_CONTACTS, &granted(exempt)), "{:?}", exempt);
        }
        assert!(!is_revocable_group(names::GROUP_NETWORK, &granted(PermissionFlags::empty())));
    }

    #[test]
    fn test_auto_revoke_enabled() {
        let config = AutoRevokeConfig::default();
        assert!(is_auto_revoke_enabled(AppOpMode::Allowed, 23, &config));
        assert!(is_auto_revoke_enabled(AppOpMode::Default, 30, &config));
        assert!(!is_auto_revoke_enabled(AppOpMode::Default, 29, &config));
        assert!(!is_auto_revoke_enabled(AppOpMode::Ignored, 33, &config));
    }

    #[test]
    fn test_unused() {
        let now = Utc::now();
        assert!(is_unused(None, now, 90));
        assert!(is_unused(Some(now - Duration::days(91)), now, 90));
        assert!(!is_unused(Some(now - Duration::days(3)), now, 90));
    }

    #[test]
    fn test_requested_runtime_groups() {
        let package = LightPackageInfo::new("com.example", 10_001)
            .with_requested(names::ACCESS_FINE_LOCATION, true)
            .with_requested(names::INTERNET, true)
            .with_requested(names::ACCESS_COARSE_LOCATION, true)
            .with_requested(names::CAMERA, false);
        assert_eq!(
            requested_runtime_groups(&package),
            vec![names::GROUP_LOCATION.to_string(), names::GROUP_CAMERA.to_string()]
        );
    }
}
