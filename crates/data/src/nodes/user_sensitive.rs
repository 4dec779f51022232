//! User Sensitivity Node
//!
//! Which permissions of a uid are user-sensitive. Packages sharing a uid
//! are merged: intersection for system uids, union otherwise.

use std::sync::Arc;

use permctl_platform::permissions;
use permctl_reactive::{AsyncReactiveValue, Evictor, LoadOutcome};
use tracing::{debug, warn};

use super::{evict_when_gone, job, NodeEnv};
use crate::hubs::updater;
use crate::keys::UidKey;
use crate::model::UidSensitivity;
use crate::rules;

/// User-sensitivity flags merged over every package sharing a uid
pub type UserSensitiveFlagsNode = AsyncReactiveValue<UidSensitivity>;

pub fn build(env: &Arc<NodeEnv>, key: &UidKey, evictor: Evictor) -> UserSensitiveFlagsNode {
    let node: UserSensitiveFlagsNode = AsyncReactiveValue::new(&env.ctx, &env.pool, format!("UserSensitiveFlags({})", key.uid));
    let id = node.value_node().node_id();
    let uid = key.uid;

    let hubs = Arc::clone(&env.hubs);
    let listener = updater(node.value_node());
    node.on_active(move |_| {
        hubs.permissions.add_listener(uid, id, Arc::clone(&listener));
        hubs.packages.add_catch_all(id, Arc::clone(&listener));
    });
    let hubs = Arc::clone(&env.hubs);
    node.on_inactive(move |_| {
        hubs.permissions.remove_listener(uid, id);
        hubs.packages.remove_catch_all(id);
    });

    let platform = Arc::clone(&env.platform);
    let user = key.user;
    node.on_prepare(move |_| {
        let platform = Arc::clone(&platform);
        job(move |token| {
            let packages = match platform.packages_for_uid(uid) {
                Ok(packages) if packages.is_empty() => return LoadOutcome::NotFound,
                Ok(packages) => packages,
                Err(e) => {
                    warn!("Packages of uid {} unavailable: {}", uid, e);
                    return LoadOutcome::Skip;
                }
            };

            let mut flags = Vec::new();
            for package in packages {
                if token.is_cancelled() {
                    return LoadOutcome::Skip;
                }
                let info = match platform.package_info(&package, user) {
                    Ok(info) => info,
                    Err(e) => {
                        debug!("Skipping {} of uid {}: {}", package, uid, e);
                        continue;
                    }
                };
                for permission in info.requested_permissions.keys() {
                    if !permissions::is_runtime_platform_permission(permission) {
                        continue;
                    }
                    match platform.permission_flags(permission, &package, user) {
                        Ok(f) => flags.push((permission.clone(), f)),
                        Err(e) => debug!("No flags for {} of {}: {}", permission, package, e),
                    }
                }
            }
            LoadOutcome::Value(Some(rules::merge_user_sensitivity(uid, flags)))
        })
    });

    evict_when_gone(&node, evictor);
    node
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::Harness;
    use permctl_core::UserId;
    use permctl_platform::{names, LightPackageInfo, PermissionFlags};

    #[test]
    fn test_shared_app_uid_unions() {
        let harness = Harness::new();
        harness
            .fake
            .install(LightPackageInfo::new("com.shared.a", 10_200).with_requested(names::CAMERA, true));
        harness
            .fake
            .install(LightPackageInfo::new("com.shared.b", 10_200).with_requested(names::CAMERA, true));
        harness
            .fake
            .set_permission_flags("com.shared.a", names::CAMERA, UserId::SYSTEM, PermissionFlags::empty())
            .unwrap();

        let node = build(&harness.env, &UidKey::of(10_200), Evictor::detached());
        let merged = harness.settle(&node).unwrap();
        assert_eq!(merged.flags(names::CAMERA), PermissionFlags::USER_SENSITIVE_MASK);
    }

    #[test]
    fn test_system_uid_intersects() {
        let harness = Harness::new();
        harness
            .fake
            .install(LightPackageInfo::new("com.android.phone", 1_001).with_requested(names::READ_SMS, true));
        harness
            .fake
            .install(LightPackageInfo::new("com.android.stk", 1_001).with_requested(names::READ_SMS, true));
        harness
            .fake
            .set_permission_flags(
                "com.android.phone",
                names::READ_SMS,
                UserId::SYSTEM,
                PermissionFlags::USER_SENSITIVE_MASK,
            )
            .unwrap();
        harness
            .fake
            .set_permission_flags(
                "com.android.stk",
                names::READ_SMS,
                UserId::SYSTEM,
                PermissionFlags::USER_SENSITIVE_WHEN_DENIED,
            )
            .unwrap();

        let node = build(&harness.env, &UidKey::of(1_001), Evictor::detached());
        let merged = harness.settle(&node).unwrap();
        assert_eq!(merged.flags(names::READ_SMS), PermissionFlags::USER_SENSITIVE_WHEN_DENIED);
        assert!(!merged.is_user_sensitive(names::READ_SMS, true));
    }

    #[test]
    fn test_unknown_uid_is_gone() {
        let harness = Harness::new();
        let node = build(&harness.env, &UidKey::of(10_999), Evictor::detached());
        assert!(harness.settle(&node).is_none());
    }
}
