//! Permission State Node
//!
//! Grant state and flags of every permission of one group for one app.

use std::sync::Arc;

use permctl_platform::PermState;
use permctl_reactive::{AsyncReactiveValue, Evictor, LoadOutcome};
use tracing::warn;

use super::{evict_when_gone, job, NodeEnv, PackageInfoNode, PermGroupNode};
use crate::hubs::{updater, UidRegistration};
use crate::keys::AppPermGroupKey;
use crate::model::PermStates;

/// Flags and grant state of every member of a group the package requests
pub type PermStateNode = AsyncReactiveValue<PermStates>;

pub fn build(
    env: &Arc<NodeEnv>,
    key: &AppPermGroupKey,
    evictor: Evictor,
    package: PackageInfoNode,
    group: PermGroupNode,
) -> PermStateNode {
    let node: PermStateNode = AsyncReactiveValue::new(&env.ctx, &env.pool, format!("PermState({})", key));
    let id = node.value_node().node_id();
    node.add_source(&package);
    node.add_source(&group);

    let registration = Arc::new(UidRegistration::new(
        &env.hubs.permissions,
        id,
        updater(node.value_node()),
    ));
    let active_registration = Arc::clone(&registration);
    node.on_active(move |_| active_registration.activate());
    let inactive_registration = Arc::clone(&registration);
    node.on_inactive(move |_| inactive_registration.deactivate());

    let platform = Arc::clone(&env.platform);
    let user = key.user;
    node.on_prepare(move |value| {
        if !package.is_initialized() || !group.is_initialized() {
            return None;
        }
        let (Some(package_info), Some(group_info)) = (package.value(), group.value()) else {
            registration.track(None);
            value.set(None);
            return None;
        };
        registration.track(Some(package_info.uid));

        let platform = Arc::clone(&platform);
        job(move |token| {
            let mut states = PermStates::new();
            for name in group_info.permission_infos.keys() {
                if token.is_cancelled() {
                    return LoadOutcome::Skip;
                }
                if !package_info.requests(name) {
                    continue;
                }
                match platform.permission_flags(name, &package_info.package_name, user) {
                    Ok(flags) => {
                        states.insert(
                            name.clone(),
                            PermState {
                                flags,
                                granted: package_info.is_granted(name),
                            },
                        );
                    }
                    Err(e) if e.is_not_found() => return LoadOutcome::NotFound,
                    Err(e) => {
                        warn!("Flags of {} for {} unavailable: {}", name, package_info.package_name, e);
                        return LoadOutcome::Skip;
                    }
                }
            }
            LoadOutcome::Value(Some(states))
        })
    });

    evict_when_gone(&node, evictor);
    node
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::{package_info, perm_group, testing::Harness};
    use permctl_core::{PlatformEvent, UserId};
    use permctl_platform::{names, LightPackageInfo, PackageManager, PermissionFlags};

    fn perm_state(harness: &Harness, key: &AppPermGroupKey) -> PermStateNode {
        let env = &harness.env;
        let package = package_info::build(env, &key.package_key(), Evictor::detached());
        let group = perm_group::build(env, &key.group_key(), Evictor::detached());
        build(env, key, Evictor::detached(), package, group)
    }

    #[test]
    fn test_reads_requested_members_only() {
        let harness = Harness::new();
        harness.fake.install(
            LightPackageInfo::new("com.maps", 10_050)
                .with_target_sdk(30)
                .with_requested(names::ACCESS_FINE_LOCATION, true),
        );
        let key = AppPermGroupKey::new("com.maps", names::GROUP_LOCATION, UserId::SYSTEM);
        let node = perm_state(&harness, &key);

        let states = harness.settle(&node).unwrap();
        assert_eq!(states.len(), 1);
        let fine = states[names::ACCESS_FINE_LOCATION];
        assert!(fine.granted);
        assert!(fine.flags.contains(PermissionFlags::USER_SENSITIVE_WHEN_GRANTED));
        assert_eq!(harness.env.hubs.permissions.listeners_for(10_050), 2);
    }

    #[test]
    fn test_permission_change_reloads() {
        let harness = Harness::new();
        harness
            .fake
            .install(LightPackageInfo::new("com.example", 10_001).with_requested(names::CAMERA, false));
        let key = AppPermGroupKey::new("com.example", names::GROUP_CAMERA, UserId::SYSTEM);
        let node = perm_state(&harness, &key);
        harness.settle(&node);

        harness
            .fake
            .update_permission_flags(
                names::CAMERA,
                "com.example",
                PermissionFlags::USER_FIXED,
                PermissionFlags::USER_FIXED,
                UserId::SYSTEM,
            )
            .unwrap();
        harness.env.hubs.route(&PlatformEvent::PermissionsChanged { uid: 10_001 });

        assert!(harness.wait(|| {
            node.value()
                .map(|s| s[names::CAMERA].flags.contains(PermissionFlags::USER_FIXED))
                .unwrap_or(false)
        }));
    }
}
