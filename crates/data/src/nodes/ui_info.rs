//! UI Info Node
//!
//! What a permission screen shows for one app and one group: whether the
//! row is visible, its grant state and whether it belongs to the system.

use std::sync::Arc;

use permctl_reactive::{ObservableCache, ReactiveValue, SourceSet};

use super::{NodeEnv, PackageInfoNode, PermGroupNode, PermStateNode, UserSensitiveFlagsNode};
use crate::keys::{AppPermGroupKey, UidKey};
use crate::model::AppPermGroupUiInfo;
use crate::rules;

/// What the permission screens show for one group of one app.
///
/// The sensitivity source follows the uid of the current package snapshot.
pub type AppPermGroupUiInfoNode = ReactiveValue<AppPermGroupUiInfo>;

pub fn build(
    env: &Arc<NodeEnv>,
    key: &AppPermGroupKey,
    package: PackageInfoNode,
    group: PermGroupNode,
    states: PermStateNode,
    sensitivity: ObservableCache<UidKey, UserSensitiveFlagsNode>,
) -> AppPermGroupUiInfoNode {
    let node: AppPermGroupUiInfoNode = ReactiveValue::new(&env.ctx, format!("AppPermGroupUiInfo({})", key));
    let held: Arc<SourceSet<UidKey, UserSensitiveFlagsNode>> = Arc::new(SourceSet::new());

    let tracked = Arc::clone(&held);
    let package_source = package.clone();
    node.add_source_with(&package, move |node| {
        let desired = package_source.value().map(|info| UidKey::of(info.uid));
        node.set_sources_to_difference(desired, &tracked, |key| sensitivity.get(key), None);
        node.update();
    });
    node.add_source(&group);
    node.add_source(&states);

    node.on_update(move |node| {
        if !package.is_initialized() || !group.is_initialized() || !states.is_initialized() {
            return;
        }
        let (Some(package), Some(group), Some(states)) = (package.value(), group.value(), states.value()) else {
            node.set(None);
            return;
        };
        let Some(flags) = held.get(&UidKey::of(package.uid)) else {
            return;
        };
        if !flags.is_initialized() {
            return;
        }
        let sensitivity = flags.value();
        node.set(Some(rules::ui_info(&package, &group, &states, sensitivity.as_deref())));
    });
    node
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PermGrantState;
    use crate::nodes::{package_info, perm_group, perm_state, testing::Harness, user_sensitive};
    use permctl_core::UserId;
    use permctl_platform::{names, LightPackageInfo, PermissionFlags};
    use permctl_reactive::Evictor;

    fn ui_info(harness: &Harness, key: &AppPermGroupKey) -> (AppPermGroupUiInfoNode, ObservableCache<UidKey, UserSensitiveFlagsNode>) {
        let env = &harness.env;
        let sensitivity_env = Arc::clone(env);
        let sensitivity: ObservableCache<UidKey, UserSensitiveFlagsNode> =
            ObservableCache::new("sensitivity", env.config.cache.clone(), move |key, evictor| {
                user_sensitive::build(&sensitivity_env, key, evictor)
            });
        let package = package_info::build(env, &key.package_key(), Evictor::detached());
        let group = perm_group::build(env, &key.group_key(), Evictor::detached());
        let states = perm_state::build(env, key, Evictor::detached(), package.clone(), group.clone());
        (build(env, key, package, group, states, sensitivity.clone()), sensitivity)
    }

    #[test]
    fn test_app_camera_denied_and_shown() {
        let harness = Harness::new();
        harness.fake.install(
            LightPackageInfo::new("com.example", 10_001)
                .with_target_sdk(30)
                .with_requested(names::CAMERA, false),
        );
        let key = AppPermGroupKey::new("com.example", names::GROUP_CAMERA, UserId::SYSTEM);
        let (node, sensitivity) = ui_info(&harness, &key);

        let info = harness.settle(&node).unwrap();
        assert_eq!(
            *info,
            AppPermGroupUiInfo {
                should_show: true,
                grant_state: PermGrantState::Denied,
                is_system: false,
            }
        );
        assert!(sensitivity.contains(&UidKey::of(10_001)));
    }

    #[test]
    fn test_insensitive_system_grant_is_system() {
        let harness = Harness::new();
        harness
            .fake
            .install(LightPackageInfo::new("com.android.phone", 1_001).with_requested(names::READ_SMS, true));
        harness
            .fake
            .set_permission_flags("com.android.phone", names::READ_SMS, UserId::SYSTEM, PermissionFlags::empty())
            .unwrap();
        let key = AppPermGroupKey::new("com.android.phone", names::GROUP_SMS, UserId::SYSTEM);
        let (node, _sensitivity) = ui_info(&harness, &key);

        let info = harness.settle(&node).unwrap();
        assert!(info.is_system);
        assert_eq!(info.grant_state, PermGrantState::Allowed);
    }
}
