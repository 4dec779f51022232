//! Group Packages Node
//!
//! Which packages request each permission group, across all users.

use std::collections::BTreeSet;
use std::sync::Arc;

use indexmap::IndexMap;
use permctl_platform::permissions;
use permctl_reactive::{ObservableCache, ReactiveValue, SourceSet};

use super::{AllPackagesNode, NodeEnv, PermGroupNode};
use crate::keys::{PackageKey, PermGroupKey};
use crate::model::{AllPackages, PermGroupPackages};

/// Packages requesting each runtime or custom group
pub type PermGroupsPackagesNode = ReactiveValue<PermGroupPackages>;

/// Platform runtime groups in display order, then custom groups by name
fn group_names(all: &AllPackages) -> Vec<String> {
    let custom: BTreeSet<&str> = all
        .iter()
        .flat_map(|(_, package)| package.declared_permissions.iter())
        .filter_map(|info| info.group.as_deref())
        .filter(|group| !permissions::is_platform_group(group))
        .collect();
    permissions::runtime_groups()
        .map(str::to_string)
        .chain(custom.into_iter().map(str::to_string))
        .collect()
}

pub fn build(
    env: &Arc<NodeEnv>,
    all_packages: AllPackagesNode,
    perm_groups: ObservableCache<PermGroupKey, PermGroupNode>,
) -> PermGroupsPackagesNode {
    let node: PermGroupsPackagesNode = ReactiveValue::new(&env.ctx, "PermGroupsPackages");
    let held: Arc<SourceSet<PermGroupKey, PermGroupNode>> = Arc::new(SourceSet::new());

    let tracked = Arc::clone(&held);
    let packages_source = all_packages.clone();
    node.add_source_with(&all_packages, move |node| {
        let desired: Vec<PermGroupKey> = packages_source
            .value()
            .map(|all| group_names(&all).into_iter().map(PermGroupKey).collect())
            .unwrap_or_default();
        node.set_sources_to_difference(desired, &tracked, |key| perm_groups.get(key), None);
        node.update();
    });

    node.on_update(move |node| {
        if !all_packages.is_initialized() {
            return;
        }
        let Some(all) = all_packages.value() else {
            node.set(None);
            return;
        };

        let mut groups = IndexMap::new();
        for name in group_names(&all) {
            let Some(group) = held.get(&PermGroupKey(name.clone())) else {
                return;
            };
            if !group.is_initialized() {
                return;
            }
            let Some(group) = group.value() else { continue };
            let mut requesting: Vec<PackageKey> = all
                .iter()
                .filter(|(_, package)| package.requested_permissions.keys().any(|p| group.contains(p)))
                .map(|(user, package)| PackageKey::new(package.package_name.clone(), user))
                .collect();
            requesting.sort();
            groups.insert(name, requesting);
        }
        node.set(Some(PermGroupPackages { groups }));
    });
    node
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::UserKey;
    use crate::nodes::{all_packages, perm_group, testing::Harness, user_packages, users, UserPackagesNode};
    use permctl_core::UserId;
    use permctl_platform::{names, LightPackageInfo, LightPermInfo, ProtectionLevel};

    #[test]
    fn test_groups_index_requesting_packages() {
        let harness = Harness::new();
        harness.fake.install(
            LightPackageInfo::new("com.camera", 10_001)
                .with_requested(names::CAMERA, false)
                .with_declared(LightPermInfo {
                    name: "com.camera.permission.SYNC".into(),
                    package_name: "com.camera".into(),
                    group: Some("com.camera.group.SYNC".into()),
                    background_permission: None,
                    protection: ProtectionLevel::Dangerous,
                    protection_flags: Default::default(),
                }),
        );
        harness.fake.install(
            LightPackageInfo::new("com.chat", 10_002)
                .with_requested(names::CAMERA, true)
                .with_requested("com.camera.permission.SYNC", true),
        );

        let env = &harness.env;
        let packages_env = Arc::clone(env);
        let user_packages: ObservableCache<UserKey, UserPackagesNode> =
            ObservableCache::new("user_packages", env.config.cache.clone(), move |key, evictor| {
                user_packages::build(&packages_env, key, evictor)
            });
        let groups_env = Arc::clone(env);
        let perm_groups: ObservableCache<PermGroupKey, PermGroupNode> =
            ObservableCache::new("perm_groups", env.config.cache.clone(), move |key, evictor| {
                perm_group::build(&groups_env, key, evictor)
            });
        let all = all_packages::build(env, users::build(env), user_packages);
        let node = build(env, all, perm_groups);

        let index = harness.settle(&node).unwrap();
        assert_eq!(
            index.groups[names::GROUP_CAMERA],
            vec![
                PackageKey::new("com.camera", UserId::SYSTEM),
                PackageKey::new("com.chat", UserId::SYSTEM),
            ]
        );
        assert_eq!(
            index.groups["com.camera.group.SYNC"],
            vec![PackageKey::new("com.chat", UserId::SYSTEM)]
        );
        assert!(index.groups[names::GROUP_SMS].is_empty());
        assert_eq!(index.groups.keys().last().map(String::as_str), Some("com.camera.group.SYNC"));
    }
}
