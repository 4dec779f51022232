//! Package Info Node
//!
//! Snapshot of one package for one user. Reloads on package broadcasts for
//! that name and on permission broadcasts for its current uid.

use std::sync::Arc;

use permctl_platform::LightPackageInfo;
use permctl_reactive::{AsyncReactiveValue, Evictor, LoadOutcome};

use super::{evict_when_gone, job, outcome, NodeEnv};
use crate::hubs::{updater, UidRegistration};
use crate::keys::PackageKey;

/// Package metadata of one package of one user.
///
/// Reloads on package broadcasts for the package and on permission changes
/// of its uid. The uid registration follows the uid of the latest snapshot.
pub type PackageInfoNode = AsyncReactiveValue<LightPackageInfo>;

pub fn build(env: &Arc<NodeEnv>, key: &PackageKey, evictor: Evictor) -> PackageInfoNode {
    let node: PackageInfoNode = AsyncReactiveValue::new(&env.ctx, &env.pool, format!("PackageInfo({})", key));
    let id = node.value_node().node_id();
    let listener = updater(node.value_node());
    let registration = Arc::new(UidRegistration::new(&env.hubs.permissions, id, Arc::clone(&listener)));

    let packages = Arc::clone(&env.hubs.packages);
    let package = key.package.clone();
    let active_registration = Arc::clone(&registration);
    node.on_active(move |_| {
        packages.add_listener(&package, id, Arc::clone(&listener));
        active_registration.activate();
    });

    let packages = Arc::clone(&env.hubs.packages);
    let package = key.package.clone();
    let inactive_registration = Arc::clone(&registration);
    node.on_inactive(move |_| {
        packages.remove_listener(&package, id);
        inactive_registration.deactivate();
    });

    node.on_applied(move |value| registration.track(value.value().map(|info| info.uid)));

    let platform = Arc::clone(&env.platform);
    let key = key.clone();
    node.on_prepare(move |_| {
        let platform = Arc::clone(&platform);
        let key = key.clone();
        job(move |token| {
            if token.is_cancelled() {
                return LoadOutcome::Skip;
            }
            outcome(&key, platform.package_info(&key.package, key.user))
        })
    });

    evict_when_gone(&node, evictor);
    node
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::Harness;
    use permctl_core::{PackageChange, PlatformEvent, UserId};
    use permctl_platform::names;
    use permctl_reactive::ObservableCache;

    #[test]
    fn test_loads_and_tracks_uid() {
        let harness = Harness::new();
        harness
            .fake
            .install(LightPackageInfo::new("com.example", 10_001).with_requested(names::CAMERA, false));

        let node = build(&harness.env, &PackageKey::new("com.example", UserId::SYSTEM), Evictor::detached());
        let info = harness.settle(&node).unwrap();
        assert_eq!(info.uid, 10_001);
        assert_eq!(harness.env.hubs.permissions.listeners_for(10_001), 1);
        assert_eq!(harness.env.hubs.packages.listener_count(), 1);
    }

    #[test]
    fn test_uid_reassignment_moves_registration() {
        let harness = Harness::new();
        harness.fake.install(LightPackageInfo::new("com.example", 10_001));
        let node = build(&harness.env, &PackageKey::new("com.example", UserId::SYSTEM), Evictor::detached());
        harness.settle(&node);
        let registrations = harness.fake.register_calls();

        harness
            .fake
            .update_package(LightPackageInfo::new("com.example", 10_002))
            .unwrap();
        harness.env.hubs.route(&PlatformEvent::Package {
            change: PackageChange::Changed,
            package: "com.example".into(),
            uid: 10_002,
        });
        assert!(harness.wait(|| node.value().map(|i| i.uid) == Some(10_002)));

        let permissions = &harness.env.hubs.permissions;
        assert_eq!(permissions.listeners_for(10_001), 0);
        assert_eq!(permissions.listeners_for(10_002), 1);
        assert_eq!(permissions.listener_count(), 1);
        assert_eq!(harness.fake.permission_listener_registrations(), 1);
        assert_eq!(harness.fake.register_calls(), registrations);
    }

    #[test]
    fn test_removed_package_evicts_itself() {
        let harness = Harness::new();
        harness.fake.install(LightPackageInfo::new("com.example", 10_001));
        let env = Arc::clone(&harness.env);
        let cache: ObservableCache<PackageKey, PackageInfoNode> = ObservableCache::new(
            "package_info",
            env.config.cache.clone(),
            move |key, evictor| build(&env, key, evictor),
        );
        let key = PackageKey::new("com.example", UserId::SYSTEM);
        let node = cache.get(&key);
        harness.settle(&node);

        harness.fake.uninstall("com.example", UserId::SYSTEM).unwrap();
        harness.env.hubs.route(&PlatformEvent::Package {
            change: PackageChange::Removed,
            package: "com.example".into(),
            uid: 10_001,
        });
        assert!(harness.wait(|| node.value().is_none()));
        assert!(!cache.contains(&key));
        assert_eq!(harness.env.hubs.permissions.listener_count(), 0);
    }
}
