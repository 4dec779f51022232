//! Permission Group Node

use std::sync::Arc;

use permctl_platform::PermGroup;
use permctl_reactive::{AsyncReactiveValue, Evictor, LoadOutcome};

use super::{evict_when_gone, job, outcome, NodeEnv};
use crate::hubs::updater;
use crate::keys::PermGroupKey;

/// Definition of a permission group and its members.
///
/// Any package change can add or drop a custom group, so the node listens
/// to every package broadcast.
pub type PermGroupNode = AsyncReactiveValue<PermGroup>;

pub fn build(env: &Arc<NodeEnv>, key: &PermGroupKey, evictor: Evictor) -> PermGroupNode {
    let node: PermGroupNode = AsyncReactiveValue::new(&env.ctx, &env.pool, format!("PermGroup({})", key.0));
    let id = node.value_node().node_id();

    let packages = Arc::clone(&env.hubs.packages);
    let listener = updater(node.value_node());
    node.on_active(move |_| packages.add_catch_all(id, Arc::clone(&listener)));
    let packages = Arc::clone(&env.hubs.packages);
    node.on_inactive(move |_| packages.remove_catch_all(id));

    let platform = Arc::clone(&env.platform);
    let group = key.0.clone();
    node.on_prepare(move |_| {
        let platform = Arc::clone(&platform);
        let group = group.clone();
        job(move |token| {
            if token.is_cancelled() {
                return LoadOutcome::Skip;
            }
            outcome(&group, platform.permission_group(&group))
        })
    });

    evict_when_gone(&node, evictor);
    node
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::Harness;
    use permctl_core::{PackageChange, PlatformEvent};
    use permctl_platform::{names, LightPackageInfo, LightPermInfo, ProtectionLevel};

    #[test]
    fn test_platform_group() {
        let harness = Harness::new();
        let node = build(&harness.env, &PermGroupKey(names::GROUP_CAMERA.into()), Evictor::detached());
        let group = harness.settle(&node).unwrap();
        assert!(group.contains(names::CAMERA));
    }

    #[test]
    fn test_custom_group_appears_with_its_package() {
        let harness = Harness::new();
        let node = build(&harness.env, &PermGroupKey("com.example.group.SYNC".into()), Evictor::detached());
        assert!(harness.settle(&node).is_none());

        harness.fake.install(LightPackageInfo::new("com.example", 10_001).with_declared(LightPermInfo {
            name: "com.example.permission.SYNC".into(),
            package_name: "com.example".into(),
            group: Some("com.example.group.SYNC".into()),
            background_permission: None,
            protection: ProtectionLevel::Dangerous,
            protection_flags: Default::default(),
        }));
        harness.env.hubs.route(&PlatformEvent::Package {
            change: PackageChange::Added,
            package: "com.example".into(),
            uid: 10_001,
        });

        assert!(harness.wait(|| node.value().is_some()));
        assert!(node.value().unwrap().contains("com.example.permission.SYNC"));
    }
}
