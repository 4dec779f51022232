//! User Packages Node

use std::sync::Arc;

use permctl_platform::LightPackageInfo;
use permctl_reactive::{AsyncReactiveValue, Evictor, LoadOutcome};

use super::{evict_when_gone, job, outcome, NodeEnv};
use crate::hubs::updater;
use crate::keys::UserKey;

/// Installed packages of one user
pub type UserPackagesNode = AsyncReactiveValue<Vec<LightPackageInfo>>;

pub fn build(env: &Arc<NodeEnv>, key: &UserKey, evictor: Evictor) -> UserPackagesNode {
    let user = key.0;
    let node: UserPackagesNode = AsyncReactiveValue::new(&env.ctx, &env.pool, format!("UserPackages({})", user));
    let id = node.value_node().node_id();

    let packages = Arc::clone(&env.hubs.packages);
    let listener = updater(node.value_node());
    node.on_active(move |_| packages.add_catch_all(id, Arc::clone(&listener)));
    let packages = Arc::clone(&env.hubs.packages);
    node.on_inactive(move |_| packages.remove_catch_all(id));

    let platform = Arc::clone(&env.platform);
    node.on_prepare(move |_| {
        let platform = Arc::clone(&platform);
        job(move |token| {
            if token.is_cancelled() {
                return LoadOutcome::Skip;
            }
            outcome(&user, platform.installed_packages(user))
        })
    });

    evict_when_gone(&node, evictor);
    node
}
