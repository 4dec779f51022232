//! App Permission Group Node
//!
//! Joins package, group and permission state into one group view for an app.

use std::sync::Arc;

use permctl_reactive::ReactiveValue;

use super::{NodeEnv, PackageInfoNode, PermGroupNode, PermStateNode};
use crate::keys::AppPermGroupKey;
use crate::model::LightAppPermGroup;
use crate::rules;

/// One group as one app sees it; `None` when the app requests no member
pub type LightAppPermGroupNode = ReactiveValue<LightAppPermGroup>;

pub fn build(
    env: &Arc<NodeEnv>,
    key: &AppPermGroupKey,
    package: PackageInfoNode,
    group: PermGroupNode,
    states: PermStateNode,
) -> LightAppPermGroupNode {
    let node: LightAppPermGroupNode = ReactiveValue::new(&env.ctx, format!("LightAppPermGroup({})", key));
    node.add_source(&package);
    node.add_source(&group);
    node.add_source(&states);

    node.on_update(move |node| {
        if !package.is_initialized() || !group.is_initialized() || !states.is_initialized() {
            return;
        }
        let value = match (package.value(), group.value(), states.value()) {
            (Some(package), Some(group), Some(states)) => rules::build_app_perm_group(&package, &group, &states),
            _ => None,
        };
        node.set(value);
    });
    node
}
