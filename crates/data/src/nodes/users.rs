//! Users Node

use std::sync::Arc;

use permctl_core::UserId;
use permctl_reactive::{AsyncReactiveValue, LoadOutcome};

use super::{job, outcome, NodeEnv};
use crate::hubs::updater;

/// Current user profiles
pub type UsersNode = AsyncReactiveValue<Vec<UserId>>;

pub fn build(env: &Arc<NodeEnv>) -> UsersNode {
    let node: UsersNode = AsyncReactiveValue::new(&env.ctx, &env.pool, "Users");
    let id = node.value_node().node_id();

    let users = Arc::clone(&env.hubs.users);
    let listener = updater(node.value_node());
    node.on_active(move |_| users.add_listener(id, Arc::clone(&listener)));
    let users = Arc::clone(&env.hubs.users);
    node.on_inactive(move |_| users.remove_listener(id));

    let platform = Arc::clone(&env.platform);
    node.on_prepare(move |_| {
        let platform = Arc::clone(&platform);
        job(move |token| {
            if token.is_cancelled() {
                return LoadOutcome::Skip;
            }
            outcome(&"user profiles", platform.user_profiles())
        })
    });
    node
}
