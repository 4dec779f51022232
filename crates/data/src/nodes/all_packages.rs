//! All Packages Node
//!
//! Installed packages of every user, merged from one per-user source each.

use std::collections::BTreeMap;
use std::sync::Arc;

use permctl_reactive::{ObservableCache, ReactiveValue, SourceSet};

use super::{NodeEnv, UserPackagesNode, UsersNode};
use crate::keys::UserKey;
use crate::model::AllPackages;

/// Installed packages of every user, one source per user
pub type AllPackagesNode = ReactiveValue<AllPackages>;

pub fn build(
    env: &Arc<NodeEnv>,
    users: UsersNode,
    user_packages: ObservableCache<UserKey, UserPackagesNode>,
) -> AllPackagesNode {
    let node: AllPackagesNode = ReactiveValue::new(&env.ctx, "AllPackages");
    let held: Arc<SourceSet<UserKey, UserPackagesNode>> = Arc::new(SourceSet::new());

    let tracked = Arc::clone(&held);
    let users_source = users.clone();
    node.add_source_with(&users, move |node| {
        let desired: Vec<UserKey> = users_source
            .value()
            .map(|users| users.iter().copied().map(UserKey).collect())
            .unwrap_or_default();
        node.set_sources_to_difference(desired, &tracked, |key| user_packages.get(key), None);
        node.update();
    });

    node.on_update(move |node| {
        if !users.is_initialized() {
            return;
        }
        let Some(users) = users.value() else {
            node.set(None);
            return;
        };
        let mut by_user = BTreeMap::new();
        for user in users.iter() {
            let Some(packages) = held.get(&UserKey(*user)) else {
                return;
            };
            if !packages.is_initialized() {
                return;
            }
            if let Some(packages) = packages.value() {
                by_user.insert(*user, (*packages).clone());
            }
        }
        node.set(Some(AllPackages { by_user }));
    });
    node
}
