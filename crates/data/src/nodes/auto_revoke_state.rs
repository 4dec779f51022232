//! Auto-revoke State Node

use std::sync::Arc;

use indexmap::IndexMap;
use permctl_platform::{names, AppOpMode};
use permctl_reactive::{AsyncReactiveValue, Evictor, LoadOutcome, ObservableCache, SourceSet};
use tracing::{debug, warn};

use super::{evict_when_gone, job, NodeEnv, PackageInfoNode, PermStateNode};
use crate::hubs::updater;
use crate::keys::{AppPermGroupKey, PackageKey};
use crate::model::{AutoRevokeState, PermStates};
use crate::rules;

/// Whether and what auto-revoke may take away from one package.
///
/// Holds one permission-state source per requested runtime group, kept in
/// step with the package's requested permissions.
pub type AutoRevokeStateNode = AsyncReactiveValue<AutoRevokeState>;

pub fn build(
    env: &Arc<NodeEnv>,
    key: &PackageKey,
    evictor: Evictor,
    package: PackageInfoNode,
    perm_states: ObservableCache<AppPermGroupKey, PermStateNode>,
) -> AutoRevokeStateNode {
    let node: AutoRevokeStateNode = AsyncReactiveValue::new(&env.ctx, &env.pool, format!("AutoRevokeState({})", key));
    let id = node.value_node().node_id();
    let held: Arc<SourceSet<AppPermGroupKey, PermStateNode>> = Arc::new(SourceSet::new());

    let tracked = Arc::clone(&held);
    let package_source = package.clone();
    let user = key.user;
    node.add_source_with(&package, move |node| {
        let desired: Vec<AppPermGroupKey> = package_source
            .value()
            .map(|info| {
                rules::requested_runtime_groups(&info)
                    .into_iter()
                    .map(|group| AppPermGroupKey::new(info.package_name.clone(), group, user))
                    .collect()
            })
            .unwrap_or_default();
        node.set_sources_to_difference(desired, &tracked, |key| perm_states.get(key), None);
        node.update();
    });

    let app_ops = Arc::clone(&env.hubs.app_ops);
    let listener = updater(node.value_node());
    let watched = key.package.clone();
    node.on_active(move |_| {
        app_ops.add_listener(names::OP_AUTO_REVOKE_PERMISSIONS_IF_UNUSED, &watched, id, Arc::clone(&listener))
    });
    let app_ops = Arc::clone(&env.hubs.app_ops);
    let watched = key.package.clone();
    node.on_inactive(move |_| {
        app_ops.remove_listener(names::OP_AUTO_REVOKE_PERMISSIONS_IF_UNUSED, &watched, id)
    });

    let platform = Arc::clone(&env.platform);
    let config = env.config.auto_revoke.clone();
    node.on_prepare(move |value| {
        if !package.is_initialized() {
            return None;
        }
        let Some(info) = package.value() else {
            value.set(None);
            return None;
        };

        let mut groups: IndexMap<String, PermStates> = IndexMap::new();
        for group in rules::requested_runtime_groups(&info) {
            let key = AppPermGroupKey::new(info.package_name.clone(), group.clone(), user);
            let states = held.get(&key)?;
            if !states.is_initialized() {
                return None;
            }
            if let Some(states) = states.value() {
                groups.insert(group, (*states).clone());
            }
        }

        let platform = Arc::clone(&platform);
        let config = config.clone();
        job(move |token| {
            if token.is_cancelled() {
                return LoadOutcome::Skip;
            }
            let op = names::OP_AUTO_REVOKE_PERMISSIONS_IF_UNUSED;
            let mode = match platform.check_op(op, info.uid, &info.package_name) {
                Ok(mode) => mode,
                Err(e) if e.is_recoverable() => {
                    debug!("{} unavailable for {}: {}", op, info.package_name, e);
                    AppOpMode::Default
                }
                Err(e) if e.is_not_found() => return LoadOutcome::NotFound,
                Err(e) => {
                    warn!("Checking {} for {} failed: {}", op, info.package_name, e);
                    return LoadOutcome::Skip;
                }
            };
            LoadOutcome::Value(Some(rules::auto_revoke_state(&config, &info, mode, &groups)))
        })
    });

    evict_when_gone(&node, evictor);
    node
}
