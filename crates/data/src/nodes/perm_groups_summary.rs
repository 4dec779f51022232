//! Group Summary Node
//!
//! Per-group counts of shown and granted apps across the device, kept up
//! to date through one UI info source per app and group.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use permctl_reactive::{KeyedReaction, ObservableCache, ReactiveValue, SourceSet};

use super::{AppPermGroupUiInfoNode, NodeEnv, PermGroupsPackagesNode};
use crate::keys::AppPermGroupKey;
use crate::model::{AppPermGroupUiInfo, PermGroupUiSummary, PermGroupsUiSummary};

/// Shown and granted app counts per group.
///
/// Fans out to one UI-info source per (package, group) pair. Each edge
/// records its own latest value, so a single app changing does not rescan
/// every source.
pub type PermGroupsUiSummaryNode = ReactiveValue<PermGroupsUiSummary>;

type Latest = Mutex<HashMap<AppPermGroupKey, Option<Arc<AppPermGroupUiInfo>>>>;

pub fn build(
    env: &Arc<NodeEnv>,
    groups_packages: PermGroupsPackagesNode,
    ui_infos: ObservableCache<AppPermGroupKey, AppPermGroupUiInfoNode>,
) -> PermGroupsUiSummaryNode {
    let node: PermGroupsUiSummaryNode = ReactiveValue::new(&env.ctx, "PermGroupsUiSummary");
    let held: Arc<SourceSet<AppPermGroupKey, AppPermGroupUiInfoNode>> = Arc::new(SourceSet::new());
    let latest: Arc<Latest> = Arc::new(Mutex::new(HashMap::new()));

    let reaction: KeyedReaction<PermGroupsUiSummary, AppPermGroupKey> = {
        let held = Arc::clone(&held);
        let latest = Arc::clone(&latest);
        Arc::new(move |node: &ReactiveValue<PermGroupsUiSummary>, key: &AppPermGroupKey| {
            if let Some(source) = held.get(key) {
                if source.is_initialized() {
                    latest.lock().insert(key.clone(), source.value());
                }
            }
            node.update();
        })
    };

    let tracked = Arc::clone(&held);
    let pruned = Arc::clone(&latest);
    let index = groups_packages.clone();
    node.add_source_with(&groups_packages, move |node| {
        let desired: HashSet<AppPermGroupKey> = index
            .value()
            .map(|index| {
                index
                    .groups
                    .iter()
                    .flat_map(|(group, packages)| {
                        packages
                            .iter()
                            .map(move |p| AppPermGroupKey::new(p.package.clone(), group.clone(), p.user))
                    })
                    .collect()
            })
            .unwrap_or_default();
        pruned.lock().retain(|key, _| desired.contains(key));
        node.set_sources_to_difference(
            desired,
            &tracked,
            |key| ui_infos.get(key),
            Some(Arc::clone(&reaction)),
        );
        node.update();
    });

    node.on_update(move |node| {
        if !groups_packages.is_initialized() {
            return;
        }
        let Some(index) = groups_packages.value() else {
            node.set(None);
            return;
        };

        let latest = latest.lock();
        let mut groups = IndexMap::new();
        for (group, packages) in &index.groups {
            let mut summary = PermGroupUiSummary::default();
            for package in packages {
                let key = AppPermGroupKey::new(package.package.clone(), group.clone(), package.user);
                let Some(info) = latest.get(&key) else {
                    return;
                };
                let Some(info) = info else { continue };
                if info.should_show {
                    summary.shown += 1;
                    if info.grant_state.is_granted() {
                        summary.granted += 1;
                    }
                }
            }
            groups.insert(group.clone(), summary);
        }
        drop(latest);
        node.set(Some(PermGroupsUiSummary { groups }));
    });
    node
}
