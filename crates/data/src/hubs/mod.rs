//! Change hubs
//!
//! Each hub fans one kind of platform event out to the nodes that care,
//! and holds the single OS-level registration for that kind of event while
//! at least one node listens. Nodes register from their `on_active` hook and
//! unregister from `on_inactive`, keyed by their `NodeId`.

mod app_op;
mod package;
mod permission;
mod user;

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::Arc;

use permctl_core::PlatformEvent;
use permctl_platform::Platform;
use permctl_reactive::{NodeId, ReactiveValue};
use tracing::trace;

pub use app_op::AppOpChangeHub;
pub use package::PackageChangeHub;
pub use permission::{PermissionChangeHub, UidRegistration};
pub use user::UserChangeHub;

/// Callback run when a watched entity changed
pub type ChangeListener = Arc<dyn Fn() + Send + Sync>;

/// Listener recomputing `node`, without keeping it alive
pub fn updater<T: Send + Sync + 'static>(node: &ReactiveValue<T>) -> ChangeListener {
    let weak = node.downgrade();
    Arc::new(move || {
        if let Some(node) = weak.upgrade() {
            node.update();
        }
    })
}

/// Listeners by key plus catch-all listeners
pub(crate) struct Registry<K> {
    keyed: HashMap<K, BTreeMap<NodeId, ChangeListener>>,
    catch_all: BTreeMap<NodeId, ChangeListener>,
}

impl<K: Eq + Hash> Registry<K> {
    pub(crate) fn new() -> Self {
        Self {
            keyed: HashMap::new(),
            catch_all: BTreeMap::new(),
        }
    }

    /// Total registrations, counting a node once per key
    pub(crate) fn len(&self) -> usize {
        self.catch_all.len() + self.keyed.values().map(BTreeMap::len).sum::<usize>()
    }

    pub(crate) fn key_len(&self, key: &K) -> usize {
        self.keyed.get(key).map(BTreeMap::len).unwrap_or(0)
    }

    pub(crate) fn insert(&mut self, key: K, id: NodeId, listener: ChangeListener) {
        self.keyed.entry(key).or_default().insert(id, listener);
    }

    pub(crate) fn remove(&mut self, key: &K, id: NodeId) -> bool {
        let Some(listeners) = self.keyed.get_mut(key) else { return false };
        let removed = listeners.remove(&id).is_some();
        if listeners.is_empty() {
            self.keyed.remove(key);
        }
        removed
    }

    pub(crate) fn insert_catch_all(&mut self, id: NodeId, listener: ChangeListener) {
        self.catch_all.insert(id, listener);
    }

    pub(crate) fn remove_catch_all(&mut self, id: NodeId) -> bool {
        self.catch_all.remove(&id).is_some()
    }

    pub(crate) fn catch_all(&self) -> impl Iterator<Item = (NodeId, &ChangeListener)> {
        self.catch_all.iter().map(|(id, l)| (*id, l))
    }

    pub(crate) fn for_key(&self, key: &K) -> impl Iterator<Item = (NodeId, &ChangeListener)> {
        self.keyed
            .get(key)
            .into_iter()
            .flat_map(|listeners| listeners.iter().map(|(id, l)| (*id, l)))
    }
}

/// Collect listeners into one delivery pass, at most once per node
pub(crate) fn dedupe<'a>(
    listeners: impl Iterator<Item = (NodeId, &'a ChangeListener)>,
) -> Vec<ChangeListener> {
    let mut seen = std::collections::HashSet::new();
    listeners
        .filter(|(id, _)| seen.insert(*id))
        .map(|(_, listener)| Arc::clone(listener))
        .collect()
}

/// All hubs of one controller
pub struct ChangeHubs {
    pub packages: Arc<PackageChangeHub>,
    pub permissions: Arc<PermissionChangeHub>,
    pub app_ops: Arc<AppOpChangeHub>,
    pub users: Arc<UserChangeHub>,
}

impl ChangeHubs {
    pub fn new(platform: &Arc<dyn Platform>) -> Self {
        Self {
            packages: Arc::new(PackageChangeHub::new(Arc::clone(platform))),
            permissions: Arc::new(PermissionChangeHub::new(Arc::clone(platform))),
            app_ops: Arc::new(AppOpChangeHub::new(Arc::clone(platform))),
            users: Arc::new(UserChangeHub::new(Arc::clone(platform))),
        }
    }

    /// Deliver one platform event. Main context only.
    pub fn route(&self, event: &PlatformEvent) {
        trace!("Routing {:?}", event);
        match event {
            PlatformEvent::Package { change, package, .. } => {
                self.packages.on_package_changed(*change, package)
            }
            PlatformEvent::PermissionsChanged { uid } => self.permissions.on_permissions_changed(*uid),
            PlatformEvent::AppOpChanged { op, package, .. } | PlatformEvent::AppOpActive { op, package, .. } => {
                self.app_ops.on_op_changed(op, package)
            }
            PlatformEvent::UserAdded { .. } | PlatformEvent::UserRemoved { .. } => {
                self.users.on_users_changed()
            }
            PlatformEvent::Shutdown => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting() -> (Arc<AtomicUsize>, ChangeListener) {
        let count = Arc::new(AtomicUsize::new(0));
        let listener_count = Arc::clone(&count);
        let listener: ChangeListener = Arc::new(move || {
            listener_count.fetch_add(1, Ordering::SeqCst);
        });
        (count, listener)
    }

    #[test]
    fn test_registry_counts() {
        let mut registry: Registry<String> = Registry::new();
        let (_, listener) = counting();
        registry.insert("a".into(), 1, Arc::clone(&listener));
        registry.insert("a".into(), 2, Arc::clone(&listener));
        registry.insert_catch_all(1, listener);
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.key_len(&"a".to_string()), 2);

        assert!(registry.remove(&"a".to_string(), 1));
        assert!(!registry.remove(&"a".to_string(), 1));
        assert!(registry.remove_catch_all(1));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_route_reaches_only_the_changed_entity() {
        use permctl_core::{EventBus, PackageChange};
        use permctl_platform::{names, FakePlatform};

        let platform: Arc<dyn Platform> = Arc::new(FakePlatform::new(Arc::new(EventBus::new())));
        let hubs = ChangeHubs::new(&platform);
        let (package_a, listener) = counting();
        hubs.packages.add_listener("com.a", 1, listener);
        let (package_b, listener) = counting();
        hubs.packages.add_listener("com.b", 2, listener);
        let (uid_a, listener) = counting();
        hubs.permissions.add_listener(10_001, 1, listener);
        let (uid_b, listener) = counting();
        hubs.permissions.add_listener(10_002, 2, listener);
        let (op_a, listener) = counting();
        hubs.app_ops.add_listener(names::OP_CAMERA, "com.a", 1, listener);
        let (op_b, listener) = counting();
        hubs.app_ops.add_listener(names::OP_CAMERA, "com.b", 2, listener);

        hubs.route(&PlatformEvent::Package {
            change: PackageChange::Changed,
            package: "com.a".into(),
            uid: 10_001,
        });
        hubs.route(&PlatformEvent::PermissionsChanged { uid: 10_001 });
        hubs.route(&PlatformEvent::AppOpActive {
            op: names::OP_CAMERA.into(),
            uid: 10_001,
            package: "com.a".into(),
            active: true,
        });

        let load = |count: &Arc<AtomicUsize>| count.load(Ordering::SeqCst);
        assert_eq!((load(&package_a), load(&uid_a), load(&op_a)), (1, 1, 1));
        assert_eq!((load(&package_b), load(&uid_b), load(&op_b)), (0, 0, 0));
    }

    #[test]
    fn test_dedupe_keeps_first() {
        let mut registry: Registry<String> = Registry::new();
        let (count, listener) = counting();
        registry.insert_catch_all(7, Arc::clone(&listener));
        registry.insert("a".into(), 7, listener);

        let pass = dedupe(registry.catch_all().chain(registry.for_key(&"a".to_string())));
        assert_eq!(pass.len(), 1);
        pass.iter().for_each(|l| l());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
