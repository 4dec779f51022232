//! Permission change hub
//!
//! Grant-state broadcasts arrive per uid; nodes watching a package follow
//! its uid through `UidRegistration`.

use std::sync::Arc;

use parking_lot::Mutex;
use permctl_core::Uid;
use permctl_platform::Platform;
use permctl_reactive::NodeId;
use tracing::{debug, trace};

use super::{dedupe, ChangeListener, Registry};

/// Permission-change multiplexer keyed by uid
pub struct PermissionChangeHub {
    platform: Arc<dyn Platform>,
    registry: Mutex<Registry<Uid>>,
}

impl PermissionChangeHub {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            registry: Mutex::new(Registry::new()),
        }
    }

    pub fn add_listener(&self, uid: Uid, id: NodeId, listener: ChangeListener) {
        self.change(|registry| registry.insert(uid, id, listener));
    }

    pub fn remove_listener(&self, uid: Uid, id: NodeId) {
        self.change(|registry| {
            registry.remove(&uid, id);
        });
    }

    /// Move a registration from `old` to `new` in one step.
    ///
    /// The listener is never registered on both uids at once, and the OS
    /// registration stays up throughout.
    pub fn add_or_replace(&self, old: Option<Uid>, new: Uid, id: NodeId, listener: ChangeListener) {
        self.change(|registry| {
            if let Some(old) = old.filter(|old| *old != new) {
                registry.remove(&old, id);
            }
            registry.insert(new, id, listener);
        });
    }

    fn change(&self, f: impl FnOnce(&mut Registry<Uid>)) {
        let (before, after) = {
            let mut registry = self.registry.lock();
            let before = registry.len();
            f(&mut registry);
            (before, registry.len())
        };
        if before == 0 && after > 0 {
            debug!("Registering permission listener");
            self.platform.register_permission_listener();
        } else if before > 0 && after == 0 {
            debug!("Unregistering permission listener");
            self.platform.unregister_permission_listener();
        }
    }

    pub fn on_permissions_changed(&self, uid: Uid) {
        let pass = dedupe(self.registry.lock().for_key(&uid));
        trace!("Permissions of uid {} changed -> {} listeners", uid, pass.len());
        for listener in pass {
            listener();
        }
    }

    /// Nodes registered on `uid`
    pub fn listeners_for(&self, uid: Uid) -> usize {
        self.registry.lock().key_len(&uid)
    }

    pub fn listener_count(&self) -> usize {
        self.registry.lock().len()
    }
}

/// Keeps one node registered on the uid it currently tracks, while active
pub struct UidRegistration {
    hub: Arc<PermissionChangeHub>,
    id: NodeId,
    listener: ChangeListener,
    state: Mutex<UidState>,
}

#[derive(Default)]
struct UidState {
    uid: Option<Uid>,
    active: bool,
}

impl UidRegistration {
    pub fn new(hub: &Arc<PermissionChangeHub>, id: NodeId, listener: ChangeListener) -> Self {
        Self {
            hub: Arc::clone(hub),
            id,
            listener,
            state: Mutex::new(UidState::default()),
        }
    }

    pub fn uid(&self) -> Option<Uid> {
        self.state.lock().uid
    }

    pub fn activate(&self) {
        let uid = {
            let mut state = self.state.lock();
            state.active = true;
            state.uid
        };
        if let Some(uid) = uid {
            self.hub.add_listener(uid, self.id, Arc::clone(&self.listener));
        }
    }

    pub fn deactivate(&self) {
        let uid = {
            let mut state = self.state.lock();
            state.active = false;
            state.uid
        };
        if let Some(uid) = uid {
            self.hub.remove_listener(uid, self.id);
        }
    }

    /// Follow the uid of the latest snapshot
    pub fn track(&self, uid: Option<Uid>) {
        let (old, active) = {
            let mut state = self.state.lock();
            if state.uid == uid {
                return;
            }
            (std::mem::replace(&mut state.uid, uid), state.active)
        };
        if !active {
            return;
        }
        match uid {
            Some(new) => {
                debug!("Node {} moves from uid {:?} to {}", self.id, old, new);
                self.hub.add_or_replace(old, new, self.id, Arc::clone(&self.listener));
            }
            None => {
                if let Some(old) = old {
                    self.hub.remove_listener(old, self.id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use permctl_core::EventBus;
    use permctl_platform::FakePlatform;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn hub() -> (Arc<FakePlatform>, Arc<PermissionChangeHub>) {
        let fake = Arc::new(FakePlatform::new(Arc::new(EventBus::new())));
        let platform: Arc<dyn Platform> = fake.clone();
        (fake, Arc::new(PermissionChangeHub::new(platform)))
    }

    #[test]
    fn test_delivery_by_uid() {
        let (_, hub) = hub();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        hub.add_listener(10_001, 1, Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        hub.on_permissions_changed(10_002);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        hub.on_permissions_changed(10_001);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_add_or_replace_moves_without_reregistering() {
        let (fake, hub) = hub();
        let noop: ChangeListener = Arc::new(|| {});
        hub.add_listener(10_001, 1, Arc::clone(&noop));
        assert_eq!(fake.permission_listener_registrations(), 1);

        hub.add_or_replace(Some(10_001), 10_002, 1, noop);
        assert_eq!(hub.listeners_for(10_001), 0);
        assert_eq!(hub.listeners_for(10_002), 1);
        assert_eq!(hub.listener_count(), 1);
        assert_eq!(fake.permission_listener_registrations(), 1);
        assert_eq!(fake.register_calls(), 1);
    }

    #[test]
    fn test_uid_registration_follows_activity() {
        let (fake, hub) = hub();
        let registration = UidRegistration::new(&hub, 9, Arc::new(|| {}));

        registration.track(Some(10_001));
        assert_eq!(hub.listener_count(), 0);

        registration.activate();
        assert_eq!(hub.listeners_for(10_001), 1);

        registration.track(Some(10_002));
        assert_eq!(hub.listeners_for(10_001), 0);
        assert_eq!(hub.listeners_for(10_002), 1);

        registration.deactivate();
        assert_eq!(hub.listener_count(), 0);
        assert_eq!(fake.permission_listener_registrations(), 0);
        assert_eq!(registration.uid(), Some(10_002));
    }
}
