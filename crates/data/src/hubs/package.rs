//! Package change hub
//!
//! Install, update and removal broadcasts keyed by package name.

use std::sync::Arc;

use parking_lot::Mutex;
use permctl_core::PackageChange;
use permctl_platform::Platform;
use permctl_reactive::NodeId;
use tracing::{debug, trace};

use super::{dedupe, ChangeListener, Registry};

/// Package broadcast multiplexer.
///
/// Listeners either watch one package name or every package. A change is
/// delivered to catch-all listeners first, then to the listeners of that
/// package unless the package was just added.
pub struct PackageChangeHub {
    platform: Arc<dyn Platform>,
    registry: Mutex<Registry<String>>,
}

impl PackageChangeHub {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            registry: Mutex::new(Registry::new()),
        }
    }

    pub fn add_listener(&self, package: &str, id: NodeId, listener: ChangeListener) {
        self.change(|registry| registry.insert(package.to_string(), id, listener));
    }

    pub fn remove_listener(&self, package: &str, id: NodeId) {
        self.change(|registry| {
            registry.remove(&package.to_string(), id);
        });
    }

    pub fn add_catch_all(&self, id: NodeId, listener: ChangeListener) {
        self.change(|registry| registry.insert_catch_all(id, listener));
    }

    pub fn remove_catch_all(&self, id: NodeId) {
        self.change(|registry| {
            registry.remove_catch_all(id);
        });
    }

    fn change(&self, f: impl FnOnce(&mut Registry<String>)) {
        let (before, after) = {
            let mut registry = self.registry.lock();
            let before = registry.len();
            f(&mut registry);
            (before, registry.len())
        };
        if before == 0 && after > 0 {
            debug!("Registering package receiver");
            self.platform.register_package_receiver();
        } else if before > 0 && after == 0 {
            debug!("Unregistering package receiver");
            self.platform.unregister_package_receiver();
        }
    }

    pub fn on_package_changed(&self, change: PackageChange, package: &str) {
        let pass = {
            let registry = self.registry.lock();
            let key = package.to_string();
            let per_package = registry
                .for_key(&key)
                .filter(|_| change != PackageChange::Added);
            dedupe(registry.catch_all().chain(per_package))
        };
        trace!("{:?} {} -> {} listeners", change, package, pass.len());
        for listener in pass {
            listener();
        }
    }

    pub fn listener_count(&self) -> usize {
        self.registry.lock().len()
    }
}
