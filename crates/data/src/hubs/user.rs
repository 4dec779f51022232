//! User change hub

use std::sync::Arc;

use parking_lot::Mutex;
use permctl_platform::Platform;
use permctl_reactive::NodeId;
use tracing::debug;

use super::{dedupe, ChangeListener, Registry};

/// User add/remove multiplexer
pub struct UserChangeHub {
    platform: Arc<dyn Platform>,
    registry: Mutex<Registry<()>>,
}

impl UserChangeHub {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            registry: Mutex::new(Registry::new()),
        }
    }

    pub fn add_listener(&self, id: NodeId, listener: ChangeListener) {
        let first = {
            let mut registry = self.registry.lock();
            let before = registry.len();
            registry.insert_catch_all(id, listener);
            before == 0
        };
        if first {
            debug!("Registering user receiver");
            self.platform.register_user_receiver();
        }
    }

    pub fn remove_listener(&self, id: NodeId) {
        let last = {
            let mut registry = self.registry.lock();
            registry.remove_catch_all(id) && registry.len() == 0
        };
        if last {
            debug!("Unregistering user receiver");
            self.platform.unregister_user_receiver();
        }
    }

    pub fn on_users_changed(&self) {
        let pass = dedupe(self.registry.lock().catch_all());
        for listener in pass {
            listener();
        }
    }
}
