//! App-op change hub
//!
//! Listeners watch an op either for one package or for every package. The
//! OS-level registration is per op and lives while any listener of that op,
//! scoped or not, is registered.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use permctl_platform::Platform;
use permctl_reactive::NodeId;
use tracing::{debug, trace};

use super::{dedupe, ChangeListener, Registry};

struct OpListeners {
    by_package: Registry<(String, String)>,
    any_package: Registry<String>,
    watchers: HashMap<String, usize>,
}

impl OpListeners {
    fn len(&self) -> usize {
        self.by_package.len() + self.any_package.len()
    }

    /// Apply `change` and return the op's new watcher count, or `None` when nothing changed
    fn track(&mut self, op: &str, change: impl FnOnce(&mut Self)) -> Option<usize> {
        let before = self.len();
        change(self);
        let after = self.len();
        if after == before {
            return None;
        }
        let count = self.watchers.entry(op.to_string()).or_insert(0);
        if after > before {
            *count += 1;
        } else {
            *count = count.saturating_sub(1);
        }
        let count = *count;
        if count == 0 {
            self.watchers.remove(op);
        }
        Some(count)
    }
}

/// App-op change multiplexer, one OS registration per watched op
pub struct AppOpChangeHub {
    platform: Arc<dyn Platform>,
    listeners: Mutex<OpListeners>,
}

impl AppOpChangeHub {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            listeners: Mutex::new(OpListeners {
                by_package: Registry::new(),
                any_package: Registry::new(),
                watchers: HashMap::new(),
            }),
        }
    }

    /// Listen to `op` changes of one package
    pub fn add_listener(&self, op: &str, package: &str, id: NodeId, listener: ChangeListener) {
        let key = (op.to_string(), package.to_string());
        let count = self.listeners.lock().track(op, |l| l.by_package.insert(key, id, listener));
        self.registered(op, count);
    }

    pub fn remove_listener(&self, op: &str, package: &str, id: NodeId) {
        let key = (op.to_string(), package.to_string());
        let count = self.listeners.lock().track(op, |l| {
            l.by_package.remove(&key, id);
        });
        self.unregistered(op, count);
    }

    /// Listen to `op` changes of every package
    pub fn add_op_listener(&self, op: &str, id: NodeId, listener: ChangeListener) {
        let count = self
            .listeners
            .lock()
            .track(op, |l| l.any_package.insert(op.to_string(), id, listener));
        self.registered(op, count);
    }

    pub fn remove_op_listener(&self, op: &str, id: NodeId) {
        let count = self.listeners.lock().track(op, |l| {
            l.any_package.remove(&op.to_string(), id);
        });
        self.unregistered(op, count);
    }

    fn registered(&self, op: &str, count: Option<usize>) {
        if count == Some(1) {
            debug!("Watching app-op {}", op);
            self.platform.register_app_op_listener(op);
        }
    }

    fn unregistered(&self, op: &str, count: Option<usize>) {
        if count == Some(0) {
            debug!("No longer watching app-op {}", op);
            self.platform.unregister_app_op_listener(op);
        }
    }

    /// Deliver a change of `op` for `package`
    pub fn on_op_changed(&self, op: &str, package: &str) {
        let pass = {
            let listeners = self.listeners.lock();
            let key = (op.to_string(), package.to_string());
            dedupe(
                listeners
                    .any_package
                    .for_key(&op.to_string())
                    .chain(listeners.by_package.for_key(&key)),
            )
        };
        trace!("App-op {} of {} changed -> {} listeners", op, package, pass.len());
        for listener in pass {
            listener();
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}
