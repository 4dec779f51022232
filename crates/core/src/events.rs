//! Event System
//!
//! Platform change events and the pub/sub bus that carries them from the
//! platform side into the controller.

use parking_lot::RwLock;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;
use tracing::debug;

use crate::ids::{Uid, UserId};

/// What happened to a package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageChange {
    Added,
    Changed,
    Replaced,
    Removed,
}

/// Change events emitted by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    /// A package was installed, updated, replaced or removed
    Package { change: PackageChange, package: String, uid: Uid },
    /// Permission state of some package with this uid changed
    PermissionsChanged { uid: Uid },
    /// Mode of an app-op changed for a package
    AppOpChanged { op: String, uid: Uid, package: String },
    /// An app-op started or stopped being actively used
    AppOpActive { op: String, uid: Uid, package: String, active: bool },
    /// A user profile was created
    UserAdded { user: UserId },
    /// A user profile was removed
    UserRemoved { user: UserId },
    /// Stops the controller's event pump
    Shutdown,
}

impl PlatformEvent {
    /// Package name carried by the event, if any
    pub fn package(&self) -> Option<&str> {
        match self {
            PlatformEvent::Package { package, .. }
            | PlatformEvent::AppOpChanged { package, .. }
            | PlatformEvent::AppOpActive { package, .. } => Some(package),
            _ => None,
        }
    }
}

/// Subscriber handle for receiving events
#[derive(Clone)]
pub struct EventSubscription {
    receiver: Receiver<PlatformEvent>,
}

impl EventSubscription {
    /// Receive the next event (blocking)
    pub fn recv(&self) -> Result<PlatformEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Receive the next event, giving up after `timeout`
    pub fn recv_timeout(&self, timeout: Duration) -> Result<PlatformEvent, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Try to receive an event (non-blocking)
    pub fn try_recv(&self) -> Result<PlatformEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }
}

/// Event bus for publish/subscribe pattern
pub struct EventBus {
    subscribers: RwLock<Vec<Sender<PlatformEvent>>>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> EventSubscription {
        let (sender, receiver) = unbounded();
        self.subscribers.write().push(sender);
        EventSubscription { receiver }
    }

    /// Emit an event to all subscribers
    ///
    /// Subscribers whose receiving side has been dropped are pruned.
    pub fn emit(&self, event: PlatformEvent) -> usize {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|sender| sender.send(event.clone()).is_ok());
        let delivered = subscribers.len();

        debug!("Event {:?} delivered to {} subscribers", event, delivered);
        delivered
    }

    /// Get the number of subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
