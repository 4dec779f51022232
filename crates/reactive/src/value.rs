//! Reactive value
//!
//! `ReactiveValue<T>` is an observable holder with explicit
//! initialized/stale/active state and a dependency graph to other values.
//!
//! State machine:
//! - `uninitialized -> initialized+fresh <-> initialized+stale`
//! - orthogonally `active <-> inactive`, driven by observers and plugged
//!   dependents. Losing the last one marks the node stale.
//!
//! Notifications come in two channels. Change notifications go to every
//! observer and dependent when the value changes by the node's equality.
//! Stale-refresh notifications go only to `observe_stale` observers and to
//! dependents that want them, when a stale node recomputes to an unchanged
//! value.
//!
//! All mutation happens on the owning [`MainContext`]. No lock is held while
//! calling out to observers, hooks or other nodes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use permctl_core::{MainContext, PermctlError, Result};
use tracing::{debug, trace};

use crate::graph::{
    next_node_id, AsSource, CacheableNode, Dependent, DependentLink, NodeId, Source, SourceRef,
};

/// Equality predicate deciding whether a new value is a change
pub type Equality<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

type ObserverFn<T> = Arc<dyn Fn(Option<&T>) + Send + Sync>;
type NodeFn<T> = Arc<dyn Fn(&ReactiveValue<T>) + Send + Sync>;

/// Registration handle returned by `observe` and `observe_stale`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverId(u64);

struct Observer<T> {
    callback: ObserverFn<T>,
    seen_version: u64,
}

struct SourceEdge<T> {
    source: SourceRef,
    on_changed: Option<NodeFn<T>>,
}

enum Notify {
    Nothing,
    Changed,
    StaleRefresh,
}

struct State<T> {
    value: Option<Arc<T>>,
    version: u64,
    initialized: bool,
    stale: bool,
    active: bool,
    time_went_inactive: Option<Instant>,
    observers: BTreeMap<ObserverId, Observer<T>>,
    stale_observers: BTreeMap<ObserverId, Observer<T>>,
    dependents: BTreeMap<NodeId, DependentLink>,
    sources: BTreeMap<NodeId, SourceEdge<T>>,
    next_observer: u64,
    propagated_stale_interest: bool,
    batch_depth: u32,
    update_pending: bool,
}

impl<T> State<T> {
    fn has_stale_interest(&self) -> bool {
        !self.stale_observers.is_empty() || self.dependents.values().any(|d| d.wants_stale)
    }

    fn is_unobserved(&self) -> bool {
        self.observers.is_empty() && self.stale_observers.is_empty() && self.dependents.is_empty()
    }

    fn source_refs(&self) -> Vec<SourceRef> {
        self.sources.values().map(|edge| edge.source.clone()).collect()
    }
}

struct Inner<T> {
    id: NodeId,
    label: String,
    ctx: MainContext,
    equality: Equality<T>,
    state: Mutex<State<T>>,
    update: Mutex<Option<NodeFn<T>>>,
    on_active: Mutex<Vec<NodeFn<T>>>,
    on_inactive: Mutex<Vec<NodeFn<T>>>,
    self_ref: Weak<Inner<T>>,
}

/// Handle to one reactive node. Clones share the node.
pub struct ReactiveValue<T> {
    inner: Arc<Inner<T>>,
}

/// Non-owning handle, for hooks and background tasks
pub struct WeakReactiveValue<T> {
    inner: Weak<Inner<T>>,
}

impl<T> Clone for ReactiveValue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Clone for WeakReactiveValue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> WeakReactiveValue<T> {
    pub fn upgrade(&self) -> Option<ReactiveValue<T>> {
        self.inner.upgrade().map(|inner| ReactiveValue { inner })
    }
}

impl<T: PartialEq + Send + Sync + 'static> ReactiveValue<T> {
    /// Create a node using structural equality
    pub fn new(ctx: &MainContext, label: impl Into<String>) -> Self {
        Self::with_equality(ctx, label, |a: &T, b: &T| a == b)
    }
}

impl<T: Send + Sync + 'static> ReactiveValue<T> {
    /// Create a node with a custom equality predicate
    pub fn with_equality<E>(ctx: &MainContext, label: impl Into<String>, equality: E) -> Self
    where
        E: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        let inner = Arc::new_cyclic(|self_ref| Inner {
            id: next_node_id(),
            label: label.into(),
            ctx: ctx.clone(),
            equality: Arc::new(equality),
            state: Mutex::new(State {
                value: None,
                version: 0,
                initialized: false,
                stale: true,
                active: false,
                time_went_inactive: Some(Instant::now()),
                observers: BTreeMap::new(),
                stale_observers: BTreeMap::new(),
                dependents: BTreeMap::new(),
                sources: BTreeMap::new(),
                next_observer: 1,
                propagated_stale_interest: false,
                batch_depth: 0,
                update_pending: false,
            }),
            update: Mutex::new(None),
            on_active: Mutex::new(Vec::new()),
            on_inactive: Mutex::new(Vec::new()),
            self_ref: self_ref.clone(),
        });
        Self { inner }
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn context(&self) -> &MainContext {
        &self.inner.ctx
    }

    pub fn downgrade(&self) -> WeakReactiveValue<T> {
        WeakReactiveValue {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Whether two handles point at the same node
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Last published value; `None` is either "no data" or "never set"
    pub fn value(&self) -> Option<Arc<T>> {
        self.inner.state.lock().value.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.state.lock().initialized
    }

    pub fn is_stale(&self) -> bool {
        self.inner.state.lock().stale
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.lock().active
    }

    pub fn time_went_inactive(&self) -> Option<Instant> {
        self.inner.state.lock().time_went_inactive
    }

    pub fn observer_count(&self) -> usize {
        let st = self.inner.state.lock();
        st.observers.len() + st.stale_observers.len()
    }

    pub fn dependent_count(&self) -> usize {
        self.inner.state.lock().dependents.len()
    }

    pub fn source_count(&self) -> usize {
        self.inner.state.lock().sources.len()
    }

    /// Whether a stale-refresh observer exists here or downstream
    pub fn has_stale_interest(&self) -> bool {
        self.inner.state.lock().has_stale_interest()
    }

    /// Install the recompute routine run by [`update`](Self::update)
    pub fn on_update<F>(&self, update: F)
    where
        F: Fn(&ReactiveValue<T>) + Send + Sync + 'static,
    {
        *self.inner.update.lock() = Some(Arc::new(update));
    }

    /// Run a hook each time the node becomes active
    pub fn on_active<F>(&self, hook: F)
    where
        F: Fn(&ReactiveValue<T>) + Send + Sync + 'static,
    {
        self.inner.on_active.lock().push(Arc::new(hook));
    }

    /// Run a hook each time the node becomes inactive
    pub fn on_inactive<F>(&self, hook: F)
    where
        F: Fn(&ReactiveValue<T>) + Send + Sync + 'static,
    {
        self.inner.on_inactive.lock().push(Arc::new(hook));
    }

    /// Recompute from the current source values
    pub fn update(&self) {
        self.inner.ctx.assert_main();
        {
            let mut st = self.inner.state.lock();
            if st.batch_depth > 0 {
                st.update_pending = true;
                return;
            }
        }
        let update = self.inner.update.lock().clone();
        if let Some(update) = update {
            update(self);
        }
    }

    /// Defer recomputes requested inside `f` into a single one afterwards
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.state.lock().batch_depth += 1;
        let result = f();
        let run = {
            let mut st = self.inner.state.lock();
            st.batch_depth -= 1;
            st.batch_depth == 0 && std::mem::take(&mut st.update_pending)
        };
        if run {
            self.update();
        }
        result
    }

    /// Publish a new value
    ///
    /// The first set always notifies, even for `None`. Later sets notify only
    /// when the value changed; an unchanged value on a stale node notifies the
    /// stale-refresh channel instead.
    pub fn set(&self, value: Option<T>) {
        self.inner.ctx.assert_main();
        let value = value.map(Arc::new);
        let notify = {
            let mut st = self.inner.state.lock();
            if !st.initialized {
                st.initialized = true;
                st.stale = false;
                st.value = value;
                st.version += 1;
                Notify::Changed
            } else if !self.same_value(&st.value, &value) {
                st.stale = false;
                st.value = value;
                st.version += 1;
                Notify::Changed
            } else if st.stale {
                st.stale = false;
                Notify::StaleRefresh
            } else {
                Notify::Nothing
            }
        };
        match notify {
            Notify::Changed => self.dispatch_changed(),
            Notify::StaleRefresh => self.dispatch_stale_refresh(),
            Notify::Nothing => trace!("{} unchanged", self.inner.label),
        }
    }

    /// Hand a value over from any thread; it is applied on the main context
    pub fn post_value(&self, value: Option<T>) -> Result<()> {
        let node = self.clone();
        self.inner.ctx.post(move || node.set(value))
    }

    /// Force the next recompute to notify, even with an unchanged value
    pub fn mark_stale(&self) {
        self.inner.ctx.assert_main();
        self.inner.state.lock().stale = true;
    }

    fn same_value(&self, old: &Option<Arc<T>>, new: &Option<Arc<T>>) -> bool {
        match (old, new) {
            (None, None) => true,
            (Some(a), Some(b)) => (self.inner.equality)(a, b),
            _ => false,
        }
    }

    /// Register a change observer
    pub fn observe<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(Option<&T>) + Send + Sync + 'static,
    {
        self.add_observer(Arc::new(callback), false)
    }

    /// Register an observer that also hears stale refreshes
    pub fn observe_stale<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(Option<&T>) + Send + Sync + 'static,
    {
        self.add_observer(Arc::new(callback), true)
    }

    fn add_observer(&self, callback: ObserverFn<T>, stale_channel: bool) -> ObserverId {
        self.inner.ctx.assert_main();
        let (id, activate) = {
            let mut st = self.inner.state.lock();
            let id = ObserverId(st.next_observer);
            st.next_observer += 1;
            let observer = Observer {
                callback,
                seen_version: 0,
            };
            if stale_channel {
                st.stale_observers.insert(id, observer);
            } else {
                st.observers.insert(id, observer);
            }
            (id, !st.active)
        };
        if stale_channel {
            self.refresh_stale_interest();
        }
        if activate {
            self.activate();
        }
        self.catch_up_observer(id);
        id
    }

    /// Remove an observer. Returns false for unknown ids.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.inner.ctx.assert_main();
        let (removed, was_stale_channel, deactivate) = {
            let mut st = self.inner.state.lock();
            let (removed, stale_channel) = if st.observers.remove(&id).is_some() {
                (true, false)
            } else {
                (st.stale_observers.remove(&id).is_some(), true)
            };
            (removed, removed && stale_channel, removed && st.active && st.is_unobserved())
        };
        if was_stale_channel {
            self.refresh_stale_interest();
        }
        if deactivate {
            self.deactivate();
        }
        removed
    }

    /// Depend on `source`, recomputing through `update` when it changes
    pub fn add_source<S: AsSource + ?Sized>(&self, source: &S) {
        self.insert_source(source.as_source(), None);
    }

    /// Depend on `source` with a dedicated reaction instead of `update`
    pub fn add_source_with<S, F>(&self, source: &S, on_changed: F)
    where
        S: AsSource + ?Sized,
        F: Fn(&ReactiveValue<T>) + Send + Sync + 'static,
    {
        self.insert_source(source.as_source(), Some(Arc::new(on_changed)));
    }

    fn insert_source(&self, source: SourceRef, on_changed: Option<NodeFn<T>>) {
        let plug = {
            let mut st = self.inner.state.lock();
            if st.sources.contains_key(&source.node_id()) {
                return;
            }
            st.sources.insert(
                source.node_id(),
                SourceEdge {
                    source: source.clone(),
                    on_changed,
                },
            );
            st.active.then(|| st.has_stale_interest())
        };
        if let Some(wants_stale) = plug {
            self.inner.ctx.assert_main();
            source.source().plug(self.link(wants_stale));
        }
    }

    /// Stop depending on a source. Safe to call from inside notifications.
    pub fn remove_source(&self, source: NodeId) -> bool {
        let removed = {
            let mut st = self.inner.state.lock();
            st.sources
                .remove(&source)
                .map(|edge| (edge.source, st.active))
        };
        match removed {
            Some((source_ref, active)) => {
                if active {
                    self.inner.ctx.assert_main();
                    source_ref.source().unplug(self.inner.id);
                }
                true
            }
            None => false,
        }
    }

    /// Resolve with the first value matching the request.
    ///
    /// Returns at once when initialized (and fresh unless `stale_ok`) and no
    /// update is forced. Must not be awaited on the main context itself.
    pub async fn get_initialized_value(
        &self,
        stale_ok: bool,
        force_update: bool,
    ) -> Result<Option<Arc<T>>> {
        debug_assert!(
            !self.inner.ctx.is_main(),
            "get_initialized_value awaited on the main context"
        );
        let (tx, rx) = tokio::sync::oneshot::channel();
        let node = self.clone();
        self.inner
            .ctx
            .post(move || node.resolve_initialized(stale_ok, force_update, tx))?;
        rx.await.map_err(|_| PermctlError::ContextClosed)
    }

    fn is_ready(&self, stale_ok: bool) -> bool {
        let st = self.inner.state.lock();
        st.initialized && (stale_ok || !st.stale)
    }

    fn resolve_initialized(
        &self,
        stale_ok: bool,
        force_update: bool,
        tx: tokio::sync::oneshot::Sender<Option<Arc<T>>>,
    ) {
        if !force_update && self.is_ready(stale_ok) {
            let _ = tx.send(self.value());
            return;
        }

        let pending = Arc::new(Mutex::new(Some(tx)));
        let registration: Arc<Mutex<Option<ObserverId>>> = Arc::new(Mutex::new(None));
        let armed = Arc::new(AtomicBool::new(!force_update));
        let weak = self.downgrade();
        let (callback_pending, callback_registration, callback_armed) = (
            Arc::clone(&pending),
            Arc::clone(&registration),
            Arc::clone(&armed),
        );
        let id = self.observe_stale(move |_| {
            if !callback_armed.load(Ordering::Acquire) {
                return;
            }
            let Some(node) = weak.upgrade() else { return };
            if !node.is_ready(stale_ok) {
                return;
            }
            if let Some(tx) = callback_pending.lock().take() {
                let _ = tx.send(node.value());
            }
            let registered = callback_registration.lock().take();
            if let Some(id) = registered {
                node.remove_observer(id);
            }
        });

        if force_update {
            self.mark_stale();
            armed.store(true, Ordering::Release);
            self.update();
        }

        if pending.lock().is_none() {
            self.remove_observer(id);
        } else {
            *registration.lock() = Some(id);
        }
    }

    fn link(&self, wants_stale: bool) -> DependentLink {
        let node: Weak<dyn Dependent> = self.inner.self_ref.clone();
        DependentLink {
            id: self.inner.id,
            node,
            wants_stale,
            seen_version: 0,
        }
    }

    fn activate(&self) {
        let (sources, wants_stale) = {
            let mut st = self.inner.state.lock();
            st.active = true;
            st.time_went_inactive = None;
            let wants_stale = st.has_stale_interest();
            st.propagated_stale_interest = wants_stale;
            (st.source_refs(), wants_stale)
        };
        debug!("{} active ({} sources)", self.inner.label, sources.len());

        let hooks = self.inner.on_active.lock().clone();
        for hook in hooks {
            hook(self);
        }
        for source in sources {
            source.source().plug(self.link(wants_stale));
        }

        let needs_update = {
            let st = self.inner.state.lock();
            st.active && st.stale
        };
        if needs_update {
            self.update();
        }
    }

    fn deactivate(&self) {
        let sources = {
            let mut st = self.inner.state.lock();
            st.active = false;
            st.stale = true;
            st.time_went_inactive = Some(Instant::now());
            st.propagated_stale_interest = false;
            st.source_refs()
        };
        debug!("{} inactive", self.inner.label);

        let hooks = self.inner.on_inactive.lock().clone();
        for hook in hooks {
            hook(self);
        }
        for source in sources {
            source.source().unplug(self.inner.id);
        }
    }

    fn refresh_stale_interest(&self) {
        let propagate = {
            let mut st = self.inner.state.lock();
            let interest = st.has_stale_interest();
            if st.active && interest != st.propagated_stale_interest {
                st.propagated_stale_interest = interest;
                Some((interest, st.source_refs()))
            } else {
                None
            }
        };
        if let Some((interest, sources)) = propagate {
            for source in sources {
                source.source().set_wants_stale(self.inner.id, interest);
            }
        }
    }

    fn catch_up_observer(&self, id: ObserverId) {
        let delivery = {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;
            let version = st.version;
            let value = st.value.clone();
            if !st.initialized {
                None
            } else {
                let observer = if st.observers.contains_key(&id) {
                    st.observers.get_mut(&id)
                } else {
                    st.stale_observers.get_mut(&id)
                };
                observer.and_then(|observer| {
                    (observer.seen_version < version).then(|| {
                        observer.seen_version = version;
                        (Arc::clone(&observer.callback), value)
                    })
                })
            }
        };
        if let Some((callback, value)) = delivery {
            callback(value.as_deref());
        }
    }

    fn dispatch_changed(&self) {
        let (value, observers, dependents) = {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;
            let version = st.version;
            let mut observers: Vec<(ObserverId, ObserverFn<T>)> = Vec::new();
            for (id, observer) in st.observers.iter_mut().chain(st.stale_observers.iter_mut()) {
                if observer.seen_version < version {
                    observer.seen_version = version;
                    observers.push((*id, Arc::clone(&observer.callback)));
                }
            }
            observers.sort_by_key(|(id, _)| *id);
            let mut dependents = Vec::new();
            for link in st.dependents.values_mut() {
                if link.seen_version < version {
                    link.seen_version = version;
                    dependents.push(link.node.clone());
                }
            }
            (st.value.clone(), observers, dependents)
        };
        trace!(
            "{} changed: {} observers, {} dependents",
            self.inner.label,
            observers.len(),
            dependents.len()
        );
        for (_, callback) in observers {
            callback(value.as_deref());
        }
        for dependent in dependents {
            if let Some(dependent) = dependent.upgrade() {
                dependent.source_changed(self.inner.id);
            }
        }
    }

    fn dispatch_stale_refresh(&self) {
        let (value, observers, dependents) = {
            let mut st = self.inner.state.lock();
            let version = st.version;
            let observers: Vec<ObserverFn<T>> = st
                .stale_observers
                .values_mut()
                .map(|observer| {
                    observer.seen_version = version;
                    Arc::clone(&observer.callback)
                })
                .collect();
            let dependents: Vec<Weak<dyn Dependent>> = st
                .dependents
                .values()
                .filter(|link| link.wants_stale)
                .map(|link| link.node.clone())
                .collect();
            (st.value.clone(), observers, dependents)
        };
        trace!("{} refreshed without change", self.inner.label);
        for callback in observers {
            callback(value.as_deref());
        }
        for dependent in dependents {
            if let Some(dependent) = dependent.upgrade() {
                if dependent.is_active() {
                    dependent.source_changed(self.inner.id);
                }
            }
        }
    }

    fn plug_dependent(&self, link: DependentLink) {
        self.inner.ctx.assert_main();
        let dependent_id = link.id;
        let wants_stale = link.wants_stale;
        let activate = {
            let mut st = self.inner.state.lock();
            st.dependents.insert(dependent_id, link);
            !st.active
        };
        if wants_stale {
            self.refresh_stale_interest();
        }
        if activate {
            self.activate();
        }

        let delivery = {
            let mut st = self.inner.state.lock();
            let version = st.version;
            let initialized = st.initialized;
            st.dependents.get_mut(&dependent_id).and_then(|link| {
                (initialized && link.seen_version < version).then(|| {
                    link.seen_version = version;
                    link.node.clone()
                })
            })
        };
        if let Some(dependent) = delivery.and_then(|weak| weak.upgrade()) {
            dependent.source_changed(self.inner.id);
        }
    }

    fn unplug_dependent(&self, dependent: NodeId) {
        self.inner.ctx.assert_main();
        let (removed_stale, deactivate) = {
            let mut st = self.inner.state.lock();
            let removed = st.dependents.remove(&dependent);
            let removed_stale = removed.as_ref().map(|l| l.wants_stale).unwrap_or(false);
            (removed_stale, removed.is_some() && st.active && st.is_unobserved())
        };
        if removed_stale {
            self.refresh_stale_interest();
        }
        if deactivate {
            self.deactivate();
        }
    }

    fn set_dependent_wants_stale(&self, dependent: NodeId, wants_stale: bool) {
        let changed = {
            let mut st = self.inner.state.lock();
            match st.dependents.get_mut(&dependent) {
                Some(link) if link.wants_stale != wants_stale => {
                    link.wants_stale = wants_stale;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.refresh_stale_interest();
        }
    }

    fn on_source_changed(&self, source: NodeId) {
        let reaction = {
            let st = self.inner.state.lock();
            st.sources.get(&source).map(|edge| edge.on_changed.clone())
        };
        match reaction {
            Some(Some(on_changed)) => on_changed(self),
            Some(None) => self.update(),
            None => trace!("{} ignoring removed source {}", self.inner.label, source),
        }
    }
}

impl<T: Send + Sync + 'static> AsSource for ReactiveValue<T> {
    fn as_source(&self) -> SourceRef {
        let node: Arc<dyn Source> = self.inner.clone();
        SourceRef::new(self.inner.id, node)
    }
}

impl<T: Send + Sync + 'static> CacheableNode for ReactiveValue<T> {
    fn node_id(&self) -> NodeId {
        self.inner.id
    }

    fn time_went_inactive(&self) -> Option<Instant> {
        ReactiveValue::time_went_inactive(self)
    }
}

impl<T: Send + Sync + 'static> Inner<T> {
    fn handle(&self) -> Option<ReactiveValue<T>> {
        self.self_ref.upgrade().map(|inner| ReactiveValue { inner })
    }
}

impl<T: Send + Sync + 'static> Source for Inner<T> {
    fn plug(&self, link: DependentLink) {
        if let Some(node) = self.handle() {
            node.plug_dependent(link);
        }
    }

    fn unplug(&self, dependent: NodeId) {
        if let Some(node) = self.handle() {
            node.unplug_dependent(dependent);
        }
    }

    fn set_wants_stale(&self, dependent: NodeId, wants_stale: bool) {
        if let Some(node) = self.handle() {
            node.set_dependent_wants_stale(dependent, wants_stale);
        }
    }

    fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }
}

impl<T: Send + Sync + 'static> Dependent for Inner<T> {
    fn source_changed(&self, source: NodeId) {
        if let Some(node) = self.handle() {
            node.on_source_changed(source);
        }
    }

    fn is_active(&self) -> bool {
        self.state.lock().active
    }
}

impl<T> fmt::Debug for ReactiveValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("ReactiveValue")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("initialized", &st.initialized)
            .field("stale", &st.stale)
            .field("active", &st.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counter() -> (Arc<AtomicUsize>, impl Fn(Option<&u32>) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&count);
        (count, move |_: Option<&u32>| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn mirror_of(ctx: &MainContext, source: &ReactiveValue<u32>, label: &str) -> (ReactiveValue<u32>, Arc<AtomicUsize>) {
        let node = ReactiveValue::new(ctx, label);
        let updates = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&updates);
        let upstream = source.clone();
        node.on_update(move |node| {
            if !upstream.is_initialized() {
                return;
            }
            seen.fetch_add(1, Ordering::SeqCst);
            node.set(upstream.value().map(|v| *v));
        });
        node.add_source(source);
        (node, updates)
    }

    #[test]
    fn test_initialization() {
        let ctx = MainContext::new("value-test");
        let node: ReactiveValue<u32> = ReactiveValue::new(&ctx, "node");
        assert!(!node.is_initialized());
        assert!(node.is_stale());

        let (count, observer) = counter();
        node.observe(observer);
        node.set(None);

        assert!(node.is_initialized());
        assert!(!node.is_stale());
        assert_eq!(node.value(), None);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        node.set(Some(4));
        node.set(None);
        assert!(node.is_initialized());
    }

    #[test]
    fn test_equal_values_notify_once() {
        let ctx = MainContext::new("value-test");
        let node = ReactiveValue::new(&ctx, "node");
        let (count, observer) = counter();
        node.observe(observer);

        node.set(Some(7));
        node.set(Some(7));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        node.set(Some(8));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_custom_equality() {
        let ctx = MainContext::new("value-test");
        let node = ReactiveValue::with_equality(&ctx, "parity", |a: &u32, b: &u32| a % 2 == b % 2);
        let (count, observer) = counter();
        node.observe(observer);

        node.set(Some(1));
        node.set(Some(3));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(node.value().as_deref(), Some(&1));
    }

    #[test]
    fn test_new_observer_catches_up() {
        let ctx = MainContext::new("value-test");
        let node = ReactiveValue::new(&ctx, "node");
        node.set(Some(5));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        node.observe(move |value| sink.lock().push(value.copied()));

        assert_eq!(*seen.lock(), vec![Some(5)]);
    }

    #[test]
    fn test_last_observer_marks_inactive_and_stale() {
        let ctx = MainContext::new("value-test");
        let node = ReactiveValue::new(&ctx, "node");
        let id = node.observe(|_: Option<&u32>| {});
        node.set(Some(1));
        assert!(node.is_active());
        assert!(node.time_went_inactive().is_none());

        assert!(node.remove_observer(id));
        assert!(!node.remove_observer(id));
        assert!(!node.is_active());
        assert!(node.is_stale());
        assert!(node.time_went_inactive().is_some());
    }

    #[test]
    fn test_activation_recomputes_stale_node() {
        let ctx = MainContext::new("value-test");
        let node = ReactiveValue::new(&ctx, "node");
        let runs = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&runs);
        node.on_update(move |node| {
            counted.fetch_add(1, Ordering::SeqCst);
            node.set(Some(1u32));
        });

        let id = node.observe(|_| {});
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        node.remove_observer(id);
        node.observe(|_| {});
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_sources_plug_only_while_active() {
        let ctx = MainContext::new("value-test");
        let source = ReactiveValue::new(&ctx, "source");
        source.set(Some(2));
        let (derived, _) = mirror_of(&ctx, &source, "derived");

        assert_eq!(source.dependent_count(), 0);
        let id = derived.observe(|_| {});
        assert_eq!(source.dependent_count(), 1);
        assert!(source.is_active());
        assert_eq!(derived.value().as_deref(), Some(&2));

        derived.remove_observer(id);
        assert_eq!(source.dependent_count(), 0);
        assert!(!source.is_active());
        assert!(source.is_stale());
    }

    #[test]
    fn test_stale_refresh_reaches_only_interested_dependents() {
        let ctx = MainContext::new("value-test");
        let b = ReactiveValue::new(&ctx, "b");
        let direct = b.observe(|_: Option<&u32>| {});
        b.set(Some(5));
        b.remove_observer(direct);
        assert!(b.is_stale());

        let (a, a_updates) = mirror_of(&ctx, &b, "a");
        let (c, c_updates) = mirror_of(&ctx, &b, "c");
        a.observe_stale(|_| {});
        c.observe(|_| {});
        assert!(b.has_stale_interest());
        assert!(b.is_stale());
        assert_eq!(a_updates.load(Ordering::SeqCst), 1);
        assert_eq!(c_updates.load(Ordering::SeqCst), 1);

        b.set(Some(5));

        assert!(!b.is_stale());
        assert_eq!(a_updates.load(Ordering::SeqCst), 2);
        assert_eq!(c_updates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stale_observer_hears_refresh() {
        let ctx = MainContext::new("value-test");
        let node = ReactiveValue::new(&ctx, "node");
        let (plain, plain_observer) = counter();
        let (stale, stale_observer) = counter();
        node.observe(plain_observer);
        node.observe_stale(stale_observer);
        node.set(Some(1));

        node.mark_stale();
        node.set(Some(1));

        assert_eq!(plain.load(Ordering::SeqCst), 1);
        assert_eq!(stale.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_remove_source_from_notification() {
        let ctx = MainContext::new("value-test");
        let source = ReactiveValue::new(&ctx, "source");
        let node: ReactiveValue<u32> = ReactiveValue::new(&ctx, "node");
        let source_id = source.node_id();
        node.add_source_with(&source, move |node| {
            node.remove_source(source_id);
        });
        node.observe(|_| {});
        assert_eq!(source.dependent_count(), 1);

        source.set(Some(1u32));

        assert_eq!(node.source_count(), 0);
        assert_eq!(source.dependent_count(), 0);
        assert!(!source.is_active());
    }

    #[test]
    fn test_batch_collapses_updates() {
        let ctx = MainContext::new("value-test");
        let node: ReactiveValue<u32> = ReactiveValue::new(&ctx, "node");
        let runs = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&runs);
        node.on_update(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        node.batch(|| {
            node.update();
            node.update();
            node.update();
        });

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_initialized_value_waits_for_first_value() {
        let main = MainContext::spawn_dedicated("value-main").unwrap();
        let node: ReactiveValue<u32> = ReactiveValue::new(main.context(), "node");

        let waiter = {
            let node = node.clone();
            tokio::spawn(async move { node.get_initialized_value(false, false).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        node.post_value(Some(9)).unwrap();

        let value = waiter.await.unwrap().unwrap();
        assert_eq!(value.as_deref(), Some(&9));
        main.join();
    }

    #[tokio::test]
    async fn test_get_initialized_value_forces_update() {
        let main = MainContext::spawn_dedicated("value-main").unwrap();
        let node: ReactiveValue<u32> = ReactiveValue::new(main.context(), "node");
        let runs = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&runs);
        node.on_update(move |node| {
            let run = counted.fetch_add(1, Ordering::SeqCst) as u32;
            node.set(Some(run));
        });

        let first = node.get_initialized_value(true, false).await.unwrap();
        assert_eq!(first.as_deref(), Some(&0));

        let forced = node.get_initialized_value(true, true).await.unwrap();
        assert!(runs.load(Ordering::SeqCst) >= 2);
        assert_ne!(forced.as_deref(), Some(&0));
        main.join();
    }

    #[tokio::test]
    async fn test_get_initialized_value_after_shutdown() {
        let main = MainContext::spawn_dedicated("value-main").unwrap();
        let node: ReactiveValue<u32> = ReactiveValue::new(main.context(), "node");
        main.context().shutdown();

        let result = node.get_initialized_value(true, false).await;
        assert!(matches!(result, Err(PermctlError::ContextClosed)));
        main.join();
    }
}
