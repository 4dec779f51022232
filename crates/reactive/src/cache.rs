//! Observable cache
//!
//! Keyed, lazily populated store of reactive nodes. Equal keys always map to
//! the same node until the entry is invalidated or evicted; a later `get`
//! then builds a fresh node.
//!
//! Eviction happens three ways:
//! - explicit invalidation of one key or of every key matching a predicate
//! - memory pressure, evicting nodes inactive for longer than a tiered
//!   threshold (every inactive node on low-memory devices)
//! - self-eviction through the [`Evictor`] handed to the factory

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use permctl_core::config::CacheConfig;
use tracing::{debug, trace};

use crate::graph::{CacheableNode, NodeId};

/// Memory trim levels reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryPressure {
    /// UI of the process is no longer visible
    UiHidden,
    /// Process is running, device is starting to run low
    RunningModerate,
    /// Process is running, device is running low
    RunningLow,
    /// Process is running, device is about to kill background processes
    RunningCritical,
    /// Process went into the background LRU list
    Background,
    /// Process is in the middle of the background LRU list
    Moderate,
    /// Process is next to be killed
    Complete,
}

/// How long a node must have been inactive before a trim may evict it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimThreshold {
    Lax,
    Tight,
    All,
}

impl MemoryPressure {
    /// Tier for this level; `None` means the level does not trim
    pub fn tier(self) -> Option<TrimThreshold> {
        match self {
            MemoryPressure::Background => Some(TrimThreshold::Lax),
            MemoryPressure::Moderate | MemoryPressure::RunningLow => Some(TrimThreshold::Tight),
            MemoryPressure::Complete | MemoryPressure::RunningCritical => Some(TrimThreshold::All),
            MemoryPressure::UiHidden | MemoryPressure::RunningModerate => None,
        }
    }
}

impl TrimThreshold {
    pub fn duration(self, config: &CacheConfig) -> Duration {
        match self {
            TrimThreshold::Lax => config.lax_threshold(),
            TrimThreshold::Tight => config.tight_threshold(),
            TrimThreshold::All => Duration::ZERO,
        }
    }
}

type EvictFn = Arc<dyn Fn(NodeId) + Send + Sync>;

/// Lets a cached node remove its own entry.
///
/// Eviction only happens while the key still maps to the node with the given
/// id, so a stale node can never evict its replacement.
#[derive(Clone)]
pub struct Evictor {
    evict: EvictFn,
}

impl Evictor {
    pub fn evict(&self, node: NodeId) {
        (self.evict)(node)
    }

    /// Evictor that does nothing, for nodes built outside a cache
    pub fn detached() -> Self {
        Self {
            evict: Arc::new(|_| {}),
        }
    }
}

impl fmt::Debug for Evictor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Evictor")
    }
}

type Factory<K, V> = Box<dyn Fn(&K, Evictor) -> V + Send + Sync>;

struct CacheInner<K, V> {
    name: String,
    config: CacheConfig,
    entries: RwLock<HashMap<K, V>>,
    factory: Factory<K, V>,
}

/// Cache of reactive nodes keyed by structural keys
pub struct ObservableCache<K, V> {
    inner: Arc<CacheInner<K, V>>,
}

impl<K, V> Clone for ObservableCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> ObservableCache<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: CacheableNode,
{
    pub fn new<F>(name: impl Into<String>, config: CacheConfig, factory: F) -> Self
    where
        F: Fn(&K, Evictor) -> V + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(CacheInner {
                name: name.into(),
                config,
                entries: RwLock::new(HashMap::new()),
                factory: Box::new(factory),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Cached node for `key`, built on first use
    pub fn get(&self, key: &K) -> V {
        if let Some(node) = self.inner.entries.read().get(key) {
            return node.clone();
        }

        let mut entries = self.inner.entries.write();
        if let Some(node) = entries.get(key) {
            return node.clone();
        }
        let node = (self.inner.factory)(key, self.evictor_for(key));
        debug!("{}: created node {} for {:?}", self.inner.name, node.node_id(), key);
        entries.insert(key.clone(), node.clone());
        node
    }

    /// Cached node for `key` without building one
    pub fn peek(&self, key: &K) -> Option<V> {
        self.inner.entries.read().get(key).cloned()
    }

    fn evictor_for(&self, key: &K) -> Evictor {
        let cache: Weak<CacheInner<K, V>> = Arc::downgrade(&self.inner);
        let key = key.clone();
        Evictor {
            evict: Arc::new(move |node| {
                let Some(cache) = cache.upgrade() else { return };
                let mut entries = cache.entries.write();
                if entries.get(&key).map(CacheableNode::node_id) == Some(node) {
                    entries.remove(&key);
                    debug!("{}: node {} evicted itself ({:?})", cache.name, node, key);
                }
            }),
        }
    }

    /// Drop the entry for `key`. Returns whether one existed.
    pub fn invalidate(&self, key: &K) -> bool {
        let removed = self.inner.entries.write().remove(key).is_some();
        if removed {
            debug!("{}: invalidated {:?}", self.inner.name, key);
        }
        removed
    }

    /// Drop every entry whose key matches. Returns the number dropped.
    pub fn invalidate_all_matching<P>(&self, mut predicate: P) -> usize
    where
        P: FnMut(&K) -> bool,
    {
        let mut entries = self.inner.entries.write();
        let before = entries.len();
        entries.retain(|key, _| !predicate(key));
        let removed = before - entries.len();
        if removed > 0 {
            debug!("{}: invalidated {} entries", self.inner.name, removed);
        }
        removed
    }

    /// React to a platform trim signal
    pub fn on_memory_pressure(&self, level: MemoryPressure) -> usize {
        self.trim_at(level, Instant::now())
    }

    /// Trim as if the signal arrived at `now`
    pub fn trim_at(&self, level: MemoryPressure, now: Instant) -> usize {
        let threshold = if self.inner.config.low_memory_device {
            Duration::ZERO
        } else {
            match level.tier() {
                Some(tier) => tier.duration(&self.inner.config),
                None => {
                    trace!("{}: {:?} does not trim", self.inner.name, level);
                    return 0;
                }
            }
        };
        self.trim_inactive(threshold, now)
    }

    /// Evict every node inactive for at least `threshold` as of `now`
    pub fn trim_inactive(&self, threshold: Duration, now: Instant) -> usize {
        let mut entries = self.inner.entries.write();
        let before = entries.len();
        entries.retain(|_, node| match node.time_went_inactive() {
            Some(since) => now.saturating_duration_since(since) < threshold,
            None => true,
        });
        let removed = before - entries.len();
        if removed > 0 {
            debug!(
                "{}: trimmed {} nodes inactive for {:?}",
                self.inner.name, removed, threshold
            );
        }
        removed
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.entries.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.inner.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ReactiveValue;
    use parking_lot::Mutex;
    use permctl_core::MainContext;

    type Key = (String, String, i32);

    fn cache(ctx: &MainContext, config: CacheConfig) -> ObservableCache<Key, ReactiveValue<u32>> {
        let ctx = ctx.clone();
        ObservableCache::new("test", config, move |key: &Key, _| {
            ReactiveValue::new(&ctx, format!("{:?}", key))
        })
    }

    fn key(package: &str, group: &str, user: i32) -> Key {
        (package.to_string(), group.to_string(), user)
    }

    #[test]
    fn test_equal_keys_share_node() {
        let ctx = MainContext::new("cache-test");
        let cache = cache(&ctx, CacheConfig::default());

        let first = cache.get(&key("com.example", "CAMERA", 0));
        let second = cache.get(&key("com.example", "CAMERA", 0));
        let other = cache.get(&key("com.example", "CAMERA", 10));

        assert!(first.ptr_eq(&second));
        assert!(!first.ptr_eq(&other));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_invalidate_builds_new_node() {
        let ctx = MainContext::new("cache-test");
        let cache = cache(&ctx, CacheConfig::default());

        let first = cache.get(&key("com.example", "CAMERA", 0));
        assert!(cache.invalidate(&key("com.example", "CAMERA", 0)));
        assert!(!cache.invalidate(&key("com.example", "CAMERA", 0)));

        let second = cache.get(&key("com.example", "CAMERA", 0));
        assert!(!first.ptr_eq(&second));
        assert_ne!(first.node_id(), second.node_id());
    }

    #[test]
    fn test_invalidate_all_matching() {
        let ctx = MainContext::new("cache-test");
        let cache = cache(&ctx, CacheConfig::default());
        cache.get(&key("com.example", "CAMERA", 0));
        cache.get(&key("com.example", "LOCATION", 0));
        cache.get(&key("com.other", "CAMERA", 0));

        let removed = cache.invalidate_all_matching(|(package, _, _)| package == "com.example");

        assert_eq!(removed, 2);
        assert_eq!(cache.keys(), vec![key("com.other", "CAMERA", 0)]);
    }

    #[test]
    fn test_pressure_tiers() {
        let ctx = MainContext::new("cache-test");
        let cache = cache(&ctx, CacheConfig::default());
        let node = cache.get(&key("com.example", "CAMERA", 0));
        let inactive_since = node.time_went_inactive().unwrap();
        let later = inactive_since + Duration::from_secs(120);

        assert_eq!(cache.trim_at(MemoryPressure::UiHidden, later), 0);
        assert_eq!(cache.trim_at(MemoryPressure::Background, later), 0);
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.trim_at(MemoryPressure::Moderate, later), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_low_memory_device_evicts_all_inactive() {
        let ctx = MainContext::new("cache-test");
        let config = CacheConfig {
            low_memory_device: true,
            ..CacheConfig::default()
        };
        let cache = cache(&ctx, config);
        let node = cache.get(&key("com.example", "CAMERA", 0));
        let inactive_since = node.time_went_inactive().unwrap();

        assert_eq!(cache.trim_at(MemoryPressure::UiHidden, inactive_since), 1);
    }

    #[test]
    fn test_active_nodes_survive_pressure() {
        let ctx = MainContext::new("cache-test");
        let cache = cache(&ctx, CacheConfig::default());
        let active = cache.get(&key("com.example", "CAMERA", 0));
        cache.get(&key("com.example", "LOCATION", 0));
        let observer = active.observe(|_| {});

        let removed = cache.trim_at(
            MemoryPressure::Complete,
            Instant::now() + Duration::from_secs(3600),
        );

        assert_eq!(removed, 1);
        assert!(cache.contains(&key("com.example", "CAMERA", 0)));
        active.remove_observer(observer);
    }

    #[test]
    fn test_evictor_only_removes_its_own_node() {
        let ctx = MainContext::new("cache-test");
        let evictors: Arc<Mutex<Vec<Evictor>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&evictors);
        let node_ctx = ctx.clone();
        let cache: ObservableCache<Key, ReactiveValue<u32>> =
            ObservableCache::new("test", CacheConfig::default(), move |_, evictor| {
                captured.lock().push(evictor);
                ReactiveValue::new(&node_ctx, "node")
            });

        let k = key("com.example", "CAMERA", 0);
        let first = cache.get(&k);
        cache.invalidate(&k);
        let second = cache.get(&k);

        let first_evictor = evictors.lock()[0].clone();
        first_evictor.evict(first.node_id());
        assert!(cache.peek(&k).unwrap().ptr_eq(&second));

        let second_evictor = evictors.lock()[1].clone();
        second_evictor.evict(second.node_id());
        assert!(!cache.contains(&k));
    }
}
