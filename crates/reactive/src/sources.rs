//! Keyed source sets
//!
//! Nodes that fan out over a changing collection of keys ("every group
//! requested by any app") keep their per-key sources in a [`SourceSet`] and
//! reconcile it with [`ReactiveValue::set_sources_to_difference`], which only
//! adds and removes the edges that actually changed.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::graph::AsSource;
use crate::value::ReactiveValue;

/// Per-key sources currently held by a node
pub struct SourceSet<K, S> {
    entries: Mutex<HashMap<K, S>>,
}

impl<K, S> Default for SourceSet<K, S> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, S> SourceSet<K, S>
where
    K: Eq + Hash + Clone,
    S: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<S> {
        self.entries.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Copy of every entry, safe to iterate while the graph changes
    pub fn snapshot(&self) -> Vec<(K, S)> {
        self.entries
            .lock()
            .iter()
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Per-key reaction used instead of a blanket recompute
pub type KeyedReaction<T, K> = Arc<dyn Fn(&ReactiveValue<T>, &K) + Send + Sync>;

impl<T: Send + Sync + 'static> ReactiveValue<T> {
    /// Make the sources held in `current` match `desired`.
    ///
    /// New keys get a source from `make_source`; keys no longer desired lose
    /// theirs. With `on_key_changed` each new edge calls it with its key
    /// instead of recomputing the whole node. Recomputes requested while
    /// reconciling collapse into one at the end.
    pub fn set_sources_to_difference<K, S, I, F>(
        &self,
        desired: I,
        current: &SourceSet<K, S>,
        mut make_source: F,
        on_key_changed: Option<KeyedReaction<T, K>>,
    ) where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        S: AsSource + Clone,
        I: IntoIterator<Item = K>,
        F: FnMut(&K) -> S,
    {
        let desired: HashSet<K> = desired.into_iter().collect();
        let (removed, added) = {
            let mut entries = current.entries.lock();
            let stale_keys: Vec<K> = entries
                .keys()
                .filter(|key| !desired.contains(*key))
                .cloned()
                .collect();
            let removed: Vec<S> = stale_keys
                .iter()
                .filter_map(|key| entries.remove(key))
                .collect();
            let added: Vec<K> = desired
                .into_iter()
                .filter(|key| !entries.contains_key(key))
                .collect();
            (removed, added)
        };

        self.batch(|| {
            for source in removed {
                self.remove_source(source.as_source().node_id());
            }
            for key in added {
                let source = make_source(&key);
                current.entries.lock().insert(key.clone(), source.clone());
                match &on_key_changed {
                    Some(reaction) => {
                        let reaction = Arc::clone(reaction);
                        self.add_source_with(&source, move |node| reaction(node, &key));
                    }
                    None => self.add_source(&source),
                }
            }
        });
    }
}
