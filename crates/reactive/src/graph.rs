//! Dependency graph plumbing
//!
//! Type-erased views of a node used on either end of a dependency edge.
//! A dependent holds its sources strongly; a source only holds weak links
//! back to the dependents currently plugged into it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Process-unique identity of a reactive node
pub type NodeId = u64;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_node_id() -> NodeId {
    NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Upstream end of an edge
pub(crate) trait Source: Send + Sync {
    fn plug(&self, link: DependentLink);
    fn unplug(&self, dependent: NodeId);
    fn set_wants_stale(&self, dependent: NodeId, wants_stale: bool);
    fn is_initialized(&self) -> bool;
}

/// Downstream end of an edge
pub(crate) trait Dependent: Send + Sync {
    fn source_changed(&self, source: NodeId);
    fn is_active(&self) -> bool;
}

/// A dependent registered on a source
pub(crate) struct DependentLink {
    pub(crate) id: NodeId,
    pub(crate) node: Weak<dyn Dependent>,
    pub(crate) wants_stale: bool,
    pub(crate) seen_version: u64,
}

/// Opaque handle to any node usable as a source
#[derive(Clone)]
pub struct SourceRef {
    id: NodeId,
    node: Arc<dyn Source>,
}

impl SourceRef {
    pub(crate) fn new(id: NodeId, node: Arc<dyn Source>) -> Self {
        Self { id, node }
    }

    pub fn node_id(&self) -> NodeId {
        self.id
    }

    pub fn is_initialized(&self) -> bool {
        self.node.is_initialized()
    }

    pub(crate) fn source(&self) -> &Arc<dyn Source> {
        &self.node
    }
}

impl fmt::Debug for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceRef").field("id", &self.id).finish()
    }
}

/// Anything that can be added as a source of a reactive value
pub trait AsSource {
    fn as_source(&self) -> SourceRef;
}

impl AsSource for SourceRef {
    fn as_source(&self) -> SourceRef {
        self.clone()
    }
}

/// What the cache needs to know about a node
pub trait CacheableNode: Clone + Send + Sync + 'static {
    fn node_id(&self) -> NodeId;

    /// When the node last lost its final observer; `None` while active
    fn time_went_inactive(&self) -> Option<Instant>;
}
