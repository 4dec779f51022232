//! permctl Reactive - observable values and caches
//!
//! The dependency-graph layer of permctl:
//! - [`ReactiveValue`]: observable holder with initialized/stale/active state
//!   and source/dependent edges
//! - [`AsyncReactiveValue`]: a reactive value recomputed on the background pool
//! - [`ObservableCache`]: lazily populated node cache with pressure eviction
//! - keyed source sets and a poller for signals without change events

pub mod graph;
pub mod value;
pub mod async_value;
pub mod cache;
pub mod sources;
pub mod poller;

pub use graph::{AsSource, CacheableNode, NodeId, SourceRef};
pub use value::{Equality, ObserverId, ReactiveValue, WeakReactiveValue};
pub use async_value::{AsyncReactiveValue, JobState, LoadJob, LoadOutcome};
pub use cache::{Evictor, MemoryPressure, ObservableCache, TrimThreshold};
pub use sources::{KeyedReaction, SourceSet};
pub use poller::poll_while_active;
