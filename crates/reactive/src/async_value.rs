//! Async reactive value
//!
//! A [`ReactiveValue`] whose recompute runs on the [`BackgroundPool`].
//!
//! A recompute is split in two:
//! - `prepare` runs on the main context, reads the sources and returns a
//!   background job, or `None` while inputs are not ready.
//! - the job runs on the pool with a [`CancellationToken`] and returns a
//!   [`LoadOutcome`], which is applied back on the main context.
//!
//! At most one job runs per node. Triggers while a job runs collapse into a
//! single queued follow-up. Deactivation cancels the running job and drops
//! its result.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use permctl_core::{BackgroundPool, MainContext};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::graph::{AsSource, CacheableNode, NodeId, SourceRef};
use crate::value::ReactiveValue;

/// Result of a background load
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome<T> {
    /// Publish this value (`None` is a valid "no data" result)
    Value(Option<T>),
    /// The queried entity is gone: publish `None` and fire not-found hooks
    NotFound,
    /// Nothing to publish (inputs vanished or the job saw cancellation)
    Skip,
}

/// Background half of a recompute
pub type LoadJob<T> = Box<dyn FnOnce(&CancellationToken) -> LoadOutcome<T> + Send + 'static>;

type PrepareFn<T> = Arc<dyn Fn(&ReactiveValue<T>) -> Option<LoadJob<T>> + Send + Sync>;
type HookFn = Arc<dyn Fn() + Send + Sync>;
type AppliedFn<T> = Arc<dyn Fn(&ReactiveValue<T>) + Send + Sync>;

/// Job slot of an async node
#[derive(Debug, Clone)]
pub enum JobState {
    Idle,
    Running { token: CancellationToken, generation: u64 },
    RunningQueued { token: CancellationToken, generation: u64 },
}

impl JobState {
    pub fn is_idle(&self) -> bool {
        matches!(self, JobState::Idle)
    }
}

struct AsyncInner<T> {
    value: ReactiveValue<T>,
    pool: Arc<BackgroundPool>,
    jobs: Mutex<JobState>,
    prepare: Mutex<Option<PrepareFn<T>>>,
    not_found: Mutex<Vec<HookFn>>,
    applied: Mutex<Vec<AppliedFn<T>>>,
    generation: AtomicU64,
    runs: AtomicUsize,
}

/// Reactive value recomputed off the main context
pub struct AsyncReactiveValue<T> {
    inner: Arc<AsyncInner<T>>,
}

impl<T> Clone for AsyncReactiveValue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: PartialEq + Send + Sync + 'static> AsyncReactiveValue<T> {
    pub fn new(ctx: &MainContext, pool: &Arc<BackgroundPool>, label: impl Into<String>) -> Self {
        Self::wrap(ReactiveValue::new(ctx, label), pool)
    }
}

impl<T: Send + Sync + 'static> AsyncReactiveValue<T> {
    /// Async node with a custom equality predicate
    pub fn with_equality<E>(
        ctx: &MainContext,
        pool: &Arc<BackgroundPool>,
        label: impl Into<String>,
        equality: E,
    ) -> Self
    where
        E: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        Self::wrap(ReactiveValue::with_equality(ctx, label, equality), pool)
    }

    fn wrap(value: ReactiveValue<T>, pool: &Arc<BackgroundPool>) -> Self {
        let inner = Arc::new(AsyncInner {
            value: value.clone(),
            pool: Arc::clone(pool),
            jobs: Mutex::new(JobState::Idle),
            prepare: Mutex::new(None),
            not_found: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            runs: AtomicUsize::new(0),
        });

        let weak = Arc::downgrade(&inner);
        value.on_update(move |_| {
            if let Some(node) = Self::upgrade(&weak) {
                node.trigger();
            }
        });
        let weak = Arc::downgrade(&inner);
        value.on_inactive(move |_| {
            if let Some(node) = Self::upgrade(&weak) {
                node.cancel();
            }
        });

        Self { inner }
    }

    fn upgrade(weak: &Weak<AsyncInner<T>>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Install the main-context half of the recompute
    pub fn on_prepare<F>(&self, prepare: F)
    where
        F: Fn(&ReactiveValue<T>) -> Option<LoadJob<T>> + Send + Sync + 'static,
    {
        *self.inner.prepare.lock() = Some(Arc::new(prepare));
    }

    /// Run a hook when a load reports the entity as gone
    pub fn on_not_found<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.not_found.lock().push(Arc::new(hook));
    }

    /// Run a hook on the main context after each background result is applied
    pub fn on_applied<F>(&self, hook: F)
    where
        F: Fn(&ReactiveValue<T>) + Send + Sync + 'static,
    {
        self.inner.applied.lock().push(Arc::new(hook));
    }

    /// The underlying reactive value
    pub fn value_node(&self) -> &ReactiveValue<T> {
        &self.inner.value
    }

    /// Number of background jobs started so far
    pub fn job_runs(&self) -> usize {
        self.inner.runs.load(Ordering::Acquire)
    }

    pub fn job_state(&self) -> JobState {
        self.inner.jobs.lock().clone()
    }

    /// Request a recompute, coalescing with any job already running
    pub fn trigger(&self) {
        self.inner.value.context().assert_main();
        let start = {
            let mut jobs = self.inner.jobs.lock();
            match &*jobs {
                JobState::Idle => true,
                JobState::Running { token, generation } => {
                    trace!("{} queued behind job {}", self.inner.value.label(), generation);
                    *jobs = JobState::RunningQueued {
                        token: token.clone(),
                        generation: *generation,
                    };
                    false
                }
                JobState::RunningQueued { .. } => {
                    trace!("{} already has a queued job", self.inner.value.label());
                    false
                }
            }
        };
        if start {
            self.start();
        }
    }

    fn start(&self) {
        let prepare = self.inner.prepare.lock().clone();
        let Some(prepare) = prepare else { return };
        let Some(job) = prepare(&self.inner.value) else {
            trace!("{} inputs not ready", self.inner.value.label());
            return;
        };

        let token = CancellationToken::new();
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *self.inner.jobs.lock() = JobState::Running {
            token: token.clone(),
            generation,
        };
        self.inner.runs.fetch_add(1, Ordering::AcqRel);
        debug!("{} starting job {}", self.inner.value.label(), generation);

        let ctx = self.inner.value.context().clone();
        let weak = Arc::downgrade(&self.inner);
        self.inner.pool.spawn_blocking(move || {
            let outcome = if token.is_cancelled() {
                LoadOutcome::Skip
            } else {
                job(&token)
            };
            if token.is_cancelled() {
                trace!("job {} cancelled, dropping its result", generation);
                return;
            }
            let _ = ctx.post(move || {
                if let Some(node) = Self::upgrade(&weak) {
                    node.complete(generation, outcome);
                }
            });
        });
    }

    fn complete(&self, generation: u64, outcome: LoadOutcome<T>) {
        let requeue = {
            let mut jobs = self.inner.jobs.lock();
            match &*jobs {
                JobState::Running { generation: current, token } if *current == generation => {
                    if token.is_cancelled() {
                        return;
                    }
                    *jobs = JobState::Idle;
                    false
                }
                JobState::RunningQueued { generation: current, token } if *current == generation => {
                    if token.is_cancelled() {
                        return;
                    }
                    *jobs = JobState::Idle;
                    true
                }
                _ => {
                    trace!("{} ignoring superseded job {}", self.inner.value.label(), generation);
                    return;
                }
            }
        };

        match outcome {
            LoadOutcome::Value(value) => self.inner.value.set(value),
            LoadOutcome::NotFound => {
                debug!("{} not found", self.inner.value.label());
                self.inner.value.set(None);
                let hooks = self.inner.not_found.lock().clone();
                for hook in hooks {
                    hook();
                }
            }
            LoadOutcome::Skip => {}
        }
        let applied = self.inner.applied.lock().clone();
        for hook in applied {
            hook(&self.inner.value);
        }

        if requeue {
            self.start();
        }
    }

    /// Cancel any running job and forget the queued one
    pub fn cancel(&self) {
        let previous = std::mem::replace(&mut *self.inner.jobs.lock(), JobState::Idle);
        match previous {
            JobState::Running { token, generation } | JobState::RunningQueued { token, generation } => {
                debug!("{} cancelling job {}", self.inner.value.label(), generation);
                token.cancel();
            }
            JobState::Idle => {}
        }
    }
}

impl<T> std::ops::Deref for AsyncReactiveValue<T> {
    type Target = ReactiveValue<T>;

    fn deref(&self) -> &ReactiveValue<T> {
        &self.inner.value
    }
}

impl<T: Send + Sync + 'static> AsSource for AsyncReactiveValue<T> {
    fn as_source(&self) -> SourceRef {
        self.inner.value.as_source()
    }
}

impl<T: Send + Sync + 'static> CacheableNode for AsyncReactiveValue<T> {
    fn node_id(&self) -> NodeId {
        self.inner.value.node_id()
    }

    fn time_went_inactive(&self) -> Option<std::time::Instant> {
        self.inner.value.time_went_inactive()
    }
}
