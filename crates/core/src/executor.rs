//! Execution contexts
//!
//! Two contexts run every piece of permctl code:
//! - [`MainContext`]: a single-threaded executor that owns the reactive graph.
//!   Any thread may post work to it; only its bound thread runs that work.
//! - [`BackgroundPool`]: a tokio runtime for blocking platform queries and
//!   timers. Results travel back to the graph by posting to the main context.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use futures::Future;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info, warn};

use crate::config::BackgroundConfig;
use crate::error::{PermctlError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Stop,
}

struct MainInner {
    name: String,
    sender: Sender<Message>,
    receiver: Receiver<Message>,
    owner: RwLock<Option<ThreadId>>,
    draining: AtomicBool,
    closed: AtomicBool,
}

/// Single-threaded executor owning all reactive state.
///
/// The context is bound to exactly one thread. Work posted from elsewhere is
/// queued and runs, strictly in order, when that thread drains the queue.
#[derive(Clone)]
pub struct MainContext {
    inner: Arc<MainInner>,
}

/// Handle to a dedicated main-context thread
pub struct MainThread {
    context: MainContext,
    handle: Option<JoinHandle<()>>,
}

impl MainContext {
    /// Create a context bound to the calling thread
    pub fn new(name: impl Into<String>) -> Self {
        let context = Self::unbound(name.into());
        context.bind_current_thread();
        context
    }

    fn unbound(name: String) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            inner: Arc::new(MainInner {
                name,
                sender,
                receiver,
                owner: RwLock::new(None),
                draining: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Spawn a thread that owns a fresh context and drains it until shutdown
    pub fn spawn_dedicated(name: impl Into<String>) -> Result<MainThread> {
        let name = name.into();
        let context = Self::unbound(name.clone());
        let (ready_tx, ready_rx) = bounded(1);

        let thread_context = context.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                thread_context.bind_current_thread();
                let _ = ready_tx.send(());
                thread_context.run_forever();
            })?;

        ready_rx
            .recv()
            .map_err(|_| PermctlError::Internal(format!("main context {} failed to start", name)))?;
        info!("Main context {} running on dedicated thread", name);

        Ok(MainThread {
            context,
            handle: Some(handle),
        })
    }

    fn bind_current_thread(&self) {
        *self.inner.owner.write() = Some(thread::current().id());
    }

    /// Context name, used in logs
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the calling thread is the one owning this context
    pub fn is_main(&self) -> bool {
        *self.inner.owner.read() == Some(thread::current().id())
    }

    /// Fail fast (debug builds) when graph state is touched off the main context
    #[track_caller]
    pub fn assert_main(&self) {
        debug_assert!(
            self.is_main(),
            "reactive state of {} touched off the main context",
            self.inner.name
        );
    }

    /// Whether `shutdown` has been called
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Queue work for the main context. Callable from any thread.
    pub fn post<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_closed() {
            return Err(PermctlError::ContextClosed);
        }
        self.inner
            .sender
            .send(Message::Run(Box::new(job)))
            .map_err(|_| PermctlError::ContextClosed)
    }

    /// Run `job` on the main context and wait for its result.
    ///
    /// Runs inline when already on the main context.
    pub fn call<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_main() {
            return Ok(job());
        }
        let (tx, rx) = bounded(1);
        self.post(move || {
            let _ = tx.send(job());
        })?;
        rx.recv().map_err(|_| PermctlError::ContextClosed)
    }

    /// Run every queued job without blocking. Returns the number of jobs run.
    pub fn run_pending(&self) -> usize {
        let _guard = self.enter();
        let mut ran = 0;
        loop {
            match self.inner.receiver.try_recv() {
                Ok(Message::Run(job)) => {
                    job();
                    ran += 1;
                }
                Ok(Message::Stop) | Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                    break;
                }
            }
        }
        ran
    }

    /// Drain jobs until `done` holds or `timeout` elapses. Returns whether `done` held.
    pub fn run_until<P>(&self, mut done: P, timeout: Duration) -> bool
    where
        P: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            self.run_pending();
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            match self.inner.receiver.recv_timeout(deadline - now) {
                Ok(Message::Run(job)) => {
                    let _guard = self.enter();
                    job();
                }
                Ok(Message::Stop) | Err(RecvTimeoutError::Disconnected) => return done(),
                Err(RecvTimeoutError::Timeout) => return done(),
            }
        }
    }

    /// Drain jobs for a fixed amount of time
    pub fn run_for(&self, duration: Duration) {
        self.run_until(|| false, duration);
    }

    fn run_forever(&self) {
        debug!("Main context {} loop started", self.inner.name);
        while let Ok(message) = self.inner.receiver.recv() {
            match message {
                Message::Run(job) => {
                    let _guard = self.enter();
                    job();
                }
                Message::Stop => break,
            }
        }
        debug!("Main context {} loop stopped", self.inner.name);
    }

    /// Stop accepting work and wake a dedicated loop so it can exit
    pub fn shutdown(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            let _ = self.inner.sender.send(Message::Stop);
            debug!("Main context {} closed", self.inner.name);
        }
    }

    fn enter(&self) -> EnterGuard<'_> {
        self.assert_main();
        let nested = self.inner.draining.swap(true, Ordering::AcqRel);
        assert!(!nested, "main context {} entered re-entrantly", self.inner.name);
        EnterGuard { context: self }
    }
}

struct EnterGuard<'a> {
    context: &'a MainContext,
}

impl Drop for EnterGuard<'_> {
    fn drop(&mut self) {
        self.context.inner.draining.store(false, Ordering::Release);
    }
}

impl MainThread {
    /// The context driven by this thread
    pub fn context(&self) -> &MainContext {
        &self.context
    }

    /// Close the context and wait for the thread to exit
    pub fn join(mut self) {
        self.context.shutdown();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Main context {} thread panicked", self.context.name());
            }
        }
    }
}

impl Drop for MainThread {
    fn drop(&mut self) {
        self.context.shutdown();
    }
}

/// Background runtime for blocking platform queries and timers
pub struct BackgroundPool {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    in_flight: Arc<AtomicUsize>,
}

impl BackgroundPool {
    /// Build a pool from configuration
    pub fn new(config: &BackgroundConfig) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .max_blocking_threads(config.max_blocking_threads.max(1))
            .thread_name("permctl-bg")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        debug!(
            "Background pool started with {} workers",
            config.worker_threads
        );
        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            handle,
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Runtime handle, for code that needs tokio primitives directly
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run a blocking closure on the pool
    pub fn spawn_blocking<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.fetch_add(1, Ordering::AcqRel);
        self.handle.spawn_blocking(move || {
            job();
            in_flight.fetch_sub(1, Ordering::AcqRel);
        });
    }

    /// Run a future on the pool
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.fetch_add(1, Ordering::AcqRel);
        self.handle.spawn(async move {
            future.await;
            in_flight.fetch_sub(1, Ordering::AcqRel);
        });
    }

    /// Number of spawned jobs that have not finished yet
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Stop the runtime, giving running jobs `grace` to finish.
    ///
    /// Inside another async runtime blocking is not allowed, so the grace
    /// period is skipped there.
    pub fn shutdown(&self, grace: Duration) {
        if let Some(runtime) = self.runtime.lock().take() {
            if Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(grace);
            }
            info!("Background pool shut down");
        }
    }
}

impl Drop for BackgroundPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_posted_jobs_run_in_order() {
        let ctx = MainContext::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = Arc::clone(&log);
            ctx.post(move || log.lock().push(i)).unwrap();
        }
        assert_eq!(ctx.run_pending(), 3);
        assert_eq!(*log.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_post_from_other_thread() {
        let ctx = MainContext::new("test");
        let hits = Arc::new(AtomicU32::new(0));
        let (remote, remote_hits) = (ctx.clone(), Arc::clone(&hits));
        thread::spawn(move || {
            assert!(!remote.is_main());
            remote
                .post(move || {
                    remote_hits.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        });
        assert!(ctx.run_until(|| hits.load(Ordering::SeqCst) == 1, Duration::from_secs(5)));
    }

    #[test]
    fn test_closed_context_rejects_work() {
        let ctx = MainContext::new("test");
        ctx.shutdown();
        assert!(matches!(ctx.post(|| {}), Err(PermctlError::ContextClosed)));
    }

    #[test]
    #[should_panic(expected = "re-entrantly")]
    fn test_reentrant_drain_panics() {
        let ctx = MainContext::new("test");
        let inner = ctx.clone();
        ctx.post(move || {
            inner.run_pending();
        })
        .unwrap();
        ctx.run_pending();
    }

    #[test]
    fn test_dedicated_thread_call() {
        let main = MainContext::spawn_dedicated("dedicated").unwrap();
        let ctx = main.context().clone();
        let main_ctx = ctx.clone();
        let on_main = ctx.call(move || main_ctx.is_main()).unwrap();
        assert!(on_main);
        main.join();
        assert!(matches!(ctx.call(|| 1), Err(PermctlError::ContextClosed)));
    }

    #[test]
    fn test_background_round_trip() {
        let ctx = MainContext::new("test");
        let pool = BackgroundPool::new(&BackgroundConfig::default()).unwrap();
        let result = Arc::new(Mutex::new(None));

        let (post_ctx, slot) = (ctx.clone(), Arc::clone(&result));
        pool.spawn_blocking(move || {
            let value = 6 * 7;
            post_ctx.post(move || *slot.lock() = Some(value)).unwrap();
        });

        assert!(ctx.run_until(|| result.lock().is_some(), Duration::from_secs(5)));
        assert_eq!(*result.lock(), Some(42));
        pool.shutdown(Duration::from_secs(1));
    }
}
