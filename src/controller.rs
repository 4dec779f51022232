//! Permission controller service
//!
//! Owns the main context thread, the background pool and the repository,
//! and pumps platform events from the bus onto the main context.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use permctl_core::{
    BackgroundPool, ControllerConfig, EventBus, MainContext, MainThread, PackageChange, PlatformEvent,
    Result,
};
use permctl_data::{revoke_unused, AutoRevokeReport, NodeEnv, PermissionRepository};
use permctl_platform::Platform;
use permctl_reactive::MemoryPressure;
use tracing::{debug, info, warn};

const POOL_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub struct PermissionController {
    main: Option<MainThread>,
    pool: Arc<BackgroundPool>,
    bus: Arc<EventBus>,
    repository: Arc<PermissionRepository>,
    pump: Option<JoinHandle<()>>,
}

impl PermissionController {
    /// Start the main context, the pool and the event pump
    pub fn start(config: ControllerConfig, platform: Arc<dyn Platform>, bus: Arc<EventBus>) -> Result<Self> {
        let main = MainContext::spawn_dedicated("permctl-main")?;
        let pool = Arc::new(BackgroundPool::new(&config.background)?);
        let env = Arc::new(NodeEnv::new(main.context().clone(), Arc::clone(&pool), platform, config));
        let repository = Arc::new(PermissionRepository::new(env));

        let subscription = bus.subscribe();
        let ctx = main.context().clone();
        let pumped = Arc::clone(&repository);
        let pump = thread::Builder::new().name("permctl-events".into()).spawn(move || {
            while let Ok(event) = subscription.recv() {
                if event == PlatformEvent::Shutdown {
                    break;
                }
                let repository = Arc::clone(&pumped);
                if ctx.post(move || dispatch(&repository, &event)).is_err() {
                    break;
                }
            }
            debug!("Event pump stopped");
        })?;

        info!("Permission controller started");
        Ok(Self {
            main: Some(main),
            pool,
            bus,
            repository,
            pump: Some(pump),
        })
    }

    pub fn repository(&self) -> &Arc<PermissionRepository> {
        &self.repository
    }

    pub fn context(&self) -> &MainContext {
        &self.repository.env().ctx
    }

    pub fn pool(&self) -> &Arc<BackgroundPool> {
        &self.pool
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Run one auto-revoke pass as of `now`
    pub async fn revoke_unused(&self, now: DateTime<Utc>) -> Result<AutoRevokeReport> {
        revoke_unused(&self.repository, now).await
    }

    /// Forward a platform trim signal to every cache
    pub fn on_memory_pressure(&self, level: MemoryPressure) -> usize {
        self.repository.on_memory_pressure(level)
    }

    /// Stop the pump, then the main context, then the pool
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(pump) = self.pump.take() {
            self.bus.emit(PlatformEvent::Shutdown);
            if pump.join().is_err() {
                warn!("Event pump panicked");
            }
        }
        if let Some(main) = self.main.take() {
            main.join();
            self.pool.shutdown(POOL_SHUTDOWN_GRACE);
            info!("Permission controller stopped");
        }
    }
}

impl Drop for PermissionController {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Route one event through the hubs; runs on the main context
fn dispatch(repository: &PermissionRepository, event: &PlatformEvent) {
    repository.env().hubs.route(event);
    if let PlatformEvent::Package {
        change: PackageChange::Removed,
        package,
        ..
    } = event
    {
        repository.invalidate_package(package);
    }
}
