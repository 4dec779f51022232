//! permctl demo
//!
//! Boots the controller on an in-memory platform, installs a few apps and
//! prints what the permission screens would show, as JSON.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use permctl::commands::{GrantGroupCommand, SetAutoRevokeExemptionCommand};
use permctl::core::{ControllerConfig, EventBus, UserId};
use permctl::platform::{names, FakePlatform, LightPackageInfo, Platform};
use permctl::PermissionController;

/// Application name
pub const APP_NAME: &str = "permctl";

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("{} v{} starting...", APP_NAME, permctl::core::VERSION);

    let config = match ControllerConfig::load().await {
        Ok(config) => config,
        Err(e) => {
            warn!("Using default configuration: {}", e);
            ControllerConfig::default()
        }
    };

    let bus = Arc::new(EventBus::new());
    let fake = Arc::new(FakePlatform::new(Arc::clone(&bus)));
    install_demo_apps(&fake);
    let platform: Arc<dyn Platform> = fake.clone();
    let controller = PermissionController::start(config, platform, bus)?;
    let repo = Arc::clone(controller.repository());

    let summary = repo.perm_groups_summary().get_initialized_value(false, false).await?;
    print_json("Group summary", &summary.as_deref())?;

    let camera = repo.ui_info("com.example.camera", names::GROUP_CAMERA, UserId::SYSTEM);
    let _watch = {
        let node = camera.clone();
        controller.context().call(move || node.observe(|_| {}))?
    };
    print_json("Camera before grant", &camera.get_initialized_value(false, false).await?.as_deref())?;

    GrantGroupCommand {
        package: "com.example.camera".into(),
        group: names::GROUP_CAMERA.into(),
        user: UserId::SYSTEM,
        background: false,
    }
    .execute(&repo)
    .await?;
    for _ in 0..50 {
        if camera.value().map(|info| info.grant_state.is_granted()).unwrap_or(false) {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(20)).await;
    }
    print_json("Camera after grant", &camera.value().as_deref())?;

    SetAutoRevokeExemptionCommand {
        package: "com.example.maps".into(),
        user: UserId::SYSTEM,
        exempt: true,
    }
    .execute(&repo)
    .await?;

    let report = controller.revoke_unused(Utc::now()).await?;
    print_json("Auto-revoke report", &report)?;

    drop(repo);
    controller.shutdown();
    Ok(())
}

fn install_demo_apps(fake: &FakePlatform) {
    let now = Utc::now();
    fake.install(
        LightPackageInfo::new("com.example.camera", 10_001)
            .with_requested(names::CAMERA, false)
            .with_requested(names::RECORD_AUDIO, true),
    );
    fake.set_last_used("com.example.camera", UserId::SYSTEM, now);

    fake.install(
        LightPackageInfo::new("com.example.maps", 10_002)
            .with_requested(names::ACCESS_FINE_LOCATION, true)
            .with_requested(names::ACCESS_BACKGROUND_LOCATION, true),
    );
    fake.set_last_used("com.example.maps", UserId::SYSTEM, now - Duration::days(200));

    fake.install(
        LightPackageInfo::new("com.example.social", 10_003)
            .with_requested(names::READ_CONTACTS, true)
            .with_requested(names::CAMERA, true)
            .with_requested(names::INTERNET, true),
    );
    fake.set_last_used("com.example.social", UserId::SYSTEM, now - Duration::days(120));
}

fn print_json<T: Serialize>(title: &str, value: &T) -> Result<()> {
    println!("== {}\n{}", title, serde_json::to_string_pretty(value)?);
    Ok(())
}
