//! Auto-revoke of unused apps
//!
//! Walks the packages of every user and takes the grants of runtime groups
//! away from apps that have gone unused for longer than the configured
//! threshold. Revoked permissions are tagged `AUTO_REVOKED` so the UI can
//! tell them apart from user denials.

use chrono::{DateTime, Utc};
use permctl_core::{Result, UserId};
use permctl_platform::PermissionFlags;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::repository::PermissionRepository;
use crate::rules;

/// Groups revoked from one package
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevokedApp {
    pub package: String,
    pub user: UserId,
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AutoRevokeReport {
    pub revoked: Vec<RevokedApp>,
}

impl AutoRevokeReport {
    pub fn is_empty(&self) -> bool {
        self.revoked.is_empty()
    }
}

/// Revoke the revocable groups of every app unused as of `now`.
///
/// Must be awaited off the main context; nodes are read through
/// `get_initialized_value`.
pub async fn revoke_unused(repo: &PermissionRepository, now: DateTime<Utc>) -> Result<AutoRevokeReport> {
    let config = repo.config().auto_revoke.clone();
    let mut report = AutoRevokeReport::default();
    if !config.enabled {
        info!("Auto-revoke disabled, nothing to do");
        return Ok(report);
    }

    let Some(users) = repo.users().get_initialized_value(false, true).await? else {
        return Ok(report);
    };
    for user in users.iter().copied() {
        let Some(packages) = repo.user_packages(user).get_initialized_value(false, false).await? else {
            continue;
        };
        for package in packages.iter() {
            let name = package.package_name.as_str();
            let last_used = match repo.platform().last_time_used(name, user) {
                Ok(last_used) => last_used,
                Err(e) => {
                    warn!("No usage stats for {}@{}: {}", name, user, e);
                    continue;
                }
            };
            if !rules::is_unused(last_used, now, config.unused_threshold_days) {
                continue;
            }

            let state = repo.auto_revoke_state(name, user).get_initialized_value(false, false).await?;
            let Some(state) = state.filter(|s| s.should_revoke()) else {
                debug!("{}@{} is unused but not revocable", name, user);
                continue;
            };

            let mut groups = Vec::new();
            for group in &state.revocable_groups {
                if revoke_group(repo, name, group, user).await? {
                    groups.push(group.clone());
                }
            }
            if !groups.is_empty() {
                info!("Auto-revoked {:?} from unused {}@{}", groups, name, user);
                report.revoked.push(RevokedApp {
                    package: name.to_string(),
                    user,
                    groups,
                });
            }
        }
    }
    Ok(report)
}

/// Revoke every revocable permission of one group. Returns whether any was revoked.
async fn revoke_group(repo: &PermissionRepository, package: &str, group: &str, user: UserId) -> Result<bool> {
    let Some(app_group) = repo
        .light_app_perm_group(package, group, user)
        .get_initialized_value(false, false)
        .await?
    else {
        return Ok(false);
    };

    let platform = repo.platform();
    let mut revoked = false;
    for permission in app_group.permissions.values().filter(|p| rules::is_revocable_permission(p)) {
        let name = permission.name();
        if let Err(e) = platform.revoke_runtime_permission(package, name, user) {
            warn!("Revoking {} from {}@{} failed: {}", name, package, user, e);
            continue;
        }
        if let Err(e) = platform.update_permission_flags(
            name,
            package,
            PermissionFlags::AUTO_REVOKED,
            PermissionFlags::AUTO_REVOKED,
            user,
        ) {
            warn!("Tagging {} of {}@{} as auto-revoked failed: {}", name, package, user, e);
        }
        revoked = true;
    }
    Ok(revoked)
}
