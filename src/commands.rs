//! Mutation commands
//!
//! Each command reads the current snapshot through the repository, then
//! calls the platform. Resulting broadcasts flow back through the hubs, so
//! commands never touch nodes directly. `submit` runs a command on the
//! background pool without waiting for it.

use std::sync::Arc;

use permctl_core::{PermctlError, Result, UserId};
use permctl_data::{LightAppPermGroup, LightPermission, PermissionRepository};
use permctl_platform::{names, AppOpMode, PermissionFlags};
use tracing::{info, warn};

use crate::controller::PermissionController;

async fn app_group(repo: &PermissionRepository, package: &str, group: &str, user: UserId) -> Result<Arc<LightAppPermGroup>> {
    repo.light_app_perm_group(package, group, user)
        .get_initialized_value(false, false)
        .await?
        .ok_or_else(|| PermctlError::NotFound(format!("{} of {}@{}", group, package, user)))
}

fn is_changeable(permission: &LightPermission) -> bool {
    !permission.is_policy_fixed() && !permission.is_system_fixed()
}

/// Grant a group, including its background half when asked
pub struct GrantGroupCommand {
    pub package: String,
    pub group: String,
    pub user: UserId,
    pub background: bool,
}

impl GrantGroupCommand {
    /// Grant and return the names of the permissions that changed
    pub async fn execute(&self, repo: &PermissionRepository) -> Result<Vec<String>> {
        let group = app_group(repo, &self.package, &self.group, self.user).await?;
        let platform = repo.platform();
        let mut changed = Vec::new();
        for permission in group.permissions.values() {
            if permission.is_background() && !self.background {
                continue;
            }
            if !is_changeable(permission) {
                continue;
            }
            let name = permission.name();
            platform.grant_runtime_permission(&self.package, name, self.user)?;
            platform.update_permission_flags(
                name,
                &self.package,
                PermissionFlags::USER_SET
                    | PermissionFlags::USER_FIXED
                    | PermissionFlags::ONE_TIME
                    | PermissionFlags::AUTO_REVOKED,
                PermissionFlags::USER_SET,
                self.user,
            )?;
            changed.push(name.to_string());
        }
        info!("Granted {:?} to {}@{}", changed, self.package, self.user);
        Ok(changed)
    }

    pub fn submit(self, controller: &PermissionController) {
        let repo = Arc::clone(controller.repository());
        controller.pool().spawn(async move {
            if let Err(e) = self.execute(&repo).await {
                warn!("Granting {} to {} failed: {}", self.group, self.package, e);
            }
        });
    }
}

/// Revoke a group, or only its background half
pub struct RevokeGroupCommand {
    pub package: String,
    pub group: String,
    pub user: UserId,
    pub background_only: bool,
    /// Keep the app from asking again
    pub fixed: bool,
}

impl RevokeGroupCommand {
    /// Revoke and return the names of the permissions that changed
    pub async fn execute(&self, repo: &PermissionRepository) -> Result<Vec<String>> {
        let group = app_group(repo, &self.package, &self.group, self.user).await?;
        let platform = repo.platform();
        let values = if self.fixed {
            PermissionFlags::USER_SET | PermissionFlags::USER_FIXED
        } else {
            PermissionFlags::USER_SET
        };
        let mut changed = Vec::new();
        for permission in group.permissions.values() {
            if self.background_only && !permission.is_background() {
                continue;
            }
            if !is_changeable(permission) {
                continue;
            }
            let name = permission.name();
            platform.revoke_runtime_permission(&self.package, name, self.user)?;
            platform.update_permission_flags(
                name,
                &self.package,
                PermissionFlags::USER_SET
                    | PermissionFlags::USER_FIXED
                    | PermissionFlags::ONE_TIME
                    | PermissionFlags::AUTO_REVOKED,
                values,
                self.user,
            )?;
            changed.push(name.to_string());
        }
        info!("Revoked {:?} from {}@{}", changed, self.package, self.user);
        Ok(changed)
    }

    pub fn submit(self, controller: &PermissionController) {
        let repo = Arc::clone(controller.repository());
        controller.pool().spawn(async move {
            if let Err(e) = self.execute(&repo).await {
                warn!("Revoking {} from {} failed: {}", self.group, self.package, e);
            }
        });
    }
}

/// Set the mode of one app-op for one package
pub struct SetAppOpModeCommand {
    pub op: String,
    pub package: String,
    pub user: UserId,
    pub mode: AppOpMode,
}

impl SetAppOpModeCommand {
    pub async fn execute(&self, repo: &PermissionRepository) -> Result<()> {
        let info = repo
            .package_info(&self.package, self.user)
            .get_initialized_value(false, false)
            .await?
            .ok_or_else(|| PermctlError::package_not_found(&self.package))?;
        repo.platform().set_mode(&self.op, info.uid, &self.package, self.mode)?;
        info!("Set {} of {}@{} to {:?}", self.op, self.package, self.user, self.mode);
        Ok(())
    }

    pub fn submit(self, controller: &PermissionController) {
        let repo = Arc::clone(controller.repository());
        controller.pool().spawn(async move {
            if let Err(e) = self.execute(&repo).await {
                warn!("Setting {} of {} failed: {}", self.op, self.package, e);
            }
        });
    }
}

/// Exempt a package from auto-revoke, or opt it back in
pub struct SetAutoRevokeExemptionCommand {
    pub package: String,
    pub user: UserId,
    pub exempt: bool,
}

impl SetAutoRevokeExemptionCommand {
    fn as_op_command(&self) -> SetAppOpModeCommand {
        SetAppOpModeCommand {
            op: names::OP_AUTO_REVOKE_PERMISSIONS_IF_UNUSED.to_string(),
            package: self.package.clone(),
            user: self.user,
            mode: if self.exempt { AppOpMode::Ignored } else { AppOpMode::Allowed },
        }
    }

    pub async fn execute(&self, repo: &PermissionRepository) -> Result<()> {
        self.as_op_command().execute(repo).await
    }

    pub fn submit(self, controller: &PermissionController) {
        self.as_op_command().submit(controller)
    }
}
