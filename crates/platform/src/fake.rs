//! In-memory platform
//!
//! A complete [`Platform`](crate::services::Platform) backed by plain maps.
//! Mutations emit the matching [`PlatformEvent`] on the event bus, but only
//! while the corresponding receiver or listener is registered, as the OS
//! would. Used by tests and the demo binary.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use permctl_core::ids;
use permctl_core::{EventBus, PackageChange, PermctlError, PlatformEvent, Result, Uid, UserId};
use tracing::{debug, trace};

use crate::model::{
    AppOpMode, LightPackageInfo, LightPermGroupInfo, LightPermInfo, OpAccess, PermGroup,
    PermissionFlags,
};
use crate::permissions;
use crate::services::{AppOpsManager, PackageManager, PlatformEvents, UsageStats, UserManager};

struct Installed {
    info: LightPackageInfo,
    flags: HashMap<String, PermissionFlags>,
}

#[derive(Default)]
struct FakeState {
    packages: BTreeMap<(UserId, String), Installed>,
    op_modes: HashMap<(String, Uid, String), AppOpMode>,
    op_accesses: HashMap<String, Vec<OpAccess>>,
    unsupported_ops: HashSet<String>,
    users: BTreeSet<UserId>,
    last_used: HashMap<(String, UserId), DateTime<Utc>>,
}

#[derive(Default)]
struct Registrations {
    package_receiver: usize,
    permission_listener: usize,
    app_op_listeners: HashMap<String, usize>,
    user_receiver: usize,
    register_calls: usize,
}

/// Platform double keeping all state in memory
pub struct FakePlatform {
    state: Mutex<FakeState>,
    registrations: Mutex<Registrations>,
    bus: Arc<EventBus>,
    package_queries: AtomicUsize,
}

impl FakePlatform {
    /// Platform with only the system user
    pub fn new(bus: Arc<EventBus>) -> Self {
        let mut state = FakeState::default();
        state.users.insert(UserId::SYSTEM);
        Self {
            state: Mutex::new(state),
            registrations: Mutex::new(Registrations::default()),
            bus,
            package_queries: AtomicUsize::new(0),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    fn emit_package(&self, change: PackageChange, package: &str, uid: Uid) {
        if self.registrations.lock().package_receiver > 0 {
            self.bus.emit(PlatformEvent::Package {
                change,
                package: package.to_string(),
                uid,
            });
        } else {
            trace!("No package receiver, dropping {:?} of {}", change, package);
        }
    }

    fn emit_permissions_changed(&self, uid: Uid) {
        if self.registrations.lock().permission_listener > 0 {
            self.bus.emit(PlatformEvent::PermissionsChanged { uid });
        }
    }

    fn emit_app_op(&self, event: PlatformEvent, op: &str) {
        let listening = self
            .registrations
            .lock()
            .app_op_listeners
            .get(op)
            .copied()
            .unwrap_or(0)
            > 0;
        if listening {
            self.bus.emit(event);
        }
    }

    fn emit_user(&self, event: PlatformEvent) {
        if self.registrations.lock().user_receiver > 0 {
            self.bus.emit(event);
        }
    }

    /// Install a package for the user encoded in its uid.
    ///
    /// Runtime permissions of app uids start out user-sensitive both ways.
    pub fn install(&self, info: LightPackageInfo) {
        let (package, uid) = (info.package_name.clone(), info.uid);
        let flags: HashMap<String, PermissionFlags> = if ids::is_system_uid(uid) {
            HashMap::new()
        } else {
            info.requested_permissions
                .keys()
                .filter(|p| permissions::is_runtime_platform_permission(p))
                .map(|p| (p.clone(), PermissionFlags::USER_SENSITIVE_MASK))
                .collect()
        };
        let replaced = {
            let mut state = self.state.lock();
            state.users.insert(info.user());
            state
                .packages
                .insert((info.user(), package.clone()), Installed { info, flags })
                .is_some()
        };
        debug!("Fake install of {} (uid {})", package, uid);
        let change = if replaced {
            PackageChange::Replaced
        } else {
            PackageChange::Added
        };
        self.emit_package(change, &package, uid);
    }

    /// Replace package metadata, keeping permission flags
    pub fn update_package(&self, info: LightPackageInfo) -> Result<()> {
        let (package, uid) = (info.package_name.clone(), info.uid);
        {
            let mut state = self.state.lock();
            let installed = state
                .packages
                .get_mut(&(info.user(), package.clone()))
                .ok_or_else(|| PermctlError::package_not_found(&package))?;
            installed.info = info;
        }
        self.emit_package(PackageChange::Changed, &package, uid);
        Ok(())
    }

    pub fn uninstall(&self, package: &str, user: UserId) -> Result<()> {
        let removed = self
            .state
            .lock()
            .packages
            .remove(&(user, package.to_string()))
            .ok_or_else(|| PermctlError::package_not_found(package))?;
        debug!("Fake uninstall of {} for {}", package, user);
        self.emit_package(PackageChange::Removed, package, removed.info.uid);
        Ok(())
    }

    /// Overwrite all flags of one permission
    pub fn set_permission_flags(
        &self,
        package: &str,
        permission: &str,
        user: UserId,
        flags: PermissionFlags,
    ) -> Result<()> {
        let uid = {
            let mut state = self.state.lock();
            let installed = state
                .packages
                .get_mut(&(user, package.to_string()))
                .ok_or_else(|| PermctlError::package_not_found(package))?;
            installed.flags.insert(permission.to_string(), flags);
            installed.info.uid
        };
        self.emit_permissions_changed(uid);
        Ok(())
    }

    pub fn set_op_mode(&self, op: &str, uid: Uid, package: &str, mode: AppOpMode) {
        self.state
            .lock()
            .op_modes
            .insert((op.to_string(), uid, package.to_string()), mode);
        self.emit_app_op(
            PlatformEvent::AppOpChanged {
                op: op.to_string(),
                uid,
                package: package.to_string(),
            },
            op,
        );
    }

    /// Record an access, replacing any earlier one for the same package
    pub fn record_op_access(&self, access: OpAccess) {
        let event = PlatformEvent::AppOpActive {
            op: access.op.clone(),
            uid: access.uid,
            package: access.package_name.clone(),
            active: access.is_running,
        };
        let op = access.op.clone();
        {
            let mut state = self.state.lock();
            let accesses = state.op_accesses.entry(op.clone()).or_default();
            accesses.retain(|a| !(a.package_name == access.package_name && a.uid == access.uid));
            accesses.push(access);
        }
        self.emit_app_op(event, &op);
    }

    /// Make every query of `op` fail as unsupported
    pub fn mark_op_unsupported(&self, op: &str) {
        self.state.lock().unsupported_ops.insert(op.to_string());
    }

    pub fn add_user(&self, user: UserId) {
        if self.state.lock().users.insert(user) {
            self.emit_user(PlatformEvent::UserAdded { user });
        }
    }

    pub fn remove_user(&self, user: UserId) {
        let removed = {
            let mut state = self.state.lock();
            state.packages.retain(|(owner, _), _| *owner != user);
            state.users.remove(&user)
        };
        if removed {
            self.emit_user(PlatformEvent::UserRemoved { user });
        }
    }

    pub fn set_last_used(&self, package: &str, user: UserId, at: DateTime<Utc>) {
        self.state
            .lock()
            .last_used
            .insert((package.to_string(), user), at);
    }

    /// Package receivers currently registered
    pub fn package_receiver_registrations(&self) -> usize {
        self.registrations.lock().package_receiver
    }

    /// Permission listeners currently registered
    pub fn permission_listener_registrations(&self) -> usize {
        self.registrations.lock().permission_listener
    }

    pub fn app_op_listener_registrations(&self, op: &str) -> usize {
        self.registrations
            .lock()
            .app_op_listeners
            .get(op)
            .copied()
            .unwrap_or(0)
    }

    pub fn user_receiver_registrations(&self) -> usize {
        self.registrations.lock().user_receiver
    }

    /// Total register calls of any kind so far
    pub fn register_calls(&self) -> usize {
        self.registrations.lock().register_calls
    }

    /// Number of `package_info` queries served
    pub fn package_queries(&self) -> usize {
        self.package_queries.load(Ordering::Acquire)
    }

    fn custom_group(state: &FakeState, group: &str) -> Option<PermGroup> {
        let mut owner: Option<String> = None;
        let mut permission_infos: IndexMap<String, LightPermInfo> = IndexMap::new();
        for installed in state.packages.values() {
            for declared in &installed.info.declared_permissions {
                if declared.group.as_deref() == Some(group) {
                    owner.get_or_insert_with(|| installed.info.package_name.clone());
                    permission_infos.insert(declared.name.clone(), declared.clone());
                }
            }
        }
        owner.map(|package_name| PermGroup {
            group_info: LightPermGroupInfo {
                name: group.to_string(),
                package_name,
                is_single_permission: false,
            },
            permission_infos,
        })
    }
}

fn decrement(count: &mut usize) -> usize {
    *count = count.saturating_sub(1);
    *count
}

impl PackageManager for FakePlatform {
    fn package_info(&self, package: &str, user: UserId) -> Result<LightPackageInfo> {
        self.package_queries.fetch_add(1, Ordering::AcqRel);
        self.state
            .lock()
            .packages
            .get(&(user, package.to_string()))
            .map(|installed| installed.info.clone())
            .ok_or_else(|| PermctlError::package_not_found(package))
    }

    fn installed_packages(&self, user: UserId) -> Result<Vec<LightPackageInfo>> {
        let state = self.state.lock();
        if !state.users.contains(&user) {
            return Err(PermctlError::NotFound(format!("user {}", user)));
        }
        Ok(state
            .packages
            .iter()
            .filter(|((owner, _), _)| *owner == user)
            .map(|(_, installed)| installed.info.clone())
            .collect())
    }

    fn packages_for_uid(&self, uid: Uid) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .packages
            .values()
            .filter(|installed| installed.info.uid == uid)
            .map(|installed| installed.info.package_name.clone())
            .collect())
    }

    fn permission_group(&self, group: &str) -> Result<PermGroup> {
        if let Some(platform) = permissions::perm_group(group) {
            return Ok(platform);
        }
        Self::custom_group(&self.state.lock(), group)
            .ok_or_else(|| PermctlError::NotFound(format!("permission group {}", group)))
    }

    fn permission_flags(&self, permission: &str, package: &str, user: UserId) -> Result<PermissionFlags> {
        let state = self.state.lock();
        let installed = state
            .packages
            .get(&(user, package.to_string()))
            .ok_or_else(|| PermctlError::package_not_found(package))?;
        Ok(installed.flags.get(permission).copied().unwrap_or_default())
    }

    fn grant_runtime_permission(&self, package: &str, permission: &str, user: UserId) -> Result<()> {
        let uid = {
            let mut state = self.state.lock();
            let installed = state
                .packages
                .get_mut(&(user, package.to_string()))
                .ok_or_else(|| PermctlError::package_not_found(package))?;
            let granted = installed
                .info
                .requested_permissions
                .get_mut(permission)
                .ok_or_else(|| {
                    PermctlError::InvalidArgument(format!("{} does not request {}", package, permission))
                })?;
            *granted = true;
            installed.info.uid
        };
        self.emit_permissions_changed(uid);
        Ok(())
    }

    fn revoke_runtime_permission(&self, package: &str, permission: &str, user: UserId) -> Result<()> {
        let uid = {
            let mut state = self.state.lock();
            let installed = state
                .packages
                .get_mut(&(user, package.to_string()))
                .ok_or_else(|| PermctlError::package_not_found(package))?;
            if let Some(granted) = installed.info.requested_permissions.get_mut(permission) {
                *granted = false;
            }
            installed.info.uid
        };
        self.emit_permissions_changed(uid);
        Ok(())
    }

    fn update_permission_flags(
        &self,
        permission: &str,
        package: &str,
        mask: PermissionFlags,
        values: PermissionFlags,
        user: UserId,
    ) -> Result<()> {
        let uid = {
            let mut state = self.state.lock();
            let installed = state
                .packages
                .get_mut(&(user, package.to_string()))
                .ok_or_else(|| PermctlError::package_not_found(package))?;
            let flags = installed.flags.entry(permission.to_string()).or_default();
            *flags = (*flags & !mask) | (values & mask);
            installed.info.uid
        };
        self.emit_permissions_changed(uid);
        Ok(())
    }
}

impl AppOpsManager for FakePlatform {
    fn check_op(&self, op: &str, uid: Uid, package: &str) -> Result<AppOpMode> {
        let state = self.state.lock();
        if state.unsupported_ops.contains(op) {
            return Err(PermctlError::UnsupportedOp(op.to_string()));
        }
        Ok(state
            .op_modes
            .get(&(op.to_string(), uid, package.to_string()))
            .copied()
            .unwrap_or(AppOpMode::Default))
    }

    fn set_mode(&self, op: &str, uid: Uid, package: &str, mode: AppOpMode) -> Result<()> {
        if self.state.lock().unsupported_ops.contains(op) {
            return Err(PermctlError::UnsupportedOp(op.to_string()));
        }
        self.set_op_mode(op, uid, package, mode);
        Ok(())
    }

    fn op_accesses(&self, op: &str) -> Result<Vec<OpAccess>> {
        let state = self.state.lock();
        if state.unsupported_ops.contains(op) {
            return Err(PermctlError::UnsupportedOp(op.to_string()));
        }
        Ok(state.op_accesses.get(op).cloned().unwrap_or_default())
    }
}

impl UserManager for FakePlatform {
    fn user_profiles(&self) -> Result<Vec<UserId>> {
        Ok(self.state.lock().users.iter().copied().collect())
    }
}

impl UsageStats for FakePlatform {
    fn last_time_used(&self, package: &str, user: UserId) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .state
            .lock()
            .last_used
            .get(&(package.to_string(), user))
            .copied())
    }
}

impl PlatformEvents for FakePlatform {
    fn register_package_receiver(&self) {
        let mut registrations = self.registrations.lock();
        registrations.package_receiver += 1;
        registrations.register_calls += 1;
        debug!("Package receiver registered ({})", registrations.package_receiver);
    }

    fn unregister_package_receiver(&self) {
        let left = decrement(&mut self.registrations.lock().package_receiver);
        debug!("Package receiver unregistered ({})", left);
    }

    fn register_permission_listener(&self) {
        let mut registrations = self.registrations.lock();
        registrations.permission_listener += 1;
        registrations.register_calls += 1;
        debug!("Permission listener registered ({})", registrations.permission_listener);
    }

    fn unregister_permission_listener(&self) {
        let left = decrement(&mut self.registrations.lock().permission_listener);
        debug!("Permission listener unregistered ({})", left);
    }

    fn register_app_op_listener(&self, op: &str) {
        let mut registrations = self.registrations.lock();
        *registrations.app_op_listeners.entry(op.to_string()).or_default() += 1;
        registrations.register_calls += 1;
    }

    fn unregister_app_op_listener(&self, op: &str) {
        if let Some(count) = self.registrations.lock().app_op_listeners.get_mut(op) {
            decrement(count);
        }
    }

    fn register_user_receiver(&self) {
        let mut registrations = self.registrations.lock();
        registrations.user_receiver += 1;
        registrations.register_calls += 1;
    }

    fn unregister_user_receiver(&self) {
        decrement(&mut self.registrations.lock().user_receiver);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::names;

    fn platform() -> (FakePlatform, permctl_core::EventSubscription) {
        let bus = Arc::new(EventBus::new());
        let events = bus.subscribe();
        (FakePlatform::new(bus), events)
    }

    fn camera_app() -> LightPackageInfo {
        LightPackageInfo::new("com.example", 10_001)
            .with_target_sdk(30)
            .with_requested(names::CAMERA, false)
    }

    #[test]
    fn test_events_need_registration() {
        let (platform, events) = platform();
        platform.install(camera_app());
        assert!(events.try_recv().is_err());

        platform.register_package_receiver();
        platform.uninstall("com.example", UserId::SYSTEM).unwrap();
        assert_eq!(
            events.try_recv().unwrap(),
            PlatformEvent::Package {
                change: PackageChange::Removed,
                package: "com.example".into(),
                uid: 10_001,
            }
        );
    }

    #[test]
    fn test_grant_and_flags() {
        let (platform, events) = platform();
        platform.install(camera_app());
        platform.register_permission_listener();

        platform
            .grant_runtime_permission("com.example", names::CAMERA, UserId::SYSTEM)
            .unwrap();
        platform
            .update_permission_flags(
                names::CAMERA,
                "com.example",
                PermissionFlags::USER_SET | PermissionFlags::ONE_TIME,
                PermissionFlags::USER_SET,
                UserId::SYSTEM,
            )
            .unwrap();

        let info = platform.package_info("com.example", UserId::SYSTEM).unwrap();
        assert!(info.is_granted(names::CAMERA));
        assert_eq!(
            platform
                .permission_flags(names::CAMERA, "com.example", UserId::SYSTEM)
                .unwrap(),
            PermissionFlags::USER_SET | PermissionFlags::USER_SENSITIVE_MASK
        );
        assert_eq!(events.try_recv().unwrap(), PlatformEvent::PermissionsChanged { uid: 10_001 });
        assert!(platform
            .grant_runtime_permission("com.example", names::READ_SMS, UserId::SYSTEM)
            .is_err());
    }

    #[test]
    fn test_custom_group_comes_from_declaring_package() {
        let (platform, _events) = platform();
        let custom = LightPermInfo {
            name: "com.example.permission.SYNC".into(),
            package_name: "com.example".into(),
            group: Some("com.example.group.SYNC".into()),
            background_permission: None,
            protection: crate::model::ProtectionLevel::Dangerous,
            protection_flags: Default::default(),
        };
        platform.install(camera_app().with_declared(custom));

        let group = platform.permission_group("com.example.group.SYNC").unwrap();
        assert_eq!(group.group_info.package_name, "com.example");
        assert!(platform.permission_group("com.other.group").unwrap_err().is_not_found());
    }

    #[test]
    fn test_unsupported_op() {
        let (platform, _events) = platform();
        platform.mark_op_unsupported(names::OP_CAMERA);
        let err = platform.op_accesses(names::OP_CAMERA).unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(
            platform.check_op(names::OP_RECORD_AUDIO, 10_001, "com.example").unwrap(),
            AppOpMode::Default
        );
    }
}
