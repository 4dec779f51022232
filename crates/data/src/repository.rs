//! Permission repository
//!
//! Owns one [`ObservableCache`] per node type. Factories capture clones of
//! the caches below them, so asking for a node pulls in (and shares) every
//! node it depends on.

use std::sync::Arc;
use std::time::Instant;

use permctl_core::{ControllerConfig, Uid, UserId};
use permctl_platform::Platform;
use permctl_reactive::{MemoryPressure, ObservableCache};
use tracing::debug;

use crate::keys::{AppPermGroupKey, OpUsageKey, PackageKey, PackageScoped, PermGroupKey, UidKey, UserKey};
use crate::nodes::{
    all_packages, auto_revoke_state, light_app_perm_group, op_usage, package_info, perm_group,
    perm_groups_packages, perm_groups_summary, perm_state, ui_info, user_packages, user_sensitive,
    users, AllPackagesNode, AppPermGroupUiInfoNode, AutoRevokeStateNode, LightAppPermGroupNode,
    NodeEnv, OpUsageNode, PackageInfoNode, PermGroupNode, PermGroupsPackagesNode,
    PermGroupsUiSummaryNode, PermStateNode, UserPackagesNode, UserSensitiveFlagsNode, UsersNode,
};

pub struct PermissionRepository {
    env: Arc<NodeEnv>,
    package_info: ObservableCache<PackageKey, PackageInfoNode>,
    perm_group: ObservableCache<PermGroupKey, PermGroupNode>,
    perm_state: ObservableCache<AppPermGroupKey, PermStateNode>,
    light_app_perm_group: ObservableCache<AppPermGroupKey, LightAppPermGroupNode>,
    user_sensitive: ObservableCache<UidKey, UserSensitiveFlagsNode>,
    ui_info: ObservableCache<AppPermGroupKey, AppPermGroupUiInfoNode>,
    auto_revoke_state: ObservableCache<PackageKey, AutoRevokeStateNode>,
    users: ObservableCache<(), UsersNode>,
    user_packages: ObservableCache<UserKey, UserPackagesNode>,
    all_packages: ObservableCache<(), AllPackagesNode>,
    perm_groups_packages: ObservableCache<(), PermGroupsPackagesNode>,
    perm_groups_summary: ObservableCache<(), PermGroupsUiSummaryNode>,
    op_usage: ObservableCache<OpUsageKey, OpUsageNode>,
}

fn check_user(user: UserId, what: &str) {
    assert!(user.is_valid(), "{} requested for invalid user {}", what, user);
}

impl PermissionRepository {
    pub fn new(env: Arc<NodeEnv>) -> Self {
        let config = env.config.cache.clone();

        let e = Arc::clone(&env);
        let package_info = ObservableCache::new("package_info", config.clone(), move |key, evictor| {
            package_info::build(&e, key, evictor)
        });

        let e = Arc::clone(&env);
        let perm_group = ObservableCache::new("perm_group", config.clone(), move |key, evictor| {
            perm_group::build(&e, key, evictor)
        });

        let (e, packages, groups) = (Arc::clone(&env), package_info.clone(), perm_group.clone());
        let perm_state = ObservableCache::new("perm_state", config.clone(), move |key: &AppPermGroupKey, evictor| {
            perm_state::build(&e, key, evictor, packages.get(&key.package_key()), groups.get(&key.group_key()))
        });

        let (e, packages, groups, states) = (
            Arc::clone(&env),
            package_info.clone(),
            perm_group.clone(),
            perm_state.clone(),
        );
        let light_app_perm_group = ObservableCache::new(
            "light_app_perm_group",
            config.clone(),
            move |key: &AppPermGroupKey, _| {
                light_app_perm_group::build(
                    &e,
                    key,
                    packages.get(&key.package_key()),
                    groups.get(&key.group_key()),
                    states.get(key),
                )
            },
        );

        let e = Arc::clone(&env);
        let user_sensitive = ObservableCache::new("user_sensitive", config.clone(), move |key, evictor| {
            user_sensitive::build(&e, key, evictor)
        });

        let (e, packages, groups, states, sensitivity) = (
            Arc::clone(&env),
            package_info.clone(),
            perm_group.clone(),
            perm_state.clone(),
            user_sensitive.clone(),
        );
        let ui_info = ObservableCache::new("ui_info", config.clone(), move |key: &AppPermGroupKey, _| {
            ui_info::build(
                &e,
                key,
                packages.get(&key.package_key()),
                groups.get(&key.group_key()),
                states.get(key),
                sensitivity.clone(),
            )
        });

        let (e, packages, states) = (Arc::clone(&env), package_info.clone(), perm_state.clone());
        let auto_revoke_state = ObservableCache::new("auto_revoke_state", config.clone(), move |key, evictor| {
            auto_revoke_state::build(&e, key, evictor, packages.get(key), states.clone())
        });

        let e = Arc::clone(&env);
        let users = ObservableCache::new("users", config.clone(), move |_: &(), _| users::build(&e));

        let e = Arc::clone(&env);
        let user_packages = ObservableCache::new("user_packages", config.clone(), move |key, evictor| {
            user_packages::build(&e, key, evictor)
        });

        let (e, all_users, per_user) = (Arc::clone(&env), users.clone(), user_packages.clone());
        let all_packages = ObservableCache::new("all_packages", config.clone(), move |_: &(), _| {
            all_packages::build(&e, all_users.get(&()), per_user.clone())
        });

        let (e, all, groups) = (Arc::clone(&env), all_packages.clone(), perm_group.clone());
        let perm_groups_packages = ObservableCache::new("perm_groups_packages", config.clone(), move |_: &(), _| {
            perm_groups_packages::build(&e, all.get(&()), groups.clone())
        });

        let (e, index, infos) = (Arc::clone(&env), perm_groups_packages.clone(), ui_info.clone());
        let perm_groups_summary = ObservableCache::new("perm_groups_summary", config.clone(), move |_: &(), _| {
            perm_groups_summary::build(&e, index.get(&()), infos.clone())
        });

        let e = Arc::clone(&env);
        let op_usage = ObservableCache::new("op_usage", config, move |key, _| op_usage::build(&e, key));

        Self {
            env,
            package_info,
            perm_group,
            perm_state,
            light_app_perm_group,
            user_sensitive,
            ui_info,
            auto_revoke_state,
            users,
            user_packages,
            all_packages,
            perm_groups_packages,
            perm_groups_summary,
            op_usage,
        }
    }

    pub fn env(&self) -> &Arc<NodeEnv> {
        &self.env
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.env.platform
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.env.config
    }

    pub fn package_info(&self, package: &str, user: UserId) -> PackageInfoNode {
        check_user(user, "package info");
        self.package_info.get(&PackageKey::new(package, user))
    }

    pub fn perm_group(&self, group: &str) -> PermGroupNode {
        self.perm_group.get(&PermGroupKey(group.to_string()))
    }

    pub fn perm_state(&self, package: &str, group: &str, user: UserId) -> PermStateNode {
        check_user(user, "permission state");
        self.perm_state.get(&AppPermGroupKey::new(package, group, user))
    }

    pub fn light_app_perm_group(&self, package: &str, group: &str, user: UserId) -> LightAppPermGroupNode {
        check_user(user, "app permission group");
        self.light_app_perm_group.get(&AppPermGroupKey::new(package, group, user))
    }

    pub fn user_sensitive_flags(&self, uid: Uid) -> UserSensitiveFlagsNode {
        self.user_sensitive.get(&UidKey::of(uid))
    }

    pub fn ui_info(&self, package: &str, group: &str, user: UserId) -> AppPermGroupUiInfoNode {
        check_user(user, "UI info");
        self.ui_info.get(&AppPermGroupKey::new(package, group, user))
    }

    pub fn auto_revoke_state(&self, package: &str, user: UserId) -> AutoRevokeStateNode {
        check_user(user, "auto-revoke state");
        self.auto_revoke_state.get(&PackageKey::new(package, user))
    }

    pub fn users(&self) -> UsersNode {
        self.users.get(&())
    }

    pub fn user_packages(&self, user: UserId) -> UserPackagesNode {
        check_user(user, "user packages");
        self.user_packages.get(&UserKey(user))
    }

    pub fn all_packages(&self) -> AllPackagesNode {
        self.all_packages.get(&())
    }

    pub fn perm_groups_packages(&self) -> PermGroupsPackagesNode {
        self.perm_groups_packages.get(&())
    }

    pub fn perm_groups_summary(&self) -> PermGroupsUiSummaryNode {
        self.perm_groups_summary.get(&())
    }

    pub fn op_usage<I, S>(&self, ops: I) -> OpUsageNode
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.op_usage.get(&OpUsageKey::new(ops))
    }

    /// Drop every cached node of the package, for every user. Returns the number dropped.
    pub fn invalidate_package(&self, package: &str) -> usize {
        let removed = self.package_info.invalidate_all_matching(|k| k.package() == package)
            + self.perm_state.invalidate_all_matching(|k| k.package() == package)
            + self.light_app_perm_group.invalidate_all_matching(|k| k.package() == package)
            + self.ui_info.invalidate_all_matching(|k| k.package() == package)
            + self.auto_revoke_state.invalidate_all_matching(|k| k.package() == package);
        debug!("Invalidated {} nodes of {}", removed, package);
        removed
    }

    pub fn on_memory_pressure(&self, level: MemoryPressure) -> usize {
        self.trim_at(level, Instant::now())
    }

    /// Trim every cache as if `level` was signalled at `now`
    pub fn trim_at(&self, level: MemoryPressure, now: Instant) -> usize {
        let removed = self.package_info.trim_at(level, now)
            + self.perm_group.trim_at(level, now)
            + self.perm_state.trim_at(level, now)
            + self.light_app_perm_group.trim_at(level, now)
            + self.user_sensitive.trim_at(level, now)
            + self.ui_info.trim_at(level, now)
            + self.auto_revoke_state.trim_at(level, now)
            + self.users.trim_at(level, now)
            + self.user_packages.trim_at(level, now)
            + self.all_packages.trim_at(level, now)
            + self.perm_groups_packages.trim_at(level, now)
            + self.perm_groups_summary.trim_at(level, now)
            + self.op_usage.trim_at(level, now);
        if removed > 0 {
            debug!("{:?} trimmed {} nodes", level, removed);
        }
        removed
    }

    /// Cached node count across every cache
    pub fn cached_nodes(&self) -> usize {
        self.package_info.len()
            + self.perm_group.len()
            + self.perm_state.len()
            + self.light_app_perm_group.len()
            + self.user_sensitive.len()
            + self.ui_info.len()
            + self.auto_revoke_state.len()
            + self.users.len()
            + self.user_packages.len()
            + self.all_packages.len()
            + self.perm_groups_packages.len()
            + self.perm_groups_summary.len()
            + self.op_usage.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AppPermGroupUiInfo, PermGrantState};
    use crate::nodes::testing::Harness;
    use permctl_core::{PackageChange, PlatformEvent};
    use permctl_platform::{names, LightPackageInfo, PermissionFlags};

    fn repository(harness: &Harness) -> PermissionRepository {
        PermissionRepository::new(Arc::clone(&harness.env))
    }

    fn camera_app(package: &str, uid: Uid, granted: bool) -> LightPackageInfo {
        LightPackageInfo::new(package, uid)
            .with_target_sdk(30)
            .with_requested(names::CAMERA, granted)
    }

    #[test]
    fn test_equal_keys_share_nodes() {
        let harness = Harness::new();
        let repo = repository(&harness);
        let first = repo.ui_info("com.example", names::GROUP_CAMERA, UserId::SYSTEM);
        let second = repo.ui_info("com.example", names::GROUP_CAMERA, UserId::SYSTEM);
        assert!(first.ptr_eq(&second));
        assert!(repo
            .perm_state("com.example", names::GROUP_CAMERA, UserId::SYSTEM)
            .ptr_eq(&repo.perm_state("com.example", names::GROUP_CAMERA, UserId::SYSTEM)));
        assert!(repo.users().ptr_eq(&repo.users()));
    }

    #[test]
    #[should_panic(expected = "invalid user")]
    fn test_null_user_panics() {
        let harness = Harness::new();
        repository(&harness).package_info("com.example", UserId::NULL);
    }

    #[test]
    fn test_camera_denied_end_to_end() {
        let harness = Harness::new();
        harness.fake.install(camera_app("com.example", 10_001, false));
        let repo = repository(&harness);

        let info = harness
            .settle(&repo.ui_info("com.example", names::GROUP_CAMERA, UserId::SYSTEM))
            .unwrap();
        assert_eq!(
            *info,
            AppPermGroupUiInfo {
                should_show: true,
                grant_state: PermGrantState::Denied,
                is_system: false,
            }
        );
        let group = harness
            .settle(&repo.light_app_perm_group("com.example", names::GROUP_CAMERA, UserId::SYSTEM))
            .unwrap();
        assert!(!group.is_granted());
    }

    #[test]
    fn test_package_removal_cascade() {
        let harness = Harness::new();
        harness.fake.install(camera_app("com.example", 10_001, true));
        let repo = repository(&harness);
        let ui_info = repo.ui_info("com.example", names::GROUP_CAMERA, UserId::SYSTEM);
        harness.settle(&ui_info);
        harness.settle(&repo.auto_revoke_state("com.example", UserId::SYSTEM));
        let package = repo.package_info("com.example", UserId::SYSTEM);

        harness.fake.uninstall("com.example", UserId::SYSTEM).unwrap();
        harness.env.hubs.route(&PlatformEvent::Package {
            change: PackageChange::Removed,
            package: "com.example".into(),
            uid: 10_001,
        });
        assert!(repo.invalidate_package("com.example") >= 4);
        assert!(harness.wait(|| package.is_initialized() && package.value().is_none()));
        assert!(harness.wait(|| ui_info.value().is_none()));

        let fresh = repo.ui_info("com.example", names::GROUP_CAMERA, UserId::SYSTEM);
        assert!(!fresh.ptr_eq(&ui_info));
    }

    #[test]
    fn test_removal_drops_every_user() {
        let harness = Harness::new();
        harness.fake.install(camera_app("com.example", 10_001, true));
        let repo = repository(&harness);
        let owner = repo.perm_state("com.example", names::GROUP_CAMERA, UserId::SYSTEM);
        let work = repo.perm_state("com.example", names::GROUP_CAMERA, UserId(10));
        let other = repo.perm_state("com.other", names::GROUP_CAMERA, UserId::SYSTEM);

        assert_eq!(repo.invalidate_package("com.example"), 4);
        assert!(!repo.perm_state("com.example", names::GROUP_CAMERA, UserId::SYSTEM).ptr_eq(&owner));
        assert!(!repo.perm_state("com.example", names::GROUP_CAMERA, UserId(10)).ptr_eq(&work));
        assert!(repo.perm_state("com.other", names::GROUP_CAMERA, UserId::SYSTEM).ptr_eq(&other));
    }

    #[test]
    fn test_shared_uid_sensitivity() {
        let harness = Harness::new();
        harness.fake.install(camera_app("com.shared.a", 10_300, true));
        harness.fake.install(camera_app("com.shared.b", 10_300, true));
        harness
            .fake
            .set_permission_flags("com.shared.b", names::CAMERA, UserId::SYSTEM, PermissionFlags::empty())
            .unwrap();
        let repo = repository(&harness);

        let flags = harness.settle(&repo.user_sensitive_flags(10_300)).unwrap();
        assert!(flags.is_user_sensitive(names::CAMERA, true));
        let info = harness
            .settle(&repo.ui_info("com.shared.b", names::GROUP_CAMERA, UserId::SYSTEM))
            .unwrap();
        assert!(!info.is_system);
    }

    #[test]
    fn test_summary_counts_shown_and_granted() {
        let harness = Harness::new();
        harness.fake.install(camera_app("com.a", 10_001, true));
        harness.fake.install(camera_app("com.b", 10_002, false));
        let repo = repository(&harness);

        let summary = harness.settle(&repo.perm_groups_summary()).unwrap();
        let camera = summary.groups[names::GROUP_CAMERA];
        assert_eq!((camera.shown, camera.granted), (2, 1));
        assert_eq!(summary.groups[names::GROUP_SMS].shown, 0);
    }

    #[test]
    fn test_pressure_trims_inactive_nodes() {
        let harness = Harness::new();
        harness.fake.install(camera_app("com.example", 10_001, false));
        let repo = repository(&harness);
        let node = repo.ui_info("com.example", names::GROUP_CAMERA, UserId::SYSTEM);
        let id = node.observe(|_| {});
        assert!(harness.wait(|| node.is_initialized()));
        assert_eq!(repo.on_memory_pressure(MemoryPressure::Complete), 0);

        node.remove_observer(id);
        assert_eq!(repo.on_memory_pressure(MemoryPressure::UiHidden), 0);
        assert!(repo.on_memory_pressure(MemoryPressure::Complete) >= 4);
        assert_eq!(repo.cached_nodes(), 0);
    }
}
