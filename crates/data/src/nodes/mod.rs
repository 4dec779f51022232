//! Derived data nodes
//!
//! One module per node type. Each exposes a type alias for the node and a
//! `build` function used as the factory of its repository cache. Nodes read
//! their sources, wait while one is uninitialized, and publish one composite
//! snapshot.

pub mod all_packages;
pub mod auto_revoke_state;
pub mod light_app_perm_group;
pub mod op_usage;
pub mod package_info;
pub mod perm_group;
pub mod perm_groups_packages;
pub mod perm_groups_summary;
pub mod perm_state;
pub mod ui_info;
pub mod user_packages;
pub mod user_sensitive;
pub mod users;

use std::fmt;
use std::sync::Arc;

use permctl_core::{BackgroundPool, ControllerConfig, MainContext, Result};
use permctl_platform::Platform;
use permctl_reactive::{AsyncReactiveValue, Evictor, LoadJob, LoadOutcome};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::hubs::ChangeHubs;

pub use all_packages::AllPackagesNode;
pub use auto_revoke_state::AutoRevokeStateNode;
pub use light_app_perm_group::LightAppPermGroupNode;
pub use op_usage::OpUsageNode;
pub use package_info::PackageInfoNode;
pub use perm_group::PermGroupNode;
pub use perm_groups_packages::PermGroupsPackagesNode;
pub use perm_groups_summary::PermGroupsUiSummaryNode;
pub use perm_state::PermStateNode;
pub use ui_info::AppPermGroupUiInfoNode;
pub use user_packages::UserPackagesNode;
pub use user_sensitive::UserSensitiveFlagsNode;
pub use users::UsersNode;

/// Everything a node needs besides its sources
pub struct NodeEnv {
    pub ctx: MainContext,
    pub pool: Arc<BackgroundPool>,
    pub platform: Arc<dyn Platform>,
    pub hubs: Arc<ChangeHubs>,
    pub config: ControllerConfig,
}

impl NodeEnv {
    pub fn new(
        ctx: MainContext,
        pool: Arc<BackgroundPool>,
        platform: Arc<dyn Platform>,
        config: ControllerConfig,
    ) -> Self {
        let hubs = Arc::new(ChangeHubs::new(&platform));
        Self {
            ctx,
            pool,
            platform,
            hubs,
            config,
        }
    }
}

/// Box a background load
pub(crate) fn job<T, F>(load: F) -> Option<LoadJob<T>>
where
    T: Send + 'static,
    F: FnOnce(&CancellationToken) -> LoadOutcome<T> + Send + 'static,
{
    let job: LoadJob<T> = Box::new(load);
    Some(job)
}

/// Map a platform query onto a load outcome
pub(crate) fn outcome<T>(what: &dyn fmt::Display, result: Result<T>) -> LoadOutcome<T> {
    match result {
        Ok(value) => LoadOutcome::Value(Some(value)),
        Err(e) if e.is_not_found() => {
            debug!("{} is gone: {}", what, e);
            LoadOutcome::NotFound
        }
        Err(e) => {
            warn!("Loading {} failed: {}", what, e);
            LoadOutcome::Skip
        }
    }
}

/// Drop the node from its cache once its entity turns out to be gone
pub(crate) fn evict_when_gone<T: Send + Sync + 'static>(node: &AsyncReactiveValue<T>, evictor: Evictor) {
    let id = node.value_node().node_id();
    node.on_not_found(move || evictor.evict(id));
}
