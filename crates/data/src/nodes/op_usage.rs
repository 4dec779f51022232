//! Op Usage Node
//!
//! Recent accesses per app-op, polled while observed.

use std::collections::BTreeMap;
use std::sync::Arc;

use permctl_reactive::{poll_while_active, AsyncReactiveValue, LoadOutcome};
use tracing::{debug, warn};

use super::{job, NodeEnv};
use crate::hubs::updater;
use crate::keys::OpUsageKey;
use crate::model::OpUsage;

/// Recent accesses of a set of app-ops.
///
/// Reloads on op broadcasts and, since access times change without one, on
/// a timer while observed. Ops the device does not know are left out.
pub type OpUsageNode = AsyncReactiveValue<OpUsage>;

pub fn build(env: &Arc<NodeEnv>, key: &OpUsageKey) -> OpUsageNode {
    let node: OpUsageNode = AsyncReactiveValue::new(&env.ctx, &env.pool, format!("OpUsage({})", key.ops.join(",")));
    let id = node.value_node().node_id();

    let app_ops = Arc::clone(&env.hubs.app_ops);
    let listener = updater(node.value_node());
    let ops = key.ops.clone();
    node.on_active(move |_| {
        for op in &ops {
            app_ops.add_op_listener(op, id, Arc::clone(&listener));
        }
    });
    let app_ops = Arc::clone(&env.hubs.app_ops);
    let ops = key.ops.clone();
    node.on_inactive(move |_| {
        for op in &ops {
            app_ops.remove_op_listener(op, id);
        }
    });

    poll_while_active(node.value_node(), &env.pool, env.config.poll.interval());

    let platform = Arc::clone(&env.platform);
    let ops = key.ops.clone();
    node.on_prepare(move |_| {
        let platform = Arc::clone(&platform);
        let ops = ops.clone();
        job(move |token| {
            let mut by_op = BTreeMap::new();
            for op in ops {
                if token.is_cancelled() {
                    return LoadOutcome::Skip;
                }
                match platform.op_accesses(&op) {
                    Ok(accesses) => {
                        by_op.insert(op, accesses);
                    }
                    Err(e) if e.is_recoverable() => debug!("Leaving out {}: {}", op, e),
                    Err(e) => {
                        warn!("Reading accesses of {} failed: {}", op, e);
                        return LoadOutcome::Skip;
                    }
                }
            }
            LoadOutcome::Value(Some(OpUsage { by_op }))
        })
    });
    node
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::Harness;
    use chrono::Utc;
    use permctl_core::ControllerConfig;
    use permctl_platform::{names, OpAccess};

    fn access(op: &str, package: &str, running: bool) -> OpAccess {
        OpAccess {
            op: op.into(),
            package_name: package.into(),
            uid: 10_001,
            last_access: Some(Utc::now()),
            is_running: running,
        }
    }

    #[test]
    fn test_unsupported_ops_are_left_out() {
        let harness = Harness::new();
        harness.fake.mark_op_unsupported(names::OP_FINE_LOCATION);
        harness.fake.record_op_access(access(names::OP_CAMERA, "com.example", true));

        let node = build(&harness.env, &OpUsageKey::new([names::OP_CAMERA, names::OP_FINE_LOCATION]));
        let usage = harness.settle(&node).unwrap();
        assert_eq!(usage.by_op.len(), 1);
        assert_eq!(usage.running_packages(), vec!["com.example"]);
        assert_eq!(harness.fake.app_op_listener_registrations(names::OP_CAMERA), 1);
    }

    #[test]
    fn test_polls_while_observed() {
        let mut config = ControllerConfig::default();
        config.poll.interval_ms = 20;
        let harness = Harness::with_config(config);
        let node = build(&harness.env, &OpUsageKey::new([names::OP_RECORD_AUDIO]));
        harness.settle(&node);
        let runs = node.job_runs();

        harness.fake.record_op_access(access(names::OP_RECORD_AUDIO, "com.recorder", false));
        assert!(harness.wait(|| {
            node.job_runs() > runs
                && node
                    .value()
                    .map(|usage| !usage.by_op[names::OP_RECORD_AUDIO].is_empty())
                    .unwrap_or(false)
        }));
    }
}
