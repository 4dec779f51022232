//! Periodic refresh for signals the platform never announces

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use permctl_core::BackgroundPool;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::value::ReactiveValue;

/// Recompute `value` every `period` while it is active.
///
/// The timer runs on the pool and posts each recompute to the main context.
/// It starts when the node becomes active and stops when it goes inactive.
pub fn poll_while_active<T>(value: &ReactiveValue<T>, pool: &Arc<BackgroundPool>, period: Duration)
where
    T: Send + Sync + 'static,
{
    let running: Arc<Mutex<Option<CancellationToken>>> = Arc::new(Mutex::new(None));

    let pool = Arc::clone(pool);
    let slot = Arc::clone(&running);
    value.on_active(move |node| {
        let token = CancellationToken::new();
        if let Some(previous) = slot.lock().replace(token.clone()) {
            previous.cancel();
        }
        let weak = node.downgrade();
        let ctx = node.context().clone();
        pool.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let target = weak.clone();
                        let tick_token = token.clone();
                        let posted = ctx.post(move || {
                            if tick_token.is_cancelled() {
                                return;
                            }
                            if let Some(node) = target.upgrade() {
                                node.update();
                            }
                        });
                        if posted.is_err() {
                            break;
                        }
                    }
                }
            }
            trace!("poller stopped");
        });
    });

    value.on_inactive(move |_| {
        if let Some(token) = running.lock().take() {
            token.cancel();
        }
    });
}
