//! Background reconciliation of active tasks against their nodes.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dispatcher::Dispatcher;

/// Poll hosting nodes every `interval` until `shutdown` fires. Each tick
/// also evicts finished tasks past their retention.
pub fn spawn_reconciler(
    interval: Duration,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let updated = dispatcher.reconcile_once().await;
                    if updated > 0 {
                        info!(updated, "Reconciled task states");
                    }
                    let evicted = dispatcher.state().evict_finished(dispatcher.config().task_retention).await;
                    if evicted > 0 {
                        debug!(evicted, "Evicted finished tasks");
                    }
                }
            }
        }
        debug!("Reconciler stopped");
    })
}
