//! Second-line timeout monitor (spec.md §4.2 "Timeout monitor"): a periodic
//! sweep of the active-execution index, independent of the per-invocation
//! HTTP client timeout.

use std::time::Duration;

use log::warn;
use tokio::time::interval;
use uuid::Uuid;

use crate::models::ExecutionStatus;

use super::Scheduler;

impl Scheduler {
    pub fn spawn_timeout_monitor(self: &std::sync::Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(10));
            loop {
                ticker.tick().await;
                this.sweep_timeouts().await;
            }
        });
    }

    /// Reclaims any active execution that has been running longer than the
    /// configured threshold. Racing with a concurrent result-callback
    /// transition is resolved by `finish_execution`'s idempotent semantics:
    /// whichever writes first wins, the other is a no-op (spec.md §8
    /// boundary behaviour).
    pub(super) async fn sweep_timeouts(self: &std::sync::Arc<Self>) {
        let threshold = Duration::from_secs(self.settings.timeout_monitor_threshold_secs);

        let stale: Vec<(Uuid, Uuid)> = self
            .active
            .iter()
            .filter(|entry| entry.value().started.elapsed() > threshold)
            .map(|entry| (*entry.key(), entry.value().vm_id))
            .collect();

        for (execution_id, vm_id) in stale {
            match self
                .db
                .finish_execution(
                    execution_id,
                    ExecutionStatus::Timeout,
                    None,
                    Some("timeout monitor: no result within threshold".into()),
                )
                .await
            {
                Ok(true) => {
                    warn!("timeout monitor reclaiming execution {execution_id} on vm {vm_id}");
                    let _ = self.pool.terminate(vm_id).await;
                }
                Ok(false) => {}
                Err(e) => warn!("timeout monitor failed to finalize execution {execution_id}: {e}"),
            }
            self.active.remove(&execution_id);
        }
    }
}
