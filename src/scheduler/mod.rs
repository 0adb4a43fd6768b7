//! Scheduler (spec.md §4.2): turns an invocation request into a completed
//! execution record, handling sync vs async, timeouts, and VM lifecycle.

mod queue;
mod timeout_monitor;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::{error, warn};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::agent::{AgentClient, AgentError, DispatchPayload};
use crate::db::{Db, DbError};
use crate::models::{Execution, ExecutionStatus, Function};
use crate::registry::{FunctionRegistry, RegistryError};
use crate::vm::VmPoolManager;

pub use queue::WorkItem;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("function not found")]
    FunctionNotFound,
    #[error("execution not found")]
    ExecutionNotFound,
    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),
    #[error("dispatch failed: {0}")]
    DispatchFailed(String),
    #[error("execution timed out")]
    ExecutionTimeout,
    #[error("async queue full")]
    QueueFull,
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Db(#[from] DbError),
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

impl From<RegistryError> for SchedulerError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound => SchedulerError::FunctionNotFound,
            RegistryError::AlreadyExists(name) => SchedulerError::Internal(format!("unexpected conflict: {name}")),
            RegistryError::Db(db) => SchedulerError::Db(db),
        }
    }
}

impl From<crate::vm::VmError> for SchedulerError {
    fn from(e: crate::vm::VmError) -> Self {
        SchedulerError::CapacityExhausted(e.to_string())
    }
}

/// Outcome of `schedule`/`schedule_by_name`/`get_result` (spec.md §4.2
/// "InvocationResult contract").
#[derive(Debug, Clone)]
pub enum InvocationResult {
    Accepted { execution_id: Uuid },
    Processing { execution_id: Uuid },
    Terminal(Execution),
}

impl InvocationResult {
    fn from_execution(execution: Execution) -> Self {
        if execution.status.is_terminal() {
            InvocationResult::Terminal(execution)
        } else {
            InvocationResult::Processing { execution_id: execution.id }
        }
    }
}

/// Settings the scheduler needs at construction; a view over
/// `crate::config::Settings`.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub async_queue_capacity: usize,
    pub async_worker_count: usize,
    pub sync_poll_interval_ms: u64,
    pub sync_poll_max_attempts: u32,
    pub timeout_monitor_threshold_secs: u64,
}

struct ActiveEntry {
    vm_id: Uuid,
    started: Instant,
}

pub struct Scheduler {
    db: Db,
    pool: Arc<VmPoolManager>,
    registry: Arc<FunctionRegistry>,
    settings: SchedulerSettings,
    active: DashMap<Uuid, ActiveEntry>,
    queue_tx: mpsc::Sender<WorkItem>,
    queue_rx: Mutex<Option<mpsc::Receiver<WorkItem>>>,
}

impl Scheduler {
    pub fn new(
        db: Db,
        pool: Arc<VmPoolManager>,
        registry: Arc<FunctionRegistry>,
        settings: SchedulerSettings,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = queue::channel(settings.async_queue_capacity);
        Arc::new(Self {
            db,
            pool,
            registry,
            settings,
            active: DashMap::new(),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
        })
    }

    /// Spawns the async worker pool (spec.md §4.2 "a pool of worker
    /// contexts"). Call once at startup, after construction.
    pub fn spawn_workers(self: &Arc<Self>) {
        let rx = self
            .queue_rx
            .try_lock()
            .expect("spawn_workers called concurrently with itself")
            .take()
            .expect("spawn_workers called more than once");
        let rx = Arc::new(Mutex::new(rx));

        for worker_id in 0..self.settings.async_worker_count {
            let this = self.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let item = { rx.lock().await.recv().await };
                    match item {
                        Some(item) => {
                            if let Err(e) = this
                                .run_to_completion(item.function, item.execution_id, item.input, item.context)
                                .await
                            {
                                warn!("worker {worker_id} invocation failed (persisted as terminal): {e}");
                            }
                        }
                        None => break,
                    }
                }
            });
        }
    }

    pub async fn schedule(
        self: &Arc<Self>,
        function_id: Uuid,
        input: Value,
        context: Option<Value>,
        sync: bool,
    ) -> SchedulerResult<InvocationResult> {
        let function = self.registry.get_metadata(function_id).await?;
        self.schedule_function(function, input, context, sync).await
    }

    pub async fn schedule_by_name(
        self: &Arc<Self>,
        function_name: &str,
        input: Value,
        context: Option<Value>,
        sync: bool,
    ) -> SchedulerResult<InvocationResult> {
        let function = self.registry.get_metadata_by_name(function_name).await?;
        self.schedule_function(function, input, context, sync).await
    }

    async fn schedule_function(
        self: &Arc<Self>,
        function: Function,
        input: Value,
        context: Option<Value>,
        sync: bool,
    ) -> SchedulerResult<InvocationResult> {
        if sync {
            let execution = Execution::new_pending(function.id);
            self.db.insert_execution(&execution).await?;
            self.run_to_completion(function, execution.id, input, context).await
        } else {
            // Reserve queue capacity before persisting anything: a `QueueFull`
            // rejection must leave no trace, not an orphaned `pending` row
            // that can never reach a terminal state (spec.md §8).
            let permit = match self.queue_tx.try_reserve() {
                Ok(permit) => permit,
                Err(mpsc::error::TrySendError::Full(())) => return Err(SchedulerError::QueueFull),
                Err(mpsc::error::TrySendError::Closed(())) => {
                    return Err(SchedulerError::Internal("work queue closed".into()))
                }
            };

            let execution = Execution::new_pending(function.id);
            self.db.insert_execution(&execution).await?;
            let execution_id = execution.id;
            permit.send(WorkItem { function, execution_id, input, context });
            Ok(InvocationResult::Accepted { execution_id })
        }
    }

    pub async fn get_result(&self, execution_id: Uuid) -> SchedulerResult<InvocationResult> {
        let execution = self.db.get_execution(execution_id).await.map_err(|e| match e {
            DbError::NotFound => SchedulerError::ExecutionNotFound,
            other => other.into(),
        })?;
        Ok(InvocationResult::from_execution(execution))
    }

    /// Steps 2-8 of spec.md §4.2 "Synchronous path", shared by the sync
    /// API handler and the async worker loop.
    async fn run_to_completion(
        self: &Arc<Self>,
        function: Function,
        execution_id: Uuid,
        input: Value,
        context: Option<Value>,
    ) -> SchedulerResult<InvocationResult> {
        let vm = match self.pool.lease().await {
            Ok(vm) => vm,
            Err(e) => {
                let _ = self
                    .db
                    .finish_execution(execution_id, ExecutionStatus::Failed, None, Some(format!("lease failed: {e}")))
                    .await;
                return Err(SchedulerError::CapacityExhausted(e.to_string()));
            }
        };

        self.db.mark_execution_running(execution_id, vm.id).await?;
        self.active.insert(execution_id, ActiveEntry { vm_id: vm.id, started: Instant::now() });

        let vm_ip: Ipv4Addr = match vm.ip_address.parse() {
            Ok(ip) => ip,
            Err(e) => {
                self.active.remove(&execution_id);
                let _ = self.pool.terminate(vm.id).await;
                return Err(SchedulerError::Internal(format!("malformed vm ip {}: {e}", vm.ip_address)));
            }
        };

        let payload = DispatchPayload::for_invocation(&function, execution_id, input, context);
        let client = AgentClient::new(Duration::from_secs(function.timeout_secs as u64 + 5));

        if let Err(e) = client.dispatch(vm_ip, &payload).await {
            self.active.remove(&execution_id);
            let reason = dispatch_error_reason(&e);
            let _ = self
                .db
                .finish_execution(execution_id, ExecutionStatus::Failed, None, Some(reason.clone()))
                .await;
            // Quarantine rather than return to the pool (spec.md §9: the
            // reference implementation is inconsistent here; quarantine is
            // prescribed as the safe default).
            let _ = self.pool.terminate(vm.id).await;
            return Err(SchedulerError::DispatchFailed(reason));
        }

        self.sync_rendezvous(execution_id, vm.id).await
    }

    /// Polls the persistence store for terminal status (spec.md §4.2 step
    /// 6): the reconciler writes the terminal state out of band, this loop
    /// observes it. An equivalent in-process condition variable/notify
    /// would be externally indistinguishable; polling is used here because
    /// reconciler and scheduler must tolerate running in separate
    /// processes against shared state (spec.md §4.3 "Correlation").
    async fn sync_rendezvous(self: &Arc<Self>, execution_id: Uuid, vm_id: Uuid) -> SchedulerResult<InvocationResult> {
        for _ in 0..self.settings.sync_poll_max_attempts {
            let execution = self.db.get_execution(execution_id).await?;
            if execution.status.is_terminal() {
                self.active.remove(&execution_id);
                if let Err(e) = self.pool.return_vm(vm_id).await {
                    error!("failed to return vm {vm_id} after execution {execution_id}: {e}");
                }
                return Ok(InvocationResult::Terminal(execution));
            }
            tokio::time::sleep(Duration::from_millis(self.settings.sync_poll_interval_ms)).await;
        }

        // Poll exhausted: the agent never reported back in time.
        let _ = self
            .db
            .finish_execution(execution_id, ExecutionStatus::Timeout, None, Some("sync poll exhausted".into()))
            .await;
        self.active.remove(&execution_id);
        let _ = self.pool.terminate(vm_id).await;
        Err(SchedulerError::ExecutionTimeout)
    }
}

fn dispatch_error_reason(e: &AgentError) -> String {
    format!("dispatch failed: {e}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HypervisorSettings;
    use crate::vm::FakeHypervisor;

    async fn test_scheduler(async_queue_capacity: usize) -> (Arc<Scheduler>, Db) {
        let db = Db::connect_in_memory().await.unwrap();
        let hv_settings = HypervisorSettings {
            binary_path: "/bin/true".into(),
            kernel_image_path: "/dev/null".into(),
            rootfs_image_path: "/dev/null".into(),
            working_dir_base: std::env::temp_dir(),
            default_vcpu_count: 1,
            default_mem_size_mib: 128,
            boot_timeout_secs: 5,
            use_fake_hypervisor: true,
        };
        let pool = VmPoolManager::new(
            db.clone(),
            Arc::new(FakeHypervisor),
            hv_settings,
            2,
            ("169.254.100.0".parse().unwrap(), 24),
        );
        let registry = FunctionRegistry::new(db.clone());
        let settings = SchedulerSettings {
            async_queue_capacity,
            async_worker_count: 2,
            sync_poll_interval_ms: 10,
            sync_poll_max_attempts: 5,
            timeout_monitor_threshold_secs: 300,
        };
        let scheduler = Scheduler::new(db.clone(), pool, registry, settings);
        (scheduler, db)
    }

    #[tokio::test]
    async fn schedule_unknown_function_errors() {
        let (scheduler, _db) = test_scheduler(10).await;
        let err = scheduler.schedule(Uuid::new_v4(), Value::Null, None, true).await.unwrap_err();
        assert!(matches!(err, SchedulerError::FunctionNotFound));
    }

    #[tokio::test]
    async fn sync_invocation_without_agent_response_times_out() {
        let (scheduler, db) = test_scheduler(10).await;
        let registry = FunctionRegistry::new(db.clone());
        let f = registry
            .register("slow".into(), "python3.11".into(), 128, 30, "def handler(e,c): pass".into(), None, None)
            .await
            .unwrap();

        // FakeHypervisor never runs a real agent, so the agent HTTP POST
        // itself fails fast (connection refused) rather than timing out —
        // exercise the dispatch-failure quarantine path instead.
        let err = scheduler.schedule(f.id, serde_json::json!({}), None, true).await.unwrap_err();
        assert!(matches!(err, SchedulerError::DispatchFailed(_)));
    }

    #[tokio::test]
    async fn async_submission_returns_accepted() {
        let (scheduler, db) = test_scheduler(10).await;
        let registry = FunctionRegistry::new(db.clone());
        let f = registry
            .register("async-fn".into(), "python3.11".into(), 128, 30, "def handler(e,c): pass".into(), None, None)
            .await
            .unwrap();

        scheduler.spawn_workers();
        let result = scheduler.schedule(f.id, serde_json::json!({}), None, false).await.unwrap();
        assert!(matches!(result, InvocationResult::Accepted { .. }));
    }

    #[tokio::test]
    async fn async_submission_rejected_when_queue_full() {
        let (scheduler, db) = test_scheduler(1).await;
        let registry = FunctionRegistry::new(db.clone());
        let f = registry
            .register("full-queue".into(), "python3.11".into(), 128, 30, "def handler(e,c): pass".into(), None, None)
            .await
            .unwrap();

        // Do not spawn workers, so the one-deep queue stays occupied by the
        // first submission and the second has no room.
        scheduler.schedule(f.id, serde_json::json!({}), None, false).await.unwrap();
        let err = scheduler.schedule(f.id, serde_json::json!({}), None, false).await.unwrap_err();
        assert!(matches!(err, SchedulerError::QueueFull));
    }
}
