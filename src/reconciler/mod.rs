//! Result Reconciler (spec.md §4.3): handles unsolicited completion reports
//! from in-VM agents and finalises execution state exactly once.

use std::sync::Arc;

use log::{info, warn};

use crate::agent::ResultCallback;
use crate::db::{Db, DbError};
use crate::models::ExecutionStatus;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("execution not found")]
    ExecutionNotFound,
    #[error(transparent)]
    Db(#[from] DbError),
}

pub type ReconcileResult<T> = std::result::Result<T, ReconcileError>;

pub struct Reconciler {
    db: Db,
}

impl Reconciler {
    pub fn new(db: Db) -> Arc<Self> {
        Arc::new(Self { db })
    }

    /// Finalises an execution from an agent's result report. Idempotent:
    /// a report for an execution already in a terminal state is accepted
    /// and discarded without mutation (spec.md §4.3 step 2, §8 law
    /// "idempotent result delivery").
    pub async fn receive_result(&self, report: ResultCallback) -> ReconcileResult<()> {
        let execution = match self.db.get_execution(report.request_id).await {
            Ok(e) => e,
            Err(DbError::NotFound) => return Err(ReconcileError::ExecutionNotFound),
            Err(e) => return Err(e.into()),
        };

        if execution.status.is_terminal() {
            info!("duplicate result for execution {} ignored", execution.id);
            return Ok(());
        }

        let status = if report.succeeded() { ExecutionStatus::Completed } else { ExecutionStatus::Failed };

        let transitioned = self
            .db
            .finish_execution(report.request_id, status, report.output.clone(), report.error_message.clone())
            .await?;

        if !transitioned {
            warn!(
                "execution {} reached a terminal state concurrently with this result; report discarded",
                report.request_id
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Execution;
    use uuid::Uuid;

    #[tokio::test]
    async fn unknown_execution_is_rejected() {
        let db = Db::connect_in_memory().await.unwrap();
        let reconciler = Reconciler::new(db);
        let report = ResultCallback {
            request_id: Uuid::new_v4(),
            function_id: Uuid::new_v4(),
            status_code: 200,
            output: Some("{}".into()),
            error_message: None,
            duration_ms: 5,
            memory_usage_kb: None,
        };
        assert!(matches!(
            reconciler.receive_result(report).await,
            Err(ReconcileError::ExecutionNotFound)
        ));
    }

    #[tokio::test]
    async fn success_report_completes_execution() {
        let db = Db::connect_in_memory().await.unwrap();
        let function_id = Uuid::new_v4();
        let execution = Execution::new_pending(function_id);
        db.insert_execution(&execution).await.unwrap();

        let reconciler = Reconciler::new(db.clone());
        let report = ResultCallback {
            request_id: execution.id,
            function_id,
            status_code: 200,
            output: Some("{\"hi\":\"Ada\"}".into()),
            error_message: None,
            duration_ms: 12,
            memory_usage_kb: Some(4096),
        };
        reconciler.receive_result(report).await.unwrap();

        let updated = db.get_execution(execution.id).await.unwrap();
        assert_eq!(updated.status, ExecutionStatus::Completed);
        assert_eq!(updated.output.as_deref(), Some("{\"hi\":\"Ada\"}"));
    }

    #[tokio::test]
    async fn duplicate_report_is_a_no_op() {
        let db = Db::connect_in_memory().await.unwrap();
        let function_id = Uuid::new_v4();
        let execution = Execution::new_pending(function_id);
        db.insert_execution(&execution).await.unwrap();

        let reconciler = Reconciler::new(db.clone());
        let report = ResultCallback {
            request_id: execution.id,
            function_id,
            status_code: 200,
            output: Some("first".into()),
            error_message: None,
            duration_ms: 5,
            memory_usage_kb: None,
        };
        reconciler.receive_result(report.clone()).await.unwrap();

        let mut second = report;
        second.output = Some("second".into());
        reconciler.receive_result(second).await.unwrap();

        let updated = db.get_execution(execution.id).await.unwrap();
        assert_eq!(updated.output.as_deref(), Some("first"));
    }
}
