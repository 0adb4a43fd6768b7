use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use crate::models::{Execution, ExecutionStatus};

use super::{Db, DbError, DbResult};

impl Db {
    pub async fn insert_execution(&self, e: &Execution) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO executions (id, function_id, vm_id, status, start_time, end_time, duration_ms, output, error)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(e.id.to_string())
        .bind(e.function_id.to_string())
        .bind(e.vm_id.map(|v| v.to_string()))
        .bind(status_str(e.status))
        .bind(e.start_time.to_rfc3339())
        .bind(e.end_time.map(|t| t.to_rfc3339()))
        .bind(e.duration_ms)
        .bind(&e.output)
        .bind(&e.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_execution(&self, id: Uuid) -> DbResult<Execution> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DbError::NotFound)?;
        row_to_execution(&row)
    }

    pub async fn list_executions_for_function(&self, function_id: Uuid) -> DbResult<Vec<Execution>> {
        let rows = sqlx::query("SELECT * FROM executions WHERE function_id = ? ORDER BY start_time")
            .bind(function_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_execution).collect()
    }

    /// Mark an execution `running` and record the VM assigned to it.
    pub async fn mark_execution_running(&self, id: Uuid, vm_id: Uuid) -> DbResult<()> {
        sqlx::query("UPDATE executions SET status = 'running', vm_id = ? WHERE id = ? AND status = 'pending'")
            .bind(vm_id.to_string())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Transition an execution into a terminal state. Terminal states are
    /// immutable (spec.md §3 invariant, §8 invariant 4): a row already in a
    /// terminal state is left untouched and `Ok(false)` is returned so
    /// callers can implement idempotent-delivery semantics (spec.md §4.3).
    pub async fn finish_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        output: Option<String>,
        error: Option<String>,
    ) -> DbResult<bool> {
        debug_assert!(status.is_terminal());

        let current = self.get_execution(id).await?;
        if current.status.is_terminal() {
            return Ok(false);
        }

        let end_time = Utc::now();
        let duration_ms = (end_time - current.start_time).num_milliseconds().max(0);

        let result = sqlx::query(
            "UPDATE executions SET status = ?, end_time = ?, duration_ms = ?, output = ?, error = ?
             WHERE id = ? AND status NOT IN ('completed', 'failed', 'timeout')",
        )
        .bind(status_str(status))
        .bind(end_time.to_rfc3339())
        .bind(duration_ms)
        .bind(&output)
        .bind(&error)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

fn status_str(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Pending => "pending",
        ExecutionStatus::Running => "running",
        ExecutionStatus::Completed => "completed",
        ExecutionStatus::Failed => "failed",
        ExecutionStatus::Timeout => "timeout",
    }
}

fn row_to_execution(row: &sqlx::sqlite::SqliteRow) -> DbResult<Execution> {
    let id: String = row.try_get("id")?;
    let function_id: String = row.try_get("function_id")?;
    let vm_id: Option<String> = row.try_get("vm_id")?;
    let status: String = row.try_get("status")?;
    let start_time: String = row.try_get("start_time")?;
    let end_time: Option<String> = row.try_get("end_time")?;

    let parse_uuid = |s: &str| {
        Uuid::parse_str(s).map_err(|e| DbError::Sqlx(sqlx::Error::Decode(Box::new(e))))
    };
    let parse_time = |s: &str| {
        chrono::DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&chrono::Utc))
            .map_err(|e| DbError::Sqlx(sqlx::Error::Decode(Box::new(e))))
    };

    Ok(Execution {
        id: parse_uuid(&id)?,
        function_id: parse_uuid(&function_id)?,
        vm_id: vm_id.map(|v| parse_uuid(&v)).transpose()?,
        status: match status.as_str() {
            "pending" => ExecutionStatus::Pending,
            "running" => ExecutionStatus::Running,
            "completed" => ExecutionStatus::Completed,
            "failed" => ExecutionStatus::Failed,
            _ => ExecutionStatus::Timeout,
        },
        start_time: parse_time(&start_time)?,
        end_time: end_time.map(|t| parse_time(&t)).transpose()?,
        duration_ms: row.try_get("duration_ms")?,
        output: row.try_get("output")?,
        error: row.try_get("error")?,
    })
}
