use sqlx::Row;
use uuid::Uuid;

use crate::models::{Vm, VmStatus};

use super::{Db, DbError, DbResult};

impl Db {
    pub async fn insert_vm(&self, vm: &Vm) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO vms (id, ip_address, created_at, last_used_at, cpu_count, memory_mib, is_warm, status)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(vm.id.to_string())
        .bind(&vm.ip_address)
        .bind(vm.created_at.to_rfc3339())
        .bind(vm.last_used_at.to_rfc3339())
        .bind(vm.cpu_count)
        .bind(vm.memory_mib)
        .bind(vm.is_warm)
        .bind(status_str(vm.status))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_vm(&self, id: Uuid) -> DbResult<Vm> {
        let row = sqlx::query("SELECT * FROM vms WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DbError::NotFound)?;
        row_to_vm(&row)
    }

    pub async fn list_vms(&self) -> DbResult<Vec<Vm>> {
        let rows = sqlx::query("SELECT * FROM vms ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_vm).collect()
    }

    pub async fn set_vm_status(&self, id: Uuid, status: VmStatus) -> DbResult<()> {
        let result = sqlx::query("UPDATE vms SET status = ? WHERE id = ?")
            .bind(status_str(status))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    pub async fn touch_vm_last_used(&self, id: Uuid) -> DbResult<()> {
        sqlx::query("UPDATE vms SET last_used_at = ? WHERE id = ?")
            .bind(chrono::Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_vm(&self, id: Uuid) -> DbResult<()> {
        sqlx::query("DELETE FROM vms WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn status_str(status: VmStatus) -> &'static str {
    match status {
        VmStatus::Initializing => "initializing",
        VmStatus::Ready => "ready",
        VmStatus::Busy => "busy",
        VmStatus::Terminated => "terminated",
    }
}

fn row_to_vm(row: &sqlx::sqlite::SqliteRow) -> DbResult<Vm> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let last_used_at: String = row.try_get("last_used_at")?;

    let parse_time = |s: &str| {
        chrono::DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&chrono::Utc))
            .map_err(|e| DbError::Sqlx(sqlx::Error::Decode(Box::new(e))))
    };

    Ok(Vm {
        id: Uuid::parse_str(&id).map_err(|e| DbError::Sqlx(sqlx::Error::Decode(Box::new(e))))?,
        ip_address: row.try_get("ip_address")?,
        created_at: parse_time(&created_at)?,
        last_used_at: parse_time(&last_used_at)?,
        cpu_count: row.try_get("cpu_count")?,
        memory_mib: row.try_get("memory_mib")?,
        is_warm: row.try_get("is_warm")?,
        status: match status.as_str() {
            "initializing" => VmStatus::Initializing,
            "ready" => VmStatus::Ready,
            "busy" => VmStatus::Busy,
            _ => VmStatus::Terminated,
        },
    })
}
