use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use crate::models::{Function, FunctionStatus, SemVer};

use super::{Db, DbError, DbResult};

impl Db {
    pub async fn insert_function(&self, f: &Function) -> DbResult<()> {
        let existing = sqlx::query("SELECT id FROM functions WHERE name = ?")
            .bind(&f.name)
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_some() {
            return Err(DbError::Conflict(format!("function name {} already registered", f.name)));
        }

        sqlx::query(
            "INSERT INTO functions
                (id, name, runtime, memory_mib, timeout_secs,
                 version_major, version_minor, version_patch,
                 created_at, updated_at, status, code, requirements, config)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(f.id.to_string())
        .bind(&f.name)
        .bind(&f.runtime)
        .bind(f.memory_mib)
        .bind(f.timeout_secs)
        .bind(f.version.major)
        .bind(f.version.minor)
        .bind(f.version.patch)
        .bind(f.created_at.to_rfc3339())
        .bind(f.updated_at.to_rfc3339())
        .bind(status_str(f.status))
        .bind(&f.code)
        .bind(&f.requirements)
        .bind(&f.config)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_function(&self, id: Uuid) -> DbResult<Function> {
        let row = sqlx::query("SELECT * FROM functions WHERE id = ? AND status != 'deleted'")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DbError::NotFound)?;
        row_to_function(&row)
    }

    pub async fn get_function_by_name(&self, name: &str) -> DbResult<Function> {
        let row = sqlx::query("SELECT * FROM functions WHERE name = ? AND status != 'deleted'")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DbError::NotFound)?;
        row_to_function(&row)
    }

    /// Replace the code/requirements/config of a function, incrementing the
    /// patch component of its version (spec.md §3: "each update replaces
    /// code and increments the patch component").
    pub async fn update_function_code(
        &self,
        id: Uuid,
        code: String,
        requirements: Option<String>,
        config: Option<String>,
    ) -> DbResult<Function> {
        let mut f = self.get_function(id).await?;
        f.code = code;
        f.requirements = requirements;
        f.config = config;
        f.version = f.version.bump_patch();
        f.updated_at = Utc::now();

        sqlx::query(
            "UPDATE functions SET code = ?, requirements = ?, config = ?,
                version_major = ?, version_minor = ?, version_patch = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&f.code)
        .bind(&f.requirements)
        .bind(&f.config)
        .bind(f.version.major)
        .bind(f.version.minor)
        .bind(f.version.patch)
        .bind(f.updated_at.to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(f)
    }

    /// Tombstone a function: mark it deleted and discard its stored code.
    pub async fn delete_function(&self, id: Uuid) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE functions SET status = 'deleted', code = '', updated_at = ? WHERE id = ? AND status != 'deleted'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    pub async fn list_functions(&self) -> DbResult<Vec<Function>> {
        let rows = sqlx::query("SELECT * FROM functions WHERE status != 'deleted' ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_function).collect()
    }
}

fn status_str(status: FunctionStatus) -> &'static str {
    match status {
        FunctionStatus::Ready => "ready",
        FunctionStatus::Deleted => "deleted",
    }
}

fn row_to_function(row: &sqlx::sqlite::SqliteRow) -> DbResult<Function> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Function {
        id: Uuid::parse_str(&id).map_err(|e| DbError::Sqlx(sqlx::Error::Decode(Box::new(e))))?,
        name: row.try_get("name")?,
        runtime: row.try_get("runtime")?,
        memory_mib: row.try_get("memory_mib")?,
        timeout_secs: row.try_get("timeout_secs")?,
        version: SemVer {
            major: row.try_get("version_major")?,
            minor: row.try_get("version_minor")?,
            patch: row.try_get("version_patch")?,
        },
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| DbError::Sqlx(sqlx::Error::Decode(Box::new(e))))?
            .with_timezone(&chrono::Utc),
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| DbError::Sqlx(sqlx::Error::Decode(Box::new(e))))?
            .with_timezone(&chrono::Utc),
        status: match status.as_str() {
            "ready" => FunctionStatus::Ready,
            _ => FunctionStatus::Deleted,
        },
        code: row.try_get("code")?,
        requirements: row.try_get("requirements")?,
        config: row.try_get("config")?,
    })
}
