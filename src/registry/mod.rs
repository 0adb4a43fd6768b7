//! Function Registry Façade (spec.md §4.4): the scheduler's only window onto
//! function metadata and code, backed by the persistence store and fronted
//! by a small read cache so a hot function doesn't cost a DB round trip on
//! every invocation.

use std::sync::Arc;

use dashmap::DashMap;
use log::info;
use uuid::Uuid;

use crate::db::{Db, DbError};
use crate::models::Function;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("function not found")]
    NotFound,
    #[error("function name already registered: {0}")]
    AlreadyExists(String),
    #[error(transparent)]
    Db(#[from] DbError),
}

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

impl From<DbError> for RegistryError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound => RegistryError::NotFound,
            DbError::Conflict(name) => RegistryError::AlreadyExists(name),
            other => RegistryError::Db(other),
        }
    }
}

/// Read-through cache over the functions table, keyed by id. Invalidated
/// eagerly on any mutation so callers never observe stale code after an
/// `update` or `delete` (spec.md §4.4: "the façade must never serve deleted
/// or superseded code").
pub struct FunctionRegistry {
    db: Db,
    cache: DashMap<Uuid, Function>,
}

impl FunctionRegistry {
    pub fn new(db: Db) -> Arc<Self> {
        Arc::new(Self { db, cache: DashMap::new() })
    }

    pub async fn register(
        &self,
        name: String,
        runtime: String,
        memory_mib: i64,
        timeout_secs: i64,
        code: String,
        requirements: Option<String>,
        config: Option<String>,
    ) -> RegistryResult<Function> {
        let now = chrono::Utc::now();
        let function = Function {
            id: Uuid::new_v4(),
            name,
            runtime,
            memory_mib,
            timeout_secs,
            version: crate::models::SemVer::initial(),
            created_at: now,
            updated_at: now,
            status: crate::models::FunctionStatus::Ready,
            code,
            requirements,
            config,
        };
        self.db.insert_function(&function).await?;
        info!("function {} ({}) registered", function.name, function.id);
        Ok(function)
    }

    pub async fn get_metadata(&self, id: Uuid) -> RegistryResult<Function> {
        if let Some(hit) = self.cache.get(&id) {
            return Ok(hit.clone());
        }
        let f = self.db.get_function(id).await?;
        self.cache.insert(id, f.clone());
        Ok(f)
    }

    pub async fn get_metadata_by_name(&self, name: &str) -> RegistryResult<Function> {
        let f = self.db.get_function_by_name(name).await?;
        self.cache.insert(f.id, f.clone());
        Ok(f)
    }

    /// Code is intentionally not cached: it can be large and is only read
    /// once per dispatch, right before handing it to the in-VM agent.
    pub async fn get_code(&self, id: Uuid) -> RegistryResult<String> {
        Ok(self.db.get_function(id).await?.code)
    }

    pub async fn update_code(
        &self,
        id: Uuid,
        code: String,
        requirements: Option<String>,
        config: Option<String>,
    ) -> RegistryResult<Function> {
        let f = self.db.update_function_code(id, code, requirements, config).await?;
        self.cache.insert(id, f.clone());
        Ok(f)
    }

    pub async fn delete(&self, id: Uuid) -> RegistryResult<()> {
        self.db.delete_function(id).await?;
        self.cache.remove(&id);
        Ok(())
    }

    pub async fn list(&self) -> RegistryResult<Vec<Function>> {
        Ok(self.db.list_functions().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry() -> Arc<FunctionRegistry> {
        let db = Db::connect_in_memory().await.unwrap();
        FunctionRegistry::new(db)
    }

    #[tokio::test]
    async fn register_then_get_round_trips() {
        let reg = registry().await;
        let f = reg
            .register("hello".into(), "python3.11".into(), 128, 10, "print('hi')".into(), None, None)
            .await
            .unwrap();

        let fetched = reg.get_metadata(f.id).await.unwrap();
        assert_eq!(fetched.name, "hello");
        assert_eq!(fetched.version.patch, 0);
    }

    #[tokio::test]
    async fn update_bumps_patch_and_invalidates_cache() {
        let reg = registry().await;
        let f = reg
            .register("hello".into(), "python3.11".into(), 128, 10, "v1".into(), None, None)
            .await
            .unwrap();
        reg.get_metadata(f.id).await.unwrap(); // warm the cache

        let updated = reg.update_code(f.id, "v2".into(), None, None).await.unwrap();
        assert_eq!(updated.version.patch, 1);

        let code = reg.get_code(f.id).await.unwrap();
        assert_eq!(code, "v2");
    }

    #[tokio::test]
    async fn delete_then_get_not_found() {
        let reg = registry().await;
        let f = reg
            .register("gone".into(), "python3.11".into(), 128, 10, "v1".into(), None, None)
            .await
            .unwrap();
        reg.delete(f.id).await.unwrap();
        assert!(matches!(reg.get_metadata(f.id).await, Err(RegistryError::NotFound)));
    }

    #[tokio::test]
    async fn duplicate_name_rejected() {
        let reg = registry().await;
        reg.register("dup".into(), "python3.11".into(), 128, 10, "v1".into(), None, None)
            .await
            .unwrap();
        let err = reg
            .register("dup".into(), "python3.11".into(), 128, 10, "v2".into(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists(_)));
    }
}
