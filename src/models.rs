//! Core data model: Function, Execution, VM and their status machines.
//! See spec.md §3.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum FunctionStatus {
    Ready,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemVer {
    pub major: i64,
    pub minor: i64,
    pub patch: i64,
}

impl SemVer {
    pub fn initial() -> Self {
        Self { major: 0, minor: 1, patch: 0 }
    }

    pub fn bump_patch(&self) -> Self {
        Self { patch: self.patch + 1, ..*self }
    }
}

impl std::fmt::Display for SemVer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Immutable-by-replacement code unit (spec.md §3 "Function").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub id: Uuid,
    pub name: String,
    pub runtime: String,
    pub memory_mib: i64,
    pub timeout_secs: i64,
    pub version: SemVer,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: FunctionStatus,
    pub code: String,
    pub requirements: Option<String>,
    pub config: Option<String>,
}

impl Function {
    pub const DEFAULT_ENTRY_POINT: &'static str = "handler.handler";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Timeout
        )
    }
}

/// One row per invocation attempt (spec.md §3 "Execution").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub function_id: Uuid,
    pub vm_id: Option<Uuid>,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl Execution {
    pub fn new_pending(function_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            function_id,
            vm_id: None,
            status: ExecutionStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            output: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum VmStatus {
    Initializing,
    Ready,
    Busy,
    Terminated,
}

/// One row per micro-VM the pool manager has ever created (spec.md §3 "VM").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vm {
    pub id: Uuid,
    pub ip_address: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub cpu_count: i64,
    pub memory_mib: i64,
    pub is_warm: bool,
    pub status: VmStatus,
}
