//! Crate-wide error composition.
//!
//! Each subsystem defines its own error enum (see `vm::VmError`,
//! `scheduler::SchedulerError`, `db::DbError`); this module composes them
//! into a single `Error` that the API layer converts into HTTP responses.

use crate::{db::DbError, registry::RegistryError, scheduler::SchedulerError, vm::VmError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("function not found")]
    FunctionNotFound,

    #[error("function already exists")]
    FunctionAlreadyExists,

    #[error("execution not found")]
    ExecutionNotFound,

    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),

    #[error("vm create failed: {0}")]
    VmCreateFailed(String),

    #[error("dispatch failed: {0}")]
    DispatchFailed(String),

    #[error("execution timed out")]
    ExecutionTimeout,

    #[error("async queue full")]
    QueueFull,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// `VmError`, `SchedulerError` and `RegistryError` carry their own
/// granular variants (`UnknownVm`, `FunctionNotFound`, ...); flatten them
/// onto the matching crate-wide variant rather than a single opaque
/// wrapper, so the API layer's status-code mapping (spec.md §7) stays
/// accurate.
impl From<VmError> for Error {
    fn from(e: VmError) -> Self {
        match e {
            VmError::UnknownVm(_) => Error::Internal(e.to_string()),
            VmError::CapacityExhausted(msg) => Error::CapacityExhausted(msg),
            VmError::CreateFailed(msg) => Error::VmCreateFailed(msg),
            VmError::IpPoolExhausted => Error::CapacityExhausted(e.to_string()),
            VmError::Db(db) => Error::Db(db),
        }
    }
}

impl From<SchedulerError> for Error {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::FunctionNotFound => Error::FunctionNotFound,
            SchedulerError::ExecutionNotFound => Error::ExecutionNotFound,
            SchedulerError::CapacityExhausted(msg) => Error::CapacityExhausted(msg),
            SchedulerError::DispatchFailed(msg) => Error::DispatchFailed(msg),
            SchedulerError::ExecutionTimeout => Error::ExecutionTimeout,
            SchedulerError::QueueFull => Error::QueueFull,
            SchedulerError::Internal(msg) => Error::Internal(msg),
            SchedulerError::Db(db) => Error::Db(db),
        }
    }
}

impl From<RegistryError> for Error {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound => Error::FunctionNotFound,
            RegistryError::AlreadyExists(_) => Error::FunctionAlreadyExists,
            RegistryError::Db(db) => Error::Db(db),
        }
    }
}
