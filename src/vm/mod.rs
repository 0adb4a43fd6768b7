//! VM Pool Manager (spec.md §4.1): leases and reclaims micro-VMs from a
//! bounded warm pool, and keeps the pool topped up in the background.

pub mod hypervisor;
pub mod ip_alloc;
pub mod manager;

pub use hypervisor::{FakeHypervisor, Hypervisor, ProcessHypervisor};
pub use manager::VmPoolManager;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("unknown vm {0}")]
    UnknownVm(uuid::Uuid),

    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),

    #[error("vm create failed: {0}")]
    CreateFailed(String),

    #[error("ip pool exhausted")]
    IpPoolExhausted,

    #[error(transparent)]
    Db(#[from] crate::db::DbError),
}

pub type VmResult<T> = std::result::Result<T, VmError>;
