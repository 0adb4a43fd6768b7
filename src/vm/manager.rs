//! `lease` / `return` over a bounded pool of pre-warmed micro-VMs, plus the
//! background refill protocol (spec.md §4.1).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use log::{info, warn};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::HypervisorSettings;
use crate::db::Db;
use crate::models::{Vm, VmStatus};

use super::hypervisor::{BootedVm, Hypervisor, VmBootSpec};
use super::ip_alloc::IpAllocator;
use super::{VmError, VmResult};

pub struct VmPoolManager {
    db: Db,
    hypervisor: Arc<dyn Hypervisor>,
    ip_alloc: Arc<IpAllocator>,
    settings: HypervisorSettings,
    warm_pool_size: usize,
    /// FIFO of VM ids currently sitting in the warm pool, all in `ready`
    /// state (spec.md §3 "Warm Pool" invariant: `|pool| <= W`).
    warm_pool: Mutex<VecDeque<Uuid>>,
    /// Live hypervisor handles for every VM this manager currently tracks,
    /// whether warm, leased, or initializing.
    live: DashMap<Uuid, Mutex<BootedVm>>,
}

impl VmPoolManager {
    pub fn new(
        db: Db,
        hypervisor: Arc<dyn Hypervisor>,
        settings: HypervisorSettings,
        warm_pool_size: usize,
        vm_ip_cidr: (std::net::Ipv4Addr, u8),
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            hypervisor,
            ip_alloc: Arc::new(IpAllocator::new(vm_ip_cidr.0, vm_ip_cidr.1)),
            settings,
            warm_pool_size,
            warm_pool: Mutex::new(VecDeque::new()),
            live: DashMap::new(),
        })
    }

    /// Starts the periodic pool-refill task (spec.md §4.1 "Pool-refill
    /// protocol"). Intended to be spawned once at process startup.
    pub fn spawn_refiller(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            loop {
                ticker.tick().await;
                if let Err(e) = this.refill_once().await {
                    warn!("pool refill iteration failed: {e}");
                }
            }
        });
    }

    async fn pool_len(&self) -> usize {
        self.warm_pool.lock().await.len()
    }

    /// Creates at most one new VM and offers it to the pool; if the pool is
    /// already full by the time the VM is ready, terminate it immediately
    /// (spec.md §4.1: "this resolves a benign race").
    async fn refill_once(self: &Arc<Self>) -> VmResult<()> {
        if self.pool_len().await >= self.warm_pool_size {
            return Ok(());
        }

        let vm_id = self.create_vm().await?;
        let mut pool = self.warm_pool.lock().await;
        if pool.len() < self.warm_pool_size {
            pool.push_back(vm_id);
        } else {
            drop(pool);
            self.terminate(vm_id).await?;
        }
        Ok(())
    }

    async fn create_vm(&self) -> VmResult<Uuid> {
        let vm_id = Uuid::new_v4();
        let ip = self.ip_alloc.allocate()?;

        let row = Vm {
            id: vm_id,
            ip_address: ip.to_string(),
            created_at: Utc::now(),
            last_used_at: Utc::now(),
            cpu_count: self.settings.default_vcpu_count as i64,
            memory_mib: self.settings.default_mem_size_mib as i64,
            is_warm: true,
            status: VmStatus::Initializing,
        };
        self.db.insert_vm(&row).await?;

        let spec = VmBootSpec {
            vm_id,
            ip_address: ip,
            vcpu_count: self.settings.default_vcpu_count,
            memory_mib: self.settings.default_mem_size_mib,
        };

        let booted = match self.hypervisor.boot(&spec).await {
            Ok(booted) => booted,
            Err(e) => {
                // Tear down what we already persisted/allocated before
                // surfacing VMCreateFailed (spec.md §4.1).
                self.ip_alloc.release(ip);
                let _ = self.db.delete_vm(vm_id).await;
                return Err(e);
            }
        };

        self.live.insert(vm_id, Mutex::new(booted));
        self.db.set_vm_status(vm_id, VmStatus::Ready).await?;
        info!("vm {vm_id} created and added to pool bookkeeping");
        Ok(vm_id)
    }

    /// Leases a VM for one invocation: pops from the warm pool, or
    /// synchronously creates one if the pool is empty (spec.md §4.1
    /// `lease`).
    pub async fn lease(self: &Arc<Self>) -> VmResult<Vm> {
        let vm_id = {
            let mut pool = self.warm_pool.lock().await;
            pool.pop_front()
        };

        let vm_id = match vm_id {
            Some(id) => id,
            None => self.create_vm().await.map_err(|e| match e {
                VmError::CreateFailed(msg) => VmError::CapacityExhausted(msg),
                other => other,
            })?,
        };

        self.db.set_vm_status(vm_id, VmStatus::Busy).await?;
        self.db.touch_vm_last_used(vm_id).await?;
        self.db.get_vm(vm_id).await.map_err(VmError::from)
    }

    /// Returns a leased VM: if the pool has room, puts it back in `ready`
    /// state; otherwise terminates it (spec.md §4.1 `return`).
    pub async fn return_vm(self: &Arc<Self>, vm_id: Uuid) -> VmResult<()> {
        if !self.live.contains_key(&vm_id) {
            return Err(VmError::UnknownVm(vm_id));
        }

        self.db.set_vm_status(vm_id, VmStatus::Ready).await?;
        self.db.touch_vm_last_used(vm_id).await?;

        let mut pool = self.warm_pool.lock().await;
        if pool.len() < self.warm_pool_size {
            pool.push_back(vm_id);
            Ok(())
        } else {
            drop(pool);
            self.terminate(vm_id).await?;
            // Pool-refill protocol (spec.md §4.1): refill fires on the
            // periodic tick *and* on each successful return that terminated
            // a VM, not just the 10s ticker.
            if let Err(e) = self.refill_once().await {
                warn!("pool refill after return-terminate failed: {e}");
            }
            Ok(())
        }
    }

    /// Forces shutdown of a VM; idempotent (spec.md §4.1 `terminate`).
    pub async fn terminate(&self, vm_id: Uuid) -> VmResult<()> {
        if let Some((_, handle)) = self.live.remove(&vm_id) {
            let mut booted = handle.into_inner();
            self.hypervisor.terminate(&mut booted).await?;
        }

        {
            let mut pool = self.warm_pool.lock().await;
            pool.retain(|id| *id != vm_id);
        }

        if let Ok(vm) = self.db.get_vm(vm_id).await {
            if let Ok(ip) = vm.ip_address.parse() {
                self.ip_alloc.release(ip);
            }
        }

        // Idempotent: deleting an already-absent row is not an error here.
        let _ = self.db.delete_vm(vm_id).await;
        Ok(())
    }

    pub async fn list(&self) -> VmResult<Vec<Vm>> {
        Ok(self.db.list_vms().await?)
    }

    pub async fn get(&self, vm_id: Uuid) -> VmResult<Vm> {
        self.db.get_vm(vm_id).await.map_err(VmError::from)
    }

    pub async fn warm_pool_depth(&self) -> usize {
        self.pool_len().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::FakeHypervisor;

    async fn manager(warm_pool_size: usize) -> Arc<VmPoolManager> {
        let db = Db::connect_in_memory().await.unwrap();
        let settings = HypervisorSettings {
            binary_path: "/bin/true".into(),
            kernel_image_path: "/dev/null".into(),
            rootfs_image_path: "/dev/null".into(),
            working_dir_base: std::env::temp_dir(),
            default_vcpu_count: 1,
            default_mem_size_mib: 128,
            boot_timeout_secs: 5,
            use_fake_hypervisor: true,
        };
        VmPoolManager::new(
            db,
            Arc::new(FakeHypervisor),
            settings,
            warm_pool_size,
            ("169.254.100.0".parse().unwrap(), 24),
        )
    }

    #[tokio::test]
    async fn lease_creates_when_pool_empty_and_return_refills_pool() {
        let mgr = manager(2).await;
        let vm = mgr.lease().await.unwrap();
        assert_eq!(vm.status, VmStatus::Busy);

        mgr.return_vm(vm.id).await.unwrap();
        assert_eq!(mgr.warm_pool_depth().await, 1);

        let fetched = mgr.get(vm.id).await.unwrap();
        assert_eq!(fetched.status, VmStatus::Ready);
    }

    #[tokio::test]
    async fn return_terminates_when_pool_is_full() {
        let mgr = manager(1).await;
        let vm_a = mgr.lease().await.unwrap();
        let vm_b = mgr.lease().await.unwrap();

        mgr.return_vm(vm_a.id).await.unwrap();
        assert_eq!(mgr.warm_pool_depth().await, 1);

        // Pool is now full; returning vm_b should terminate it instead.
        mgr.return_vm(vm_b.id).await.unwrap();
        assert_eq!(mgr.warm_pool_depth().await, 1);
        assert!(mgr.get(vm_b.id).await.is_err());
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let mgr = manager(1).await;
        let vm = mgr.lease().await.unwrap();
        mgr.terminate(vm.id).await.unwrap();
        mgr.terminate(vm.id).await.unwrap();
    }

    #[tokio::test]
    async fn return_of_unknown_vm_errors() {
        let mgr = manager(1).await;
        let err = mgr.return_vm(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, VmError::UnknownVm(_)));
    }

    #[tokio::test]
    async fn refill_tops_up_pool_below_target() {
        let mgr = manager(3).await;
        mgr.refill_once().await.unwrap();
        assert_eq!(mgr.warm_pool_depth().await, 1);
    }
}
