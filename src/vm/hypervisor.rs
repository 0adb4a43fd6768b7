//! Hypervisor process supervision (spec.md §4.1 "VM creation").
//!
//! Modeled on the teacher's `Hypervisor`/`RollbackStack` pair: a working
//! directory per VM id, a generated config, a spawned child process tracked
//! by pid, and a rollback list that unwinds whatever was already set up if a
//! later step fails. Firecracker itself is not available in this
//! environment, so the concrete launch is behind a trait with a real
//! process-spawning implementation and a fake one used by tests and by
//! operators without virtualization hardware (`RUSTCRACKER_FAKE_HYPERVISOR`).

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use log::{error, info, warn};
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use crate::config::HypervisorSettings;

use super::{VmError, VmResult};

/// Parameters needed to boot one micro-VM.
#[derive(Debug, Clone)]
pub struct VmBootSpec {
    pub vm_id: Uuid,
    pub ip_address: Ipv4Addr,
    pub vcpu_count: u32,
    pub memory_mib: u32,
}

/// A live hypervisor process and the handles needed to talk to and tear down
/// the micro-VM it's running.
#[derive(Debug)]
pub struct BootedVm {
    pub vm_id: Uuid,
    pub pid: Option<u32>,
    pub working_dir: PathBuf,
    pub control_socket: PathBuf,
    child: Option<tokio::process::Child>,
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn boot(&self, spec: &VmBootSpec) -> VmResult<BootedVm>;
    async fn terminate(&self, vm: &mut BootedVm) -> VmResult<()>;
}

/// Resources created so far during a boot attempt, torn down in reverse
/// order if a later step fails (spec.md §4.1: "On failure at any step, all
/// partially created resources must be torn down").
enum Rollback {
    WorkingDir(PathBuf),
    Process(tokio::process::Child),
}

async fn unwind(mut stack: Vec<Rollback>) {
    while let Some(step) = stack.pop() {
        match step {
            Rollback::Process(mut child) => {
                let _ = child.kill().await;
            }
            Rollback::WorkingDir(dir) => {
                let _ = tokio::fs::remove_dir_all(&dir).await;
            }
        }
    }
}

/// Spawns the configured hypervisor binary as a real child process.
pub struct ProcessHypervisor {
    settings: HypervisorSettings,
}

impl ProcessHypervisor {
    pub fn new(settings: HypervisorSettings) -> Self {
        Self { settings }
    }

    fn working_dir(&self, vm_id: Uuid) -> PathBuf {
        self.settings.working_dir_base.join(vm_id.to_string())
    }

    /// Generates the hypervisor's launch config: kernel, rootfs drive,
    /// machine sizing, log/metrics FIFOs and the per-VM control socket
    /// (spec.md §4.1 step 3).
    fn render_config(&self, spec: &VmBootSpec, dir: &Path) -> serde_json::Value {
        serde_json::json!({
            "boot-source": {
                "kernel_image_path": self.settings.kernel_image_path,
                "boot_args": "console=ttyS0 reboot=k panic=1 pci=off",
            },
            "drives": [{
                "drive_id": "rootfs",
                "path_on_host": self.settings.rootfs_image_path,
                "is_root_device": true,
                "is_read_only": false,
            }],
            "machine-config": {
                "vcpu_count": spec.vcpu_count,
                "mem_size_mib": spec.memory_mib,
            },
            "logger": { "log_path": dir.join("vm.log") },
            "metrics": { "metrics_path": dir.join("vm.metrics") },
        })
    }
}

#[async_trait]
impl Hypervisor for ProcessHypervisor {
    async fn boot(&self, spec: &VmBootSpec) -> VmResult<BootedVm> {
        let mut rollbacks = Vec::new();
        let dir = self.working_dir(spec.vm_id);

        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            VmError::CreateFailed(format!("mkdir {dir:?}: {e}"))
        })?;
        rollbacks.push(Rollback::WorkingDir(dir.clone()));

        let config = self.render_config(spec, &dir);
        let config_path = dir.join("config.json");
        if let Err(e) = tokio::fs::write(&config_path, config.to_string()).await {
            unwind(rollbacks).await;
            return Err(VmError::CreateFailed(format!("write config: {e}")));
        }

        let control_socket = dir.join("firecracker.sock");

        let child = match tokio::process::Command::new(&self.settings.binary_path)
            .arg("--api-sock")
            .arg(&control_socket)
            .arg("--config-file")
            .arg(&config_path)
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                unwind(rollbacks).await;
                return Err(VmError::CreateFailed(format!("spawn hypervisor: {e}")));
            }
        };
        let pid = child.id();
        rollbacks.push(Rollback::Process(child));

        // Wait for the hypervisor to bind its control socket (the reference
        // implementation's health probe is implementation-defined; binding
        // the socket is the observable proxy for "booted").
        let deadline = Instant::now() + Duration::from_secs(self.settings.boot_timeout_secs);
        loop {
            if control_socket.exists() {
                break;
            }
            if Instant::now() >= deadline {
                error!("vm {} failed to boot within {}s", spec.vm_id, self.settings.boot_timeout_secs);
                unwind(rollbacks).await;
                return Err(VmError::CreateFailed("boot timeout".into()));
            }
            sleep(Duration::from_millis(50)).await;
        }

        // Rollback consumed the child into the stack; pull it back out as
        // the handle we return.
        let child = match rollbacks.pop() {
            Some(Rollback::Process(child)) => child,
            _ => unreachable!("process was the last thing pushed"),
        };

        info!("vm {} booted (pid {:?})", spec.vm_id, pid);
        Ok(BootedVm { vm_id: spec.vm_id, pid, working_dir: dir, control_socket, child: Some(child) })
    }

    async fn terminate(&self, vm: &mut BootedVm) -> VmResult<()> {
        if let Some(mut child) = vm.child.take() {
            // The hypervisor holds an open fd to itself via procfs, so
            // signalling its pid directly is safe even after tokio's
            // handle is dropped (mirrors the teacher's rollback terminate).
            if let Some(pid) = vm.pid {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
            if let Err(e) = child.kill().await {
                warn!("vm {} process already gone: {e}", vm.vm_id);
            }
        }
        let _ = tokio::fs::remove_dir_all(&vm.working_dir).await;
        Ok(())
    }
}

/// In-memory stand-in hypervisor used by tests and by operators without
/// virtualization hardware (`RUSTCRACKER_FAKE_HYPERVISOR=1`). Boots
/// instantly and never spawns a process.
pub struct FakeHypervisor;

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn boot(&self, spec: &VmBootSpec) -> VmResult<BootedVm> {
        let working_dir = std::env::temp_dir().join(format!("faasd-fake-vm-{}", spec.vm_id));
        Ok(BootedVm {
            vm_id: spec.vm_id,
            pid: None,
            control_socket: working_dir.join("fake.sock"),
            working_dir,
            child: None,
        })
    }

    async fn terminate(&self, _vm: &mut BootedVm) -> VmResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_hypervisor_boots_and_terminates() {
        let hv = FakeHypervisor;
        let spec = VmBootSpec { vm_id: Uuid::new_v4(), ip_address: Ipv4Addr::new(169, 254, 100, 1), vcpu_count: 1, memory_mib: 128 };
        let mut vm = hv.boot(&spec).await.unwrap();
        assert_eq!(vm.vm_id, spec.vm_id);
        hv.terminate(&mut vm).await.unwrap();
    }
}
