//! Process-wide configuration, read once at startup from the environment.
use std::net::Ipv4Addr;
use std::path::PathBuf;

use log::{error, warn};

use crate::error::{Error, Result};

/// All configuration the control plane needs, gathered from the environment
/// at startup (see SPEC_FULL.md §6.2 for the full variable list).
#[derive(Debug, Clone)]
pub struct Settings {
    /// HTTP listen port for the API surface.
    pub port: u16,

    /// Path to the SQLite database file backing the persistence store.
    pub db_path: PathBuf,

    /// Warm pool target size `W`.
    pub warm_pool_size: usize,

    /// `log` crate filter string, e.g. "info" or "faasd_control_plane=debug".
    pub log_level: String,

    /// Optional bearer token required on invocation/result endpoints.
    /// When `None`, authentication is a no-op (local/dev mode).
    pub api_token: Option<String>,

    pub hypervisor: HypervisorSettings,

    /// CIDR the VM IP allocator hands addresses out of.
    pub vm_ip_cidr: (Ipv4Addr, u8),

    pub async_queue_capacity: usize,
    pub async_worker_count: usize,

    pub sync_poll_interval_ms: u64,
    pub sync_poll_max_attempts: u32,

    /// Second-line timeout monitor threshold. Must never exceed the largest
    /// timeout ceiling accepted at function registration.
    pub timeout_monitor_threshold_secs: u64,
    pub max_function_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct HypervisorSettings {
    pub binary_path: PathBuf,
    pub kernel_image_path: PathBuf,
    pub rootfs_image_path: PathBuf,
    pub working_dir_base: PathBuf,
    pub default_vcpu_count: u32,
    pub default_mem_size_mib: u32,
    pub boot_timeout_secs: u64,
    /// When set, skip spawning a real hypervisor process and use the
    /// in-memory fake instead. Used by tests and by operators without
    /// virtualization hardware available.
    pub use_fake_hypervisor: bool,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Settings {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let vm_ip_cidr_str = env_or("VM_IP_CIDR", "169.254.100.0/24");
        let vm_ip_cidr = parse_cidr(&vm_ip_cidr_str)
            .map_err(|e| Error::Config(format!("invalid VM_IP_CIDR {vm_ip_cidr_str}: {e}")))?;

        let settings = Self {
            port: env_parse("PORT", 8080),
            db_path: PathBuf::from(env_or("DB_PATH", "faasd.db")),
            warm_pool_size: env_parse("WARM_POOL_SIZE", 5),
            log_level: env_or("LOG_LEVEL", "info"),
            api_token: std::env::var("API_TOKEN").ok(),
            hypervisor: HypervisorSettings {
                binary_path: PathBuf::from(env_or("HYPERVISOR_BIN", "/usr/bin/firecracker")),
                kernel_image_path: PathBuf::from(env_or("KERNEL_IMAGE_PATH", "/var/lib/faasd/vmlinux")),
                rootfs_image_path: PathBuf::from(env_or("ROOTFS_IMAGE_PATH", "/var/lib/faasd/rootfs.ext4")),
                working_dir_base: PathBuf::from(env_or("VM_WORKDIR_BASE", "/var/lib/faasd/vms")),
                default_vcpu_count: env_parse("VM_DEFAULT_VCPU_COUNT", 1),
                default_mem_size_mib: env_parse("VM_DEFAULT_MEM_MIB", 128),
                boot_timeout_secs: env_parse("VM_BOOT_TIMEOUT_SECS", 30),
                use_fake_hypervisor: env_parse("RUSTCRACKER_FAKE_HYPERVISOR", false),
            },
            vm_ip_cidr,
            async_queue_capacity: env_parse("ASYNC_QUEUE_CAPACITY", 100),
            async_worker_count: env_parse("ASYNC_WORKER_COUNT", 5),
            sync_poll_interval_ms: env_parse("SYNC_POLL_INTERVAL_MS", 500),
            sync_poll_max_attempts: env_parse("SYNC_POLL_MAX_ATTEMPTS", 30),
            timeout_monitor_threshold_secs: env_parse("TIMEOUT_MONITOR_THRESHOLD_SECS", 300),
            max_function_timeout_secs: env_parse("MAX_FUNCTION_TIMEOUT_SECS", 900),
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.warm_pool_size == 0 {
            let msg = "WARM_POOL_SIZE must be at least 1";
            error!("{msg}");
            return Err(Error::Config(msg.into()));
        }

        if self.timeout_monitor_threshold_secs > self.max_function_timeout_secs * 2 {
            warn!(
                "timeout monitor threshold ({}s) is far above the max function timeout ({}s); \
                 invocations may wait much longer than their declared timeout before the \
                 second-line monitor reclaims their VM",
                self.timeout_monitor_threshold_secs, self.max_function_timeout_secs
            );
        }

        if !self.hypervisor.use_fake_hypervisor && !self.hypervisor.binary_path.exists() {
            warn!(
                "hypervisor binary not found at {:?}; real VM creation will fail until it is installed",
                self.hypervisor.binary_path
            );
        }

        Ok(())
    }
}

/// Minimal IPv4 CIDR parser: "a.b.c.d/nn".
fn parse_cidr(s: &str) -> std::result::Result<(Ipv4Addr, u8), String> {
    let (addr, prefix) = s.split_once('/').ok_or("missing prefix length")?;
    let addr: Ipv4Addr = addr.parse().map_err(|e| format!("{e}"))?;
    let prefix: u8 = prefix.parse().map_err(|e| format!("{e}"))?;
    if prefix > 32 {
        return Err("prefix length must be <= 32".into());
    }
    Ok((addr, prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_cidr() {
        let (addr, prefix) = parse_cidr("169.254.100.0/24").unwrap();
        assert_eq!(addr, Ipv4Addr::new(169, 254, 100, 0));
        assert_eq!(prefix, 24);
    }

    #[test]
    fn rejects_bad_cidr() {
        assert!(parse_cidr("not-an-ip/24").is_err());
        assert!(parse_cidr("1.2.3.4/99").is_err());
        assert!(parse_cidr("1.2.3.4").is_err());
    }
}
