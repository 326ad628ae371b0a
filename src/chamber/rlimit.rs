//! POSIX rlimit containment.
//!
//! Limits are applied by a shell prelude (`ulimit -v`, `ulimit -t`) before
//! the command runs, so they are inherited by everything it starts. The
//! program runs as the leader of its own process group; killing the group
//! reaches grandchildren too.
//!
//! The memory ceiling itself is enforced by the chamber's sampler, which
//! kills the group once resident memory passes it. `ulimit -v` is only a
//! backstop at [`VIRTUAL_BACKSTOP_FACTOR`] times the ceiling: an address
//! space cap at the ceiling would make allocations fail inside the program
//! before resident memory ever showed the overrun. A run whose largest
//! address space reached the last ceiling-sized step below the backstop is
//! reported as a breach.

use std::path::Path;

use tokio::process::Child;

use super::{
    process, ChamberError, ChamberLimits, Containment, ContainmentKind, HealthStatus,
    ProcessHandle, ResourceUsage,
};

/// Address-space backstop, as a multiple of the memory ceiling.
pub const VIRTUAL_BACKSTOP_FACTOR: u64 = 8;

/// Address-space rlimit applied for `limits`, in bytes.
pub fn virtual_backstop(limits: &ChamberLimits) -> u64 {
    limits.memory_bytes.saturating_mul(VIRTUAL_BACKSTOP_FACTOR)
}

/// Backend enforcing limits through inherited rlimits.
#[derive(Debug, Clone, Copy, Default)]
pub struct RlimitContainment;

impl RlimitContainment {
    /// Shell script that sets the limits and then runs `command`.
    ///
    /// `ulimit` failures are silenced: a shell without `-v` support still
    /// runs the program, and the sampler catches overruns.
    pub fn wrap(command: &str, limits: &ChamberLimits) -> String {
        let memory_kib = virtual_backstop(limits) / 1024;
        let cpu_secs = process::ceil_secs(limits.cpu_time);
        format!(
            "ulimit -v {memory_kib} 2>/dev/null; ulimit -t {cpu_secs} 2>/dev/null; {command}"
        )
    }
}

#[async_trait::async_trait]
impl Containment for RlimitContainment {
    fn kind(&self) -> ContainmentKind {
        ContainmentKind::Rlimit
    }

    fn spawn(
        &self,
        command: &str,
        dir: &Path,
        limits: &ChamberLimits,
    ) -> Result<(Child, ProcessHandle), ChamberError> {
        let script = Self::wrap(command, limits);
        let child = process::shell_command(&script, dir)
            .spawn()
            .map_err(|e| ChamberError::Launch(e.to_string()))?;
        let handle = ProcessHandle {
            pid: child.id(),
            cgroup: None,
        };
        Ok((child, handle))
    }

    fn sample(&self, handle: &ProcessHandle) -> ResourceUsage {
        if cfg!(target_os = "linux") {
            handle.pid.map(super::procfs::sample_tree).unwrap_or_default()
        } else {
            ResourceUsage::default()
        }
    }

    fn limit_breached(
        &self,
        _handle: &ProcessHandle,
        usage: &ResourceUsage,
        limits: &ChamberLimits,
    ) -> bool {
        let threshold = virtual_backstop(limits).saturating_sub(limits.memory_bytes);
        usage.peak_virtual_bytes > 0 && usage.peak_virtual_bytes >= threshold
    }

    async fn kill(&self, handle: &ProcessHandle) {
        if let Some(pid) = handle.pid {
            process::kill_group(pid).await;
        }
    }

    async fn health_check(&self) -> HealthStatus {
        let check = tokio::process::Command::new("sh")
            .args(["-c", "ulimit -t 1"])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await;
        match check {
            Ok(status) if status.success() => HealthStatus::Healthy {
                kind: ContainmentKind::Rlimit,
                details: "rlimit containment available (CPU via ulimit, memory by sampling with a ulimit backstop)".to_owned(),
            },
            Ok(status) => HealthStatus::Unavailable {
                kind: ContainmentKind::Rlimit,
                details: format!("shell rejected ulimit: {status}"),
            },
            Err(e) => HealthStatus::Unavailable {
                kind: ContainmentKind::Rlimit,
                details: format!("failed to start sh: {e}"),
            },
        }
    }
}
