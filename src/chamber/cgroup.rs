//! Linux cgroup v2 containment.
//!
//! Each run gets its own child cgroup under the configured root
//! (`/sys/fs/cgroup/sentinel` by default) with `memory.max` set and swap
//! disabled. The shell moves itself into the cgroup before running the
//! command, so every descendant is accounted for and `cgroup.kill` reaches
//! all of them. CPU time is capped with an inherited rlimit because cgroup
//! v2 only offers bandwidth throttling, not a total budget.
//!
//! If the shell cannot join its group it exits with [`JOIN_FAILED_EXIT`]
//! before running anything; a run that ends that way with no CPU time
//! charged to the group is reported as a failed launch.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;
use tracing::{debug, warn};

use super::{
    process, ChamberError, ChamberLimits, Containment, ContainmentKind, HealthStatus,
    ProcessHandle, ResourceUsage,
};

/// Exit status of the shell prelude when it cannot join the run cgroup.
pub const JOIN_FAILED_EXIT: i32 = 125;

/// Attempts made to remove a per-run cgroup whose processes are still exiting.
const RELEASE_ATTEMPTS: u32 = 5;

/// Delay between removal attempts.
const RELEASE_BACKOFF: Duration = Duration::from_millis(20);

/// Backend enforcing memory through cgroup v2.
#[derive(Debug, Clone)]
pub struct CgroupContainment {
    root: PathBuf,
}

impl CgroupContainment {
    /// Prepare the cgroup subtree at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`ChamberError::Forbidden`] when the host has no cgroup v2
    /// hierarchy at the parent of `root`, or the subtree cannot be created
    /// or delegated the memory controller.
    pub fn new(root: &Path) -> Result<Self, ChamberError> {
        let parent = root.parent().ok_or_else(|| {
            ChamberError::Forbidden(format!("cgroup root '{}' has no parent", root.display()))
        })?;
        let controllers = std::fs::read_to_string(parent.join("cgroup.controllers"))
            .map_err(|e| {
                ChamberError::Forbidden(format!(
                    "no cgroup v2 hierarchy at '{}': {e}",
                    parent.display()
                ))
            })?;
        if !controllers.split_whitespace().any(|c| c == "memory") {
            return Err(ChamberError::Forbidden(format!(
                "memory controller not available at '{}'",
                parent.display()
            )));
        }

        std::fs::create_dir_all(root).map_err(|e| {
            ChamberError::Forbidden(format!("cannot create cgroup '{}': {e}", root.display()))
        })?;
        std::fs::write(root.join("cgroup.subtree_control"), "+memory").map_err(|e| {
            ChamberError::Forbidden(format!(
                "cannot delegate memory controller under '{}': {e}",
                root.display()
            ))
        })?;

        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Root of the sentinel subtree.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn create_run_group(&self, limits: &ChamberLimits) -> Result<PathBuf, ChamberError> {
        let group = self
            .root
            .join(format!("chamber-{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir(&group).map_err(|e| {
            ChamberError::Launch(format!("cannot create cgroup '{}': {e}", group.display()))
        })?;
        if let Err(e) = std::fs::write(group.join("memory.max"), limits.memory_bytes.to_string())
        {
            let _ = std::fs::remove_dir(&group);
            return Err(ChamberError::Launch(format!(
                "cannot set memory.max on '{}': {e}",
                group.display()
            )));
        }
        if let Err(e) = std::fs::write(group.join("memory.swap.max"), "0") {
            debug!(group = %group.display(), error = %e, "swap limit not supported");
        }
        Ok(group)
    }

    /// Shell script that joins `group`, caps CPU time, then runs `command`.
    pub fn wrap(command: &str, group: &Path, limits: &ChamberLimits) -> String {
        let procs = group.join("cgroup.procs");
        let cpu_secs = process::ceil_secs(limits.cpu_time);
        format!(
            "echo $$ > {} || exit {JOIN_FAILED_EXIT}; ulimit -t {cpu_secs} 2>/dev/null; {command}",
            process::shell_quote(&procs.to_string_lossy())
        )
    }
}

#[async_trait::async_trait]
impl Containment for CgroupContainment {
    fn kind(&self) -> ContainmentKind {
        ContainmentKind::Cgroup
    }

    fn spawn(
        &self,
        command: &str,
        dir: &Path,
        limits: &ChamberLimits,
    ) -> Result<(Child, ProcessHandle), ChamberError> {
        let group = self.create_run_group(limits)?;
        let script = Self::wrap(command, &group, limits);
        match process::shell_command(&script, dir).spawn() {
            Ok(child) => {
                let handle = ProcessHandle {
                    pid: child.id(),
                    cgroup: Some(group),
                };
                Ok((child, handle))
            }
            Err(e) => {
                let _ = std::fs::remove_dir(&group);
                Err(ChamberError::Launch(e.to_string()))
            }
        }
    }

    fn sample(&self, handle: &ProcessHandle) -> ResourceUsage {
        let Some(group) = handle.cgroup.as_deref() else {
            return ResourceUsage::default();
        };
        let memory = read_u64(&group.join("memory.peak"))
            .or_else(|| read_u64(&group.join("memory.current")));
        let cpu = std::fs::read_to_string(group.join("cpu.stat"))
            .ok()
            .and_then(|stat| keyed_value(&stat, "usage_usec"))
            .map(Duration::from_micros);

        match (memory, cpu) {
            (Some(peak_memory_bytes), Some(cpu_time)) => ResourceUsage {
                peak_memory_bytes,
                peak_virtual_bytes: 0,
                cpu_time,
            },
            _ => handle.pid.map(super::procfs::sample_tree).unwrap_or_default(),
        }
    }

    fn limit_breached(
        &self,
        handle: &ProcessHandle,
        _usage: &ResourceUsage,
        _limits: &ChamberLimits,
    ) -> bool {
        handle
            .cgroup
            .as_deref()
            .and_then(|group| std::fs::read_to_string(group.join("memory.events")).ok())
            .and_then(|events| keyed_value(&events, "oom_kill"))
            .is_some_and(|kills| kills > 0)
    }

    fn launch_aborted(&self, handle: &ProcessHandle, status: Option<ExitStatus>) -> bool {
        if status.and_then(|s| s.code()) != Some(JOIN_FAILED_EXIT) {
            return false;
        }
        let Some(group) = handle.cgroup.as_deref() else {
            return false;
        };
        let charged = std::fs::read_to_string(group.join("cpu.stat"))
            .ok()
            .and_then(|stat| keyed_value(&stat, "usage_usec"));
        !matches!(charged, Some(usec) if usec > 0)
    }

    async fn kill(&self, handle: &ProcessHandle) {
        if let Some(group) = handle.cgroup.as_deref() {
            match tokio::fs::write(group.join("cgroup.kill"), "1").await {
                Ok(()) => return,
                Err(e) => debug!(group = %group.display(), error = %e, "cgroup.kill unavailable"),
            }
        }
        if let Some(pid) = handle.pid {
            process::kill_group(pid).await;
        }
    }

    async fn release(&self, handle: &ProcessHandle) {
        let Some(group) = handle.cgroup.as_deref() else {
            return;
        };
        for attempt in 1..=RELEASE_ATTEMPTS {
            match tokio::fs::remove_dir(group).await {
                Ok(()) => return,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
                Err(e) if attempt == RELEASE_ATTEMPTS => {
                    warn!(group = %group.display(), error = %e, "failed to remove run cgroup");
                }
                Err(_) => tokio::time::sleep(RELEASE_BACKOFF).await,
            }
        }
    }

    async fn health_check(&self) -> HealthStatus {
        match tokio::fs::read_to_string(self.root.join("cgroup.subtree_control")).await {
            Ok(control) if control.split_whitespace().any(|c| c == "memory") => {
                HealthStatus::Healthy {
                    kind: ContainmentKind::Cgroup,
                    details: format!("cgroup v2 containment at {}", self.root.display()),
                }
            }
            Ok(_) => HealthStatus::Degraded {
                kind: ContainmentKind::Cgroup,
                details: "memory controller not delegated; relying on sampling".to_owned(),
            },
            Err(e) => HealthStatus::Unavailable {
                kind: ContainmentKind::Cgroup,
                details: format!("cgroup root {} unreadable: {e}", self.root.display()),
            },
        }
    }
}

fn read_u64(path: &Path) -> Option<u64> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Value of a `key value` line in flat-keyed cgroup files (`cpu.stat`, `memory.events`).
fn keyed_value(contents: &str, key: &str) -> Option<u64> {
    contents.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        if parts.next()? == key {
            parts.next()?.parse().ok()
        } else {
            None
        }
    })
}
