//! Direct containment: wall-clock enforcement only.
//!
//! Used when neither cgroups nor rlimits are available. Memory and CPU are
//! still sampled (on Linux, via `/proc`) and the chamber kills the program
//! once a sample is over a ceiling, but nothing caps them between samples.

use std::path::Path;

use tokio::process::Child;

use super::{
    process, ChamberError, ChamberLimits, Containment, ContainmentKind, HealthStatus,
    ProcessHandle, ResourceUsage,
};

/// Backend that relies on the chamber watchdog alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectContainment;

#[async_trait::async_trait]
impl Containment for DirectContainment {
    fn kind(&self) -> ContainmentKind {
        ContainmentKind::Direct
    }

    fn spawn(
        &self,
        command: &str,
        dir: &Path,
        _limits: &ChamberLimits,
    ) -> Result<(Child, ProcessHandle), ChamberError> {
        let child = process::shell_command(command, dir)
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

    async fn kill(&self, handle: &ProcessHandle) {
        if let Some(pid) = handle.pid {
            process::kill_group(pid).await;
        }
    }

    async fn health_check(&self) -> HealthStatus {
        HealthStatus::Degraded {
            kind: ContainmentKind::Direct,
            details: "direct containment available (wall-clock limit; memory and CPU by sampling only)"
                .to_owned(),
        }
    }
}
