//! Running real programs in a chamber (Unix only).

use std::path::Path;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use sentinel::chamber::direct::DirectContainment;
use sentinel::chamber::rlimit::RlimitContainment;
use sentinel::chamber::{
    Chamber, ChamberError, ChamberLimits, Containment, ContainmentKind, HealthStatus,
    ProcessHandle, ResourceUsage,
};
use tokio::process::Child;

fn limits(timeout_secs: u64, cpu_secs: u64) -> ChamberLimits {
    ChamberLimits {
        timeout: Duration::from_secs(timeout_secs),
        memory_bytes: 256 * 1024 * 1024,
        cpu_time: Duration::from_secs(cpu_secs),
    }
}

fn rlimit_chamber(limits: ChamberLimits) -> Chamber {
    Chamber::new(limits, Arc::new(RlimitContainment)).expect("chamber created")
}

#[tokio::test]
async fn program_reads_input_from_working_directory() {
    let chamber = rlimit_chamber(limits(5, 5));
    chamber.write_file("input.txt", b"hello chamber").expect("write input");

    let outcome = chamber.run("cat input.txt; echo oops >&2").await;
    assert!(outcome.terminated_lawfully(), "{outcome:?}");
    assert_eq!(outcome.stdout, b"hello chamber");
    assert_eq!(outcome.stderr, b"oops\n");
    assert_eq!(outcome.exit_code, Some(0));
    chamber.cleanup();
}

#[tokio::test]
async fn nonzero_exit_is_still_lawful() {
    let chamber = rlimit_chamber(limits(5, 5));
    let outcome = chamber.run("exit 3").await;
    assert_eq!(outcome.exit_code, Some(3));
    assert!(outcome.terminated_lawfully());
    assert!(!outcome.launch_failed);
}

#[tokio::test]
async fn never_terminating_program_times_out() {
    let chamber = rlimit_chamber(limits(2, 30));
    let outcome = chamber.run("while :; do :; done").await;

    assert!(outcome.timed_out, "{outcome:?}");
    assert!(!outcome.terminated_lawfully());
    assert!(outcome.wall_time >= Duration::from_secs(2));
    assert!(outcome.wall_time < Duration::from_secs(6), "{:?}", outcome.wall_time);
}

#[tokio::test]
async fn timeout_kills_background_children_too() {
    let chamber = Chamber::new(limits(1, 30), Arc::new(DirectContainment)).expect("chamber");
    let started = std::time::Instant::now();
    let outcome = chamber.run("sleep 30 & sleep 30").await;

    assert!(outcome.timed_out);
    // Pipes held by the orphaned sleep must not stall the call.
    assert!(started.elapsed() < Duration::from_secs(6), "{:?}", started.elapsed());
}

#[tokio::test]
async fn cpu_budget_exhaustion_is_resource_exceeded() {
    let chamber = rlimit_chamber(limits(15, 1));
    let outcome = chamber.run("while :; do :; done").await;

    assert!(outcome.resource_exceeded, "{outcome:?}");
    assert!(!outcome.timed_out);
    assert!(!outcome.terminated_lawfully());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn memory_ceiling_breach_is_resource_exceeded() {
    let chamber = rlimit_chamber(ChamberLimits {
        timeout: Duration::from_secs(15),
        memory_bytes: 64 * 1024 * 1024,
        cpu_time: Duration::from_secs(15),
    });
    // `tail` buffers a newline-free stream whole, so it grows until stopped.
    let outcome = chamber.run("head -c 1G /dev/zero | tail -n 1").await;

    assert!(outcome.resource_exceeded, "{outcome:?}");
    assert!(!outcome.timed_out, "{outcome:?}");
    assert!(!outcome.terminated_lawfully());
    assert!(outcome.usage.peak_memory_bytes > 64 * 1024 * 1024);
}

#[derive(Debug)]
struct RefusingContainment;

#[async_trait::async_trait]
impl Containment for RefusingContainment {
    fn kind(&self) -> ContainmentKind {
        ContainmentKind::Direct
    }

    fn spawn(
        &self,
        _command: &str,
        _dir: &Path,
        _limits: &ChamberLimits,
    ) -> Result<(Child, ProcessHandle), ChamberError> {
        Err(ChamberError::Launch("no such executable".to_owned()))
    }

    fn sample(&self, _handle: &ProcessHandle) -> ResourceUsage {
        ResourceUsage::default()
    }

    async fn kill(&self, _handle: &ProcessHandle) {}

    async fn health_check(&self) -> HealthStatus {
        HealthStatus::Unavailable {
            kind: ContainmentKind::Direct,
            details: "test double".to_owned(),
        }
    }
}

#[tokio::test]
async fn launch_failure_is_flagged_not_propagated() {
    let chamber = Chamber::new(limits(5, 5), Arc::new(RefusingContainment)).expect("chamber");
    let outcome = chamber.run("./anything").await;

    assert!(outcome.launch_failed);
    assert!(!outcome.timed_out);
    assert!(!outcome.resource_exceeded);
    assert!(outcome.stdout.is_empty());
    assert!(!outcome.terminated_lawfully());
}

/// Spawns a shell that bails out the way a failed containment join does.
#[derive(Debug)]
struct UnjoinableContainment;

#[async_trait::async_trait]
impl Containment for UnjoinableContainment {
    fn kind(&self) -> ContainmentKind {
        ContainmentKind::Cgroup
    }

    fn spawn(
        &self,
        _command: &str,
        dir: &Path,
        _limits: &ChamberLimits,
    ) -> Result<(Child, ProcessHandle), ChamberError> {
        let child = tokio::process::Command::new("sh")
            .args(["-c", "exit 125"])
            .current_dir(dir)
            .spawn()
            .map_err(|e| ChamberError::Launch(e.to_string()))?;
        let handle = ProcessHandle {
            pid: child.id(),
            cgroup: None,
        };
        Ok((child, handle))
    }

    fn sample(&self, _handle: &ProcessHandle) -> ResourceUsage {
        ResourceUsage::default()
    }

    fn launch_aborted(&self, _handle: &ProcessHandle, status: Option<ExitStatus>) -> bool {
        status.and_then(|s| s.code()) == Some(125)
    }

    async fn kill(&self, _handle: &ProcessHandle) {}

    async fn health_check(&self) -> HealthStatus {
        HealthStatus::Unavailable {
            kind: ContainmentKind::Cgroup,
            details: "test double".to_owned(),
        }
    }
}

#[tokio::test]
async fn exit_before_containment_is_a_launch_failure() {
    let chamber = Chamber::new(limits(5, 5), Arc::new(UnjoinableContainment)).expect("chamber");
    let outcome = chamber.run("echo never runs").await;

    assert!(outcome.launch_failed, "{outcome:?}");
    assert!(!outcome.timed_out);
    assert!(!outcome.terminated_lawfully());
}

#[tokio::test]
async fn environment_is_scrubbed() {
    let chamber = rlimit_chamber(limits(5, 5));
    let outcome = chamber.run("env | cut -d= -f1 | sort | tr '\\n' ' '").await;
    let names = String::from_utf8_lossy(&outcome.stdout);
    assert!(names.contains("HOME"));
    assert!(!names.contains("CARGO"), "leaked: {names}");
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn memory_and_cpu_are_sampled() {
    let chamber = rlimit_chamber(limits(5, 5));
    let outcome = chamber
        .run("i=0; while [ $i -lt 200000 ]; do i=$((i+1)); done")
        .await;
    assert!(outcome.terminated_lawfully(), "{outcome:?}");
    assert!(outcome.usage.peak_memory_bytes > 0);
}
