//! Isolated execution chamber for untrusted programs.
//!
//! A [`Chamber`] owns a private working directory and runs one shell
//! command at a time under a [`Containment`] backend that enforces memory
//! and CPU-time ceilings. A sampler polls usage every [`SAMPLE_INTERVAL`]
//! and kills the program the moment a sample is over a ceiling; a
//! wall-clock watchdog kills the process group when `timeout` expires. Every failure inside the chamber is reported
//! through [`ChamberOutcome`] flags; nothing is propagated as an error past
//! [`Chamber::run`].

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[cfg(target_os = "linux")]
pub mod cgroup;
pub mod direct;
pub(crate) mod process;
pub(crate) mod procfs;
#[cfg(unix)]
pub mod rlimit;

/// Extra time allowed after a kill for the process to be reaped and its
/// output pipes to drain.
pub const KILL_GRACE: Duration = Duration::from_secs(1);

/// Interval between resource samples while the program runs.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(10);

/// Default location of the sentinel cgroup subtree.
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/sentinel";

/// Name of the file through which each trial input is delivered.
pub const INPUT_FILE: &str = "input.txt";

/// `SIGXCPU`: delivered when the CPU-time rlimit is exceeded.
#[cfg(unix)]
const SIGXCPU: i32 = 24;

/// Exit code a POSIX shell reports for a child killed by `SIGXCPU` (128 + 24).
#[cfg(unix)]
const SHELL_SIGXCPU_EXIT: i32 = 152;

/// Resource ceilings applied to one chamber run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChamberLimits {
    /// Wall-clock budget before the watchdog kills the process.
    pub timeout: Duration,
    /// Memory ceiling in bytes.
    pub memory_bytes: u64,
    /// CPU-time ceiling.
    pub cpu_time: Duration,
}

impl ChamberLimits {
    /// Memory ceiling expressed in mebibytes.
    pub fn memory_mb(&self) -> f64 {
        bytes_to_mb(self.memory_bytes)
    }

    /// Whether `usage` is over the memory or CPU-time ceiling.
    pub fn exceeded_by(&self, usage: &ResourceUsage) -> bool {
        usage.peak_memory_bytes > self.memory_bytes || usage.cpu_time > self.cpu_time
    }
}

impl Default for ChamberLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            memory_bytes: 64 * 1024 * 1024,
            cpu_time: Duration::from_secs(2),
        }
    }
}

/// Peak resource consumption observed for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    /// Peak resident memory in bytes.
    pub peak_memory_bytes: u64,
    /// Largest peak address space of any single process, in bytes. Zero
    /// when the backend cannot observe it.
    pub peak_virtual_bytes: u64,
    /// Consumed CPU time (user + system).
    pub cpu_time: Duration,
}

impl ResourceUsage {
    /// Component-wise maximum of two samples.
    pub fn peak(self, other: Self) -> Self {
        Self {
            peak_memory_bytes: self.peak_memory_bytes.max(other.peak_memory_bytes),
            peak_virtual_bytes: self.peak_virtual_bytes.max(other.peak_virtual_bytes),
            cpu_time: self.cpu_time.max(other.cpu_time),
        }
    }

    /// Peak memory in mebibytes.
    pub fn memory_mb(&self) -> f64 {
        bytes_to_mb(self.peak_memory_bytes)
    }
}

/// Convert bytes to mebibytes without a lossy integer cast.
pub(crate) fn bytes_to_mb(bytes: u64) -> f64 {
    let kib = u32::try_from(bytes / 1024).unwrap_or(u32::MAX);
    f64::from(kib) / 1024.0
}

/// Result of one chamber run.
///
/// `timed_out`, `resource_exceeded` and `launch_failed` are independent;
/// any of them means the run did not terminate lawfully.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChamberOutcome {
    /// Raw captured stdout.
    pub stdout: Vec<u8>,
    /// Raw captured stderr.
    pub stderr: Vec<u8>,
    /// Exit code, when the process exited normally.
    pub exit_code: Option<i32>,
    /// The watchdog killed the process.
    pub timed_out: bool,
    /// A memory or CPU ceiling was exceeded.
    pub resource_exceeded: bool,
    /// The command could not be started, or exited before the backend
    /// had placed it under containment.
    pub launch_failed: bool,
    /// Wall-clock time from spawn to exit (or kill).
    pub wall_time: Duration,
    /// Peak observed consumption.
    pub usage: ResourceUsage,
}

impl ChamberOutcome {
    /// Outcome reported when the command never started.
    pub fn launch_failure(wall_time: Duration) -> Self {
        Self {
            launch_failed: true,
            wall_time,
            ..Self::default()
        }
    }

    /// Whether the run finished on its own within every limit.
    pub fn terminated_lawfully(&self) -> bool {
        !self.timed_out && !self.resource_exceeded && !self.launch_failed
    }
}

/// Errors raised inside the chamber before they are folded into flags.
#[derive(Debug, thiserror::Error)]
pub enum ChamberError {
    /// The command or its OS container could not be started.
    #[error("failed to launch command: {0}")]
    Launch(String),
    /// Filesystem failure on the chamber directory or backend state.
    #[error("chamber I/O failed: {0}")]
    Io(String),
    /// A path escaped the chamber directory or a backend is unavailable.
    #[error("not allowed: {0}")]
    Forbidden(String),
}

/// Containment backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainmentKind {
    /// Linux cgroup v2 container per run.
    Cgroup,
    /// POSIX rlimits set by a shell prelude.
    Rlimit,
    /// Wall-clock enforcement only.
    Direct,
}

impl fmt::Display for ContainmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cgroup => "cgroup",
            Self::Rlimit => "rlimit",
            Self::Direct => "direct",
        };
        f.write_str(name)
    }
}

/// Configured backend preference; `Auto` detects one at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// Pick the strongest backend available on this host.
    #[default]
    Auto,
    /// Require the cgroup backend.
    Cgroup,
    /// Require the rlimit backend.
    Rlimit,
    /// Use the direct backend.
    Direct,
}

impl std::str::FromStr for BackendPreference {
    type Err = ChamberError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cgroup" => Ok(Self::Cgroup),
            "rlimit" => Ok(Self::Rlimit),
            "direct" => Ok(Self::Direct),
            other => Err(ChamberError::Forbidden(format!(
                "unknown containment backend '{other}'"
            ))),
        }
    }
}

/// Health status for a containment backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// Backend enforces every limit.
    Healthy {
        /// Backend kind.
        kind: ContainmentKind,
        /// Human-readable diagnostics.
        details: String,
    },
    /// Backend runs programs but enforces only some limits.
    Degraded {
        /// Backend kind.
        kind: ContainmentKind,
        /// Human-readable diagnostics.
        details: String,
    },
    /// Backend cannot run programs.
    Unavailable {
        /// Backend kind.
        kind: ContainmentKind,
        /// Human-readable diagnostics.
        details: String,
    },
}

impl HealthStatus {
    /// Returns `true` when the backend is fully operational.
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy { .. })
    }
}

/// Identifies a spawned process for sampling and killing, independent of
/// the [`Child`] handle the chamber awaits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    /// OS process id (also the process-group id on Unix).
    pub pid: Option<u32>,
    /// Per-run cgroup directory, for the cgroup backend.
    pub cgroup: Option<PathBuf>,
}

/// OS-specific capability to spawn, measure and kill a contained program.
#[async_trait]
pub trait Containment: Send + Sync + fmt::Debug {
    /// Backend kind.
    fn kind(&self) -> ContainmentKind;

    /// Launch `command` through the shell inside `dir` under `limits`.
    ///
    /// # Errors
    ///
    /// Returns [`ChamberError::Launch`] if the process or its container
    /// cannot be created.
    fn spawn(
        &self,
        command: &str,
        dir: &Path,
        limits: &ChamberLimits,
    ) -> Result<(Child, ProcessHandle), ChamberError>;

    /// Current peak consumption of the contained program.
    fn sample(&self, handle: &ProcessHandle) -> ResourceUsage;

    /// Whether the OS reported a limit violation that sampling alone
    /// cannot show. `usage` is the peak observed over the run.
    fn limit_breached(
        &self,
        _handle: &ProcessHandle,
        _usage: &ResourceUsage,
        _limits: &ChamberLimits,
    ) -> bool {
        false
    }

    /// Whether the program exited before containment was in place, so the
    /// command itself never ran.
    fn launch_aborted(&self, _handle: &ProcessHandle, _status: Option<ExitStatus>) -> bool {
        false
    }

    /// Force-kill everything the program started.
    async fn kill(&self, handle: &ProcessHandle);

    /// Tear down per-run OS state once the program is gone.
    async fn release(&self, _handle: &ProcessHandle) {}

    /// Check whether this backend can enforce its limits.
    async fn health_check(&self) -> HealthStatus;
}

/// Pick a containment backend according to `preference`.
///
/// # Errors
///
/// Returns [`ChamberError::Forbidden`] when an explicitly requested backend
/// is not supported on this platform or cannot be initialised.
pub fn select_containment(
    preference: BackendPreference,
    cgroup_root: &Path,
) -> Result<Arc<dyn Containment>, ChamberError> {
    let selected: Arc<dyn Containment> = match preference {
        BackendPreference::Auto => auto_detect(cgroup_root),
        BackendPreference::Cgroup => cgroup_backend(cgroup_root)?,
        BackendPreference::Rlimit => rlimit_backend()?,
        BackendPreference::Direct => Arc::new(direct::DirectContainment),
    };
    info!(backend = %selected.kind(), "containment backend selected");
    Ok(selected)
}

/// Detect the strongest backend: cgroup, then rlimit, then direct.
pub fn auto_detect(cgroup_root: &Path) -> Arc<dyn Containment> {
    match cgroup_backend(cgroup_root) {
        Ok(backend) => return backend,
        Err(e) => debug!(error = %e, "cgroup backend unavailable"),
    }
    match rlimit_backend() {
        Ok(backend) => backend,
        Err(e) => {
            debug!(error = %e, "rlimit backend unavailable");
            Arc::new(direct::DirectContainment)
        }
    }
}

#[cfg(target_os = "linux")]
fn cgroup_backend(root: &Path) -> Result<Arc<dyn Containment>, ChamberError> {
    Ok(Arc::new(cgroup::CgroupContainment::new(root)?))
}

#[cfg(not(target_os = "linux"))]
fn cgroup_backend(_root: &Path) -> Result<Arc<dyn Containment>, ChamberError> {
    Err(ChamberError::Forbidden(
        "cgroup containment requires Linux".to_owned(),
    ))
}

#[cfg(unix)]
fn rlimit_backend() -> Result<Arc<dyn Containment>, ChamberError> {
    Ok(Arc::new(rlimit::RlimitContainment))
}

#[cfg(not(unix))]
fn rlimit_backend() -> Result<Arc<dyn Containment>, ChamberError> {
    Err(ChamberError::Forbidden(
        "rlimit containment requires a Unix host".to_owned(),
    ))
}

/// Resolve `requested` inside `base`, rejecting paths that escape it.
///
/// The check is lexical: `.` and `..` are resolved without touching the
/// filesystem, so the target need not exist yet.
///
/// # Errors
///
/// Returns [`ChamberError::Forbidden`] when the resolved path leaves `base`.
pub fn confine(base: &Path, requested: &Path) -> Result<PathBuf, ChamberError> {
    let resolved = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        base.join(requested)
    };

    let normalized = normalize_path(&resolved);
    let base_normalized = normalize_path(base);

    if !normalized.starts_with(&base_normalized) || normalized == base_normalized {
        return Err(ChamberError::Forbidden(format!(
            "path '{}' escapes chamber '{}'",
            requested.display(),
            base.display()
        )));
    }

    Ok(normalized)
}

/// Normalize a path by resolving `.` and `..` components without filesystem access.
fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                components.pop();
            }
            Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// A private, resource-limited execution context for one untrusted program.
#[derive(Debug)]
pub struct Chamber {
    dir: tempfile::TempDir,
    limits: ChamberLimits,
    containment: Arc<dyn Containment>,
}

impl Chamber {
    /// Create a chamber with a fresh private directory.
    ///
    /// # Errors
    ///
    /// Returns [`ChamberError::Io`] if the directory cannot be created.
    pub fn new(
        limits: ChamberLimits,
        containment: Arc<dyn Containment>,
    ) -> Result<Self, ChamberError> {
        let dir = tempfile::Builder::new()
            .prefix("chamber_")
            .tempdir()
            .map_err(|e| ChamberError::Io(format!("failed to create chamber directory: {e}")))?;
        debug!(dir = %dir.path().display(), backend = %containment.kind(), "chamber created");
        Ok(Self {
            dir,
            limits,
            containment,
        })
    }

    /// The chamber's private working directory.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Limits applied to every run.
    pub fn limits(&self) -> &ChamberLimits {
        &self.limits
    }

    /// Write a file inside the chamber directory.
    ///
    /// # Errors
    ///
    /// Returns [`ChamberError::Forbidden`] if `relative` escapes the
    /// chamber, or [`ChamberError::Io`] if the write fails.
    pub fn write_file(&self, relative: &str, contents: &[u8]) -> Result<PathBuf, ChamberError> {
        let path = confine(self.dir(), Path::new(relative))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ChamberError::Io(format!("failed to create {}: {e}", parent.display())))?;
        }
        std::fs::write(&path, contents)
            .map_err(|e| ChamberError::Io(format!("failed to write {}: {e}", path.display())))?;
        Ok(path)
    }

    /// Run `command` through the shell inside the chamber.
    ///
    /// Blocks (asynchronously) until the program exits or the watchdog
    /// kills it; the sampling task is always joined before returning.
    pub async fn run(&self, command: &str) -> ChamberOutcome {
        let started = Instant::now();
        let (mut child, handle) = match self.containment.spawn(command, self.dir(), &self.limits) {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!(error = %e, command, "chamber launch failed");
                return ChamberOutcome::launch_failure(started.elapsed());
            }
        };

        let stdout_task = child.stdout.take().map(|pipe| tokio::spawn(read_pipe(pipe)));
        let stderr_task = child.stderr.take().map(|pipe| tokio::spawn(read_pipe(pipe)));

        let (stop_tx, stop_rx) = oneshot::channel();
        let sampler = tokio::spawn(sample_until_stopped(
            Arc::clone(&self.containment),
            handle.clone(),
            self.limits,
            stop_rx,
        ));

        let mut timed_out = false;
        let status = match tokio::time::timeout(self.limits.timeout, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!(error = %e, "failed to wait for chamber process");
                self.force_kill(&mut child, &handle).await
            }
            Err(_) => {
                timed_out = true;
                warn!(
                    timeout_secs = self.limits.timeout.as_secs_f64(),
                    "chamber watchdog fired, killing process"
                );
                self.force_kill(&mut child, &handle).await
            }
        };
        let wall_time = started.elapsed();

        let _ = stop_tx.send(());
        let (sampled, enforced) = sampler.await.unwrap_or_default();
        let usage = sampled.peak(self.containment.sample(&handle));

        let (stdout, stdout_drained) = collect_pipe(stdout_task).await;
        let (stderr, stderr_drained) = collect_pipe(stderr_task).await;
        if !stdout_drained || !stderr_drained {
            debug!("output pipes still held open, sweeping process group");
            self.containment.kill(&handle).await;
        }

        let launch_failed = self.containment.launch_aborted(&handle, status);
        if launch_failed {
            warn!(command, "program exited before containment was in place");
        }
        let resource_exceeded = enforced
            || self.limits.exceeded_by(&usage)
            || self.containment.limit_breached(&handle, &usage, &self.limits)
            || status.is_some_and(cpu_limit_signalled);

        if resource_exceeded && matches!(child.try_wait(), Ok(None)) {
            self.force_kill(&mut child, &handle).await;
        }

        self.containment.release(&handle).await;

        let outcome = ChamberOutcome {
            stdout,
            stderr,
            exit_code: status.and_then(|s| s.code()),
            timed_out,
            resource_exceeded,
            launch_failed,
            wall_time,
            usage,
        };
        debug!(
            exit_code = ?outcome.exit_code,
            timed_out,
            resource_exceeded,
            wall_ms = wall_time.as_secs_f64() * 1000.0,
            peak_memory_bytes = usage.peak_memory_bytes,
            "chamber run finished"
        );
        outcome
    }

    /// Kill the program and wait up to [`KILL_GRACE`] for it to be reaped.
    async fn force_kill(
        &self,
        child: &mut Child,
        handle: &ProcessHandle,
    ) -> Option<ExitStatus> {
        self.containment.kill(handle).await;
        let _ = child.start_kill();
        match tokio::time::timeout(KILL_GRACE, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!(error = %e, "failed to reap killed chamber process");
                None
            }
            Err(_) => {
                warn!("chamber process survived kill grace period");
                None
            }
        }
    }

    /// Remove the private directory.
    ///
    /// Dropping the chamber also removes it; this variant logs failures.
    pub fn cleanup(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!(dir = %path.display(), error = %e, "failed to remove chamber directory");
        }
    }
}

async fn read_pipe<R>(mut pipe: R) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buffer = Vec::new();
    if let Err(e) = pipe.read_to_end(&mut buffer).await {
        debug!(error = %e, "chamber pipe read ended with error");
    }
    buffer
}

/// Await a pipe reader for at most [`KILL_GRACE`]. Returns the bytes read
/// and whether the pipe reached EOF in time.
async fn collect_pipe(task: Option<JoinHandle<Vec<u8>>>) -> (Vec<u8>, bool) {
    let Some(mut task) = task else {
        return (Vec::new(), true);
    };
    match tokio::time::timeout(KILL_GRACE, &mut task).await {
        Ok(Ok(bytes)) => (bytes, true),
        Ok(Err(e)) => {
            debug!(error = %e, "chamber pipe reader panicked");
            (Vec::new(), true)
        }
        Err(_) => {
            task.abort();
            (Vec::new(), false)
        }
    }
}

/// Sample until told to stop, killing the program the first time a sample
/// is over a ceiling. Returns the peak and whether the kill was issued.
async fn sample_until_stopped(
    containment: Arc<dyn Containment>,
    handle: ProcessHandle,
    limits: ChamberLimits,
    mut stop: oneshot::Receiver<()>,
) -> (ResourceUsage, bool) {
    let mut peak = containment.sample(&handle);
    let mut enforced = false;
    let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => {
                peak = peak.peak(containment.sample(&handle));
                if !enforced && limits.exceeded_by(&peak) {
                    enforced = true;
                    warn!(
                        peak_memory_bytes = peak.peak_memory_bytes,
                        cpu_ms = peak.cpu_time.as_millis(),
                        "resource ceiling exceeded, killing process"
                    );
                    containment.kill(&handle).await;
                }
            }
        }
    }
    (peak, enforced)
}

#[cfg(unix)]
fn cpu_limit_signalled(status: ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(SIGXCPU) || status.code() == Some(SHELL_SIGXCPU_EXIT)
}

#[cfg(not(unix))]
fn cpu_limit_signalled(_status: ExitStatus) -> bool {
    false
}
