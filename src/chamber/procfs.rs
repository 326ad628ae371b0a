//! Resource sampling from `/proc` for a process and its descendants.
//!
//! Memory is the sum of each live process's high-water mark (`VmHWM`), so
//! it over-approximates the tree's simultaneous peak. Address space is the
//! largest single `VmPeak`, since address-space rlimits are per process.
//! CPU time adds user
//! and system ticks, including reaped children. Once a process has been
//! reaped it can no longer be sampled; callers keep the running maximum.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use super::ResourceUsage;

/// Milliseconds per kernel clock tick. `USER_HZ` is 100 on every
/// mainstream Linux architecture.
const MILLIS_PER_TICK: u64 = 10;

/// Sample the process tree rooted at `root`.
pub(crate) fn sample_tree(root: u32) -> ResourceUsage {
    sample_tree_at(Path::new("/proc"), root)
}

fn sample_tree_at(proc_root: &Path, root: u32) -> ResourceUsage {
    let mut usage = ResourceUsage::default();
    let mut seen = HashSet::new();
    let mut stack = vec![root];

    while let Some(pid) = stack.pop() {
        if !seen.insert(pid) {
            continue;
        }
        if let Some(process) = read_process(proc_root, pid) {
            usage.peak_memory_bytes = usage
                .peak_memory_bytes
                .saturating_add(process.peak_memory_bytes);
            usage.peak_virtual_bytes = usage.peak_virtual_bytes.max(process.peak_virtual_bytes);
            usage.cpu_time = usage.cpu_time.saturating_add(process.cpu_time);
        }
        stack.extend(children(proc_root, pid));
    }

    usage
}

fn read_process(proc_root: &Path, pid: u32) -> Option<ResourceUsage> {
    let dir = proc_root.join(pid.to_string());
    let status = std::fs::read_to_string(dir.join("status")).ok()?;
    let stat = std::fs::read_to_string(dir.join("stat")).ok()?;

    let memory_kib = status_kib(&status, "VmHWM:")
        .or_else(|| status_kib(&status, "VmRSS:"))
        .unwrap_or(0);
    let virtual_kib = status_kib(&status, "VmPeak:")
        .or_else(|| status_kib(&status, "VmSize:"))
        .unwrap_or(0);
    let ticks = cpu_ticks(&stat)?;

    Some(ResourceUsage {
        peak_memory_bytes: memory_kib.saturating_mul(1024),
        peak_virtual_bytes: virtual_kib.saturating_mul(1024),
        cpu_time: Duration::from_millis(ticks.saturating_mul(MILLIS_PER_TICK)),
    })
}

/// Parse a `Key:   1234 kB` line from `/proc/<pid>/status`.
fn status_kib(status: &str, key: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix(key))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse().ok())
}

/// Sum `utime + stime + cutime + cstime` from `/proc/<pid>/stat`.
///
/// The command name (field 2) may contain spaces and parentheses, so
/// fields are counted from the last `)`.
fn cpu_ticks(stat: &str) -> Option<u64> {
    let (_, rest) = stat.rsplit_once(')')?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is field 3 (state); utime is field 14.
    [11_usize, 12, 13, 14].iter().try_fold(0_u64, |acc, idx| {
        let ticks: i64 = fields.get(*idx)?.parse().ok()?;
        Some(acc.saturating_add(u64::try_from(ticks).unwrap_or(0)))
    })
}

fn children(proc_root: &Path, pid: u32) -> Vec<u32> {
    let tasks = proc_root.join(pid.to_string()).join("task");
    let Ok(entries) = std::fs::read_dir(&tasks) else {
        return Vec::new();
    };

    entries
        .flatten()
        .filter_map(|task| std::fs::read_to_string(task.path().join("children")).ok())
        .flat_map(|listing| {
            listing
                .split_whitespace()
                .filter_map(|p| p.parse().ok())
                .collect::<Vec<u32>>()
        })
        .collect()
}
