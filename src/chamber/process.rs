//! Shell launching and process-group signalling shared by all backends.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

/// Build a shell command that runs `script` inside `dir`.
///
/// The child gets a scrubbed environment (only `PATH`, with `HOME` pointing
/// at the chamber) and its own process group so the whole tree can be
/// signalled at once.
pub(crate) fn shell_command(script: &str, dir: &Path) -> Command {
    let mut command = if cfg!(windows) {
        let mut c = std::process::Command::new("cmd");
        c.arg("/C").arg(script);
        c
    } else {
        let mut c = std::process::Command::new("sh");
        c.arg("-c").arg(script);
        c
    };

    command
        .current_dir(dir)
        .env_clear()
        .env("HOME", dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(path) = std::env::var_os("PATH") {
        command.env("PATH", path);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut command = Command::from(command);
    command.kill_on_drop(true);
    command
}

/// Quote a value for safe interpolation into a POSIX shell script.
pub(crate) fn shell_quote(raw: &str) -> String {
    let escaped = raw.replace('\'', r"'\''");
    format!("'{escaped}'")
}

/// Whole seconds needed to cover `duration`, rounding up, at least one.
pub(crate) fn ceil_secs(duration: std::time::Duration) -> u64 {
    let whole = duration.as_secs();
    let rounded = if duration.subsec_nanos() > 0 {
        whole.saturating_add(1)
    } else {
        whole
    };
    rounded.max(1)
}

/// Shell script that sends SIGKILL to the group led by `pgid`.
///
/// `kill` is a shell builtin, so no external binary is needed.
pub(crate) fn kill_script(pgid: u32) -> String {
    format!("kill -KILL -{pgid}")
}

/// Send SIGKILL to the process group led by `pgid`.
///
/// Failures are only logged: the group may already be gone.
#[cfg(unix)]
pub(crate) async fn kill_group(pgid: u32) {
    let result = Command::new("sh")
        .arg("-c")
        .arg(kill_script(pgid))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match result {
        Ok(status) if status.success() => debug!(pgid, "killed process group"),
        Ok(status) => debug!(pgid, ?status, "process group already gone"),
        Err(e) => debug!(pgid, error = %e, "failed to start sh for kill"),
    }
}

/// Process groups are a Unix concept; elsewhere the chamber kills the child directly.
#[cfg(not(unix))]
pub(crate) async fn kill_group(_pgid: u32) {}
