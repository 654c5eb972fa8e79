//! Child process helpers: bounded script runs, readiness probing and
//! graceful termination.

use crate::error::{ExecError, ExecResult};
use std::ffi::OsStr;
use std::net::Ipv4Addr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::Instant;

/// Interval between readiness and liveness polls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Maximum stderr bytes carried into an error.
const MAX_STDERR: usize = 4096;

/// Run a command to completion within `timeout`, returning its output.
///
/// The child is killed if the timeout elapses. A non-zero exit is not an
/// error here; callers map exit codes themselves.
pub async fn run_with_timeout<I, S>(program: &OsStr, args: I, timeout: Duration) -> ExecResult<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match tokio::time::timeout(timeout, command.output()).await {
        Ok(output) => Ok(output?),
        Err(_) => Err(ExecError::Timeout {
            operation: format!("command `{}`", program.to_string_lossy()),
            after: timeout,
        }),
    }
}

/// Run a command and fail with `CommandFailed` on a non-zero exit.
pub async fn run_checked<I, S>(program: &str, args: I, timeout: Duration) -> ExecResult<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<S> = args.into_iter().collect();
    let rendered = std::iter::once(program.to_string())
        .chain(args.iter().map(|a| a.as_ref().to_string_lossy().into_owned()))
        .collect::<Vec<_>>()
        .join(" ");

    let output = run_with_timeout(OsStr::new(program), &args, timeout).await?;
    if !output.status.success() {
        return Err(ExecError::CommandFailed {
            command: rendered,
            status: output.status.code(),
            stderr: stderr_excerpt(&output),
        });
    }
    Ok(output)
}

/// Trimmed, bounded stderr for error messages.
pub fn stderr_excerpt(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let trimmed = stderr.trim();
    if trimmed.len() <= MAX_STDERR {
        return trimmed.to_string();
    }
    let mut end = MAX_STDERR;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}

/// Wait until something accepts TCP connections on `127.0.0.1:port`.
///
/// Fails early with `StartupFailed` if `child` exits first, and with
/// `Timeout` once `timeout` has elapsed.
pub async fn wait_until_ready(child: &mut Child, port: u16, timeout: Duration) -> ExecResult<()> {
    let deadline = Instant::now() + timeout;

    loop {
        if TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.is_ok() {
            return Ok(());
        }

        if let Some(status) = child.try_wait()? {
            return Err(ExecError::StartupFailed(format!(
                "process exited with {status} before accepting connections on port {port}"
            )));
        }

        if Instant::now() >= deadline {
            return Err(ExecError::Timeout {
                operation: format!("waiting for port {port}"),
                after: timeout,
            });
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Send a signal, treating "no such process" as success.
///
/// Returns whether the process existed.
fn signal(pid: u32, sig: libc::c_int) -> ExecResult<bool> {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return Ok(false);
    };
    if pid <= 0 {
        return Ok(false);
    }
    // SAFETY: kill() has no memory-safety preconditions; pid is positive.
    let ret = unsafe { libc::kill(pid, sig) };
    if ret == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err.into())
    }
}

/// Stop a child we spawned: SIGTERM, wait up to `grace`, then SIGKILL.
pub async fn stop_child(child: &mut Child, grace: Duration) -> ExecResult<()> {
    if child.try_wait()?.is_some() {
        return Ok(());
    }
    if let Some(pid) = child.id() {
        signal(pid, libc::SIGTERM)?;
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            tracing::debug!(status = ?status.ok(), "Process exited after SIGTERM");
            Ok(())
        }
        Err(_) => {
            tracing::warn!(grace = ?grace, "Process ignored SIGTERM, sending SIGKILL");
            child.kill().await?;
            Ok(())
        }
    }
}

/// Whether `arg` names `marker` as a whole path or a prefix of one.
fn mentions(arg: &[u8], marker: &[u8]) -> bool {
    if marker.is_empty() || arg.len() < marker.len() {
        return false;
    }
    arg.windows(marker.len())
        .enumerate()
        .any(|(at, window)| {
            window == marker && matches!(arg.get(at + marker.len()).copied(), None | Some(b'/'))
        })
}

/// Whether `pid` is a live process started with `marker` in its argv.
///
/// Pids are recycled, so one read back from disk says nothing on its own.
/// Zombies report an empty command line and count as gone.
async fn owns_pid(pid: u32, marker: &Path) -> ExecResult<bool> {
    let cmdline = match tokio::fs::read(format!("/proc/{pid}/cmdline")).await {
        Ok(cmdline) => cmdline,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) if e.raw_os_error() == Some(libc::ESRCH) => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    let marker = marker.as_os_str().as_bytes();
    Ok(cmdline.split(|b| *b == 0).any(|arg| mentions(arg, marker)))
}

/// Stop a process known only by pid (spawned before a restart).
///
/// The process is only signalled while its command line still mentions
/// `marker`, the instance data directory.
pub async fn stop_pid(pid: u32, marker: &Path, grace: Duration) -> ExecResult<()> {
    if !owns_pid(pid, marker).await? {
        tracing::debug!(pid = pid, marker = %marker.display(), "Recorded process is gone or was replaced");
        return Ok(());
    }
    if !signal(pid, libc::SIGTERM)? {
        return Ok(());
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        tokio::time::sleep(POLL_INTERVAL).await;
        if !owns_pid(pid, marker).await? {
            return Ok(());
        }
    }

    tracing::warn!(pid = pid, grace = ?grace, "Process ignored SIGTERM, sending SIGKILL");
    signal(pid, libc::SIGKILL)?;
    Ok(())
}
