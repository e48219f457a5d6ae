//! Pre-build shell checks with a timeout and bounded output.

use std::io::Read;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured result of a shell check.
#[derive(Debug)]
pub struct CheckOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub truncated: usize,
    pub timed_out: bool,
}

impl CheckOutput {
    pub fn passed(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    /// Last non-empty stderr line, falling back to stdout.
    pub fn summary(&self) -> String {
        let last_line = |bytes: &[u8]| {
            String::from_utf8_lossy(bytes)
                .lines()
                .rev()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .map(str::to_string)
        };
        last_line(&self.stderr)
            .or_else(|| last_line(&self.stdout))
            .unwrap_or_default()
    }
}

/// Run `script` through `sh -c` in `workdir`, killing it after `timeout`.
///
/// Output is read concurrently while the child runs; at most
/// `output_limit_bytes` of each stream is kept.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs()))]
pub fn run_shell_check(
    workdir: &Path,
    script: &str,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CheckOutput> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(script)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!(script, "spawning shell check");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn shell");
            return Err(e).context("spawn sh");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for shell check")? {
        Some(status) => status,
        None => {
            warn!(timeout_secs = timeout.as_secs(), "shell check timed out, killing");
            timed_out = true;
            child.kill().context("kill shell check")?;
            child.wait().context("wait shell check after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    debug!(exit_code = ?status.code(), timed_out, "shell check finished");
    Ok(CheckOutput {
        status,
        stdout,
        stderr,
        truncated: stdout_truncated + stderr_truncated,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        let keep = n.min(remaining);
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }

    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passing_check() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = run_shell_check(temp.path(), "echo ok", Duration::from_secs(10), 1024)
            .expect("run");
        assert!(out.passed());
        assert_eq!(out.summary(), "ok");
    }

    #[test]
    fn failing_check_reports_stderr() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = run_shell_check(
            temp.path(),
            "echo fine; echo broken >&2; exit 3",
            Duration::from_secs(10),
            1024,
        )
        .expect("run");
        assert!(!out.passed());
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(out.summary(), "broken");
    }

    #[test]
    fn check_runs_in_workdir() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("Dockerfile"), "FROM scratch\n").expect("write");
        let out = run_shell_check(temp.path(), "test -f Dockerfile", Duration::from_secs(10), 64)
            .expect("run");
        assert!(out.passed());
    }

    #[test]
    fn slow_check_times_out() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = run_shell_check(temp.path(), "exec sleep 5", Duration::from_millis(100), 64)
            .expect("run");
        assert!(out.timed_out);
        assert!(!out.passed());
    }

    #[test]
    fn output_is_bounded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = run_shell_check(temp.path(), "printf 0123456789", Duration::from_secs(10), 4)
            .expect("run");
        assert_eq!(out.stdout, b"0123");
        assert_eq!(out.truncated, 6);
    }
}
