//! Bounded child processes: wall-clock timeout, capped output, kill-and-reap.
//!
//! On Unix every child leads its own process group. When the child finishes or
//! times out the whole group is killed, so helpers it started (browsers, node
//! servers, nested agents) cannot outlive it or keep its pipes open.

use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// The program could not be started at all (missing binary, bad cwd, ...).
///
/// Returned inside `anyhow::Error`; callers that treat this as an
/// infrastructure failure use `downcast_ref::<SpawnError>()`.
#[derive(Debug, thiserror::Error)]
#[error("failed to start '{program}': {source}")]
pub struct SpawnError {
    pub program: String,
    #[source]
    pub source: io::Error,
}

/// Invocation of an external command.
#[derive(Debug, Clone)]
pub struct CommandSpec<'a> {
    pub argv: &'a [String],
    pub cwd: &'a Path,
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl<'a> CommandSpec<'a> {
    pub fn new(argv: &'a [String], cwd: &'a Path, timeout: Duration) -> Self {
        Self {
            argv,
            cwd,
            env: Vec::new(),
            stdin: None,
            timeout,
            output_limit_bytes: 100_000,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }
}

/// What a finished (or killed) child left behind.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// Bytes dropped from stdout+stderr beyond the output limit.
    pub truncated: usize,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl ProcessOutput {
    /// stdout and stderr joined, for logs and error excerpts.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        if self.truncated > 0 {
            out.push_str(&format!("\n[output truncated {} bytes]\n", self.truncated));
        }
        out
    }
}

/// Run `spec` to completion or until its timeout, then kill and reap it.
///
/// Pipes are drained on reader threads while the child runs, so a chatty child
/// cannot deadlock against a full pipe.
#[instrument(
    skip_all,
    fields(
        program = spec.argv.first().map(String::as_str).unwrap_or(""),
        timeout_secs = spec.timeout.as_secs()
    )
)]
pub fn run_bounded(spec: CommandSpec<'_>) -> Result<ProcessOutput> {
    let (program, args) = spec
        .argv
        .split_first()
        .ok_or_else(|| anyhow!("empty command"))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(spec.cwd)
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|source| SpawnError {
        program: program.clone(),
        source,
    })?;
    debug!(pid = child.id(), "child spawned");

    let stdin_handle = match (spec.stdin, child.stdin.take()) {
        (Some(input), Some(mut pipe)) => Some(thread::spawn(move || {
            match pipe.write_all(&input) {
                Err(err) if err.kind() != io::ErrorKind::BrokenPipe => Err(err),
                _ => Ok(()),
            }
        })),
        _ => None,
    };

    let stdout = child.stdout.take().ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child.stderr.take().ok_or_else(|| anyhow!("stderr was not piped"))?;
    let limit = spec.output_limit_bytes;
    let stdout_handle = thread::spawn(move || drain_limited(stdout, limit));
    let stderr_handle = thread::spawn(move || drain_limited(stderr, limit));

    let mut timed_out = false;
    let status = match child.wait_timeout(spec.timeout).context("wait for child")? {
        Some(status) => status,
        None => {
            warn!(timeout_secs = spec.timeout.as_secs(), "child exceeded timeout, killing");
            timed_out = true;
            kill_group(child.id());
            if let Err(err) = child.kill()
                && err.kind() != io::ErrorKind::InvalidInput
            {
                return Err(err).context("kill child");
            }
            child.wait().context("reap child after kill")?
        }
    };
    // Descendants still holding stdout/stderr would block the readers below.
    kill_group(child.id());

    if let Some(handle) = stdin_handle {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(err = %err, "failed to write child stdin"),
            Err(_) => warn!("stdin writer thread panicked"),
        }
    }
    let (stdout, stdout_dropped) = join_reader(stdout_handle).context("join stdout")?;
    let (stderr, stderr_dropped) = join_reader(stderr_handle).context("join stderr")?;
    let truncated = stdout_dropped + stderr_dropped;
    if truncated > 0 {
        warn!(truncated, "child output truncated");
    }

    let elapsed = started.elapsed();
    debug!(
        exit_code = ?status.code(),
        timed_out,
        elapsed_ms = elapsed.as_millis() as u64,
        "child finished"
    );
    Ok(ProcessOutput {
        exit_code: status.code(),
        success: status.success() && !timed_out,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        truncated,
        timed_out,
        elapsed,
    })
}

/// SIGKILL the process group led by `pid`. A group that is already gone is fine.
#[cfg(unix)]
fn kill_group(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        warn!(pid, "pid out of range, cannot signal its group");
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => debug!(pgid = raw, "process group killed"),
        Err(Errno::ESRCH) => {}
        Err(err) => warn!(pgid = raw, err = %err, "failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

fn join_reader(
    handle: thread::JoinHandle<io::Result<(Vec<u8>, usize)>>,
) -> Result<(Vec<u8>, usize)> {
    handle
        .join()
        .map_err(|_| anyhow!("output reader thread panicked"))?
        .context("read child output")
}

fn drain_limited<R: Read>(mut reader: R, limit: usize) -> io::Result<(Vec<u8>, usize)> {
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            return Ok((kept, dropped));
        }
        let room = limit.saturating_sub(kept.len()).min(n);
        kept.extend_from_slice(&chunk[..room]);
        dropped += n - room;
    }
}

/// Last `max_bytes` of `text`, cut on a char boundary.
pub fn tail_excerpt(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn captures_output_and_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cmd = argv(&["sh", "-c", "echo out; echo err >&2; exit 3"]);
        let output = run_bounded(CommandSpec::new(&cmd, temp.path(), Duration::from_secs(10)))
            .expect("run");
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success);
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.combined(), "out\nerr\n");
    }

    #[test]
    fn stdin_and_env_reach_the_child() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cmd = argv(&["sh", "-c", "cat; printf %s \"$AUTOHEAL_FEATURE\""]);
        let spec = CommandSpec::new(&cmd, temp.path(), Duration::from_secs(10))
            .stdin("hello ")
            .env("AUTOHEAL_FEATURE", "login");
        let output = run_bounded(spec).expect("run");
        assert!(output.success);
        assert_eq!(output.stdout, "hello login");
    }

    #[test]
    fn timeout_kills_and_reaps() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cmd = argv(&["sleep", "30"]);
        let started = Instant::now();
        let output = run_bounded(CommandSpec::new(&cmd, temp.path(), Duration::from_millis(200)))
            .expect("run");
        assert!(output.timed_out);
        assert!(!output.success);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn timeout_kills_grandchildren_too() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cmd = argv(&["sh", "-c", "sleep 30; true"]);
        let started = Instant::now();
        let output = run_bounded(CommandSpec::new(&cmd, temp.path(), Duration::from_millis(200)))
            .expect("run");
        assert!(output.timed_out);
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "took {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn background_helper_does_not_hold_the_pipes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cmd = argv(&["sh", "-c", "sleep 30 & echo started"]);
        let started = Instant::now();
        let output = run_bounded(CommandSpec::new(&cmd, temp.path(), Duration::from_secs(10)))
            .expect("run");
        assert!(output.success);
        assert!(!output.timed_out);
        assert_eq!(output.stdout, "started\n");
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "took {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn output_beyond_limit_is_dropped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cmd = argv(&["sh", "-c", "printf 0123456789"]);
        let spec = CommandSpec::new(&cmd, temp.path(), Duration::from_secs(10)).output_limit(4);
        let output = run_bounded(spec).expect("run");
        assert_eq!(output.stdout, "0123");
        assert_eq!(output.truncated, 6);
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cmd = argv(&["autoheal-definitely-not-a-binary"]);
        let err = run_bounded(CommandSpec::new(&cmd, temp.path(), Duration::from_secs(1)))
            .unwrap_err();
        assert!(err.downcast_ref::<SpawnError>().is_some(), "{err:#}");
    }

    #[test]
    fn tail_excerpt_respects_char_boundaries() {
        assert_eq!(tail_excerpt("abc", 10), "abc");
        assert_eq!(tail_excerpt("abcdef", 3), "def");
        assert_eq!(tail_excerpt("aé", 1), "");
    }
}
