//! Child processes with a wall-clock timeout and bounded output capture.

use std::io::Read;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Bytes kept from one output stream plus the count of bytes dropped.
#[derive(Debug, Default)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub dropped: usize,
}

impl Captured {
    pub fn lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// How a child ended and what it printed.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Captured,
    pub stderr: Captured,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Exit code, or -1 when the child was killed by a signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }
}

/// Run `cmd` with stdin closed, killing it once `timeout` elapses.
///
/// Output is drained while the child runs so it never stalls on a full pipe.
/// Each stream keeps at most `output_limit_bytes`.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawn command")?;
    let drains = Drains::attach(&mut child, output_limit_bytes)?;

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => (status, false),
        None => (kill(&mut child)?, true),
    };
    let (stdout, stderr) = drains.finish()?;

    if stdout.dropped > 0 || stderr.dropped > 0 {
        warn!(
            stdout_dropped = stdout.dropped,
            stderr_dropped = stderr.dropped,
            "command output over limit"
        );
    }
    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

/// Reader threads for both output pipes of one child.
struct Drains {
    stdout: JoinHandle<Result<Captured>>,
    stderr: JoinHandle<Result<Captured>>,
}

impl Drains {
    fn attach(child: &mut Child, limit: usize) -> Result<Self> {
        let stdout: ChildStdout = child.stdout.take().context("stdout not piped")?;
        let stderr: ChildStderr = child.stderr.take().context("stderr not piped")?;
        Ok(Self {
            stdout: thread::spawn(move || capture(stdout, limit)),
            stderr: thread::spawn(move || capture(stderr, limit)),
        })
    }

    fn finish(self) -> Result<(Captured, Captured)> {
        let join = |handle: JoinHandle<Result<Captured>>, stream: &str| {
            handle
                .join()
                .map_err(|_| anyhow!("{stream} reader panicked"))?
                .with_context(|| format!("read {stream}"))
        };
        Ok((join(self.stdout, "stdout")?, join(self.stderr, "stderr")?))
    }
}

fn kill(child: &mut Child) -> Result<ExitStatus> {
    warn!(pid = child.id(), "command timed out, killing");
    #[cfg(unix)]
    kill_process_group(child.id());
    child.kill().context("kill command")?;
    child.wait().context("reap killed command")
}

/// Signal the group led by `pid`, if any. Grandchildren would otherwise keep
/// the output pipes open after the child itself is gone.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let target = format!("-{pid}");
    let status = Command::new("kill")
        .args(["-KILL", "--", target.as_str()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        Ok(status) if status.success() => debug!(pid, "process group killed"),
        Ok(_) => debug!(pid, "no process group to kill"),
        Err(err) => warn!(pid, err = %err, "failed to run kill for process group"),
    }
}

fn capture<R: Read>(mut reader: R, limit: usize) -> Result<Captured> {
    let mut captured = Captured::default();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(captured);
        }
        let room = limit.saturating_sub(captured.bytes.len()).min(n);
        captured.bytes.extend_from_slice(&buf[..room]);
        captured.dropped += n - room;
    }
}
