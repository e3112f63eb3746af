//! Verification commands run through `sh -c` in the repository root.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::core::types::CommandResult;
use crate::io::process::run_command_with_timeout;

/// How a sandboxed command ended.
#[derive(Debug)]
pub enum SandboxOutcome {
    /// The command exited (successfully or not) within its timeout.
    Finished(CommandResult),
    /// The command was killed at the timeout. Output captured so far is kept.
    TimedOut(CommandResult),
}

/// Run `script` with `sh -c` in `cwd`, inheriting the environment.
#[instrument(skip_all, fields(name = %name, timeout_sec = timeout_sec))]
pub fn run_shell(
    name: &str,
    script: &str,
    cwd: &Path,
    timeout_sec: u64,
    output_limit_bytes: usize,
) -> Result<SandboxOutcome> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script).current_dir(cwd);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    let output =
        run_command_with_timeout(cmd, Duration::from_secs(timeout_sec), output_limit_bytes)
            .with_context(|| format!("run command '{name}'"))?;

    let result = CommandResult {
        name: name.to_string(),
        ok: !output.timed_out && output.status.success(),
        code: output.code(),
        stdout: output.stdout.lossy(),
        stderr: output.stderr.lossy(),
    };
    info!(ok = result.ok, code = result.code, timed_out = output.timed_out, "command finished");
    if output.timed_out {
        Ok(SandboxOutcome::TimedOut(result))
    } else {
        Ok(SandboxOutcome::Finished(result))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn runs_in_working_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("marker.txt"), "here").expect("write");
        let outcome = run_shell("cat", "cat marker.txt && echo warn >&2", temp.path(), 10, 1024)
            .expect("run");
        let SandboxOutcome::Finished(result) = outcome else {
            panic!("expected finished");
        };
        assert!(result.ok);
        assert_eq!(result.stdout, "here");
        assert_eq!(result.stderr, "warn\n");
    }

    #[test]
    fn non_zero_exit_is_not_ok() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outcome = run_shell("fail", "exit 7", temp.path(), 10, 1024).expect("run");
        let SandboxOutcome::Finished(result) = outcome else {
            panic!("expected finished");
        };
        assert!(!result.ok);
        assert_eq!(result.code, 7);
    }

    #[test]
    fn timeout_takes_down_grandchildren() {
        let temp = tempfile::tempdir().expect("tempdir");
        let started = std::time::Instant::now();
        let outcome = run_shell("nested", "sleep 30; echo never", temp.path(), 1, 1024)
            .expect("run");
        assert!(matches!(outcome, SandboxOutcome::TimedOut(_)));
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn timeout_keeps_partial_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outcome = run_shell("slow", "echo begin; exec sleep 30", temp.path(), 1, 1024)
            .expect("run");
        let SandboxOutcome::TimedOut(result) = outcome else {
            panic!("expected timeout");
        };
        assert!(!result.ok);
        assert_eq!(result.stdout, "begin\n");
    }
}
