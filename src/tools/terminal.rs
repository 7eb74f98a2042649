//! Terminal/shell command execution tool.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use super::{ExecuteBashArgs, Sandbox, ToolError, ToolLimits};

/// How long output is still collected after the shell itself has exited.
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
}

impl CommandOutput {
    pub fn render(&self) -> String {
        let mut result = format!("Exit code: {}\n", self.exit_code);

        if !self.stdout.is_empty() {
            result.push_str("\n--- stdout ---\n");
            result.push_str(&self.stdout);
        }

        if !self.stderr.is_empty() {
            result.push_str("\n--- stderr ---\n");
            result.push_str(&self.stderr);
        }

        if self.stdout.is_empty() && self.stderr.is_empty() {
            result.push_str("(no output)");
        }

        if self.truncated {
            result.push_str("\n... [output truncated]");
        }

        result
    }
}

/// Run a shell command in the workspace root.
///
/// A nonzero exit is a normal result. Only spawn failures and timeouts are
/// errors. The child is killed when this future is dropped.
pub async fn execute_bash(
    sandbox: &Sandbox,
    args: &ExecuteBashArgs,
    limits: &ToolLimits,
) -> Result<CommandOutput, ToolError> {
    tracing::info!("Executing command: {}", args.command);

    // Determine shell based on OS
    let (shell, shell_arg) = if cfg!(target_os = "windows") {
        ("cmd", "/C")
    } else {
        ("sh", "-c")
    };

    let mut cmd = Command::new(shell);
    cmd.arg(shell_arg)
        .arg(&args.command)
        .current_dir(sandbox.root())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| ToolError::io(&args.command, e))?;
    let mut group = ProcessGroupGuard::new(child.id());

    let cap = limits.output_limit_bytes;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let mut out = Captured::default();
    let mut err = Captured::default();

    let run = async {
        let readers = async {
            tokio::join!(
                read_capped(stdout, cap, &mut out),
                read_capped(stderr, cap, &mut err)
            )
        };
        tokio::pin!(readers);

        tokio::select! {
            status = child.wait() => {
                // A background job can hold the pipes open after the shell exits.
                let drained = tokio::time::timeout(PIPE_DRAIN_GRACE, &mut readers)
                    .await
                    .is_ok();
                (status, drained)
            }
            _ = &mut readers => (child.wait().await, true),
        }
    };

    let (status, drained) = match tokio::time::timeout(limits.command_timeout, run).await {
        Ok(done) => done,
        Err(_) => {
            let secs = limits.command_timeout.as_secs();
            tracing::warn!(command = %args.command, secs, "command timed out");
            return Err(ToolError::ExecutionTimeout(secs));
        }
    };

    let status = status.map_err(|e| ToolError::io(&args.command, e))?;
    if drained {
        group.disarm();
    } else {
        tracing::debug!("pipes still open after exit, killing leftover processes");
    }
    let exit_code = status.code().unwrap_or(-1);
    tracing::debug!(exit_code, "command finished");

    Ok(CommandOutput {
        exit_code,
        stdout: String::from_utf8_lossy(&out.bytes).into_owned(),
        stderr: String::from_utf8_lossy(&err.bytes).into_owned(),
        truncated: out.truncated || err.truncated,
    })
}

/// Bytes kept from one pipe.
#[derive(Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Read a pipe to EOF, keeping at most `cap` bytes and draining the rest so
/// the child never blocks on a full pipe.
async fn read_capped<R>(pipe: Option<R>, cap: usize, sink: &mut Captured)
where
    R: AsyncRead + Unpin,
{
    let Some(mut pipe) = pipe else {
        return;
    };

    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(sink.bytes.len());
                if n > room {
                    sink.truncated = true;
                }
                sink.bytes.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
}

/// Kills the command's whole process group when dropped, so grandchildren
/// started by the shell do not outlive a timeout or a cancelled turn.
struct ProcessGroupGuard {
    #[cfg_attr(not(unix), allow(dead_code))]
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    /// The command exited and its pipes closed; nothing left to kill.
    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            // ESRCH once the group has exited is expected and ignored.
            unsafe {
                libc::killpg(pgid as libc::pid_t, libc::SIGKILL);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn sandbox() -> (tempfile::TempDir, Sandbox) {
        let dir = tempfile::tempdir().expect("tempdir");
        let sandbox = Sandbox::new(dir.path()).expect("sandbox");
        (dir, sandbox)
    }

    fn bash(command: &str) -> ExecuteBashArgs {
        ExecuteBashArgs {
            command: command.to_string(),
        }
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let (_dir, sb) = sandbox();
        let out = execute_bash(&sb, &bash("echo out; echo err >&2"), &ToolLimits::default())
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
        assert_eq!(
            out.render(),
            "Exit code: 0\n\n--- stdout ---\nout\n\n--- stderr ---\nerr\n"
        );
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_raised() {
        let (_dir, sb) = sandbox();
        let out = execute_bash(&sb, &bash("exit 3"), &ToolLimits::default())
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(out.render().starts_with("Exit code: 3"));
    }

    #[tokio::test]
    async fn runs_in_workspace_root() {
        let (_dir, sb) = sandbox();
        std::fs::write(sb.root().join("marker.txt"), "x").unwrap();
        let out = execute_bash(&sb, &bash("ls"), &ToolLimits::default())
            .await
            .unwrap();
        assert!(out.stdout.contains("marker.txt"));
    }

    #[tokio::test]
    async fn times_out_and_kills_the_command() {
        let (_dir, sb) = sandbox();
        let limits = ToolLimits {
            command_timeout: Duration::from_secs(1),
            ..ToolLimits::default()
        };

        let started = Instant::now();
        let err = execute_bash(&sb, &bash("sleep 30"), &limits)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionTimeout(1)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn output_is_capped() {
        let (_dir, sb) = sandbox();
        let limits = ToolLimits {
            output_limit_bytes: 16,
            ..ToolLimits::default()
        };
        let out = execute_bash(&sb, &bash("yes | head -c 100000"), &limits)
            .await
            .unwrap();
        assert_eq!(out.stdout.len(), 16);
        assert!(out.truncated);
        assert!(out.render().ends_with("[output truncated]"));
    }

    #[tokio::test]
    async fn background_job_does_not_hold_the_result() {
        let (_dir, sb) = sandbox();
        let limits = ToolLimits {
            command_timeout: Duration::from_secs(5),
            ..ToolLimits::default()
        };

        let started = Instant::now();
        let out = execute_bash(&sb, &bash("echo started; sleep 30 &"), &limits)
            .await
            .unwrap();

        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, "started\n");
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
