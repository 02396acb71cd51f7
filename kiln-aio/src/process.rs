// kiln-aio/src/process.rs
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use kiln_common::error::{KilnError, Result};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default cap on captured output per command. Older output is dropped first.
pub const DEFAULT_MAX_OUTPUT: usize = 64 * 1024;

/// A command to run with a fully specified environment.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// When set, the child environment is cleared and replaced by this map.
    pub env: Option<BTreeMap<String, String>>,
    pub timeout: Option<Duration>,
    pub max_output: usize,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: None,
            env: None,
            timeout: None,
            max_output: DEFAULT_MAX_OUTPUT,
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " \"{}\"", arg.replace('"', "\\\""))?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Exit status plus interleaved stdout and stderr.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub status: ExitStatus,
    pub output: String,
    /// Older output was dropped to stay within `max_output`.
    pub truncated: bool,
    pub timed_out: bool,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.status.success() && !self.timed_out
    }

    pub fn describe_status(&self) -> String {
        if self.timed_out {
            "timeout".to_string()
        } else {
            self.status.to_string()
        }
    }
}

struct TailBuffer {
    bytes: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl TailBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
        if self.bytes.len() > self.limit {
            let excess = self.bytes.len() - self.limit;
            self.bytes.drain(..excess);
            self.truncated = true;
        }
    }
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn kill_process_group(child: &mut Child) {
    if let Some(pid) = child.id() {
        // The child leads its own process group; take down everything it spawned.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    let _ = child.start_kill();
}

enum Waited {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

/// Runs a command, capturing combined output. Killing on cancellation or
/// timeout covers the whole process group.
///
/// Returns `Err(KilnError::Cancelled)` if `cancel` fires before the command
/// exits. A non-zero exit is not an error; inspect the outcome.
pub async fn run_captured(
    spec: &CommandSpec,
    cancel: &CancellationToken,
) -> Result<CommandOutcome> {
    debug!(
        "Running command: {} (cwd: {:?}, env keys: {:?})",
        spec,
        spec.cwd,
        spec.env.as_ref().map(|e| e.keys().collect::<Vec<_>>())
    );
    if cancel.is_cancelled() {
        return Err(KilnError::Cancelled);
    }

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args);
    cmd.kill_on_drop(true);
    cmd.process_group(0);
    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }
    if let Some(env) = &spec.env {
        cmd.env_clear();
        cmd.envs(env);
    }
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.stdin(Stdio::null());

    let mut child = cmd.spawn()?;

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, tx.clone()));
    }
    drop(tx);

    let limit = spec.max_output;
    let collector = tokio::spawn(async move {
        let mut buffer = TailBuffer {
            bytes: Vec::new(),
            limit,
            truncated: false,
        };
        while let Some(chunk) = rx.recv().await {
            buffer.push(&chunk);
        }
        buffer
    });

    let timeout = async {
        match spec.timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    let waited = tokio::select! {
        status = child.wait() => Waited::Exited(status?),
        _ = timeout => Waited::TimedOut,
        _ = cancel.cancelled() => Waited::Cancelled,
    };

    let (status, timed_out) = match waited {
        Waited::Exited(status) => (status, false),
        Waited::TimedOut => {
            warn!("Command timed out after {:?}: {}", spec.timeout, spec);
            kill_process_group(&mut child);
            (child.wait().await?, true)
        }
        Waited::Cancelled => {
            debug!("Cancelling command: {}", spec);
            kill_process_group(&mut child);
            let _ = child.wait().await;
            collector.abort();
            return Err(KilnError::Cancelled);
        }
    };

    // Descendants that outlive the child can hold the pipes open; do not wait
    // on them forever.
    let buffer = match tokio::time::timeout(Duration::from_secs(5), collector).await {
        Ok(Ok(buffer)) => buffer,
        Ok(Err(e)) => return Err(KilnError::Generic(format!("Output collector failed: {e}"))),
        Err(_) => {
            warn!("Output of `{}` did not close after exit; dropping it", spec);
            TailBuffer {
                bytes: Vec::new(),
                limit,
                truncated: true,
            }
        }
    };

    let outcome = CommandOutcome {
        status,
        output: String::from_utf8_lossy(&buffer.bytes).into_owned(),
        truncated: buffer.truncated,
        timed_out,
    };
    if outcome.success() {
        debug!("Command finished successfully: {}", spec);
    } else {
        debug!(
            "Command failed with {}: {}\n{}",
            outcome.describe_status(),
            spec,
            outcome.output.trim()
        );
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("/bin/sh", vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn captures_both_streams_and_status() {
        let token = CancellationToken::new();
        let out = run_captured(&sh("echo out; echo err >&2; exit 3"), &token)
            .await
            .unwrap();
        assert_eq!(out.status.code(), Some(3));
        assert!(out.output.contains("out"));
        assert!(out.output.contains("err"));
        assert!(!out.success());
    }

    #[tokio::test]
    async fn environment_is_replaced_when_given() {
        let token = CancellationToken::new();
        let mut spec = sh("echo \"[$KILN_TEST_VAR][$HOME]\"");
        spec.env = Some(BTreeMap::from([(
            "KILN_TEST_VAR".to_string(),
            "set".to_string(),
        )]));
        let out = run_captured(&spec, &token).await.unwrap();
        assert_eq!(out.output.trim(), "[set][]");
    }

    #[tokio::test]
    async fn output_keeps_the_tail() {
        let token = CancellationToken::new();
        let mut spec = sh("i=0; while [ $i -lt 2000 ]; do echo line$i; i=$((i+1)); done");
        spec.max_output = 64;
        let out = run_captured(&spec, &token).await.unwrap();
        assert!(out.truncated);
        assert!(out.output.len() <= 64);
        assert!(out.output.contains("line1999"));
    }

    #[tokio::test]
    async fn cancellation_kills_the_child_promptly() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let start = Instant::now();
        let result = run_captured(&sh("sleep 30"), &token).await;
        assert!(matches!(result, Err(KilnError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let token = CancellationToken::new();
        let mut spec = sh("sleep 30");
        spec.timeout = Some(Duration::from_millis(100));
        let out = run_captured(&spec, &token).await.unwrap();
        assert!(out.timed_out);
        assert_eq!(out.describe_status(), "timeout");
    }

    #[tokio::test]
    async fn missing_program_is_an_io_error() {
        let token = CancellationToken::new();
        let spec = CommandSpec::new("/nonexistent/kiln-tool", vec![]);
        assert!(matches!(
            run_captured(&spec, &token).await,
            Err(KilnError::Io(_))
        ));
    }
}
