//! Child process execution with streamed output, wall-clock timeouts and
//! bounded tail capture.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use super::Emitter;

/// Keep at most this many bytes of combined output for error reporting.
pub const TAIL_LIMIT: usize = 64 * 1024;

/// Result of a bounded, streamed command run.
#[derive(Debug)]
pub struct CommandOutput {
    pub exit_code: i32,
    /// Last `TAIL_LIMIT` bytes of combined stdout/stderr.
    pub tail: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Spawn `bash -c <command>`, returning the child plus a channel of its
/// interleaved stdout/stderr lines.
pub fn spawn_shell(
    command: &str,
    dir: &Path,
    envs: &[(String, String)],
) -> Result<(Child, mpsc::Receiver<String>)> {
    let mut cmd = Command::new("bash");
    cmd.args(["-c", command])
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in envs {
        cmd.env(key, value);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn command: {}", command))?;

    let stdout = child.stdout.take().context("Failed to capture stdout")?;
    let stderr = child.stderr.take().context("Failed to capture stderr")?;

    let (tx, rx) = mpsc::channel::<String>(256);
    let tx_err = tx.clone();

    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx_err.send(line).await.is_err() {
                break;
            }
        }
    });

    Ok((child, rx))
}

/// Run a shell command, streaming every line through the emitter and
/// keeping a bounded tail. The child is killed if it outlives `limit`.
pub async fn run_logged(
    command: &str,
    dir: &Path,
    envs: &[(String, String)],
    limit: Duration,
    emitter: &Emitter,
) -> Result<CommandOutput> {
    let (mut child, mut lines) = spawn_shell(command, dir, envs)?;
    let mut tail = String::new();

    let outcome = tokio::time::timeout(limit, async {
        while let Some(line) = lines.recv().await {
            emitter.log(&format!("{}\n", line)).await;
            push_tail(&mut tail, &line);
        }
        child.wait().await
    })
    .await;

    match outcome {
        Ok(status) => {
            let status = status.context("Failed to wait for child process")?;
            Ok(CommandOutput {
                exit_code: status.code().unwrap_or(-1),
                tail,
                timed_out: false,
            })
        }
        Err(_) => {
            let _ = child.kill().await;
            let note = format!("command timed out after {}s", limit.as_secs());
            emitter.log(&format!("{}\n", note)).await;
            push_tail(&mut tail, &note);
            Ok(CommandOutput {
                exit_code: -1,
                tail,
                timed_out: true,
            })
        }
    }
}

/// Append a line, discarding from the front beyond [`TAIL_LIMIT`].
fn push_tail(tail: &mut String, line: &str) {
    tail.push_str(line);
    tail.push('\n');
    if tail.len() > TAIL_LIMIT {
        let mut cut = tail.len() - TAIL_LIMIT;
        while !tail.is_char_boundary(cut) {
            cut += 1;
        }
        tail.drain(..cut);
    }
}
