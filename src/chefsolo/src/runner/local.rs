//! Local shell command runner.
//!
//! Stdout and stderr share one OS pipe so lines keep the order the command wrote
//! them in. A blocking reader drains the pipe into a channel; the run forwards
//! each line to the sink and into the error buffer.
use super::buffer::{OutputBuffer, MAX_BUF_SIZE};
use super::CommandRunner;
use crate::error::{ProvisionError, Result};
use crate::output::OutputSink;
use async_trait::async_trait;
use std::io::BufRead;
use std::process::Stdio;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct LocalRunner {
    sink: Arc<dyn OutputSink>,
    cancel: CancellationToken,
    shell: String,
}

impl LocalRunner {
    pub fn new(sink: Arc<dyn OutputSink>, cancel: CancellationToken) -> Self {
        Self {
            sink,
            cancel,
            shell: "/bin/sh".to_string(),
        }
    }

    fn command_error(command: &str, reason: impl Into<String>, output: &OutputBuffer) -> ProvisionError {
        ProvisionError::LocalCommand {
            command: command.to_string(),
            reason: reason.into(),
            output: output.to_string(),
        }
    }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(&self, command: &str) -> Result<()> {
        let mut collected = OutputBuffer::new(MAX_BUF_SIZE);
        if command.trim().is_empty() {
            return Err(Self::command_error(
                command,
                "command must be a non-empty string",
                &collected,
            ));
        }

        let (reader, writer) = nix::unistd::pipe().map_err(|e| {
            Self::command_error(
                command,
                format!("failed to initialize pipe for output: {}", e),
                &collected,
            )
        })?;
        let stderr_writer = writer.try_clone().map_err(|e| {
            Self::command_error(
                command,
                format!("failed to initialize pipe for output: {}", e),
                &collected,
            )
        })?;

        let mut cmd = tokio::process::Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::from(writer))
            .stderr(Stdio::from(stderr_writer))
            .kill_on_drop(true);

        self.sink.output(&format!(
            "Executing: [{:?} \"-c\" {:?}]",
            self.shell, command
        ));
        tracing::debug!("[LocalRunner] Spawning {:?}", command);

        let spawned = cmd.spawn();
        // Drop our copies of the write end so the reader sees EOF when the child exits
        drop(cmd);
        let mut child = spawned
            .map_err(|e| Self::command_error(command, format!("error executing command: {}", e), &collected))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let pipe = std::fs::File::from(reader);
        let drain = tokio::task::spawn_blocking(move || {
            let mut reader = std::io::BufReader::new(pipe);
            let mut raw = Vec::new();
            loop {
                raw.clear();
                match reader.read_until(b'\n', &mut raw) {
                    Ok(0) => break,
                    Ok(_) => {
                        if raw.last() == Some(&b'\n') {
                            raw.pop();
                        }
                        let line = String::from_utf8_lossy(&raw).into_owned();
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("[LocalRunner] Output pipe read failed: {}", e);
                        break;
                    }
                }
            }
        });

        let cancel = &self.cancel;
        let sink = &self.sink;
        let wait = async {
            tokio::select! {
                status = child.wait() => status.map_err(|e| format!("error waiting for command: {}", e)),
                _ = cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!("[LocalRunner] Failed to kill cancelled command: {}", e);
                    }
                    Err("command cancelled".to_string())
                }
            }
        };
        // A grandchild that keeps the pipe open holds this until cancellation
        let forward = async {
            tokio::select! {
                _ = async {
                    while let Some(line) = rx.recv().await {
                        sink.output(&line);
                        collected.push_line(&line);
                    }
                } => true,
                _ = cancel.cancelled() => false,
            }
        };
        let (status, drained) = tokio::join!(wait, forward);
        if drained {
            let _ = drain.await;
        }

        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(Self::command_error(
                command,
                format!("error executing command: {}", status),
                &collected,
            )),
            Err(reason) => Err(Self::command_error(command, reason, &collected)),
        }
    }
}
