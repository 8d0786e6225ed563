//! SSH sessions through the system OpenSSH client.
//!
//! `connect` starts a ControlMaster in the background; every command, upload and
//! the final teardown then reuse its control socket.

use crate::config::ConnectionConfig;
use crate::connection::{Connector, Session};
use crate::error::{ProvisionError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct SshConnector {
    host: String,
    port: u16,
    user: Option<String>,
    private_key: Option<PathBuf>,
    timeout: Duration,
}

impl SshConnector {
    pub fn from_config(config: &ConnectionConfig) -> Result<Self> {
        if config.host.is_empty() {
            return Err(ProvisionError::Config(
                "connection.host must be set for ssh connections".to_string(),
            ));
        }
        Ok(Self {
            host: config.host.clone(),
            port: config.port.unwrap_or(22),
            user: config.user.clone(),
            private_key: config
                .private_key
                .as_deref()
                .map(crate::config::expand_home),
            timeout: config.timeout(),
        })
    }

    fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.destination(), self.port)
    }

    async fn connect(&self) -> Result<Arc<dyn Session>> {
        let control_path = std::env::temp_dir().join(format!(
            "chefsolo-{}-{}.sock",
            std::process::id(),
            SESSION_COUNTER.fetch_add(1, Ordering::SeqCst)
        ));

        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes"])
            .args(["-o", "StrictHostKeyChecking=accept-new"])
            .args(["-o", "ConnectTimeout=10"])
            .args(["-o", "ControlMaster=yes"])
            .args(["-o", "ControlPersist=yes"])
            .arg("-o")
            .arg(format!("ControlPath={}", control_path.display()))
            .arg("-p")
            .arg(self.port.to_string());
        if let Some(key) = &self.private_key {
            cmd.arg("-i").arg(key);
        }
        // The backgrounded master inherits stderr, so errors go to a log file
        let log_path = control_path.with_extension("log");
        cmd.arg("-E")
            .arg(&log_path)
            .arg("-fN")
            .arg(self.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        tracing::debug!("[SshConnector] Starting control master for {}", self.describe());
        let status = cmd
            .status()
            .await
            .map_err(|e| ProvisionError::Connection(format!("failed to run ssh: {}", e)))?;
        let log = std::fs::read_to_string(&log_path).unwrap_or_default();
        let _ = std::fs::remove_file(&log_path);
        if !status.success() {
            return Err(ProvisionError::Connection(format!(
                "ssh to {} failed ({}): {}",
                self.describe(),
                status,
                log.trim()
            )));
        }

        Ok(Arc::new(SshSession {
            destination: self.destination(),
            port: self.port,
            control_path,
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct SshSession {
    destination: String,
    port: u16,
    control_path: PathBuf,
    closed: AtomicBool,
}

impl SshSession {
    /// ssh over the control socket. `options` go before the destination.
    fn ssh(&self, options: &[&str]) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes"])
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-p")
            .arg(self.port.to_string())
            .args(options)
            .arg(&self.destination);
        cmd
    }
}

async fn forward_lines<R>(reader: R, output: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if output.send(line).is_err() {
            break;
        }
    }
}

/// Single-quote `value` for a POSIX shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[async_trait]
impl Session for SshSession {
    async fn exec(&self, command: &str, output: mpsc::UnboundedSender<String>) -> Result<i32> {
        let mut child = self
            .ssh(&[])
            .arg("--")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProvisionError::Connection(format!("failed to run ssh: {}", e)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_task = stdout.map(|s| tokio::spawn(forward_lines(s, output.clone())));
        let err_task = stderr.map(|s| tokio::spawn(forward_lines(s, output.clone())));
        drop(output);

        let status = child
            .wait()
            .await
            .map_err(|e| ProvisionError::Connection(format!("ssh session failed: {}", e)))?;
        for task in [out_task, err_task].into_iter().flatten() {
            let _ = task.await;
        }

        // ssh reports its own failures with 255
        match status.code() {
            Some(255) => Err(ProvisionError::Connection(format!(
                "ssh connection to {} lost",
                self.destination
            ))),
            Some(code) => Ok(code),
            None => Err(ProvisionError::Connection(
                "ssh terminated by a signal".to_string(),
            )),
        }
    }

    async fn upload(&self, remote_path: &str, content: Vec<u8>) -> Result<()> {
        let mut child = self
            .ssh(&[])
            .arg("--")
            .arg(format!("cat > {}", shell_quote(remote_path)))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ProvisionError::Connection(format!("failed to run ssh: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&content).await?;
            stdin.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ProvisionError::RemoteCommand {
                command: format!("upload {}", remote_path),
                reason: format!("{}", output.status),
                output: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }

    async fn upload_dir(&self, local_dir: &Path, remote_dir: &str) -> Result<()> {
        let output = Command::new("scp")
            .args(["-r", "-q", "-o", "BatchMode=yes"])
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-P")
            .arg(self.port.to_string())
            .arg(local_dir)
            .arg(format!("{}:{}", self.destination, remote_dir))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ProvisionError::Connection(format!("failed to run scp: {}", e)))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ProvisionError::RemoteCommand {
                command: format!("upload {} -> {}", local_dir.display(), remote_dir),
                reason: format!("{}", output.status),
                output: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }

    async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let result = self
            .ssh(&["-O", "exit"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            tracing::warn!("[SshSession] Failed to close {}: {}", self.destination, e);
        }
        let _ = std::fs::remove_file(&self.control_path);
    }
}
