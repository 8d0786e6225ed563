//! Remote command runner over an open session.
use super::buffer::{OutputBuffer, MAX_BUF_SIZE};
use super::CommandRunner;
use crate::connection::Session;
use crate::error::{ProvisionError, Result};
use crate::output::OutputSink;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Wrap `command` for elevated execution when `use_sudo` is set.
/// Single quotes inside the command are escaped for the outer quoting.
pub fn elevate(command: &str, use_sudo: bool) -> String {
    if use_sudo {
        format!("sudo bash -c '{}'", command.replace('\'', "'\\''"))
    } else {
        command.to_string()
    }
}

pub struct RemoteRunner {
    session: Arc<dyn Session>,
    sink: Arc<dyn OutputSink>,
    use_sudo: bool,
}

impl RemoteRunner {
    pub fn new(session: Arc<dyn Session>, sink: Arc<dyn OutputSink>, use_sudo: bool) -> Self {
        Self {
            session,
            sink,
            use_sudo,
        }
    }

    pub async fn upload(&self, remote_path: &str, content: &str) -> Result<()> {
        tracing::debug!("[RemoteRunner] Uploading {}", remote_path);
        self.session
            .upload(remote_path, content.as_bytes().to_vec())
            .await
    }

    /// Upload a local directory into `remote_dir`. A missing source uploads nothing.
    pub async fn upload_dir(&self, local_dir: &Path, remote_dir: &str) -> Result<()> {
        if !local_dir.exists() {
            self.sink.output(&format!(
                "Warning: {} does not exist, uploading nothing.",
                local_dir.display()
            ));
            return Ok(());
        }
        tracing::debug!(
            "[RemoteRunner] Uploading directory {} into {}",
            local_dir.display(),
            remote_dir
        );
        self.session.upload_dir(local_dir, remote_dir).await
    }
}

#[async_trait]
impl CommandRunner for RemoteRunner {
    async fn run(&self, command: &str) -> Result<()> {
        let command = elevate(command, self.use_sudo);
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let mut collected = OutputBuffer::new(MAX_BUF_SIZE);

        let sink = &self.sink;
        // The session drops its sender when the command ends, which ends forwarding
        let forward = async {
            while let Some(line) = rx.recv().await {
                sink.output(&line);
                collected.push_line(&line);
            }
        };
        let (status, ()) = tokio::join!(self.session.exec(&command, tx), forward);

        match status {
            Ok(0) => Ok(()),
            Ok(code) => Err(ProvisionError::RemoteCommand {
                command,
                reason: format!("exit status {}", code),
                output: collected.to_string(),
            }),
            Err(e) => Err(ProvisionError::RemoteCommand {
                command,
                reason: e.to_string(),
                output: collected.to_string(),
            }),
        }
    }
}
