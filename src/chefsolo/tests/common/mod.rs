//! Shared test support: a recording session and connector, a counting bundle
//! builder and configuration fixtures.
#![allow(dead_code)]

use async_trait::async_trait;
use chefsolo::{
    BundleBuilder, Connector, OutputLayout, ProvisionConfig, ProvisionError, Result, Session,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One remote action seen by the recording session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Exec(String),
    Upload(String),
    UploadDir { local: PathBuf, remote: String },
    Disconnect,
}

#[derive(Default)]
pub struct RecordingSession {
    events: Mutex<Vec<Event>>,
    uploads: Mutex<Vec<(String, String)>>,
    /// Commands containing this text exit with status 1
    fail_on: Option<String>,
    /// Lines printed by every command
    output: Vec<String>,
}

impl RecordingSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(text: &str) -> Self {
        Self {
            fail_on: Some(text.to_string()),
            ..Self::default()
        }
    }

    pub fn printing(lines: &[&str]) -> Self {
        Self {
            output: lines.iter().map(|l| l.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Exec(command) => Some(command),
                _ => None,
            })
            .collect()
    }

    /// Content uploaded to `remote_path`, if any
    pub fn uploaded(&self, remote_path: &str) -> Option<String> {
        self.uploads
            .lock()
            .unwrap()
            .iter()
            .find(|(path, _)| path == remote_path)
            .map(|(_, content)| content.clone())
    }
}

#[async_trait]
impl Session for RecordingSession {
    async fn exec(&self, command: &str, output: mpsc::UnboundedSender<String>) -> Result<i32> {
        self.events
            .lock()
            .unwrap()
            .push(Event::Exec(command.to_string()));
        for line in &self.output {
            let _ = output.send(line.clone());
        }
        match &self.fail_on {
            Some(text) if command.contains(text.as_str()) => {
                let _ = output.send(format!("{}: failed", command));
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn upload(&self, remote_path: &str, content: Vec<u8>) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(Event::Upload(remote_path.to_string()));
        self.uploads.lock().unwrap().push((
            remote_path.to_string(),
            String::from_utf8_lossy(&content).to_string(),
        ));
        Ok(())
    }

    async fn upload_dir(&self, local_dir: &Path, remote_dir: &str) -> Result<()> {
        self.events.lock().unwrap().push(Event::UploadDir {
            local: local_dir.to_path_buf(),
            remote: remote_dir.to_string(),
        });
        Ok(())
    }

    async fn disconnect(&self) {
        self.events.lock().unwrap().push(Event::Disconnect);
    }
}

/// Hands out one shared session after `failures` failed attempts.
pub struct RecordingConnector {
    pub session: Arc<RecordingSession>,
    failures: usize,
    attempts: AtomicUsize,
    timeout: Duration,
}

impl RecordingConnector {
    pub fn new(session: Arc<RecordingSession>) -> Self {
        Self::flaky(session, 0)
    }

    pub fn flaky(session: Arc<RecordingSession>, failures: usize) -> Self {
        Self {
            session,
            failures,
            attempts: AtomicUsize::new(0),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for RecordingConnector {
    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn describe(&self) -> String {
        "recording".to_string()
    }

    async fn connect(&self) -> Result<Arc<dyn Session>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(ProvisionError::Connection(format!(
                "connection refused (attempt {})",
                attempt + 1
            )));
        }
        Ok(self.session.clone())
    }
}

/// Counts builds and writes a file into the bundle.
#[derive(Default)]
pub struct CountingBuilder {
    builds: AtomicUsize,
    delay: Duration,
    fail: bool,
}

impl CountingBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BundleBuilder for CountingBuilder {
    async fn build(&self, layout: &OutputLayout, _cancel: &CancellationToken) -> Result<()> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(ProvisionError::LocalCommand {
                command: "berks vendor".to_string(),
                reason: "exit status: 1".to_string(),
                output: "Berksfile not found".to_string(),
            });
        }
        let cookbooks = layout.root().join("cookbooks");
        std::fs::create_dir_all(&cookbooks)?;
        std::fs::write(cookbooks.join("metadata.rb"), "name 'base'\n")?;
        Ok(())
    }
}

/// A module directory and an output directory inside a fresh temp dir.
pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub module: PathBuf,
    pub output: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("chef");
        std::fs::create_dir_all(&module).unwrap();
        std::fs::write(module.join("Berksfile"), "source 'https://supermarket.chef.io'\n").unwrap();
        let output = dir.path().join("bundle");
        Self {
            dir,
            module,
            output,
        }
    }

    pub fn config(&self, instance_id: &str) -> ProvisionConfig {
        ProvisionConfig::new(
            instance_id,
            self.module.to_string_lossy(),
            self.output.to_string_lossy(),
            vec![format!(r#"{{"id":"{}"}}"#, instance_id)],
            format!(r#"{{"id":"{}"}}"#, instance_id),
        )
    }
}
