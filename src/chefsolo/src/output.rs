//! Output sinks for human-readable provisioning lines.
//!
//! Every line a run produces (status messages, local and remote command output)
//! goes through an [`OutputSink`] handed to the provisioner. Sinks are explicit and
//! per-instance; nothing writes to process-wide state.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

/// Receives output lines in the order they are produced.
pub trait OutputSink: Send + Sync + 'static {
    fn output(&self, line: &str);
}

impl<T: OutputSink + ?Sized> OutputSink for Arc<T> {
    fn output(&self, line: &str) {
        (**self).output(line)
    }
}

/// One output line tagged with the instance that produced it.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct OutputLine {
    pub instance_id: String,
    pub line: String,
}

/// Forwards lines to `tracing` at info level.
pub struct TracingSink {
    instance_id: String,
}

impl TracingSink {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
        }
    }
}

impl OutputSink for TracingSink {
    fn output(&self, line: &str) {
        tracing::info!(instance = %self.instance_id, "{}", line);
    }
}

/// Channel-based sink. Never blocks the producer; lines are dropped if the
/// receiver falls behind a full channel.
pub struct ChannelOutputSink {
    sender: tokio::sync::mpsc::Sender<OutputLine>,
    instance_id: String,
}

impl ChannelOutputSink {
    pub fn new(sender: tokio::sync::mpsc::Sender<OutputLine>, instance_id: impl Into<String>) -> Self {
        Self {
            sender,
            instance_id: instance_id.into(),
        }
    }
}

impl OutputSink for ChannelOutputSink {
    fn output(&self, line: &str) {
        let _ = self.sender.try_send(OutputLine {
            instance_id: self.instance_id.clone(),
            line: line.to_string(),
        });
    }
}

fn ansi_escape() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| Regex::new(r"\x1b\[[0-9;]+m").expect("static ANSI pattern"))
}

/// Strip colour escapes and turn carriage returns into newlines.
pub fn sanitize_line(line: &str) -> String {
    ansi_escape().replace_all(line, "").replace('\r', "\n")
}

/// Appends sanitized lines to `<log_dir>/<instance_id>`.
pub struct LogFileSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl LogFileSink {
    pub fn new(log_dir: &Path, instance_id: &str) -> std::io::Result<Self> {
        std::fs::create_dir_all(log_dir)?;
        Ok(Self {
            path: log_dir.join(instance_id),
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, text: &str) -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(text.as_bytes())?;
        file.sync_all()
    }
}

impl OutputSink for LogFileSink {
    fn output(&self, line: &str) {
        let mut text = sanitize_line(line);
        if !text.ends_with('\n') {
            text.push('\n');
        }
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = self.append(&text) {
            tracing::warn!(
                "[LogFileSink] Error writing output to logfile {}: {}",
                self.path.display(),
                e
            );
        }
    }
}

/// Sends each line to every inner sink.
#[derive(Default)]
pub struct TeeSink {
    sinks: Vec<Arc<dyn OutputSink>>,
}

impl TeeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl OutputSink for TeeSink {
    fn output(&self, line: &str) {
        for sink in &self.sinks {
            sink.output(line);
        }
    }
}

/// Keeps every line in memory.
#[derive(Default)]
pub struct RecordingSink {
    lines: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl OutputSink for RecordingSink {
    fn output(&self, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(line.to_string());
    }
}

