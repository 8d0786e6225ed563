//! Remote sessions and connection management.
//!
//! A [`Connector`] opens a [`Session`] to the target machine. The
//! [`ConnectionManager`] retries failed attempts with exponential backoff until the
//! connector's timeout elapses or the run is cancelled, and ties the session's
//! lifetime to the run's cancellation token.

use crate::error::{ProvisionError, Result};
use crate::output::OutputSink;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// An open session on the target machine.
#[async_trait]
pub trait Session: Send + Sync {
    /// Run `command` in the target's shell, sending each output line as it is
    /// produced. Returns the exit status; `Err` means the transport failed.
    async fn exec(&self, command: &str, output: mpsc::UnboundedSender<String>) -> Result<i32>;

    /// Write `content` to the file at `remote_path`.
    async fn upload(&self, remote_path: &str, content: Vec<u8>) -> Result<()>;

    /// Copy the local directory `local_dir` into `remote_dir`, keeping its name.
    async fn upload_dir(&self, local_dir: &Path, remote_dir: &str) -> Result<()>;

    /// Close the session. Safe to call more than once.
    async fn disconnect(&self);
}

/// Opens sessions for one target.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Total time allowed for connecting, retries included.
    fn timeout(&self) -> Duration;

    /// Human-readable target, used in output lines.
    fn describe(&self) -> String;

    async fn connect(&self) -> Result<Arc<dyn Session>>;
}

/// Exponential backoff between connection attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        RetryPolicy {
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Delay after the given failed attempt (0-indexed).
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.max_delay_ms)
    }
}

impl Default for RetryPolicy {
    /// 1s base delay, capped at 30s.
    fn default() -> Self {
        RetryPolicy {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

/// A session whose lifetime is tied to a cancellation token.
///
/// On cancellation a background watcher disconnects it. On normal completion
/// the owner calls [`ConnectedSession::close`].
pub struct ConnectedSession {
    session: Arc<dyn Session>,
    watcher: JoinHandle<()>,
}

impl ConnectedSession {
    pub fn session(&self) -> Arc<dyn Session> {
        self.session.clone()
    }

    pub async fn close(self) {
        self.watcher.abort();
        self.session.disconnect().await;
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    retry: RetryPolicy,
    sink: Arc<dyn OutputSink>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, sink: Arc<dyn OutputSink>) -> Self {
        Self {
            connector,
            retry: RetryPolicy::default(),
            sink,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Connect, retrying until success, the connector's timeout or cancellation.
    /// On timeout the last connection error is returned.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<ConnectedSession> {
        let budget = self.connector.timeout();
        let target = self.connector.describe();
        self.sink
            .output(&format!("Connecting to remote host {}...", target));

        let mut last_error: Option<ProvisionError> = None;
        let outcome = {
            let attempts = async {
                let mut attempt: u32 = 0;
                loop {
                    match self.connector.connect().await {
                        Ok(session) => return session,
                        Err(e) => {
                            let delay = self.retry.delay_ms(attempt);
                            tracing::warn!(
                                "[ConnectionManager] Attempt {} to {} failed: {}. Retrying in {}ms",
                                attempt + 1,
                                target,
                                e,
                                delay
                            );
                            last_error = Some(e);
                            attempt = attempt.saturating_add(1);
                            tokio::time::sleep(Duration::from_millis(delay)).await;
                        }
                    }
                }
            };
            tokio::select! {
                result = tokio::time::timeout(budget, attempts) => result.ok(),
                _ = cancel.cancelled() => {
                    return Err(ProvisionError::Cancelled(format!(
                        "connection to {} cancelled",
                        target
                    )));
                }
            }
        };

        let session = match outcome {
            Some(session) => session,
            None => {
                return Err(last_error.unwrap_or_else(|| {
                    ProvisionError::Connection(format!(
                        "timeout after {}s connecting to {}",
                        budget.as_secs(),
                        target
                    ))
                }))
            }
        };

        self.sink.output("Connected!");
        tracing::info!("[ConnectionManager] Connected to {}", target);

        let watched = session.clone();
        let token = cancel.clone();
        let watcher = tokio::spawn(async move {
            token.cancelled().await;
            tracing::info!("[ConnectionManager] Run cancelled, closing session to {}", target);
            watched.disconnect().await;
        });

        Ok(ConnectedSession { session, watcher })
    }
}
