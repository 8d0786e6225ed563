//! Command runners.
//!
//! Both runners stream every output line to the run's sink as it is produced and
//! keep the tail of the output so a failure can carry it.
pub mod buffer;
pub mod local;
pub mod remote;

pub use buffer::{OutputBuffer, MAX_BUF_SIZE};
pub use local::LocalRunner;
pub use remote::{elevate, RemoteRunner};

use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run one shell command to completion.
    async fn run(&self, command: &str) -> Result<()>;

    /// Run commands in order. Fail-fast: stops at the first failure.
    async fn run_all(&self, commands: &[String]) -> Result<()> {
        for (index, command) in commands.iter().enumerate() {
            let started = std::time::Instant::now();
            if let Err(e) = self.run(command).await {
                tracing::warn!(
                    "[TIMING] Command {}/{} failed after {}ms",
                    index + 1,
                    commands.len(),
                    started.elapsed().as_millis()
                );
                return Err(e);
            }
            tracing::debug!(
                "[TIMING] Command {}/{} completed in {}ms",
                index + 1,
                commands.len(),
                started.elapsed().as_millis()
            );
        }
        Ok(())
    }
}
