//! Error type for provisioning runs.

use crate::orchestrator::Stage;
use std::path::PathBuf;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Error type for provisioning operations.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed {what} {input:?}: {reason}")]
    MalformedInput {
        what: &'static str,
        input: String,
        reason: String,
    },

    #[error("Bundle seems stuck: {} did not appear after waiting {}ms", marker.display(), waited.as_millis())]
    CoordinationTimeout { marker: PathBuf, waited: Duration },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Error executing remote command {command:?}: {reason}{}", output_suffix(output))]
    RemoteCommand {
        command: String,
        reason: String,
        output: String,
    },

    #[error("Error running command '{command}': {reason}{}", output_suffix(output))]
    LocalCommand {
        command: String,
        reason: String,
        output: String,
    },

    #[error("Render error: {0}")]
    Render(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<ProvisionError>,
    },
}

fn output_suffix(output: &str) -> String {
    if output.is_empty() {
        String::new()
    } else {
        format!(". Output: {}", output)
    }
}

impl ProvisionError {
    pub(crate) fn io_context(context: impl std::fmt::Display, e: std::io::Error) -> Self {
        ProvisionError::Io(std::io::Error::new(e.kind(), format!("{}: {}", context, e)))
    }

    /// Wrap this error with the stage that produced it. Already-staged errors are kept as-is.
    pub fn in_stage(self, stage: Stage) -> Self {
        match self {
            staged @ ProvisionError::Stage { .. } => staged,
            other => ProvisionError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, looking through stage wrappers.
    pub fn root(&self) -> &ProvisionError {
        match self {
            ProvisionError::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// The stage a failure was reported from, if it went through the orchestrator.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            ProvisionError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// True for failures detected while resolving configuration.
    pub fn is_config(&self) -> bool {
        matches!(
            self.root(),
            ProvisionError::Config(_) | ProvisionError::MalformedInput { .. }
        )
    }
}
