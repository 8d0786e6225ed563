//! Local bundle coordination.
//!
//! Several runs may share one output directory. Exactly one of them builds the
//! bundle; the others wait for its completion marker. Every run then registers the
//! node descriptors and writes its own node attributes file.

use crate::config::{NodeDescriptor, ProvisionRequest};
use crate::error::{ProvisionError, Result};
use crate::layout::{write_if_absent, OutputLayout, WriteOutcome};
use crate::lock::FileLock;
use crate::output::OutputSink;
use crate::runner::{CommandRunner, LocalRunner};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Builds the bundle into the output directory.
#[async_trait]
pub trait BundleBuilder: Send + Sync {
    async fn build(&self, layout: &OutputLayout, cancel: &CancellationToken) -> Result<()>;
}

/// Local commands building the bundle: vendoring cookbooks, or installing and
/// exporting the policy.
pub fn bundle_commands(request: &ProvisionRequest) -> Vec<String> {
    let prefix = &request.bundle_prefix;
    let module = request.module_path.display();
    let output = request.output_dir.display();
    if request.uses_policyfile() {
        vec![
            format!("{} chef install {}/Policyfile.rb", prefix, module),
            format!(
                "{} chef export --force {}/Policyfile.rb {}",
                prefix, module, output
            ),
        ]
    } else {
        vec![format!(
            "{} berks vendor -b=\"{}/Berksfile\" {}/cookbooks",
            prefix, module, output
        )]
    }
}

/// Builds the bundle by running shell commands locally.
pub struct ShellBundleBuilder {
    commands: Vec<String>,
    sink: Arc<dyn OutputSink>,
}

impl ShellBundleBuilder {
    pub fn new(commands: Vec<String>, sink: Arc<dyn OutputSink>) -> Self {
        Self { commands, sink }
    }

    pub fn for_request(request: &ProvisionRequest, sink: Arc<dyn OutputSink>) -> Self {
        Self::new(bundle_commands(request), sink)
    }
}

#[async_trait]
impl BundleBuilder for ShellBundleBuilder {
    async fn build(&self, _layout: &OutputLayout, cancel: &CancellationToken) -> Result<()> {
        LocalRunner::new(self.sink.clone(), cancel.clone())
            .run_all(&self.commands)
            .await
    }
}

/// How this run obtained the bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleRole {
    /// This run built it
    Built,
    /// Complete before this run took the lock
    AlreadyBuilt,
    /// Another run built it while this one waited
    Waited,
}

/// Polling schedule for runs waiting on another run's build.
///
/// The interval doubles after each poll, and `ceiling` caps the total time
/// spent waiting: the defaults poll after 2s and then after 3s more. A cap on
/// each single sleep would instead wait 2s then 4s.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    /// Total wait before giving up
    pub ceiling: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            ceiling: Duration::from_secs(5),
        }
    }
}

pub struct BundleCoordinator {
    layout: OutputLayout,
    builder: Arc<dyn BundleBuilder>,
    sink: Arc<dyn OutputSink>,
    backoff: Backoff,
}

impl BundleCoordinator {
    pub fn new(layout: OutputLayout, builder: Arc<dyn BundleBuilder>, sink: Arc<dyn OutputSink>) -> Self {
        Self {
            layout,
            builder,
            sink,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Make sure the bundle and the node files exist, then write this instance's
    /// attributes file. Returns the attributes file path.
    pub async fn prepare(
        &self,
        instance_id: &str,
        nodes: &[NodeDescriptor],
        target_node: &str,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        match self.ensure_bundle(nodes, cancel).await? {
            BundleRole::Built => self.sink.output("Bundle built"),
            role => {
                if role == BundleRole::AlreadyBuilt {
                    self.sink.output("Bundle already built, reusing it");
                } else {
                    self.sink.output("Bundle built by another run");
                }
                // Nodes this run knows about may be missing from the registry
                self.write_node_files(nodes)?;
            }
        }
        self.write_dna(instance_id, target_node)
    }

    /// Build the bundle once across every run sharing the output directory.
    pub async fn ensure_bundle(
        &self,
        nodes: &[NodeDescriptor],
        cancel: &CancellationToken,
    ) -> Result<BundleRole> {
        if self.layout.is_built() {
            return Ok(BundleRole::AlreadyBuilt);
        }

        let lock = match FileLock::try_acquire(&self.layout.build_lock())? {
            Some(lock) => lock,
            None => {
                self.sink
                    .output("Another run is building the bundle, waiting for it");
                self.wait_for_marker(cancel).await?;
                return Ok(BundleRole::Waited);
            }
        };

        // A run may have finished between the first check and the lock
        if self.layout.is_built() {
            lock.release();
            return Ok(BundleRole::AlreadyBuilt);
        }

        self.sink.output("Building the bundle");
        tracing::info!(
            "[BundleCoordinator] Building bundle into {}",
            self.layout.root().display()
        );
        self.builder.build(&self.layout, cancel).await?;
        self.write_node_files(nodes)?;
        self.layout.mark_built()?;
        lock.release();
        Ok(BundleRole::Built)
    }

    /// Poll for the build marker with exponential backoff, up to the ceiling.
    async fn wait_for_marker(&self, cancel: &CancellationToken) -> Result<()> {
        let mut interval = self.backoff.initial;
        let mut waited = Duration::ZERO;

        while !self.layout.is_built() && waited < self.backoff.ceiling {
            let step = interval.min(self.backoff.ceiling - waited);
            tracing::debug!(
                "[BundleCoordinator] Waiting {}ms for {}",
                step.as_millis(),
                self.layout.marker().display()
            );
            tokio::select! {
                _ = tokio::time::sleep(step) => {}
                _ = cancel.cancelled() => {
                    return Err(ProvisionError::Cancelled(
                        "waiting for the bundle build".to_string(),
                    ));
                }
            }
            waited += step;
            interval = interval.saturating_mul(2);
        }

        if self.layout.is_built() {
            Ok(())
        } else {
            Err(ProvisionError::CoordinationTimeout {
                marker: self.layout.marker(),
                waited,
            })
        }
    }

    /// Register every node descriptor in the shared node directory. Skipped with a
    /// warning when another run holds the node lock. Existing files are kept.
    pub fn write_node_files(&self, nodes: &[NodeDescriptor]) -> Result<usize> {
        let nodes_dir = self.layout.nodes_dir();
        std::fs::create_dir_all(&nodes_dir).map_err(|e| {
            ProvisionError::io_context(format!("failed to create {}", nodes_dir.display()), e)
        })?;

        let lock = match FileLock::try_acquire(&self.layout.nodes_lock())? {
            Some(lock) => lock,
            None => {
                self.sink
                    .output("Node files are locked by another run, skipping them");
                tracing::warn!(
                    "[BundleCoordinator] {} is held elsewhere, node files not written",
                    self.layout.nodes_lock().display()
                );
                return Ok(0);
            }
        };

        let mut written = 0;
        for node in nodes {
            let outcome =
                write_if_absent(&self.layout.node_file(&node.id), &node.raw, self.sink.as_ref())?;
            if outcome == WriteOutcome::Written {
                written += 1;
            }
        }
        lock.release();
        Ok(written)
    }

    /// Write `dna/<instance_id>.json` unless it already exists.
    pub fn write_dna(&self, instance_id: &str, target_node: &str) -> Result<PathBuf> {
        let dna_dir = self.layout.dna_dir();
        std::fs::create_dir_all(&dna_dir).map_err(|e| {
            ProvisionError::io_context(format!("failed to create {}", dna_dir.display()), e)
        })?;
        let path = self.layout.dna_file(instance_id);
        write_if_absent(&path, target_node, self.sink.as_ref())?;
        Ok(path)
    }
}
