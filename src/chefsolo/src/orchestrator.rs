//! Provisioning run state machine.
//!
//! A run moves strictly forward through
//! `Configured -> LocalArtifactsPrepared -> MachinePrepared -> ClientRan -> Done`.
//! Any failure aborts the run and is reported with the stage it happened in.

use crate::config::{ProvisionConfig, ProvisionRequest};
use crate::connection::{ConnectionManager, Connector};
use crate::coordinator::{Backoff, BundleBuilder, BundleCoordinator, ShellBundleBuilder};
use crate::error::{ProvisionError, Result};
use crate::layout::OutputLayout;
use crate::os::RemoteStep;
use crate::output::OutputSink;
use crate::render::TemplateRenderer;
use crate::runner::{CommandRunner, RemoteRunner};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Configured,
    LocalArtifactsPrepared,
    MachinePrepared,
    ClientRan,
    Done,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Configured => "Configuration",
            Stage::LocalArtifactsPrepared => "Preparing local artifacts",
            Stage::MachinePrepared => "Preparing the machine",
            Stage::ClientRan => "Running the chef client",
            Stage::Done => "Finishing the run",
        };
        f.write_str(name)
    }
}

/// Files produced locally before touching the target
#[derive(Debug, Clone)]
pub struct LocalArtifacts {
    pub client_config: String,
    pub service_unit: Option<String>,
}

pub struct Provisioner {
    request: ProvisionRequest,
    connector: Option<Arc<dyn Connector>>,
    sink: Arc<dyn OutputSink>,
    builder: Arc<dyn BundleBuilder>,
    renderer: TemplateRenderer,
    stage: Stage,
}

impl Provisioner {
    /// Resolve the configuration and make the output directory usable. Nothing
    /// remote happens here.
    pub fn configure(config: &ProvisionConfig, sink: Arc<dyn OutputSink>) -> Result<Self> {
        let configured = || -> Result<Self> {
            let request = ProvisionRequest::resolve(config)?;
            OutputLayout::new(&request.output_dir).prepare()?;
            let builder: Arc<dyn BundleBuilder> =
                Arc::new(ShellBundleBuilder::for_request(&request, sink.clone()));
            Ok(Self {
                request,
                connector: None,
                sink: sink.clone(),
                builder,
                renderer: TemplateRenderer::from_env()?,
                stage: Stage::Configured,
            })
        };
        configured().map_err(|e| e.in_stage(Stage::Configured))
    }

    /// Use `connector` instead of the built-in one for the request's transport.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_bundle_builder(mut self, builder: Arc<dyn BundleBuilder>) -> Self {
        self.builder = builder;
        self
    }

    pub fn request(&self) -> &ProvisionRequest {
        &self.request
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Drive the run to completion.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let started = std::time::Instant::now();
        tracing::info!(
            "[Provisioner] Starting run for instance {} ({} target)",
            self.request.instance_id,
            self.request.platform
        );

        let connector = match &self.connector {
            Some(connector) => connector.clone(),
            None => default_connector(&self.request).map_err(|e| e.in_stage(Stage::Configured))?,
        };

        self.sink.output("Creating configuration files...");
        let artifacts = self
            .prepare_local_artifacts(&cancel)
            .await
            .map_err(|e| e.in_stage(Stage::LocalArtifactsPrepared))?;
        self.stage = Stage::LocalArtifactsPrepared;

        let manager = ConnectionManager::new(connector, self.sink.clone())
            .with_retry(self.request.connection.retry_policy());
        let connected = manager
            .connect(&cancel)
            .await
            .map_err(|e| e.in_stage(Stage::MachinePrepared))?;
        let runner = RemoteRunner::new(connected.session(), self.sink.clone(), self.request.use_sudo);

        let remote = self.run_remote(&runner, &artifacts).await;
        connected.close().await;
        remote?;

        self.stage = Stage::Done;
        tracing::info!(
            "[TIMING] Run for instance {} completed in {}ms",
            self.request.instance_id,
            started.elapsed().as_millis()
        );
        Ok(())
    }

    async fn run_remote(&mut self, runner: &RemoteRunner, artifacts: &LocalArtifacts) -> Result<()> {
        self.sink.output("Preparing the machine...");
        self.prepare_machine(runner, artifacts)
            .await
            .map_err(|e| e.in_stage(Stage::MachinePrepared))?;
        self.stage = Stage::MachinePrepared;

        self.sink.output("Starting initial Chef-Client run...");
        self.run_client(runner, artifacts)
            .await
            .map_err(|e| e.in_stage(Stage::ClientRan))?;
        self.stage = Stage::ClientRan;
        Ok(())
    }

    /// Build or wait for the shared bundle, write this instance's attributes and
    /// render the files uploaded later.
    pub async fn prepare_local_artifacts(&self, cancel: &CancellationToken) -> Result<LocalArtifacts> {
        let request = &self.request;
        let coordinator = BundleCoordinator::new(
            OutputLayout::new(&request.output_dir),
            self.builder.clone(),
            self.sink.clone(),
        )
        .with_backoff(Backoff {
            initial: request.initial_backoff,
            ceiling: request.backoff_ceiling,
        });
        let dna_path = coordinator
            .prepare(&request.instance_id, &request.nodes, &request.target_node, cancel)
            .await?;
        tracing::debug!("[Provisioner] Node attributes in {}", dna_path.display());

        let client_config = self.renderer.render_client_config(request)?;
        let service_unit = if request.install_as_service {
            let unit = request.platform.service_unit(request);
            Some(self.renderer.render_service_unit(&unit)?)
        } else {
            None
        };

        Ok(LocalArtifacts {
            client_config,
            service_unit,
        })
    }

    /// Stage configuration and bundle on the target, then install the client
    /// unless told to skip it.
    async fn prepare_machine(&self, runner: &RemoteRunner, artifacts: &LocalArtifacts) -> Result<()> {
        let platform = self.request.platform;
        self.apply_steps(runner, platform.stage_config_steps(&self.request, &artifacts.client_config))
            .await?;

        if self.request.skip_install {
            self.sink.output("Skipping chef client installation");
            return Ok(());
        }
        self.sink.output("Installing chef client...");
        runner
            .run_all(&platform.install_client_commands(&self.request))
            .await
    }

    async fn run_client(&self, runner: &RemoteRunner, artifacts: &LocalArtifacts) -> Result<()> {
        let platform = self.request.platform;
        if let Some(unit) = &artifacts.service_unit {
            self.sink.output("Installing chef client as a service...");
            let steps = platform.service_install_steps(&self.request, unit)?;
            self.apply_steps(runner, steps).await?;
        }
        runner.run(&platform.run_client_command(&self.request)).await
    }

    async fn apply_steps(&self, runner: &RemoteRunner, steps: Vec<RemoteStep>) -> Result<()> {
        for step in steps {
            match step {
                RemoteStep::Run(command) => runner.run(&command).await?,
                RemoteStep::Upload {
                    remote_path,
                    content,
                } => runner.upload(&remote_path, &content).await?,
                RemoteStep::UploadDir { local, remote_dir } => {
                    runner.upload_dir(&local, &remote_dir).await?
                }
                RemoteStep::Notice(line) => self.sink.output(&line),
            }
        }
        Ok(())
    }
}

/// Connector for the request's transport. Only ssh is built in; WinRM targets
/// need a connector supplied by the embedding program.
pub fn default_connector(request: &ProvisionRequest) -> Result<Arc<dyn Connector>> {
    match request.transport {
        crate::config::Transport::Ssh => Ok(Arc::new(crate::ssh::SshConnector::from_config(
            &request.connection,
        )?)),
        crate::config::Transport::Winrm => Err(ProvisionError::Config(
            "no built-in winrm connector is available".to_string(),
        )),
    }
}
