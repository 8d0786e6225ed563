//! chefsolo-provision: provision one machine with chef-solo.

use anyhow::Context;
use chefsolo::{
    LogFileSink, OutputSink, ProvisionConfig, ProvisionRequest, Provisioner, TeeSink, TracingSink,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "chefsolo-provision", version, about = "Provision a machine with chef-solo")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full provisioning sequence against the configured target
    Apply {
        #[arg(short = 'c', long = "config")]
        config: PathBuf,

        #[arg(long = "log-dir", help = "Also append output to <log-dir>/<instance_id>")]
        log_dir: Option<PathBuf>,

        #[command(flatten)]
        overrides: Overrides,
    },
    /// Resolve and check the configuration without touching anything
    Validate {
        #[arg(short = 'c', long = "config")]
        config: PathBuf,

        #[command(flatten)]
        overrides: Overrides,
    },
}

#[derive(clap::Args, Debug)]
struct Overrides {
    #[arg(long = "use-sudo")]
    use_sudo: bool,

    #[arg(long = "skip-install")]
    skip_install: bool,

    #[arg(long = "instance-id")]
    instance_id: Option<String>,
}

impl Overrides {
    fn apply(self, config: &mut ProvisionConfig) {
        if self.use_sudo {
            config.use_sudo = true;
        }
        if self.skip_install {
            config.skip_install = true;
        }
        if let Some(instance_id) = self.instance_id {
            config.instance_id = instance_id;
        }
    }
}

fn load_config(path: &PathBuf, overrides: Overrides) -> anyhow::Result<ProvisionConfig> {
    let mut config = ProvisionConfig::load(path)
        .with_context(|| format!("loading {}", path.display()))?;
    overrides.apply(&mut config);
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to info level if RUST_LOG not set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();
    match args.command {
        Command::Validate { config, overrides } => {
            let config = load_config(&config, overrides)?;
            let request = ProvisionRequest::resolve(&config)?;
            tracing::info!(
                "Configuration is valid: instance {} on a {} target, output {}",
                request.instance_id,
                request.platform,
                request.output_dir.display()
            );
            Ok(())
        }
        Command::Apply {
            config,
            log_dir,
            overrides,
        } => {
            let config = load_config(&config, overrides)?;

            let mut sinks = TeeSink::new().with(Arc::new(TracingSink::new(&config.instance_id)));
            let log_dir = log_dir.or_else(|| config.log_dir.as_deref().map(chefsolo::config::expand_home));
            if let Some(dir) = log_dir {
                let file_sink = LogFileSink::new(&dir, &config.instance_id)
                    .with_context(|| format!("opening log dir {}", dir.display()))?;
                tracing::info!("Writing run output to {}", file_sink.path().display());
                sinks = sinks.with(Arc::new(file_sink));
            }
            let sink: Arc<dyn OutputSink> = Arc::new(sinks);

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted, cancelling the run");
                    on_signal.cancel();
                }
            });

            let mut provisioner = Provisioner::configure(&config, sink)?;
            provisioner.run(cancel).await?;
            tracing::info!("Provisioning of {} complete", config.instance_id);
            Ok(())
        }
    }
}
