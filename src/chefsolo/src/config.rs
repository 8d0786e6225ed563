//! Provisioner configuration
//! Loaded from a TOML file and resolved once into an immutable `ProvisionRequest`
use crate::connection::RetryPolicy;
use crate::error::{ProvisionError, Result};
use crate::os::OsStrategy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default chef environment passed with `-E`
pub const DEFAULT_ENVIRONMENT: &str = "_default";

/// Default install channel
pub const DEFAULT_CHANNEL: &str = "stable";

/// Default prefix for the local bundle commands
pub const DEFAULT_BUNDLE_PREFIX: &str = "bundle exec";

/// Raw provisioner configuration, as written by the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionConfig {
    pub instance_id: String,
    pub module_path: String,
    pub output_dir: String,
    pub nodes: Vec<String>,
    pub target_node: String,

    /// "linux" or "windows"; inferred from the connection type when absent
    #[serde(default)]
    pub os_type: Option<String>,
    #[serde(default)]
    pub use_sudo: bool,
    #[serde(default)]
    pub install_as_service: bool,
    #[serde(default)]
    pub skip_install: bool,
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default)]
    pub version: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub use_policyfile: bool,
    #[serde(default)]
    pub named_run_list: Option<String>,
    #[serde(default)]
    pub http_proxy: Option<String>,
    #[serde(default)]
    pub https_proxy: Option<String>,
    #[serde(default)]
    pub no_proxy: Vec<String>,
    #[serde(default)]
    pub ssl_verify_mode: Option<String>,
    #[serde(default)]
    pub disable_reporting: bool,
    #[serde(default)]
    pub client_options: Vec<String>,
    /// Extra local directories uploaded next to the bundle
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default = "default_bundle_prefix")]
    pub bundle_prefix: String,
    #[serde(default)]
    pub log_dir: Option<String>,

    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
}

fn default_channel() -> String {
    DEFAULT_CHANNEL.to_string()
}

fn default_environment() -> String {
    DEFAULT_ENVIRONMENT.to_string()
}

fn default_bundle_prefix() -> String {
    DEFAULT_BUNDLE_PREFIX.to_string()
}

impl ProvisionConfig {
    /// Minimal configuration with every optional field at its default.
    pub fn new(
        instance_id: impl Into<String>,
        module_path: impl Into<String>,
        output_dir: impl Into<String>,
        nodes: Vec<String>,
        target_node: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            module_path: module_path.into(),
            output_dir: output_dir.into(),
            nodes,
            target_node: target_node.into(),
            os_type: None,
            use_sudo: false,
            install_as_service: false,
            skip_install: false,
            channel: default_channel(),
            version: String::new(),
            environment: default_environment(),
            use_policyfile: false,
            named_run_list: None,
            http_proxy: None,
            https_proxy: None,
            no_proxy: Vec::new(),
            ssl_verify_mode: None,
            disable_reporting: false,
            client_options: Vec::new(),
            resources: Vec::new(),
            bundle_prefix: default_bundle_prefix(),
            log_dir: None,
            coordination: CoordinationConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProvisionError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        let config = Self::from_toml_str(&content).map_err(|e| match e {
            ProvisionError::Config(msg) => {
                ProvisionError::Config(format!("{:?}: {}", path, msg))
            }
            other => other,
        })?;
        tracing::info!("[ProvisionConfig] Loaded provisioner config from {:?}", path);
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ProvisionError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// Backoff used by runs waiting for another run's bundle build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Total time a waiting run polls for the build marker before giving up
    #[serde(default = "default_ceiling_ms")]
    pub ceiling_ms: u64,
}

fn default_initial_backoff_ms() -> u64 {
    2_000
}

fn default_ceiling_ms() -> u64 {
    5_000
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            ceiling_ms: default_ceiling_ms(),
        }
    }
}

/// Remote connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// "ssh" (default) or "winrm"
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            kind: None,
            host: String::new(),
            port: None,
            user: None,
            private_key: None,
            timeout_secs: default_timeout_secs(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl ConnectionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_base_delay_ms, self.retry_max_delay_ms)
    }
}

/// Remote transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Ssh,
    Winrm,
}

impl std::str::FromStr for Transport {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        // An empty type means the default transport, ssh
        match s.to_lowercase().as_str() {
            "ssh" | "" => Ok(Transport::Ssh),
            "winrm" => Ok(Transport::Winrm),
            _ => Err(ProvisionError::Config(format!(
                "unsupported connection type: {}",
                s
            ))),
        }
    }
}

/// How the client picks what to converge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunSelector {
    /// Cookbook mode, converging the named environment
    Environment(String),
    /// Policyfile mode, optionally with a named run list
    Policy { named_run_list: Option<String> },
}

impl RunSelector {
    pub fn uses_policyfile(&self) -> bool {
        matches!(self, RunSelector::Policy { .. })
    }
}

/// Proxy settings forwarded to the installer and the client configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxySettings {
    pub http: Option<String>,
    pub https: Option<String>,
    pub no_proxy: Vec<String>,
}

/// A node descriptor for the shared node registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub id: String,
    /// Original JSON text, written verbatim
    pub raw: String,
}

impl NodeDescriptor {
    pub fn parse(raw: &str) -> Result<Self> {
        let value = parse_json_object("node descriptor", raw)?;
        let id = value
            .get("id")
            .and_then(|id| id.as_str())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ProvisionError::MalformedInput {
                what: "node descriptor",
                input: raw.to_string(),
                reason: "missing string field \"id\"".to_string(),
            })?;
        if !is_file_name(id) {
            return Err(ProvisionError::MalformedInput {
                what: "node descriptor",
                input: raw.to_string(),
                reason: format!("node id {:?} is not a valid file name", id),
            });
        }
        Ok(Self {
            id: id.to_string(),
            raw: raw.to_string(),
        })
    }
}

/// True when `name` can be used as a single path component.
fn is_file_name(name: &str) -> bool {
    !name.contains('/') && !name.contains('\\') && name != "." && name != ".."
}

fn parse_json_object(
    what: &'static str,
    raw: &str,
) -> Result<serde_json::Map<String, serde_json::Value>> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err(ProvisionError::MalformedInput {
            what,
            input: raw.to_string(),
            reason: "expected a JSON object".to_string(),
        }),
        Err(e) => Err(ProvisionError::MalformedInput {
            what,
            input: raw.to_string(),
            reason: format!("error unable to render json: {}", e),
        }),
    }
}

/// Immutable request resolved once at the start of a run
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub instance_id: String,
    pub platform: OsStrategy,
    pub transport: Transport,
    pub module_path: PathBuf,
    pub output_dir: PathBuf,
    /// Final path component of `output_dir`, reused under the remote config dir
    pub base_output_dir: String,
    pub nodes: Vec<NodeDescriptor>,
    pub target_node: String,
    pub use_sudo: bool,
    pub install_as_service: bool,
    pub skip_install: bool,
    pub channel: String,
    pub version: String,
    pub run_selector: RunSelector,
    pub proxy: ProxySettings,
    pub ssl_verify_mode: Option<String>,
    pub disable_reporting: bool,
    pub client_options: Vec<String>,
    pub resources: Vec<PathBuf>,
    pub bundle_prefix: String,
    pub initial_backoff: Duration,
    pub backoff_ceiling: Duration,
    pub connection: ConnectionConfig,
}

impl ProvisionRequest {
    /// Validate the configuration and resolve it. Touches nothing remote and
    /// writes nothing locally.
    pub fn resolve(config: &ProvisionConfig) -> Result<Self> {
        if config.instance_id.trim().is_empty() {
            return Err(ProvisionError::Config(
                "instance_id must be a non-empty string".to_string(),
            ));
        }
        if !is_file_name(&config.instance_id) {
            return Err(ProvisionError::Config(format!(
                "instance_id {:?} is not a valid file name",
                config.instance_id
            )));
        }

        let nodes = config
            .nodes
            .iter()
            .map(|raw| NodeDescriptor::parse(raw))
            .collect::<Result<Vec<_>>>()?;
        parse_json_object("target node descriptor", &config.target_node)?;

        let module_path = expand_home(&config.module_path);
        check_readable(&module_path).map_err(|e| {
            ProvisionError::Config(format!(
                "error expanding the chef module path {}: {}",
                module_path.display(),
                e
            ))
        })?;

        let output_dir = expand_home(&config.output_dir);
        let base_output_dir = output_dir
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| {
                ProvisionError::Config(format!(
                    "output directory {} has no final path component",
                    output_dir.display()
                ))
            })?;

        let transport: Transport = config.connection.kind.as_deref().unwrap_or("").parse()?;
        let platform = match config.os_type.as_deref() {
            Some(os) if !os.is_empty() => os.parse::<OsStrategy>()?,
            _ => OsStrategy::from_transport(transport),
        };

        let use_sudo = config.use_sudo && platform.supports_elevation();
        if config.use_sudo && !use_sudo {
            tracing::debug!(
                "[ProvisionRequest] Elevation is not used on {} targets, ignoring use_sudo",
                platform
            );
        }

        if config.install_as_service {
            if !platform.supports_service() {
                return Err(ProvisionError::Config(format!(
                    "installing chef as a service is not supported on {} targets",
                    platform
                )));
            }
            if !use_sudo {
                return Err(ProvisionError::Config(
                    "you need to use the option use_sudo to install chef as a service".to_string(),
                ));
            }
        }

        let run_selector = if config.use_policyfile {
            RunSelector::Policy {
                named_run_list: config
                    .named_run_list
                    .clone()
                    .filter(|name| !name.is_empty()),
            }
        } else {
            RunSelector::Environment(config.environment.clone())
        };

        // Written to client.rb as a ruby symbol
        let ssl_verify_mode = config
            .ssl_verify_mode
            .as_ref()
            .filter(|mode| !mode.is_empty())
            .map(|mode| {
                if mode.starts_with(':') {
                    mode.clone()
                } else {
                    format!(":{}", mode)
                }
            });

        if config.coordination.initial_backoff_ms == 0 {
            return Err(ProvisionError::Config(
                "coordination.initial_backoff_ms must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            instance_id: config.instance_id.clone(),
            platform,
            transport,
            module_path,
            output_dir,
            base_output_dir,
            nodes,
            target_node: config.target_node.clone(),
            use_sudo,
            install_as_service: config.install_as_service,
            skip_install: config.skip_install,
            channel: config.channel.clone(),
            version: config.version.clone(),
            run_selector,
            proxy: ProxySettings {
                http: config.http_proxy.clone().filter(|p| !p.is_empty()),
                https: config.https_proxy.clone().filter(|p| !p.is_empty()),
                no_proxy: config.no_proxy.clone(),
            },
            ssl_verify_mode,
            disable_reporting: config.disable_reporting,
            client_options: config.client_options.clone(),
            resources: config.resources.iter().map(|r| expand_home(r)).collect(),
            bundle_prefix: config.bundle_prefix.clone(),
            initial_backoff: Duration::from_millis(config.coordination.initial_backoff_ms),
            backoff_ceiling: Duration::from_millis(config.coordination.ceiling_ms),
            connection: config.connection.clone(),
        })
    }

    pub fn uses_policyfile(&self) -> bool {
        self.run_selector.uses_policyfile()
    }
}

/// Fails unless `path` exists and can be listed (directories) or opened.
fn check_readable(path: &Path) -> std::io::Result<()> {
    if std::fs::metadata(path)?.is_dir() {
        std::fs::read_dir(path)?;
    } else {
        std::fs::File::open(path)?;
    }
    Ok(())
}

/// Expand a leading `~` to the current user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
