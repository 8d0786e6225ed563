//! Per-platform remote steps.
//!
//! [`OsStrategy`] is a closed set of target platforms. Every operation returns the
//! commands and uploads to perform as plain data; executing them is the caller's
//! job, so the step lists can be checked without a live target.

use crate::config::{ProvisionRequest, ProxySettings, RunSelector, Transport};
use crate::error::{ProvisionError, Result};
use std::path::PathBuf;

const NIX_CONF_DIR: &str = "/opt/chef/0";
const NIX_CLIENT: &str = "/opt/chef/embedded/bin/ruby --disable-gems /usr/bin/chef-client";
const NIX_INSTALL_URL: &str = "https://omnitruck.chef.io/install.sh";

const WINDOWS_CONF_DIR: &str = "C:/chef";
const WINDOWS_CLIENT: &str = "cmd /c chef-client";
const WINDOWS_INSTALL_URL: &str = "https://omnitruck.chef.io/install.ps1";

pub const CLIENT_CONFIG: &str = "client.rb";
pub const SERVICE_NAME: &str = "chef-run.service";
const SERVICE_STAGING_DIR: &str = "/tmp";
const SERVICE_DIR: &str = "/etc/systemd/system";

/// One remote action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStep {
    /// Run a shell command, elevated when the request asks for it
    Run(String),
    /// Write a file
    Upload { remote_path: String, content: String },
    /// Copy a local directory into `remote_dir`
    UploadDir { local: PathBuf, remote_dir: String },
    /// Status line for the output sink
    Notice(String),
}

/// Parameters of the service unit file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUnit {
    pub working_directory: String,
    pub exec_start: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsStrategy {
    /// Unix-like targets
    Nix,
    Windows,
}

impl std::fmt::Display for OsStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OsStrategy::Nix => write!(f, "linux"),
            OsStrategy::Windows => write!(f, "windows"),
        }
    }
}

impl std::str::FromStr for OsStrategy {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "linux" | "unix" | "nix" => Ok(OsStrategy::Nix),
            "windows" => Ok(OsStrategy::Windows),
            _ => Err(ProvisionError::Config(format!("unsupported os type: {}", s))),
        }
    }
}

impl OsStrategy {
    /// Platform implied by the connection type
    pub fn from_transport(transport: Transport) -> Self {
        match transport {
            Transport::Ssh => OsStrategy::Nix,
            Transport::Winrm => OsStrategy::Windows,
        }
    }

    pub fn conf_dir(&self) -> &'static str {
        match self {
            OsStrategy::Nix => NIX_CONF_DIR,
            OsStrategy::Windows => WINDOWS_CONF_DIR,
        }
    }

    pub fn client_command(&self) -> &'static str {
        match self {
            OsStrategy::Nix => NIX_CLIENT,
            OsStrategy::Windows => WINDOWS_CLIENT,
        }
    }

    pub fn supports_elevation(&self) -> bool {
        matches!(self, OsStrategy::Nix)
    }

    pub fn supports_service(&self) -> bool {
        matches!(self, OsStrategy::Nix)
    }

    /// `<conf_dir>/client.rb`
    pub fn client_config_path(&self) -> String {
        format!("{}/{}", self.conf_dir(), CLIENT_CONFIG)
    }

    /// Remote directory holding the uploaded bundle
    pub fn bundle_dir(&self, base_output_dir: &str) -> String {
        format!("{}/{}", self.conf_dir(), base_output_dir)
    }

    /// Client command line, without the change of directory
    pub fn client_invocation(&self, request: &ProvisionRequest) -> String {
        let bundle_dir = self.bundle_dir(&request.base_output_dir);
        let dna = format!("{}/dna/{}.json", bundle_dir, request.instance_id);
        let command = format!(
            "{} -z -c {} -j {}",
            self.client_command(),
            self.client_config_path(),
            quote(&dna)
        );
        match &request.run_selector {
            RunSelector::Policy {
                named_run_list: None,
            } => command,
            RunSelector::Policy {
                named_run_list: Some(name),
            } => format!("{} -n {}", command, quote(name)),
            RunSelector::Environment(environment) => {
                format!("{} -E {}", command, quote(environment))
            }
        }
    }

    /// Client command run from inside the bundle directory
    pub fn run_client_command(&self, request: &ProvisionRequest) -> String {
        let bundle_dir = self.bundle_dir(&request.base_output_dir);
        match self {
            OsStrategy::Nix => format!("cd {} && {}", bundle_dir, self.client_invocation(request)),
            OsStrategy::Windows => format!(
                "cd /d {} && {}",
                to_windows_path(&bundle_dir),
                self.client_invocation(request)
            ),
        }
    }

    /// Commands installing the client through the omnitruck installer
    pub fn install_client_commands(&self, request: &ProvisionRequest) -> Vec<String> {
        match self {
            OsStrategy::Nix => {
                let prefix = nix_proxy_prefix(&request.proxy);
                vec![
                    format!("{}curl -LO {}", prefix, NIX_INSTALL_URL),
                    format!(
                        "{}bash ./install.sh -v {} -c {}",
                        prefix,
                        quote(&request.version),
                        request.channel
                    ),
                    format!("{}rm -f install.sh", prefix),
                ]
            }
            OsStrategy::Windows => {
                let prefix = windows_proxy_prefix(&request.proxy);
                let script = "$env:TEMP\\install.ps1";
                let proxy_arg = request
                    .proxy
                    .http
                    .as_ref()
                    .map(|proxy| format!(" -Proxy {}", proxy))
                    .unwrap_or_default();
                let version_arg = if request.version.is_empty() {
                    String::new()
                } else {
                    format!(" -version {}", request.version)
                };
                vec![
                    format!(
                        "{}powershell -NoProfile -ExecutionPolicy Bypass -Command \"Invoke-WebRequest -UseBasicParsing -Uri {}{} -OutFile {}\"",
                        prefix, WINDOWS_INSTALL_URL, proxy_arg, script
                    ),
                    format!(
                        "{}powershell -NoProfile -ExecutionPolicy Bypass -Command \". {}; install -project chef -channel {}{}\"",
                        prefix, script, request.channel, version_arg
                    ),
                    format!("{}cmd /c del /f /q %TEMP%\\install.ps1", prefix),
                ]
            }
        }
    }

    /// Steps staging the client configuration, the local bundle and the extra
    /// resources on the target.
    pub fn stage_config_steps(&self, request: &ProvisionRequest, client_config: &str) -> Vec<RemoteStep> {
        let conf_dir = self.conf_dir();
        let bundle_dir = self.bundle_dir(&request.base_output_dir);
        let mut steps = Vec::new();

        match self {
            OsStrategy::Nix => {
                steps.push(RemoteStep::Run(format!("mkdir -p {}", conf_dir)));
                if request.use_sudo {
                    steps.push(RemoteStep::Run(format!("chmod -R 777 {}", conf_dir)));
                }
            }
            OsStrategy::Windows => {
                let dir = to_windows_path(conf_dir);
                steps.push(RemoteStep::Run(format!(
                    "cmd /c if not exist \"{}\" mkdir \"{}\"",
                    dir, dir
                )));
            }
        }

        steps.push(RemoteStep::Notice("Uploading client conf".to_string()));
        steps.push(RemoteStep::Upload {
            remote_path: self.client_config_path(),
            content: client_config.to_string(),
        });

        steps.push(RemoteStep::Notice(format!("Deploying {}", bundle_dir)));
        steps.push(RemoteStep::UploadDir {
            local: request.output_dir.clone(),
            remote_dir: conf_dir.to_string(),
        });
        for resource in &request.resources {
            steps.push(RemoteStep::UploadDir {
                local: resource.clone(),
                remote_dir: bundle_dir.clone(),
            });
        }

        if *self == OsStrategy::Nix && request.use_sudo {
            steps.push(RemoteStep::Run(format!("chmod -R 755 {}", conf_dir)));
            steps.push(RemoteStep::Run(chmod_files(conf_dir, 600)));
            steps.push(RemoteStep::Run(format!("chown -R root.root {}", conf_dir)));
        }
        steps
    }

    /// Unit file parameters for running the client at boot
    pub fn service_unit(&self, request: &ProvisionRequest) -> ServiceUnit {
        ServiceUnit {
            working_directory: self.bundle_dir(&request.base_output_dir),
            exec_start: self.client_invocation(request),
        }
    }

    /// Steps installing and enabling `unit_file` as the boot-time client service
    pub fn service_install_steps(&self, request: &ProvisionRequest, unit_file: &str) -> Result<Vec<RemoteStep>> {
        if !self.supports_service() {
            return Err(ProvisionError::Config(format!(
                "installing chef as a service is not supported on {} targets",
                self
            )));
        }
        if !request.use_sudo {
            return Err(ProvisionError::Config(
                "you need to use the option use_sudo to install chef as a service".to_string(),
            ));
        }
        let staged = format!("{}/{}", SERVICE_STAGING_DIR, SERVICE_NAME);
        Ok(vec![
            RemoteStep::Upload {
                remote_path: staged.clone(),
                content: unit_file.to_string(),
            },
            RemoteStep::Run(chmod_files(&staged, 755)),
            RemoteStep::Run(format!("mv {} {}/{}", staged, SERVICE_DIR, SERVICE_NAME)),
            RemoteStep::Run("systemctl daemon-reload".to_string()),
            RemoteStep::Run(format!("systemctl enable {}", SERVICE_NAME)),
        ])
    }
}

fn chmod_files(path: &str, mode: u32) -> String {
    format!("find {} -maxdepth 1 -type f -exec /bin/chmod -R {} {{}} +", path, mode)
}

fn nix_proxy_prefix(proxy: &ProxySettings) -> String {
    let mut prefix = String::new();
    if let Some(http) = &proxy.http {
        prefix.push_str(&format!("http_proxy='{}' ", http));
    }
    if let Some(https) = &proxy.https {
        prefix.push_str(&format!("https_proxy='{}' ", https));
    }
    if !proxy.no_proxy.is_empty() {
        prefix.push_str(&format!("no_proxy='{}' ", proxy.no_proxy.join(",")));
    }
    prefix
}

fn windows_proxy_prefix(proxy: &ProxySettings) -> String {
    let mut prefix = String::new();
    if let Some(http) = &proxy.http {
        prefix.push_str(&format!("set \"http_proxy={}\" && ", http));
    }
    if let Some(https) = &proxy.https {
        prefix.push_str(&format!("set \"https_proxy={}\" && ", https));
    }
    if !proxy.no_proxy.is_empty() {
        prefix.push_str(&format!("set \"no_proxy={}\" && ", proxy.no_proxy.join(",")));
    }
    prefix
}

fn to_windows_path(path: &str) -> String {
    path.replace('/', "\\")
}

/// Double-quote `value`, escaping backslashes and quotes.
pub fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}
