//! Chef-solo provisioner
//!
//! Provisions a freshly created machine by building a shared cookbook or policy
//! bundle locally (once, across every concurrent run sharing the output directory),
//! uploading it with a rendered client configuration, installing the chef client
//! and running it against the bundle.

pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod layout;
pub mod lock;
pub mod orchestrator;
pub mod os;
pub mod output;
pub mod render;
pub mod runner;
pub mod ssh;

pub use config::{
    ConnectionConfig, CoordinationConfig, NodeDescriptor, ProvisionConfig, ProvisionRequest,
    ProxySettings, RunSelector, Transport,
};
pub use connection::{ConnectedSession, ConnectionManager, Connector, RetryPolicy, Session};
pub use coordinator::{
    bundle_commands, Backoff, BundleBuilder, BundleCoordinator, BundleRole, ShellBundleBuilder,
};
pub use error::{ProvisionError, Result};
pub use layout::{write_if_absent, OutputLayout, WriteOutcome};
pub use lock::FileLock;
pub use orchestrator::{default_connector, LocalArtifacts, Provisioner, Stage};
pub use os::{OsStrategy, RemoteStep, ServiceUnit};
pub use output::{
    sanitize_line, ChannelOutputSink, LogFileSink, OutputLine, OutputSink, RecordingSink,
    TeeSink, TracingSink,
};
pub use render::{ClientConfigContext, TemplateRenderer};
pub use runner::{elevate, CommandRunner, LocalRunner, OutputBuffer, RemoteRunner, MAX_BUF_SIZE};
pub use ssh::SshConnector;
