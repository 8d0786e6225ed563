//! Rendering of the files uploaded to the target: the client configuration and
//! the boot-time service unit.

pub mod embedded_templates;
pub mod template_renderer;

pub use template_renderer::TemplateRenderer;

use crate::config::ProvisionRequest;
use crate::error::{ProvisionError, Result};
use crate::os::ServiceUnit;
use embedded_templates::{CLIENT_CONFIG_TEMPLATE, SERVICE_UNIT_TEMPLATE};
use serde::Serialize;
use tera::Context;

/// Values substituted into `client.rb`
#[derive(Debug, Clone, Serialize)]
pub struct ClientConfigContext {
    pub http_proxy: String,
    pub https_proxy: String,
    pub no_proxy: Vec<String>,
    pub ssl_verify_mode: String,
    pub disable_reporting: bool,
    pub client_options: Vec<String>,
    pub use_policyfile: bool,
    /// Remote bundle directory, `<conf_dir>/<base_output_dir>`
    pub bundle_dir: String,
}

impl ClientConfigContext {
    pub fn from_request(request: &ProvisionRequest) -> Self {
        Self {
            http_proxy: request.proxy.http.clone().unwrap_or_default(),
            https_proxy: request.proxy.https.clone().unwrap_or_default(),
            no_proxy: request.proxy.no_proxy.clone(),
            ssl_verify_mode: request.ssl_verify_mode.clone().unwrap_or_default(),
            disable_reporting: request.disable_reporting,
            client_options: request.client_options.clone(),
            use_policyfile: request.uses_policyfile(),
            bundle_dir: request.platform.bundle_dir(&request.base_output_dir),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ServiceUnitContext<'a> {
    working_directory: &'a str,
    exec_start: &'a str,
}

impl TemplateRenderer {
    pub fn render_client_config(&self, request: &ProvisionRequest) -> Result<String> {
        let context = Context::from_serialize(ClientConfigContext::from_request(request))
            .map_err(|e| ProvisionError::Render(format!("error building client.rb context: {}", e)))?;
        self.render_with_context(CLIENT_CONFIG_TEMPLATE, &context)
    }

    pub fn render_service_unit(&self, unit: &ServiceUnit) -> Result<String> {
        let context = Context::from_serialize(ServiceUnitContext {
            working_directory: &unit.working_directory,
            exec_start: &unit.exec_start,
        })
        .map_err(|e| ProvisionError::Render(format!("error building service unit context: {}", e)))?;
        self.render_with_context(SERVICE_UNIT_TEMPLATE, &context)
    }
}
