//! Template renderer using Tera for Jinja2-style template rendering
use super::embedded_templates;
use crate::error::{ProvisionError, Result};
use std::path::{Path, PathBuf};
use tera::{Context, Tera};

/// Environment variable pointing at a directory of template overrides
pub const TEMPLATES_DIR_ENV: &str = "CHEFSOLO_TEMPLATES_DIR";

pub struct TemplateRenderer {
    tera: Tera,
    templates_dir: PathBuf,
}

impl TemplateRenderer {
    /// Create a TemplateRenderer from the templates compiled into the binary.
    pub fn from_embedded() -> Result<Self> {
        tracing::debug!("[TemplateRenderer] Initializing Tera from embedded templates");

        let mut tera = Tera::default();
        for (name, content) in embedded_templates::ALL_TEMPLATES {
            tera.add_raw_template(name, content).map_err(|e| {
                ProvisionError::Render(format!("Failed to add embedded template {}: {}", name, e))
            })?;
            tracing::debug!("[TemplateRenderer] Loaded embedded template: {}", name);
        }

        Ok(Self {
            tera,
            templates_dir: PathBuf::from("(embedded)"),
        })
    }

    /// Embedded templates, overridden by any `*.j2` file found in `templates_dir`.
    pub fn with_overrides(templates_dir: PathBuf) -> Result<Self> {
        let mut renderer = Self::from_embedded()?;
        let entries = std::fs::read_dir(&templates_dir).map_err(|e| {
            ProvisionError::Render(format!(
                "Failed to read templates dir {}: {}",
                templates_dir.display(),
                e
            ))
        })?;

        let mut template_count = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) if path.is_file() && name.ends_with(".j2") => name.to_string(),
                _ => continue,
            };
            let content = std::fs::read_to_string(&path)?;
            if let Err(e) = renderer.tera.add_raw_template(&name, &content) {
                tracing::warn!("[TemplateRenderer] Failed to add template {}: {}", name, e);
            } else {
                template_count += 1;
                tracing::debug!("[TemplateRenderer] Loaded template override: {}", name);
            }
        }

        tracing::info!(
            "[TemplateRenderer] Loaded {} template overrides from {}",
            template_count,
            templates_dir.display()
        );
        renderer.templates_dir = templates_dir;
        Ok(renderer)
    }

    /// Embedded templates, with overrides from `CHEFSOLO_TEMPLATES_DIR` when set.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(TEMPLATES_DIR_ENV) {
            Some(dir) => Self::with_overrides(PathBuf::from(dir)),
            None => Self::from_embedded(),
        }
    }

    /// Render a template with a Tera Context directly
    pub fn render_with_context(&self, template_name: &str, context: &Context) -> Result<String> {
        let rendered = self.tera.render(template_name, context).map_err(|e| {
            ProvisionError::Render(format!("Failed to render template {}: {}", template_name, e))
        })?;
        tracing::debug!(
            "[TemplateRenderer] Rendered template {} ({} bytes)",
            template_name,
            rendered.len()
        );
        Ok(rendered)
    }

    /// List all loaded template names
    pub fn list_templates(&self) -> Vec<String> {
        self.tera.get_template_names().map(String::from).collect()
    }

    pub fn templates_dir(&self) -> &Path {
        &self.templates_dir
    }
}
