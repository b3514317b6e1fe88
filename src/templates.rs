//! Message rendering.
//!
//! The dispatch engine only needs [`TemplateRenderer`]. The bundled
//! [`PlaceholderTemplates`] does plain `{{ name }}` substitution over
//! templates loaded from a directory (`<id>.html` plus optional `<id>.txt`).

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::RenderError;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder pattern compiles")
});

/// A message personalised for one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub html: String,
    pub text: Option<String>,
}

/// Turns a template id plus recipient variables into a message.
pub trait TemplateRenderer: Send + Sync {
    fn render(
        &self,
        template_id: &str,
        subject: &str,
        variables: &HashMap<String, String>,
    ) -> Result<RenderedMessage, RenderError>;
}

#[derive(Debug, Clone)]
struct Template {
    html: String,
    text: Option<String>,
}

/// In-memory `{{ var }}` templates.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderTemplates {
    templates: HashMap<String, Template>,
}

impl PlaceholderTemplates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, html: impl Into<String>, text: Option<String>) {
        self.templates.insert(
            id.into(),
            Template {
                html: html.into(),
                text,
            },
        );
    }

    /// Load every `*.html` file in `dir`, with a sibling `.txt` as the text part.
    pub fn load_dir(dir: &Path) -> Result<Self, RenderError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| RenderError::Load(format!("{}: {e}", dir.display())))?;

        let mut templates = Self::new();
        for entry in entries {
            let path = entry
                .map_err(|e| RenderError::Load(format!("{}: {e}", dir.display())))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("html") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let html = std::fs::read_to_string(&path)
                .map_err(|e| RenderError::Load(format!("{}: {e}", path.display())))?;
            let text = std::fs::read_to_string(path.with_extension("txt")).ok();
            templates.insert(id, html, text);
        }

        tracing::info!(dir = %dir.display(), count = templates.len(), "Templates loaded");
        Ok(templates)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl TemplateRenderer for PlaceholderTemplates {
    fn render(
        &self,
        template_id: &str,
        subject: &str,
        variables: &HashMap<String, String>,
    ) -> Result<RenderedMessage, RenderError> {
        let template = self
            .templates
            .get(template_id)
            .ok_or_else(|| RenderError::NotFound(template_id.to_string()))?;

        Ok(RenderedMessage {
            subject: substitute(template_id, subject, variables)?,
            html: substitute(template_id, &template.html, variables)?,
            text: template
                .text
                .as_deref()
                .map(|t| substitute(template_id, t, variables))
                .transpose()?,
        })
    }
}

fn substitute(
    template_id: &str,
    source: &str,
    variables: &HashMap<String, String>,
) -> Result<String, RenderError> {
    let mut out = String::with_capacity(source.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(source) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = variables
            .get(name.as_str())
            .ok_or_else(|| RenderError::MissingVariable {
                template: template_id.to_string(),
                variable: name.as_str().to_string(),
            })?;
        out.push_str(&source[last..whole.start()]);
        out.push_str(value);
        last = whole.end();
    }
    out.push_str(&source[last..]);
    Ok(out)
}
