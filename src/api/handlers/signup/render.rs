//! Form models and the renderers that turn them into page JSON.

use anyhow::{Result, anyhow};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FormField {
    pub name: String,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub required: bool,
    pub section: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl FormField {
    #[must_use]
    pub fn new(name: &str, label: &str, kind: &str, section: &str) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            kind: kind.to_string(),
            required: false,
            section: section.to_string(),
            value: None,
        }
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn with_value(mut self, value: Option<&str>) -> Self {
        self.value = value
            .filter(|value| !value.is_empty())
            .map(ToString::to_string);
        self
    }
}

/// Signup form produced by an auth plugin.
#[derive(Clone, Debug)]
pub struct SignupForm {
    /// Renderer lookup key, `auth_{authtype}`.
    pub component: String,
    pub action: String,
    pub fields: Vec<FormField>,
    /// Forms that cannot be exported to a renderer draw themselves.
    pub renderable: bool,
}

impl SignupForm {
    /// Self-rendered form markup, used when no renderer applies.
    #[must_use]
    pub fn display(&self) -> serde_json::Value {
        let mut html = format!(
            "<form method=\"post\" action=\"{}\">",
            escape_html(&self.action)
        );
        for field in &self.fields {
            html.push_str(&format!(
                "<label for=\"id_{name}\">{label}</label><input type=\"{kind}\" id=\"id_{name}\" name=\"{name}\" value=\"{value}\"{required}>",
                name = escape_html(&field.name),
                label = escape_html(&field.label),
                kind = escape_html(&field.kind),
                value = escape_html(field.value.as_deref().unwrap_or_default()),
                required = if field.required { " required" } else { "" },
            ));
        }
        html.push_str("</form>");
        json!({ "html": html })
    }
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

pub trait FormRenderer: Send + Sync {
    fn render(&self, form: &SignupForm) -> serde_json::Value;
}

/// Flat list of fields.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultRenderer;

impl FormRenderer for DefaultRenderer {
    fn render(&self, form: &SignupForm) -> serde_json::Value {
        json!({
            "action": form.action,
            "fields": form.fields,
        })
    }
}

/// Fields grouped into sections, in the order sections first appear.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmailFormRenderer;

impl FormRenderer for EmailFormRenderer {
    fn render(&self, form: &SignupForm) -> serde_json::Value {
        let mut sections: Vec<(&str, Vec<&FormField>)> = Vec::new();
        for field in &form.fields {
            match sections
                .iter_mut()
                .find(|(name, _)| *name == field.section.as_str())
            {
                Some((_, fields)) => fields.push(field),
                None => sections.push((field.section.as_str(), vec![field])),
            }
        }
        let sections: Vec<serde_json::Value> = sections
            .into_iter()
            .map(|(name, fields)| json!({ "name": name, "fields": fields }))
            .collect();
        json!({
            "action": form.action,
            "sections": sections,
        })
    }
}

pub struct RendererRegistry {
    default: Arc<dyn FormRenderer>,
    renderers: HashMap<String, Arc<dyn FormRenderer>>,
}

impl RendererRegistry {
    #[must_use]
    pub fn new(default: Arc<dyn FormRenderer>) -> Self {
        Self {
            default,
            renderers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new(Arc::new(DefaultRenderer));
        registry.register("auth_email", Arc::new(EmailFormRenderer));
        registry
    }

    pub fn register(&mut self, component: &str, renderer: Arc<dyn FormRenderer>) {
        self.renderers.insert(component.to_string(), renderer);
    }

    /// Renderer registered for `component`.
    ///
    /// # Errors
    /// Returns an error if nothing is registered for the component.
    pub fn for_component(&self, component: &str) -> Result<Arc<dyn FormRenderer>> {
        self.renderers
            .get(component)
            .cloned()
            .ok_or_else(|| anyhow!("no renderer registered for {component}"))
    }

    /// Render with the component renderer, else the default one; forms that
    /// are not renderable use their own output.
    #[must_use]
    pub fn render_form(&self, form: &SignupForm) -> serde_json::Value {
        if !form.renderable {
            return form.display();
        }
        let renderer = self
            .for_component(&form.component)
            .unwrap_or_else(|_| self.default.clone());
        renderer.render(form)
    }
}
