use serde::{Deserialize, Serialize};

use crate::error::PluginError;

const NO_NAME: &str = "name must not be empty";

/// One widget type exported by a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetDecl {
    #[serde(rename = "type")]
    pub widget_type: String,
    pub component: String,
}

/// Contents of a plugin's `plugin.json`.
///
/// Older manifests declare a single `widget` object instead of a `widgets`
/// list; both are accepted and normalized into `widgets`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawManifest")]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub widgets: Vec<WidgetDecl>,
    /// Whether the plugin runs an init hook on registration.
    pub init: bool,
}

#[derive(Deserialize)]
struct RawManifest {
    name: String,
    version: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    widgets: Vec<WidgetDecl>,
    #[serde(default)]
    widget: Option<WidgetDecl>,
    #[serde(default = "default_init")]
    init: bool,
}

fn default_init() -> bool {
    true
}

// Plain message: `parse` adds the `InvalidManifest` wrapping.
impl TryFrom<RawManifest> for PluginManifest {
    type Error = String;

    fn try_from(raw: RawManifest) -> Result<Self, Self::Error> {
        if raw.name.trim().is_empty() {
            return Err(NO_NAME.to_string());
        }
        let mut widgets = raw.widgets;
        widgets.extend(raw.widget);
        if widgets.is_empty() {
            return Err(format!("plugin {} declares no widget", raw.name));
        }
        Ok(Self {
            name: raw.name,
            version: raw.version,
            description: raw.description,
            widgets,
            init: raw.init,
        })
    }
}

impl PluginManifest {
    pub fn parse(json: &str) -> Result<Self, PluginError> {
        serde_json::from_str(json).map_err(|e| PluginError::InvalidManifest(e.to_string()))
    }

    pub fn widget(&self, widget_type: &str) -> Option<&WidgetDecl> {
        self.widgets.iter().find(|w| w.widget_type == widget_type)
    }

    pub fn widget_types(&self) -> impl Iterator<Item = &str> {
        self.widgets.iter().map(|w| w.widget_type.as_str())
    }
}
