use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
    #[error("plugin {0} is already registered")]
    DuplicatePlugin(String),
    #[error("plugin {0} is not registered")]
    UnknownPlugin(String),
    #[error("plugin {plugin} does not declare widget type {widget_type}")]
    UnknownWidgetType { plugin: String, widget_type: String },
    #[error("plugin {plugin} failed to initialize: {reason}")]
    Init { plugin: String, reason: String },
}

pub type PluginResult<T> = Result<T, PluginError>;
