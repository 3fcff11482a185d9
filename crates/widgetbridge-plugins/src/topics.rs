//! Topic namespace shared by host and plugins, the payload types carried on
//! those topics, and the schema registry the bus validates against.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use thiserror::Error;

use crate::notifications::NotificationKind;

pub const PLUGIN_READY: &str = "plugin:ready";
pub const PLUGIN_DATA_LOADED: &str = "plugin:data-loaded";
pub const PLUGIN_ERROR: &str = "plugin:error";
pub const PLUGIN_ACTION: &str = "plugin:action";
pub const PLUGIN_NOTIFICATION: &str = "plugin:notification";
pub const PLUGIN_FORM_SUBMITTED: &str = "plugin:form-submitted";
pub const PLUGIN_CONFIG_UPDATED: &str = "plugin:config-updated";
pub const PLUGIN_LOG: &str = "plugin:log";

pub const HOST_BROADCAST: &str = "host:broadcast";
pub const HOST_REFRESH_DATA: &str = "host:refresh-data";
pub const HOST_NOTIFICATION: &str = "host:notification";
pub const HOST_UPDATE_CONFIG: &str = "host:update-config";
pub const HOST_GLOBAL_COMMAND: &str = "host:global-command";

pub const PLUGIN_TOPICS: [&str; 8] = [
    PLUGIN_READY,
    PLUGIN_DATA_LOADED,
    PLUGIN_ERROR,
    PLUGIN_ACTION,
    PLUGIN_NOTIFICATION,
    PLUGIN_FORM_SUBMITTED,
    PLUGIN_CONFIG_UPDATED,
    PLUGIN_LOG,
];

pub const HOST_TOPICS: [&str; 5] = [
    HOST_BROADCAST,
    HOST_REFRESH_DATA,
    HOST_NOTIFICATION,
    HOST_UPDATE_CONFIG,
    HOST_GLOBAL_COMMAND,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicOrigin {
    Plugin,
    Host,
    Other,
}

pub fn origin(topic: &str) -> TopicOrigin {
    if topic.starts_with("plugin:") {
        TopicOrigin::Plugin
    } else if topic.starts_with("host:") {
        TopicOrigin::Host
    } else {
        TopicOrigin::Other
    }
}

// ---- payloads ----------------------------------------------------------

/// `host:refresh-data`. No `widgetId` means every instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widget_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widget_type: Option<String>,
}

impl RefreshRequest {
    pub fn addresses(&self, widget_id: &str, widget_type: &str) -> bool {
        let id_matches = self.widget_id.as_deref().map_or(true, |id| id == widget_id);
        let type_matches = self.widget_type.as_deref().map_or(true, |t| t == widget_type);
        id_matches && type_matches
    }
}

/// `host:notification`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostNotice {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<NotificationKind>,
    pub message: String,
}

/// `host:update-config`. Only `widgetId` is checked at the bus; the
/// addressed widget validates `settings` and acks a rejection itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    pub widget_id: String,
    #[serde(default)]
    pub settings: Value,
    /// Echoed back verbatim in the ack.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Value>,
}

/// `plugin:config-updated`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigAck {
    pub widget_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Value>,
}

/// `plugin:data-loaded`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataLoaded {
    pub widget_id: String,
    pub widget_type: String,
    pub endpoint: String,
    pub data_size: usize,
}

/// `plugin:error`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginFailure {
    pub widget_id: String,
    pub error: String,
    pub endpoint: String,
}

/// `plugin:ready`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginReady {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

// ---- schema registry ---------------------------------------------------

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema for topic {topic} does not compile: {reason}")]
    Invalid { topic: String, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    Unregistered,
    Valid,
    Invalid(Vec<String>),
}

struct TopicSchema {
    raw: Value,
    validator: jsonschema::Validator,
}

/// Maps topic name to the JSON schema its payload must satisfy.
#[derive(Default)]
pub struct TopicRegistry {
    schemas: HashMap<String, TopicSchema>,
}

impl TopicRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry preloaded with the payload table of the standard topics.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for (topic, schema) in builtin_schemas() {
            // The builtin table is static; a failure here is a programming error
            // caught by the registry tests, so skip instead of aborting the host.
            if let Err(e) = registry.register(topic, schema) {
                tracing::error!(%topic, "builtin schema rejected: {e}");
            }
        }
        registry
    }

    pub fn register(&mut self, topic: &str, schema: Value) -> Result<(), SchemaError> {
        let validator = jsonschema::validator_for(&schema).map_err(|e| SchemaError::Invalid {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;
        self.schemas.insert(topic.to_string(), TopicSchema { raw: schema, validator });
        Ok(())
    }

    pub fn schema(&self, topic: &str) -> Option<&Value> {
        self.schemas.get(topic).map(|s| &s.raw)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.schemas.contains_key(topic)
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    pub fn validate(&self, topic: &str, payload: &Value) -> Validation {
        let Some(schema) = self.schemas.get(topic) else {
            return Validation::Unregistered;
        };
        if schema.validator.is_valid(payload) {
            return Validation::Valid;
        }
        let reasons = schema
            .validator
            .iter_errors(payload)
            .map(|e| e.to_string())
            .collect();
        Validation::Invalid(reasons)
    }
}

impl std::fmt::Debug for TopicRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut topics: Vec<&str> = self.topics().collect();
        topics.sort_unstable();
        f.debug_struct("TopicRegistry").field("topics", &topics).finish()
    }
}

fn builtin_schemas() -> Vec<(&'static str, Value)> {
    let kind = json!({ "type": "string", "enum": ["info", "success", "error"] });
    vec![
        (
            PLUGIN_READY,
            json!({
                "type": "object",
                "required": ["name", "version"],
                "properties": {
                    "name": { "type": "string" },
                    "version": { "type": "string" },
                    "capabilities": { "type": "array", "items": { "type": "string" } }
                }
            }),
        ),
        (
            PLUGIN_DATA_LOADED,
            json!({
                "type": "object",
                "properties": {
                    "widgetId": { "type": "string" },
                    "widgetType": { "type": "string" },
                    "endpoint": { "type": "string" },
                    "dataSize": { "type": "integer", "minimum": 0 }
                }
            }),
        ),
        (
            PLUGIN_ERROR,
            json!({
                "type": "object",
                "anyOf": [{ "required": ["error"] }, { "required": ["message"] }],
                "properties": {
                    "widgetId": { "type": "string" },
                    "error": { "type": "string" },
                    "message": { "type": "string" },
                    "endpoint": { "type": "string" }
                }
            }),
        ),
        (
            PLUGIN_ACTION,
            json!({
                "type": "object",
                "required": ["action"],
                "properties": {
                    "action": { "type": "string" },
                    "widgetId": { "type": "string" },
                    "tenantId": { "type": ["string", "null"] }
                }
            }),
        ),
        (
            PLUGIN_NOTIFICATION,
            json!({
                "type": "object",
                "required": ["type", "message"],
                "properties": {
                    "type": kind.clone(),
                    "message": { "type": "string" },
                    "source": { "type": "string" }
                }
            }),
        ),
        (
            PLUGIN_FORM_SUBMITTED,
            json!({
                "type": "object",
                "required": ["widgetId"],
                "properties": { "widgetId": { "type": "string" } }
            }),
        ),
        (
            PLUGIN_CONFIG_UPDATED,
            json!({
                "type": "object",
                "required": ["widgetId", "success"],
                "properties": {
                    "widgetId": { "type": "string" },
                    "success": { "type": "boolean" },
                    "error": { "type": "string" }
                }
            }),
        ),
        (
            PLUGIN_LOG,
            json!({
                "type": "object",
                "required": ["level", "message"],
                "properties": {
                    "level": { "type": "string", "enum": ["trace", "debug", "info", "warn", "error"] },
                    "message": { "type": "string" },
                    "timestamp": { "type": ["string", "integer"] }
                }
            }),
        ),
        (HOST_BROADCAST, json!({})),
        (
            HOST_REFRESH_DATA,
            json!({
                "type": ["object", "null"],
                "properties": {
                    "widgetId": { "type": ["string", "null"] },
                    "widgetType": { "type": ["string", "null"] }
                }
            }),
        ),
        (
            HOST_NOTIFICATION,
            json!({
                "type": "object",
                "required": ["message"],
                "properties": {
                    "type": kind,
                    "message": { "type": "string" }
                }
            }),
        ),
        (
            HOST_UPDATE_CONFIG,
            json!({
                "type": "object",
                "required": ["widgetId"],
                "properties": {
                    "widgetId": { "type": "string" }
                }
            }),
        ),
        (
            HOST_GLOBAL_COMMAND,
            json!({
                "type": "object",
                "properties": { "command": { "type": "string" } }
            }),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_covers_every_standard_topic() {
        let registry = TopicRegistry::builtin();
        for topic in PLUGIN_TOPICS.iter().chain(HOST_TOPICS.iter()) {
            assert!(registry.contains(topic), "missing schema for {topic}");
        }
    }

    #[test]
    fn unknown_topic_is_unregistered() {
        let registry = TopicRegistry::builtin();
        assert_eq!(registry.validate("plugin:custom", &json!(42)), Validation::Unregistered);
    }

    #[test]
    fn config_ack_shape() {
        let registry = TopicRegistry::builtin();
        let ack = serde_json::to_value(ConfigAck {
            widget_id: "W".into(),
            success: true,
            error: None,
            request_id: None,
        })
        .unwrap();
        assert_eq!(ack, json!({ "widgetId": "W", "success": true }));
        assert_eq!(registry.validate(PLUGIN_CONFIG_UPDATED, &ack), Validation::Valid);

        match registry.validate(PLUGIN_CONFIG_UPDATED, &json!({ "widgetId": "W" })) {
            Validation::Invalid(reasons) => assert!(!reasons.is_empty()),
            other => panic!("expected invalid, got {other:?}"),
        }
    }

    #[test]
    fn refresh_accepts_null_and_object() {
        let registry = TopicRegistry::builtin();
        assert_eq!(registry.validate(HOST_REFRESH_DATA, &Value::Null), Validation::Valid);
        assert_eq!(
            registry.validate(HOST_REFRESH_DATA, &json!({ "widgetId": "A" })),
            Validation::Valid
        );
        assert_eq!(
            registry.validate(HOST_REFRESH_DATA, &json!({ "widgetId": null, "widgetType": null })),
            Validation::Valid
        );
        assert!(matches!(
            registry.validate(HOST_REFRESH_DATA, &json!("A")),
            Validation::Invalid(_)
        ));
    }

    #[test]
    fn update_config_only_requires_widget_id() {
        let registry = TopicRegistry::builtin();
        for payload in [
            json!({ "widgetId": "W", "settings": "oops" }),
            json!({ "widgetId": "W", "settings": { "title": 7 }, "requestId": 12 }),
            json!({ "widgetId": "W" }),
        ] {
            assert_eq!(registry.validate(HOST_UPDATE_CONFIG, &payload), Validation::Valid);
        }
        assert!(matches!(
            registry.validate(HOST_UPDATE_CONFIG, &json!({ "settings": {} })),
            Validation::Invalid(_)
        ));
    }

    #[test]
    fn plugin_error_accepts_either_message_field() {
        let registry = TopicRegistry::builtin();
        assert_eq!(registry.validate(PLUGIN_ERROR, &json!({ "error": "x" })), Validation::Valid);
        assert_eq!(registry.validate(PLUGIN_ERROR, &json!({ "message": "x" })), Validation::Valid);
        assert!(matches!(
            registry.validate(PLUGIN_ERROR, &json!({ "endpoint": "/x" })),
            Validation::Invalid(_)
        ));
    }

    #[test]
    fn register_rejects_broken_schema() {
        let mut registry = TopicRegistry::empty();
        let err = registry
            .register("plugin:custom", json!({ "type": "not-a-type" }))
            .unwrap_err();
        assert!(err.to_string().contains("plugin:custom"));
        assert!(!registry.contains("plugin:custom"));
    }

    #[test]
    fn refresh_addressing() {
        let broadcast = RefreshRequest::default();
        assert!(broadcast.addresses("A", "fetch"));

        let to_a = RefreshRequest { widget_id: Some("A".into()), widget_type: None };
        assert!(to_a.addresses("A", "fetch"));
        assert!(!to_a.addresses("B", "fetch"));

        let by_type = RefreshRequest { widget_id: None, widget_type: Some("chart".into()) };
        assert!(!by_type.addresses("A", "fetch"));
        assert!(by_type.addresses("A", "chart"));
    }

    #[test]
    fn host_notice_type_is_optional() {
        let notice: HostNotice = serde_json::from_value(json!({ "message": "hi" })).unwrap();
        assert_eq!(notice.kind, None);
        let notice: HostNotice =
            serde_json::from_value(json!({ "type": "error", "message": "boom" })).unwrap();
        assert_eq!(notice.kind, Some(NotificationKind::Error));
    }

    #[test]
    fn origin_by_prefix() {
        assert_eq!(origin(PLUGIN_LOG), TopicOrigin::Plugin);
        assert_eq!(origin(HOST_BROADCAST), TopicOrigin::Host);
        assert_eq!(origin("misc"), TopicOrigin::Other);
    }
}
