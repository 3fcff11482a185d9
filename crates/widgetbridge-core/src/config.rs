use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_REFRESH_TOPIC: &str = "host:refresh-data";
pub const DEFAULT_NOTIFICATION_TOPIC: &str = "host:notification";
pub const DEFAULT_UPDATE_CONFIG_TOPIC: &str = "host:update-config";

/// Display window of a notification before it is dropped automatically.
pub const DEFAULT_NOTIFICATION_TTL_MS: u64 = 3000;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct CoreConfig {
    pub bridge: BridgeConfig,
    pub api: ApiConfig,
    pub notifications: NotificationConfig,
    pub logging: LoggingConfig,
}

impl CoreConfig {
    pub fn load(path: &Path) -> CoreResult<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> CoreResult<Self> {
        let cfg: CoreConfig = serde_json::from_str(data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> CoreResult<()> {
        for (name, topic) in [
            ("refresh", &self.bridge.topics.refresh),
            ("notification", &self.bridge.topics.notification),
            ("update_config", &self.bridge.topics.update_config),
        ] {
            if topic.trim().is_empty() {
                return Err(CoreError::Config(format!("topics.{name} must not be empty")));
            }
        }
        if self.notifications.ttl_ms == 0 {
            return Err(CoreError::Config("notifications.ttl_ms must be positive".to_string()));
        }
        if self.api.timeout_ms == Some(0) {
            return Err(CoreError::Config("api.timeout_ms must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub tenant_id: Option<String>,
    pub topics: TopicConfig,
    pub validation: ValidationMode,
}

/// Host topics a widget listens on. Names are configurable per host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TopicConfig {
    pub refresh: String,
    pub notification: String,
    pub update_config: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            refresh: DEFAULT_REFRESH_TOPIC.to_string(),
            notification: DEFAULT_NOTIFICATION_TOPIC.to_string(),
            update_config: DEFAULT_UPDATE_CONFIG_TOPIC.to_string(),
        }
    }
}

/// How the bus treats payloads that violate a registered topic schema.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    Off,
    Warn,
    #[default]
    Enforce,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the host-managed API client. Without it the host
    /// injects no proxy and widgets use the direct path.
    pub base_url: Option<String>,
    /// Origin used by the direct-fetch fallback to resolve relative paths.
    pub fallback_origin: Option<String>,
    pub timeout_ms: Option<u64>,
    pub headers: BTreeMap<String, String>,
}

impl ApiConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotificationConfig {
    pub ttl_ms: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { ttl_ms: DEFAULT_NOTIFICATION_TTL_MS }
    }
}

impl NotificationConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Fallback filter when `RUST_LOG` is unset.
    pub filter: Option<String>,
    pub file: Option<PathBuf>,
    pub ansi: Option<bool>,
}
