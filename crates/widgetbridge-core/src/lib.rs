pub mod config;
pub mod error;
pub mod logging;

pub use config::{
    ApiConfig, BridgeConfig, CoreConfig, LoggingConfig, NotificationConfig, TopicConfig,
    ValidationMode,
};
pub use error::{CoreError, CoreResult};
