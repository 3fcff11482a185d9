pub mod api;
pub mod bridge;
pub mod bus;
pub mod error;
pub mod host;
pub mod loader;
pub mod manifest;
pub mod notifications;
pub mod topics;
pub mod widget;

#[cfg(test)]
pub(crate) mod test_util;

pub use api::{ApiError, ApiProxy, DirectFetch, HttpApiProxy};
pub use bridge::{BridgeContext, BridgeHandle};
pub use bus::{handler, BusEvent, EventBus, Handler, LocalEventBus, Subscription};
pub use error::{PluginError, PluginResult};
pub use host::{ManifestPlugin, Plugin, PluginHost};
pub use loader::{LoadedPlugin, PluginLoader};
pub use manifest::{PluginManifest, WidgetDecl};
pub use notifications::{Notification, NotificationId, NotificationKind, NotificationQueue};
pub use topics::{TopicRegistry, Validation};
pub use widget::{
    Lifecycle, Readiness, WidgetInstance, WidgetOptions, WidgetProps, WidgetSettings, WidgetState,
};
