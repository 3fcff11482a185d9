use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::api::ApiProxy;
use crate::bus::{EventBus, Handler, Subscription};

/// Read-only facts about the host session handed to plugins.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BridgeContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BridgeContext {
    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self { tenant_id: Some(tenant_id.into()), extra: Map::new() }
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

struct BridgeInner {
    bus: Arc<dyn EventBus>,
    api: Option<Arc<dyn ApiProxy>>,
    context: BridgeContext,
}

/// Capability bundle lent by the host to a plugin's `init` hook and to every
/// widget instance it mounts.
///
/// Cloning shares the same underlying bridge; there is no way to swap the
/// bus, proxy or context of an existing handle.
#[derive(Clone)]
pub struct BridgeHandle {
    inner: Arc<BridgeInner>,
}

impl BridgeHandle {
    pub fn new(
        bus: Arc<dyn EventBus>,
        api: Option<Arc<dyn ApiProxy>>,
        context: BridgeContext,
    ) -> Self {
        Self { inner: Arc::new(BridgeInner { bus, api, context }) }
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.inner.bus
    }

    /// Host-managed API client. `None` is a normal state; callers use the
    /// direct path instead.
    pub fn api(&self) -> Option<&Arc<dyn ApiProxy>> {
        self.inner.api.as_ref()
    }

    pub fn context(&self) -> &BridgeContext {
        &self.inner.context
    }

    pub fn emit(&self, topic: &str, payload: Value) {
        self.inner.bus.publish(topic, payload);
    }

    pub fn on(&self, topic: &str, handler: Handler) -> Subscription {
        self.inner.bus.on(topic, handler)
    }

    /// True when both handles refer to the same bridge instance.
    pub fn same_as(&self, other: &BridgeHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHandle")
            .field("has_api", &self.inner.api.is_some())
            .field("context", &self.inner.context)
            .finish()
    }
}
