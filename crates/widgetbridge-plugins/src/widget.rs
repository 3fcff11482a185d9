//! Lifecycle controller for one mounted widget instance.
//!
//! A [`WidgetInstance`] owns the widget's local state, its subscriptions on
//! the shared bus and its notification queue. It goes through
//! `Unmounted -> Mounting -> Active -> Unmounting -> Unmounted` exactly once;
//! teardown is terminal.
//!
//! Network work runs on spawned Tokio tasks. Each fetch carries a sequence
//! number so the most recently issued fetch owns the data slot, and every
//! result is checked against the instance's cancellation flag before it is
//! committed, so responses landing after unmount are dropped silently.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};
use widgetbridge_core::config::DEFAULT_NOTIFICATION_TTL_MS;
use widgetbridge_core::{CoreConfig, TopicConfig};

use crate::api::ApiProxy;
use crate::bridge::BridgeHandle;
use crate::bus::{handler, Subscription};
use crate::notifications::{Notification, NotificationId, NotificationKind, NotificationQueue};
use crate::topics::{
    ConfigAck, ConfigUpdate, DataLoaded, HostNotice, PluginFailure, RefreshRequest, PLUGIN_ACTION,
    PLUGIN_CONFIG_UPDATED, PLUGIN_DATA_LOADED, PLUGIN_ERROR, PLUGIN_FORM_SUBMITTED,
    PLUGIN_NOTIFICATION,
};

const NO_SUBMIT_ENDPOINT: &str = "No submission endpoint configured";
const NO_API: &str = "No API available";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WidgetSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submit_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WidgetSettings {
    pub fn with_data_endpoint(endpoint: impl Into<String>) -> Self {
        Self { data_endpoint: Some(endpoint.into()), ..Self::default() }
    }

    pub fn data_endpoint(&self) -> Option<&str> {
        non_blank(self.data_endpoint.as_deref())
    }

    pub fn submit_endpoint(&self) -> Option<&str> {
        non_blank(self.submit_endpoint.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WidgetProps {
    pub id: String,
    pub widget_type: String,
    #[serde(default)]
    pub settings: WidgetSettings,
}

impl WidgetProps {
    pub fn new(id: impl Into<String>, widget_type: impl Into<String>, settings: WidgetSettings) -> Self {
        Self { id: id.into(), widget_type: widget_type.into(), settings }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Lifecycle {
    Unmounted,
    Mounting,
    Active,
    Unmounting,
}

/// Whether the widget can load data. The two `Missing*` variants are the
/// "not configured" states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Readiness {
    Ready,
    MissingEndpoint,
    MissingApi,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetState {
    pub lifecycle: Lifecycle,
    pub readiness: Readiness,
    pub settings: WidgetSettings,
    pub data: Option<Value>,
    pub loading: bool,
    pub submitting: bool,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct WidgetOptions {
    pub topics: TopicConfig,
    pub notification_ttl: Duration,
    /// Used when the bridge carries no API proxy.
    pub fallback_api: Option<Arc<dyn ApiProxy>>,
}

impl Default for WidgetOptions {
    fn default() -> Self {
        Self {
            topics: TopicConfig::default(),
            notification_ttl: Duration::from_millis(DEFAULT_NOTIFICATION_TTL_MS),
            fallback_api: None,
        }
    }
}

impl WidgetOptions {
    pub fn from_config(cfg: &CoreConfig) -> Self {
        Self {
            topics: cfg.bridge.topics.clone(),
            notification_ttl: cfg.notifications.ttl(),
            fallback_api: None,
        }
    }

    pub fn with_fallback(mut self, api: Arc<dyn ApiProxy>) -> Self {
        self.fallback_api = Some(api);
        self
    }
}

struct Inner {
    lifecycle: Lifecycle,
    torn_down: bool,
    settings: WidgetSettings,
    data: Option<Value>,
    error: Option<String>,
    pending_fetches: usize,
    pending_submits: usize,
    issued_seq: u64,
    applied_seq: u64,
    subscriptions: Vec<Subscription>,
}

struct Shared {
    id: String,
    widget_type: String,
    bridge: BridgeHandle,
    api: Option<Arc<dyn ApiProxy>>,
    topics: TopicConfig,
    notifications: NotificationQueue,
    cancelled: AtomicBool,
    inner: Mutex<Inner>,
    outstanding: watch::Sender<usize>,
}

#[derive(Debug, Clone, Copy)]
enum OpKind {
    Fetch,
    Submit,
}

impl OpKind {
    fn release(self, inner: &mut Inner) {
        let pending = match self {
            OpKind::Fetch => &mut inner.pending_fetches,
            OpKind::Submit => &mut inner.pending_submits,
        };
        *pending = pending.saturating_sub(1);
    }
}

/// One in-flight fetch or submission.
///
/// Created right after the matching `pending_*` counter was raised. The
/// counter comes back down through `settle` on the normal path, or on drop
/// when the owning future is cancelled before completing. Also counted for
/// [`WidgetInstance::idle`].
struct OpGuard {
    shared: Arc<Shared>,
    kind: OpKind,
    settled: bool,
}

impl OpGuard {
    fn new(shared: &Arc<Shared>, kind: OpKind) -> Self {
        shared.outstanding.send_modify(|n| *n += 1);
        Self { shared: shared.clone(), kind, settled: false }
    }

    fn settle(&mut self, inner: &mut Inner) {
        if !self.settled {
            self.settled = true;
            self.kind.release(inner);
        }
    }
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        // Unmounted instances keep their state frozen.
        if !self.settled && !self.shared.cancelled.load(Ordering::SeqCst) {
            let mut inner = self.shared.lock();
            self.kind.release(&mut inner);
            debug!(widget = %self.shared.id, kind = ?self.kind, "operation abandoned");
        }
        self.shared.outstanding.send_modify(|n| *n = n.saturating_sub(1));
    }
}

struct FetchTicket {
    endpoint: String,
    api: Arc<dyn ApiProxy>,
    seq: u64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_live(&self, inner: &Inner) -> bool {
        inner.lifecycle == Lifecycle::Active && !self.cancelled.load(Ordering::SeqCst)
    }

    fn readiness(&self, settings: &WidgetSettings) -> Readiness {
        if settings.data_endpoint().is_none() {
            Readiness::MissingEndpoint
        } else if self.api.is_none() {
            Readiness::MissingApi
        } else {
            Readiness::Ready
        }
    }

    fn subscribe(self: &Arc<Self>, topic: &str, react: fn(&Arc<Shared>, &Value)) -> Subscription {
        let weak: Weak<Shared> = Arc::downgrade(self);
        self.bridge.on(
            topic,
            handler(move |payload| {
                if let Some(shared) = weak.upgrade() {
                    react(&shared, payload);
                }
            }),
        )
    }

    /// Registers a fetch synchronously so `loading` flips before any await.
    fn begin_fetch(&self) -> Option<FetchTicket> {
        let mut inner = self.lock();
        if !self.is_live(&inner) {
            return None;
        }
        let endpoint = inner.settings.data_endpoint()?.to_string();
        let api = self.api.clone()?;
        inner.pending_fetches += 1;
        inner.issued_seq += 1;
        inner.error = None;
        Some(FetchTicket { endpoint, api, seq: inner.issued_seq })
    }

    async fn complete_fetch(self: Arc<Self>, ticket: FetchTicket, mut op: OpGuard) {
        let FetchTicket { endpoint, api, seq } = ticket;
        let span = info_span!("widget_fetch", widget = %self.id, seq, endpoint = %endpoint);
        let result = api.get(&endpoint).instrument(span).await;

        let event = {
            let mut inner = self.lock();
            if self.cancelled.load(Ordering::SeqCst) {
                debug!(widget = %self.id, seq, "response after unmount discarded");
                return;
            }
            op.settle(&mut inner);
            if seq < inner.applied_seq {
                debug!(widget = %self.id, seq, applied = inner.applied_seq, "superseded response ignored");
                return;
            }
            inner.applied_seq = seq;
            match result {
                Ok(data) => {
                    let data_size = match &data {
                        Value::Array(items) => items.len(),
                        _ => 1,
                    };
                    inner.data = Some(data);
                    inner.error = None;
                    let payload = DataLoaded {
                        widget_id: self.id.clone(),
                        widget_type: self.widget_type.clone(),
                        endpoint,
                        data_size,
                    };
                    (PLUGIN_DATA_LOADED, to_payload(&payload))
                }
                Err(err) => {
                    let message = err.to_string();
                    warn!(widget = %self.id, %endpoint, "fetch failed: {message}");
                    inner.error = Some(message.clone());
                    let payload = PluginFailure { widget_id: self.id.clone(), error: message, endpoint };
                    (PLUGIN_ERROR, to_payload(&payload))
                }
            }
        };
        self.bridge.emit(event.0, event.1);
    }

    fn spawn_fetch(self: &Arc<Self>) {
        let Some(ticket) = self.begin_fetch() else {
            return;
        };
        let op = OpGuard::new(self, OpKind::Fetch);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(self.clone().complete_fetch(ticket, op));
            }
            Err(_) => {
                warn!(widget = %self.id, "no runtime available, fetch not started");
                drop(op);
            }
        }
    }

    fn on_refresh(self: &Arc<Self>, payload: &Value) {
        let request = if payload.is_null() {
            RefreshRequest::default()
        } else {
            match serde_json::from_value::<RefreshRequest>(payload.clone()) {
                Ok(request) => request,
                Err(e) => {
                    debug!(widget = %self.id, "unreadable refresh payload: {e}");
                    return;
                }
            }
        };
        if request.addresses(&self.id, &self.widget_type) {
            self.spawn_fetch();
        }
    }

    fn on_host_notice(self: &Arc<Self>, payload: &Value) {
        let notice = match serde_json::from_value::<HostNotice>(payload.clone()) {
            Ok(notice) => notice,
            Err(e) => {
                debug!(widget = %self.id, "unreadable host notification: {e}");
                return;
            }
        };
        if !self.is_live(&self.lock()) {
            return;
        }
        self.notifications.push(notice.kind.unwrap_or_default(), notice.message);
    }

    fn on_config_update(self: &Arc<Self>, payload: &Value) {
        let update = match serde_json::from_value::<ConfigUpdate>(payload.clone()) {
            Ok(update) => update,
            Err(e) => {
                debug!(widget = %self.id, "unreadable config update: {e}");
                return;
            }
        };
        if update.widget_id != self.id {
            return;
        }

        let parsed = match update.settings {
            Value::Object(_) => serde_json::from_value::<WidgetSettings>(update.settings)
                .map_err(|e| format!("invalid settings: {e}")),
            Value::Null => Err("settings missing".to_string()),
            _ => Err("settings must be an object".to_string()),
        };

        let (outcome, refetch) = {
            let mut inner = self.lock();
            if !self.is_live(&inner) {
                return;
            }
            match parsed {
                Ok(settings) => {
                    let changed = settings.data_endpoint() != inner.settings.data_endpoint();
                    inner.settings = settings;
                    (Ok(()), changed && inner.settings.data_endpoint().is_some())
                }
                Err(reason) => (Err(reason), false),
            }
        };

        match &outcome {
            Ok(()) => info!(widget = %self.id, "settings applied"),
            Err(reason) => warn!(widget = %self.id, "settings rejected: {reason}"),
        }
        let ack = ConfigAck {
            widget_id: self.id.clone(),
            success: outcome.is_ok(),
            error: outcome.err(),
            request_id: update.request_id,
        };
        self.bridge.emit(PLUGIN_CONFIG_UPDATED, to_payload(&ack));

        if refetch {
            self.spawn_fetch();
        }
    }
}

fn to_payload<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn merge_response(data: &mut Option<Value>, response: &Value) {
    let Value::Object(incoming) = response else {
        return;
    };
    match data {
        Some(Value::Object(existing)) => {
            existing.extend(incoming.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        _ => *data = Some(response.clone()),
    }
}

pub struct WidgetInstance {
    shared: Arc<Shared>,
}

impl WidgetInstance {
    pub fn new(props: WidgetProps, bridge: BridgeHandle, options: WidgetOptions) -> Self {
        let api = bridge.api().cloned().or(options.fallback_api);
        let (outstanding, _) = watch::channel(0usize);
        let shared = Shared {
            id: props.id,
            widget_type: props.widget_type,
            bridge,
            api,
            topics: options.topics,
            notifications: NotificationQueue::new(options.notification_ttl),
            cancelled: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                lifecycle: Lifecycle::Unmounted,
                torn_down: false,
                settings: props.settings,
                data: None,
                error: None,
                pending_fetches: 0,
                pending_submits: 0,
                issued_seq: 0,
                applied_seq: 0,
                subscriptions: Vec::new(),
            }),
            outstanding,
        };
        Self { shared: Arc::new(shared) }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn widget_type(&self) -> &str {
        &self.shared.widget_type
    }

    pub fn bridge(&self) -> &BridgeHandle {
        &self.shared.bridge
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.lock().lifecycle
    }

    pub fn state(&self) -> WidgetState {
        let inner = self.shared.lock();
        WidgetState {
            lifecycle: inner.lifecycle,
            readiness: self.shared.readiness(&inner.settings),
            settings: inner.settings.clone(),
            data: inner.data.clone(),
            loading: inner.pending_fetches > 0,
            submitting: inner.pending_submits > 0,
            error: inner.error.clone(),
        }
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.shared.notifications.snapshot()
    }

    pub fn dismiss(&self, id: NotificationId) -> bool {
        self.shared.notifications.expire(id)
    }

    /// Subscriptions this instance still holds on the bus.
    pub fn subscription_count(&self) -> usize {
        self.shared.lock().subscriptions.iter().filter(|s| s.is_active()).count()
    }

    /// Subscribes to the host topics and, when configured, starts the
    /// initial load. Must run inside a Tokio runtime for the load to start.
    pub fn mount(&self) {
        let shared = &self.shared;
        {
            let mut inner = shared.lock();
            if inner.lifecycle != Lifecycle::Unmounted || inner.torn_down {
                debug!(widget = %shared.id, lifecycle = ?inner.lifecycle, "mount ignored");
                return;
            }
            inner.lifecycle = Lifecycle::Mounting;
        }

        let subscriptions = vec![
            shared.subscribe(&shared.topics.refresh, Shared::on_refresh),
            shared.subscribe(&shared.topics.notification, Shared::on_host_notice),
            shared.subscribe(&shared.topics.update_config, Shared::on_config_update),
        ];

        let readiness = {
            let mut inner = shared.lock();
            inner.subscriptions.extend(subscriptions);
            inner.lifecycle = Lifecycle::Active;
            shared.readiness(&inner.settings)
        };
        info!(widget = %shared.id, widget_type = %shared.widget_type, ?readiness, "widget mounted");

        if readiness == Readiness::Ready {
            shared.spawn_fetch();
        }
    }

    /// Releases every subscription and freezes the instance. Idempotent.
    pub fn unmount(&self) {
        let shared = &self.shared;
        let subscriptions = {
            let mut inner = shared.lock();
            if !matches!(inner.lifecycle, Lifecycle::Active | Lifecycle::Mounting) {
                return;
            }
            inner.lifecycle = Lifecycle::Unmounting;
            shared.cancelled.store(true, Ordering::SeqCst);
            std::mem::take(&mut inner.subscriptions)
        };
        for subscription in &subscriptions {
            subscription.unsubscribe();
        }
        shared.notifications.clear();
        {
            let mut inner = shared.lock();
            inner.lifecycle = Lifecycle::Unmounted;
            inner.torn_down = true;
        }
        info!(widget = %shared.id, released = subscriptions.len(), "widget unmounted");
    }

    /// Fetches the data endpoint once and waits for the result.
    pub async fn load(&self) {
        let Some(ticket) = self.shared.begin_fetch() else {
            return;
        };
        let op = OpGuard::new(&self.shared, OpKind::Fetch);
        self.shared.clone().complete_fetch(ticket, op).await;
    }

    /// User-initiated refresh: tells the host, then reloads.
    pub async fn refresh(&self) {
        if !self.shared.is_live(&self.shared.lock()) {
            return;
        }
        self.shared.bridge.emit(
            PLUGIN_ACTION,
            json!({ "action": "refresh", "widgetId": self.shared.id }),
        );
        self.load().await;
    }

    /// Posts `form` to the submit endpoint. Failures end up in the widget's
    /// error state and notification queue.
    pub async fn submit(&self, form: Value) {
        let shared = &self.shared;
        let started = {
            let mut inner = shared.lock();
            if !shared.is_live(&inner) {
                return;
            }
            match (inner.settings.submit_endpoint().map(str::to_string), shared.api.clone()) {
                (Some(endpoint), Some(api)) => {
                    inner.pending_submits += 1;
                    inner.error = None;
                    Ok((endpoint, api))
                }
                (None, _) => Err(NO_SUBMIT_ENDPOINT),
                (Some(_), None) => Err(NO_API),
            }
        };
        let (endpoint, api) = match started {
            Ok(pair) => pair,
            Err(reason) => {
                shared.notifications.push(NotificationKind::Error, reason);
                return;
            }
        };

        let mut op = OpGuard::new(shared, OpKind::Submit);
        let span = info_span!("widget_submit", widget = %shared.id, endpoint = %endpoint);
        let result = api.post(&endpoint, &form).instrument(span).await;

        let outcome = {
            let mut inner = shared.lock();
            if shared.cancelled.load(Ordering::SeqCst) {
                debug!(widget = %shared.id, "submission result after unmount discarded");
                return;
            }
            op.settle(&mut inner);
            match result {
                Ok(response) => {
                    merge_response(&mut inner.data, &response);
                    Ok(response)
                }
                Err(err) => {
                    let message = err.to_string();
                    inner.error = Some(message.clone());
                    Err(message)
                }
            }
        };

        match outcome {
            Ok(response) => {
                shared.notifications.push(NotificationKind::Success, "Data submitted successfully!");
                shared.bridge.emit(
                    PLUGIN_FORM_SUBMITTED,
                    json!({ "widgetId": shared.id, "formData": form, "response": response }),
                );
            }
            Err(message) => {
                warn!(widget = %shared.id, %endpoint, "submission failed: {message}");
                shared.notifications.push(NotificationKind::Error, format!("Error: {message}"));
            }
        }
    }

    pub fn send_notification(&self, message: &str) {
        if !self.shared.is_live(&self.shared.lock()) {
            return;
        }
        self.shared.bridge.emit(
            PLUGIN_NOTIFICATION,
            json!({ "type": "info", "message": message, "source": self.shared.id }),
        );
        self.shared
            .notifications
            .push(NotificationKind::Success, "Notification sent to host");
    }

    pub fn trigger_action(&self, action: &str) {
        if !self.shared.is_live(&self.shared.lock()) {
            return;
        }
        let tenant = self.shared.bridge.context().tenant_id.clone();
        self.shared.bridge.emit(
            PLUGIN_ACTION,
            json!({ "action": action, "widgetId": self.shared.id, "tenantId": tenant }),
        );
    }

    /// Resolves once no fetch or submission of this instance is in flight.
    pub async fn idle(&self) {
        let mut rx = self.shared.outstanding.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Drop for WidgetInstance {
    fn drop(&mut self) {
        self.unmount();
    }
}

impl std::fmt::Debug for WidgetInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WidgetInstance")
            .field("id", &self.shared.id)
            .field("widget_type", &self.shared.widget_type)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}
