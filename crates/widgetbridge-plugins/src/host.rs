//! Plugin registry owned by the host.
//!
//! The host lends one [`BridgeHandle`] to every plugin: `init` runs exactly
//! once at registration, before any widget of that plugin can mount, and
//! whatever the hook subscribed is released when the plugin is unloaded.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use crate::bridge::BridgeHandle;
use crate::bus::{handler, Subscription};
use crate::error::{PluginError, PluginResult};
use crate::loader::LoadedPlugin;
use crate::manifest::PluginManifest;
use crate::topics::{PluginReady, HOST_BROADCAST, HOST_GLOBAL_COMMAND, PLUGIN_LOG, PLUGIN_READY};
use crate::widget::{WidgetInstance, WidgetOptions, WidgetProps};

pub trait Plugin: Send + Sync {
    fn manifest(&self) -> &PluginManifest;

    /// One-time hook. Returned subscriptions stay alive until unload.
    fn init(&self, _bridge: &BridgeHandle) -> PluginResult<Vec<Subscription>> {
        Ok(Vec::new())
    }

    fn create_widget(
        &self,
        props: WidgetProps,
        bridge: BridgeHandle,
        options: WidgetOptions,
    ) -> WidgetInstance {
        WidgetInstance::new(props, bridge, options)
    }
}

/// Plugin described entirely by its manifest.
#[derive(Debug, Clone)]
pub struct ManifestPlugin {
    manifest: PluginManifest,
}

impl ManifestPlugin {
    pub fn new(manifest: PluginManifest) -> Self {
        Self { manifest }
    }
}

impl From<LoadedPlugin> for ManifestPlugin {
    fn from(loaded: LoadedPlugin) -> Self {
        Self::new(loaded.manifest)
    }
}

impl Plugin for ManifestPlugin {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    fn init(&self, bridge: &BridgeHandle) -> PluginResult<Vec<Subscription>> {
        if !self.manifest.init {
            return Ok(Vec::new());
        }
        let name = self.manifest.name.clone();

        let on_command = {
            let name = name.clone();
            bridge.on(
                HOST_GLOBAL_COMMAND,
                handler(move |payload| info!(plugin = %name, %payload, "global command received")),
            )
        };
        let on_broadcast = {
            let name = name.clone();
            bridge.on(
                HOST_BROADCAST,
                handler(move |payload| debug!(plugin = %name, %payload, "broadcast received")),
            )
        };

        let ready = PluginReady {
            name: name.clone(),
            version: self.manifest.version.clone(),
            capabilities: self.manifest.widget_types().map(str::to_string).collect(),
        };
        let ready = serde_json::to_value(&ready).map_err(|e| PluginError::Init {
            plugin: name.clone(),
            reason: e.to_string(),
        })?;
        bridge.emit(PLUGIN_READY, ready);
        bridge.emit(
            PLUGIN_LOG,
            json!({ "level": "info", "message": format!("{name} initialized") }),
        );
        Ok(vec![on_command, on_broadcast])
    }
}

struct Registered {
    plugin: Arc<dyn Plugin>,
    subscriptions: Vec<Subscription>,
}

pub struct PluginHost {
    bridge: BridgeHandle,
    options: WidgetOptions,
    plugins: Mutex<HashMap<String, Registered>>,
}

impl PluginHost {
    pub fn new(bridge: BridgeHandle, options: WidgetOptions) -> Self {
        Self { bridge, options, plugins: Mutex::new(HashMap::new()) }
    }

    pub fn bridge(&self) -> &BridgeHandle {
        &self.bridge
    }

    pub fn register(&self, plugin: Arc<dyn Plugin>) -> PluginResult<()> {
        let name = plugin.manifest().name.clone();
        if self.lock().contains_key(&name) {
            return Err(PluginError::DuplicatePlugin(name));
        }

        // Runs unlocked: the hook emits, and listeners may query the host.
        let subscriptions = plugin.init(&self.bridge)?;

        let mut plugins = self.lock();
        if plugins.contains_key(&name) {
            drop(plugins);
            subscriptions.iter().for_each(Subscription::unsubscribe);
            return Err(PluginError::DuplicatePlugin(name));
        }
        info!(
            plugin = %name,
            version = %plugin.manifest().version,
            widgets = plugin.manifest().widgets.len(),
            "plugin registered"
        );
        plugins.insert(name, Registered { plugin, subscriptions });
        Ok(())
    }

    /// Builds and mounts a widget of a registered plugin.
    pub fn mount(&self, plugin: &str, props: WidgetProps) -> PluginResult<WidgetInstance> {
        let plugin = self
            .lock()
            .get(plugin)
            .map(|r| r.plugin.clone())
            .ok_or_else(|| PluginError::UnknownPlugin(plugin.to_string()))?;
        let manifest = plugin.manifest();
        if manifest.widget(&props.widget_type).is_none() {
            return Err(PluginError::UnknownWidgetType {
                plugin: manifest.name.clone(),
                widget_type: props.widget_type,
            });
        }
        let instance = plugin.create_widget(props, self.bridge.clone(), self.options.clone());
        instance.mount();
        Ok(instance)
    }

    /// Releases the plugin's init subscriptions. Mounted widgets are owned by
    /// the caller and unmount on their own.
    pub fn unload(&self, name: &str) -> PluginResult<()> {
        let registered = self
            .lock()
            .remove(name)
            .ok_or_else(|| PluginError::UnknownPlugin(name.to_string()))?;
        registered.subscriptions.iter().for_each(Subscription::unsubscribe);
        info!(plugin = %name, "plugin unloaded");
        Ok(())
    }

    pub fn unload_all(&self) {
        let drained: Vec<_> = self.lock().drain().collect();
        for (name, registered) in drained {
            registered.subscriptions.iter().for_each(Subscription::unsubscribe);
            debug!(plugin = %name, "plugin unloaded");
        }
    }

    pub fn plugin_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn manifest(&self, name: &str) -> Option<PluginManifest> {
        self.lock().get(name).map(|r| r.plugin.manifest().clone())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Registered>> {
        self.plugins.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("plugins", &self.plugin_names())
            .field("bridge", &self.bridge)
            .finish()
    }
}

/// Payload helper for `host:global-command`.
pub fn global_command(command: &str, args: Value) -> Value {
    json!({ "command": command, "args": args })
}
