use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use widgetbridge_core::logging::init_logging_with;
use widgetbridge_core::CoreConfig;
use widgetbridge_plugins::topics::{origin, TopicOrigin, HOST_REFRESH_DATA, HOST_TOPICS, PLUGIN_TOPICS};
use widgetbridge_plugins::{
    handler, ApiProxy, BridgeContext, BridgeHandle, DirectFetch, EventBus, Handler, HttpApiProxy,
    LocalEventBus, ManifestPlugin, PluginHost, PluginLoader, TopicRegistry, WidgetInstance,
    WidgetOptions, WidgetProps,
};

#[derive(Debug, Parser)]
#[command(name = "widgetbridge-host", version, about = "Hosts plugin widgets on a shared event bus")]
struct Args {
    /// Host configuration file (JSON).
    #[arg(long, env = "WIDGETBRIDGE_CONFIG")]
    config: Option<PathBuf>,
    /// Directory scanned for `<plugin>/plugin.json`.
    #[arg(long, default_value = "plugins")]
    plugins: PathBuf,
    /// Exit after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    run_for: Option<u64>,
    /// Broadcast `host:refresh-data` on this period, in seconds.
    #[arg(long)]
    refresh_every: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct MountSpec {
    plugin: String,
    #[serde(flatten)]
    props: WidgetProps,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
struct HostConfig {
    #[serde(flatten)]
    core: CoreConfig,
    #[serde(default)]
    widgets: Vec<MountSpec>,
}

impl HostConfig {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_json(&data).with_context(|| format!("parsing {}", path.display()))
    }

    fn from_json(data: &str) -> anyhow::Result<Self> {
        let cfg: HostConfig = serde_json::from_str(data)?;
        cfg.core.validate()?;
        Ok(cfg)
    }
}

type Wiring = (Arc<LocalEventBus>, BridgeHandle, WidgetOptions);

fn build_bridge(cfg: &CoreConfig) -> anyhow::Result<Wiring> {
    let bus = Arc::new(LocalEventBus::with_registry(
        TopicRegistry::builtin(),
        cfg.bridge.validation,
    ));
    let api = HttpApiProxy::from_config(&cfg.api)?.map(|p| Arc::new(p) as Arc<dyn ApiProxy>);
    if api.is_none() {
        info!("no api.base_url configured, widgets fall back to direct fetch");
    }
    let context = cfg
        .bridge
        .tenant_id
        .clone()
        .map(BridgeContext::for_tenant)
        .unwrap_or_default();
    let bridge = BridgeHandle::new(bus.clone(), api, context);
    let direct = DirectFetch::from_config(&cfg.api)?;
    let options = WidgetOptions::from_config(cfg).with_fallback(Arc::new(direct));
    Ok((bus, bridge, options))
}

/// Logs traffic on a standard topic: plugin output at info, host commands at
/// debug.
fn tap(topic: &'static str) -> Handler {
    let from = origin(topic);
    handler(move |payload| match from {
        TopicOrigin::Plugin => info!(%topic, origin = ?from, %payload, "bus event"),
        _ => debug!(%topic, origin = ?from, %payload, "bus event"),
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = match &args.config {
        Some(path) => HostConfig::load(path)?,
        None => HostConfig::default(),
    };
    let _log_guard = init_logging_with(&cfg.core.logging)?;
    info!(config = ?args.config, plugins = %args.plugins.display(), "widgetbridge host starting");

    let (bus, bridge, options) = build_bridge(&cfg.core)?;

    let taps: Vec<_> = PLUGIN_TOPICS
        .iter()
        .chain(HOST_TOPICS.iter())
        .map(|&topic| bus.on(topic, tap(topic)))
        .collect();

    let host = PluginHost::new(bridge, options);
    for loaded in PluginLoader::new(args.plugins.clone()).discover()? {
        let name = loaded.manifest.name.clone();
        if let Err(e) = host.register(Arc::new(ManifestPlugin::from(loaded))) {
            warn!(plugin = %name, "plugin not registered: {e}");
        }
    }

    let mut widgets: Vec<WidgetInstance> = Vec::new();
    for spec in cfg.widgets {
        let id = spec.props.id.clone();
        match host.mount(&spec.plugin, spec.props) {
            Ok(widget) => widgets.push(widget),
            Err(e) => warn!(widget = %id, "widget not mounted: {e}"),
        }
    }
    info!(plugins = host.plugin_names().len(), widgets = widgets.len(), "host ready");

    let refresher = args.refresh_every.filter(|s| *s > 0).map(|secs| {
        let bus = bus.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(secs));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                bus.publish(HOST_REFRESH_DATA, serde_json::Value::Null);
            }
        })
    });

    match args.run_for {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                res = tokio::signal::ctrl_c() => res?,
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }

    info!("shutting down");
    if let Some(task) = refresher {
        task.abort();
    }
    for widget in &widgets {
        let state = widget.state();
        info!(
            widget = %widget.id(),
            readiness = ?state.readiness,
            error = ?state.error,
            "final widget state"
        );
        widget.unmount();
    }
    host.unload_all();
    taps.iter().for_each(|t| t.unsubscribe());
    bus.shutdown();
    Ok(())
}
