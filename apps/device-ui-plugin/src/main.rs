use std::sync::Arc;

use anyhow::Context;
use device_ui_plugin::config::HostConfig;
use device_ui_plugin::file_store::JsonFileConfigStore;
use device_ui_plugin::host::{ConfigStore, InMemoryConfigStore, InMemoryProtocol};
use device_ui_plugin::plugin::DeviceUiPlugin;
use device_ui_plugin::protocol_sync::StepSchema;
use device_ui_plugin::supervisor::TokioLauncher;
use device_ui_plugin::telemetry::init_tracing;
use tracing::{info, warn};
use transport_bus::{Bus, LocalBus};
use transport_mqtt::MqttBus;

/// `memory://` keeps everything in process; any other uri names a broker.
fn open_bus(cfg: &HostConfig) -> anyhow::Result<(Arc<dyn Bus>, Option<Arc<MqttBus>>)> {
    if cfg.bus_uri.starts_with("memory://") {
        let bus: Arc<dyn Bus> = Arc::new(LocalBus::new());
        return Ok((bus, None));
    }
    let client_id = format!("{}-{}", cfg.plugin_name, std::process::id());
    let mqtt = Arc::new(
        MqttBus::connect(&cfg.bus_uri, &client_id).context("configure broker connection")?,
    );
    let bus: Arc<dyn Bus> = mqtt.clone();
    Ok((bus, Some(mqtt)))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cfg = HostConfig::from_env();
    init_tracing(&cfg.log_filter);

    let (bus, mqtt) = open_bus(&cfg)?;
    let config: Arc<dyn ConfigStore> = match &cfg.settings_path {
        Some(path) => Arc::new(JsonFileConfigStore::new(path.clone(), cfg.advanced_ui)),
        None => InMemoryConfigStore::new(cfg.advanced_ui),
    };
    let protocol = InMemoryProtocol::with_steps(
        cfg.step_count,
        &cfg.plugin_name,
        &StepSchema::video().defaults(),
    );
    let plugin = Arc::new(DeviceUiPlugin::from_config(
        &cfg,
        bus,
        config,
        protocol,
        Arc::new(TokioLauncher),
    ));

    info!(
        plugin = %cfg.plugin_name,
        worker = %cfg.worker_executable,
        worker_args = ?cfg.worker_args,
        bus_uri = %cfg.bus_uri,
        transport = %cfg.transport_mode,
        advanced_ui = cfg.advanced_ui,
        heartbeat_ms = cfg.heartbeat_interval_ms,
        max_restarts = ?cfg.max_restarts,
        settings_path = ?cfg.settings_path,
        steps = cfg.step_count,
        "starting device-ui-plugin"
    );
    plugin.enable().await.context("enable plugin")?;

    tokio::signal::ctrl_c().await.context("listen for ctrl-c")?;
    info!("shutdown requested");

    plugin.request_shutdown().context("request worker settings")?;
    if tokio::time::timeout(cfg.shutdown_grace(), plugin.terminated())
        .await
        .is_err()
    {
        warn!(
            grace_ms = cfg.shutdown_grace_ms,
            "worker did not report settings before the grace period ended"
        );
    }
    plugin.teardown();
    if let Some(mqtt) = mqtt {
        mqtt.shutdown();
    }
    Ok(())
}
