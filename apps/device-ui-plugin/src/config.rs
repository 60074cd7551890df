use std::path::PathBuf;
use std::time::Duration;

use crate::supervisor::WorkerSpec;

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub log_filter: String,
    pub plugin_name: String,
    pub worker_executable: String,
    pub worker_args: Vec<String>,
    pub bus_uri: String,
    pub transport_mode: String,
    pub advanced_ui: bool,
    pub heartbeat_interval_ms: u64,
    pub max_restarts: Option<u32>,
    pub settings_path: Option<PathBuf>,
    pub step_count: usize,
    pub shutdown_grace_ms: u64,
}

impl HostConfig {
    pub fn from_env() -> Self {
        let log_filter =
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,device_ui_plugin=debug".into());
        let plugin_name = std::env::var("DEVICE_UI_PLUGIN_NAME")
            .unwrap_or_else(|_| "dmf_device_ui_plugin".into());
        let worker_executable =
            std::env::var("DEVICE_UI_WORKER_EXE").unwrap_or_else(|_| "python".into());
        let worker_args = std::env::var("DEVICE_UI_WORKER_ARGS")
            .unwrap_or_else(|_| "-m dmf_device_ui.bin.device_view".into())
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let bus_uri =
            std::env::var("DEVICE_UI_BUS_URI").unwrap_or_else(|_| "mqtt://localhost:1883".into());
        let transport_mode =
            std::env::var("DEVICE_UI_TRANSPORT").unwrap_or_else(|_| "fixed".into());
        let advanced_ui = std::env::var("DEVICE_UI_ADVANCED_UI")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
            .unwrap_or(false);
        let heartbeat_interval_ms = std::env::var("DEVICE_UI_HEARTBEAT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|ms| *ms > 0)
            .unwrap_or(1_000);
        let max_restarts = std::env::var("DEVICE_UI_MAX_RESTARTS")
            .ok()
            .and_then(|v| v.parse().ok());
        let settings_path = std::env::var_os("DEVICE_UI_SETTINGS_PATH").map(PathBuf::from);
        let step_count = std::env::var("DEVICE_UI_STEP_COUNT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        let shutdown_grace_ms = std::env::var("DEVICE_UI_SHUTDOWN_GRACE_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5_000);
        Self {
            log_filter,
            plugin_name,
            worker_executable,
            worker_args,
            bus_uri,
            transport_mode,
            advanced_ui,
            heartbeat_interval_ms,
            max_restarts,
            settings_path,
            step_count,
            shutdown_grace_ms,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn worker_spec(&self) -> WorkerSpec {
        WorkerSpec {
            program: self.worker_executable.clone(),
            leading_args: self.worker_args.clone(),
            instance_name: self.plugin_name.clone(),
            transport_mode: self.transport_mode.clone(),
            bus_uri: self.bus_uri.clone(),
        }
    }
}
