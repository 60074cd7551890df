use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use device_ui_plugin::bus::publisher::{
    TOPIC_DEFAULT_CORNERS, TOPIC_EDITED_CORNERS, TOPIC_REQUEST_SETTINGS, TOPIC_SCHEMA,
    TOPIC_STEP_OPTIONS, TOPIC_SURFACE_ALPHAS, TOPIC_TERMINATE,
};
use device_ui_plugin::bus::subscriber::{TOPIC_SETTINGS_REPLY, TOPIC_UPDATE_PROTOCOL};
use device_ui_plugin::host::{InMemoryConfigStore, InMemoryProtocol, StepOptions};
use device_ui_plugin::plugin::{DeviceUiPlugin, PluginParts};
use device_ui_plugin::settings::WireSettings;
use device_ui_plugin::supervisor::{
    SupervisorEvent, WorkerCommand, WorkerExit, WorkerLauncher, WorkerProcess, WorkerSpec,
    WorkerState,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use transport_bus::{Bus, LocalBus};

const PLUGIN: &str = "dmf_device_ui_plugin";

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Worker that stays alive until the test says otherwise.
struct IdleWorker {
    pid: u32,
    exit: Arc<Mutex<Option<WorkerExit>>>,
}

impl WorkerProcess for IdleWorker {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn try_wait(&mut self) -> std::io::Result<Option<WorkerExit>> {
        Ok(*self.exit.lock())
    }
}

/// Records every launch and hands out one exit cell per worker.
#[derive(Default)]
struct RecordingLauncher {
    commands: Mutex<Vec<WorkerCommand>>,
    exits: Mutex<Vec<Arc<Mutex<Option<WorkerExit>>>>>,
}

impl RecordingLauncher {
    fn launches(&self) -> usize {
        self.commands.lock().len()
    }

    fn exit_worker(&self, launch: usize, exit: WorkerExit) {
        if let Some(cell) = self.exits.lock().get(launch) {
            *cell.lock() = Some(exit);
        }
    }
}

impl WorkerLauncher for RecordingLauncher {
    fn launch(&self, command: &WorkerCommand) -> std::io::Result<Box<dyn WorkerProcess>> {
        let mut commands = self.commands.lock();
        commands.push(command.clone());
        let exit = Arc::new(Mutex::new(None));
        self.exits.lock().push(Arc::clone(&exit));
        Ok(Box::new(IdleWorker {
            pid: 4000 + commands.len() as u32,
            exit,
        }))
    }
}

struct Harness {
    bus: Arc<LocalBus>,
    config: Arc<InMemoryConfigStore>,
    protocol: Arc<InMemoryProtocol>,
    launcher: Arc<RecordingLauncher>,
    plugin: Arc<DeviceUiPlugin>,
}

fn options(value: Value) -> StepOptions {
    value.as_object().cloned().unwrap_or_default()
}

fn stored_settings() -> WireSettings {
    WireSettings {
        surface_alphas: Some(r#"{"video":0.5,"shapes":1}"#.into()),
        canvas_corners: Some(",x,y\n0,0.0,0.0\n1,640.0,0.0\n".into()),
        frame_corners: Some(",x,y\n0,10.0,10.0\n1,630.0,10.0\n".into()),
        x: Some(20),
        y: Some(30),
        width: Some(400),
        height: Some(500),
        ..WireSettings::default()
    }
}

fn harness(steps: usize) -> Harness {
    let bus = Arc::new(LocalBus::new());
    let config = InMemoryConfigStore::with_settings(PLUGIN, stored_settings());
    let protocol =
        InMemoryProtocol::with_steps(steps, PLUGIN, &options(json!({"video_enabled": true})));
    let launcher = Arc::new(RecordingLauncher::default());
    let plugin = Arc::new(DeviceUiPlugin::new(PluginParts {
        name: PLUGIN.into(),
        worker: WorkerSpec {
            program: "device-view".into(),
            leading_args: Vec::new(),
            instance_name: PLUGIN.into(),
            transport_mode: "fixed".into(),
            bus_uri: "mqtt://localhost:1883".into(),
        },
        bus: bus.clone(),
        config: config.clone(),
        protocol: protocol.clone(),
        launcher: launcher.clone(),
        heartbeat: Duration::from_millis(20),
        max_restarts: None,
    }));
    Harness {
        bus,
        config,
        protocol,
        launcher,
        plugin,
    }
}

fn retained_json(bus: &LocalBus, topic: &str) -> Option<Value> {
    let msg = bus.retained(topic)?;
    serde_json::from_slice(&msg.payload).ok()
}

fn publish_json(bus: &LocalBus, topic: &str, value: Value) -> TestResult {
    bus.publish(topic, Bytes::from(serde_json::to_vec(&value)?), false)?;
    Ok(())
}

/// Polls `check` until it holds, yielding to the runtime in between.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

#[tokio::test]
async fn enable_launches_worker_and_publishes_state() -> TestResult {
    let h = harness(2);
    let status = h.plugin.enable().await?;
    assert_eq!(status.state, WorkerState::Running);
    assert_eq!(status.pid, Some(4001));

    let commands = h.launcher.commands.lock().clone();
    assert_eq!(h.launcher.launches(), 1);
    let args = &commands[0].args;
    assert_eq!(args[0..2], ["-n", PLUGIN]);
    assert_eq!(args[2], "-a");
    let passed: WireSettings = serde_json::from_str(&args[3])?;
    assert_eq!(passed, stored_settings());
    assert_eq!(args[4..], ["fixed", "mqtt://localhost:1883"]);

    let schema = retained_json(&h.bus, TOPIC_SCHEMA).expect("schema retained");
    assert_eq!(schema["video_enabled"]["type"], "boolean");
    assert_eq!(
        retained_json(&h.bus, TOPIC_STEP_OPTIONS),
        Some(json!([{"video_enabled": true}, {"video_enabled": true}]))
    );
    let alphas = retained_json(&h.bus, TOPIC_SURFACE_ALPHAS).expect("alphas retained");
    let alphas: Value = serde_json::from_str(alphas["surface_alphas"].as_str().unwrap_or(""))?;
    assert_eq!(alphas, json!({"video": 0.5, "shapes": 1}));
    assert!(h.bus.retained(TOPIC_DEFAULT_CORNERS).is_some());
    assert!(h.bus.retained(TOPIC_EDITED_CORNERS).is_none());

    h.plugin.teardown();
    assert_eq!(h.plugin.supervisor().status().state, WorkerState::Stopped);
    Ok(())
}

#[tokio::test]
async fn worker_protocol_edits_merge_in_step_order() -> TestResult {
    let h = harness(3);
    h.plugin.enable().await?;

    publish_json(
        &h.bus,
        TOPIC_UPDATE_PROTOCOL,
        json!([
            {"video_enabled": false},
            {"video_enabled": false, "bogus": true},
            {}
        ]),
    )?;

    let protocol = h.protocol.clone();
    assert!(
        eventually(|| protocol.options(1, PLUGIN)
            == Some(options(json!({"video_enabled": false}))))
        .await
    );
    assert_eq!(
        h.protocol.options(0, PLUGIN),
        Some(options(json!({"video_enabled": false})))
    );
    assert_eq!(
        h.protocol.options(2, PLUGIN),
        Some(options(json!({"video_enabled": true})))
    );

    let bus = h.bus.clone();
    assert!(
        eventually(|| retained_json(&bus, TOPIC_STEP_OPTIONS)
            == Some(json!([
                {"video_enabled": false},
                {"video_enabled": false},
                {"video_enabled": true}
            ])))
        .await
    );

    h.plugin.teardown();
    Ok(())
}

#[tokio::test]
async fn step_removal_republishes_snapshot() -> TestResult {
    let h = harness(3);
    h.plugin.enable().await?;
    h.protocol.remove_step(0)?;

    let bus = h.bus.clone();
    assert!(
        eventually(|| retained_json(&bus, TOPIC_STEP_OPTIONS)
            .and_then(|v| v.as_array().map(Vec::len))
            == Some(2))
        .await
    );
    h.plugin.teardown();
    Ok(())
}

#[tokio::test]
async fn shutdown_saves_reply_then_terminates_worker() -> TestResult {
    let h = harness(1);
    h.plugin.enable().await?;
    let mut requests = h.bus.subscribe(TOPIC_REQUEST_SETTINGS);
    let mut terminate = h.bus.subscribe(TOPIC_TERMINATE);

    h.plugin.request_shutdown()?;
    let request = requests.recv().await?;
    assert_eq!(request.payload.as_ref(), b"null");
    assert!(matches!(terminate.try_recv(), Ok(None)));

    let mut reply = serde_json::to_value(stored_settings())?;
    reply["x"] = json!(99);
    publish_json(&h.bus, TOPIC_SETTINGS_REPLY, reply)?;

    tokio::time::timeout(Duration::from_secs(1), h.plugin.terminated()).await?;
    let notice = tokio::time::timeout(Duration::from_secs(1), terminate.recv()).await??;
    assert_eq!(notice.payload.as_ref(), b"null");
    assert_eq!(h.config.save_count(), 1);

    h.plugin.teardown();
    Ok(())
}

#[tokio::test]
async fn unchanged_reply_is_not_persisted() -> TestResult {
    let h = harness(1);
    h.plugin.enable().await?;

    publish_json(
        &h.bus,
        TOPIC_SETTINGS_REPLY,
        serde_json::to_value(stored_settings())?,
    )?;
    publish_json(&h.bus, TOPIC_SETTINGS_REPLY, json!({"width": 400}))?;
    publish_json(&h.bus, TOPIC_SETTINGS_REPLY, json!({"width": 410}))?;

    let config = h.config.clone();
    assert!(eventually(|| config.save_count() == 1).await);
    // Give any stray saves a chance to land.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.config.save_count(), 1);

    h.plugin.teardown();
    Ok(())
}

#[tokio::test]
async fn host_settings_edit_pushes_edited_corners() -> TestResult {
    let h = harness(1);
    h.plugin.enable().await?;

    let update = WireSettings {
        canvas_corners: Some(",x,y\n0,1.0,1.0\n".into()),
        frame_corners: Some(",x,y\n0,2.0,2.0\n".into()),
        ..WireSettings::default()
    };
    assert!(h.plugin.update_ui_settings(&update).await?);

    let corners = retained_json(&h.bus, TOPIC_EDITED_CORNERS).expect("edited corners retained");
    let canvas: Value = serde_json::from_str(corners["df_canvas_corners"].as_str().unwrap_or(""))?;
    assert_eq!(canvas["0"]["x"], 1.0);
    assert_eq!(h.config.save_count(), 1);

    h.plugin.teardown();
    Ok(())
}

#[tokio::test]
async fn clean_worker_exit_relaunches_with_saved_settings() -> TestResult {
    let h = harness(1);
    let mut events = h.plugin.subscribe_supervisor();
    h.plugin.enable().await?;
    assert_eq!(events.recv().await?, SupervisorEvent::Started { pid: Some(4001) });

    h.plugin
        .save_ui_settings(&WireSettings {
            x: Some(77),
            ..WireSettings::default()
        })
        .await?;
    h.launcher.exit_worker(0, WorkerExit::Clean);

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv()).await??;
    assert_eq!(
        event,
        SupervisorEvent::Restarted {
            pid: Some(4002),
            restarts: 1
        }
    );
    assert_eq!(h.launcher.launches(), 2);
    let relaunched = h.launcher.commands.lock()[1].clone();
    let passed: WireSettings = serde_json::from_str(&relaunched.args[3])?;
    assert_eq!(passed.x, Some(77));

    let status = h.plugin.supervisor().status();
    assert_eq!(status.state, WorkerState::Running);
    assert_eq!(status.restarts, 1);

    h.plugin.teardown();
    Ok(())
}

#[tokio::test]
async fn failed_worker_exit_stops_supervision() -> TestResult {
    let h = harness(1);
    let mut events = h.plugin.subscribe_supervisor();
    h.plugin.enable().await?;
    events.recv().await?;

    h.launcher.exit_worker(0, WorkerExit::Failed(Some(3)));
    let event = tokio::time::timeout(Duration::from_secs(1), events.recv()).await??;
    assert_eq!(event, SupervisorEvent::WorkerFailed { code: Some(3) });
    assert_eq!(h.plugin.supervisor().status().state, WorkerState::Stopped);
    assert_eq!(h.launcher.launches(), 1);

    h.plugin.teardown();
    Ok(())
}
