//! Worker process supervision.
//!
//! The supervisor owns at most one worker process. While the worker runs, a
//! heartbeat task polls it without blocking once per period:
//!
//! * still alive: the heartbeat timestamp is refreshed;
//! * exited with status 0: the worker is relaunched from the persisted
//!   settings and the same heartbeat keeps going;
//! * exited with any other status: the failure is reported and the
//!   supervisor returns to `Stopped`.
//!
//! Stopping never kills the worker; the host asks it to exit over the bus.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::BridgeError;
use crate::bus_publisher::{CornerTarget, UiPublisher};
use crate::host::ConfigStore;
use crate::settings::{self, WireSettings};

pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);

#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("worker already {0:?}")]
    AlreadyRunning(WorkerState),
    #[error("worker start cancelled by stop")]
    Cancelled,
    #[error("clean-exit restart limit of {0} reached")]
    RestartLimit(u32),
    #[error("failed to encode worker arguments: {0}")]
    Arguments(#[from] serde_json::Error),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Exit status zero.
    Clean,
    /// Non-zero status, or no status at all (terminated by a signal).
    Failed(Option<i32>),
}

/// Decision taken by one heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatFlow {
    Continue,
    Restart,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Started { pid: Option<u32> },
    Restarted { pid: Option<u32>, restarts: u32 },
    SpawnFailed { reason: String },
    WorkerFailed { code: Option<i32> },
    Stopped,
}

/// A launched worker that can be polled without blocking.
pub trait WorkerProcess: Send {
    fn id(&self) -> Option<u32>;
    fn try_wait(&mut self) -> std::io::Result<Option<WorkerExit>>;
}

pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, command: &WorkerCommand) -> std::io::Result<Box<dyn WorkerProcess>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Static parts of the worker command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub program: String,
    pub leading_args: Vec<String>,
    pub instance_name: String,
    pub transport_mode: String,
    pub bus_uri: String,
}

impl WorkerSpec {
    /// `program [leading args] -n NAME -a SETTINGS_JSON [-d] MODE BUS_URI`
    pub fn command(
        &self,
        settings: &WireSettings,
        debug: bool,
    ) -> Result<WorkerCommand, serde_json::Error> {
        let mut args = self.leading_args.clone();
        args.push("-n".into());
        args.push(self.instance_name.clone());
        args.push("-a".into());
        args.push(serde_json::to_string(settings)?);
        if debug {
            args.push("-d".into());
        }
        args.push(self.transport_mode.clone());
        args.push(self.bus_uri.clone());
        Ok(WorkerCommand {
            program: self.program.clone(),
            args,
        })
    }
}

/// Spawns workers as OS processes in their own process group.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioLauncher;

struct TokioWorker(tokio::process::Child);

impl WorkerProcess for TokioWorker {
    fn id(&self) -> Option<u32> {
        self.0.id()
    }

    fn try_wait(&mut self) -> std::io::Result<Option<WorkerExit>> {
        Ok(self.0.try_wait()?.map(|status| match status.code() {
            Some(0) => WorkerExit::Clean,
            code => WorkerExit::Failed(code),
        }))
    }
}

impl WorkerLauncher for TokioLauncher {
    fn launch(&self, command: &WorkerCommand) -> std::io::Result<Box<dyn WorkerProcess>> {
        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(false);
        #[cfg(unix)]
        cmd.process_group(0);
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
        let child = cmd.spawn()?;
        Ok(Box::new(TokioWorker(child)))
    }
}

/// The supervised process and its liveness bookkeeping.
pub struct WorkerHandle {
    pid: Option<u32>,
    running: bool,
    last_heartbeat: Option<DateTime<Utc>>,
    command: WorkerCommand,
    process: Box<dyn WorkerProcess>,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("pid", &self.pid)
            .field("running", &self.running)
            .field("last_heartbeat", &self.last_heartbeat)
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub restarts: u32,
    pub command: Option<WorkerCommand>,
}

struct Inner {
    state: WorkerState,
    handle: Option<WorkerHandle>,
    heartbeat: Option<CancellationToken>,
    restarts: u32,
    last_settings: WireSettings,
}

#[derive(Clone)]
pub struct Supervisor {
    spec: Arc<WorkerSpec>,
    launcher: Arc<dyn WorkerLauncher>,
    config: Arc<dyn ConfigStore>,
    publisher: UiPublisher,
    period: Duration,
    max_restarts: Option<u32>,
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl Supervisor {
    pub fn new(
        spec: WorkerSpec,
        launcher: Arc<dyn WorkerLauncher>,
        config: Arc<dyn ConfigStore>,
        publisher: UiPublisher,
    ) -> Self {
        Self {
            spec: Arc::new(spec),
            launcher,
            config,
            publisher,
            period: HEARTBEAT_PERIOD,
            max_restarts: None,
            inner: Arc::new(Mutex::new(Inner {
                state: WorkerState::Stopped,
                handle: None,
                heartbeat: None,
                restarts: 0,
                last_settings: WireSettings::with_form_defaults(),
            })),
            events: broadcast::channel(32).0,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Bounds clean-exit restarts. Unbounded by default.
    pub fn with_max_restarts(mut self, max_restarts: Option<u32>) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> WorkerStatus {
        let inner = self.inner.lock();
        let handle = inner.handle.as_ref();
        WorkerStatus {
            state: inner.state,
            pid: handle.and_then(|h| h.pid),
            last_heartbeat: handle.and_then(|h| h.last_heartbeat),
            restarts: inner.restarts,
            command: handle.map(|h| h.command.clone()),
        }
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.events.send(event);
    }

    /// Launches the worker, pushes `settings` to it and starts the heartbeat.
    pub async fn start(&self, settings: WireSettings) -> Result<WorkerStatus, SupervisorError> {
        {
            let mut inner = self.inner.lock();
            if inner.state != WorkerState::Stopped {
                return Err(SupervisorError::AlreadyRunning(inner.state));
            }
            inner.state = WorkerState::Starting;
            inner.restarts = 0;
        }

        let debug = self.config.advanced_ui_enabled().await;

        // Check and launch under one lock so a stop() that landed during the
        // await above can never be followed by an untracked worker.
        let cancel = CancellationToken::new();
        {
            let mut inner = self.inner.lock();
            if inner.state != WorkerState::Starting {
                debug!("start cancelled before launch");
                return Err(SupervisorError::Cancelled);
            }
            let handle = match self.launch(&settings, debug) {
                Ok(handle) => handle,
                Err(err) => {
                    inner.state = WorkerState::Stopped;
                    return Err(err);
                }
            };
            inner.state = WorkerState::Running;
            inner.handle = Some(handle);
            inner.heartbeat = Some(cancel.clone());
            inner.last_settings = settings.clone();
        }

        self.push_settings(&settings);
        tokio::spawn(self.clone().heartbeat(cancel));

        let status = self.status();
        info!(pid = ?status.pid, "worker started");
        self.emit(SupervisorEvent::Started { pid: status.pid });
        Ok(status)
    }

    /// Clears the running flag and cancels the heartbeat. Idempotent.
    pub fn stop(&self) {
        let was_active = {
            let mut inner = self.inner.lock();
            if let Some(token) = inner.heartbeat.take() {
                token.cancel();
            }
            if let Some(handle) = inner.handle.as_mut() {
                handle.running = false;
                handle.last_heartbeat = None;
            }
            inner.handle = None;
            let was_active = inner.state != WorkerState::Stopped;
            inner.state = WorkerState::Stopped;
            was_active
        };
        if was_active {
            info!("worker supervision stopped");
            self.emit(SupervisorEvent::Stopped);
        }
    }

    fn launch(&self, settings: &WireSettings, debug: bool) -> Result<WorkerHandle, SupervisorError> {
        let command = self.spec.command(settings, debug)?;
        debug!(program = %command.program, args = ?command.args, "launching worker");
        let process = self.launcher.launch(&command).map_err(|source| {
            error!(program = %command.program, error = %source, "worker spawn failed");
            self.emit(SupervisorEvent::SpawnFailed {
                reason: source.to_string(),
            });
            SupervisorError::Spawn {
                program: command.program.clone(),
                source,
            }
        })?;
        Ok(WorkerHandle {
            pid: process.id(),
            running: true,
            last_heartbeat: None,
            command,
            process,
        })
    }

    fn push_settings(&self, settings: &WireSettings) {
        let typed = settings::decode_lenient(settings);
        if let Err(err) = self.publisher.publish_ui_settings(&typed, CornerTarget::Default) {
            warn!(error = %err, "failed to push settings to worker");
        }
    }

    /// One non-blocking liveness check.
    pub fn tick(&self) -> HeartbeatFlow {
        let mut inner = self.inner.lock();
        let Some(handle) = inner.handle.as_mut() else {
            return HeartbeatFlow::Stop;
        };
        if !handle.running {
            handle.last_heartbeat = None;
            return HeartbeatFlow::Stop;
        }
        match handle.process.try_wait() {
            Ok(None) => {
                handle.last_heartbeat = Some(Utc::now());
                HeartbeatFlow::Continue
            }
            Ok(Some(WorkerExit::Clean)) => {
                info!(pid = ?handle.pid, "worker exited cleanly; restarting");
                HeartbeatFlow::Restart
            }
            Ok(Some(WorkerExit::Failed(code))) => {
                error!(pid = ?handle.pid, ?code, "worker exited with failure");
                handle.running = false;
                inner.handle = None;
                inner.heartbeat = None;
                inner.state = WorkerState::Stopped;
                drop(inner);
                self.emit(SupervisorEvent::WorkerFailed { code });
                HeartbeatFlow::Stop
            }
            Err(err) => {
                warn!(pid = ?handle.pid, error = %err, "worker poll failed");
                handle.last_heartbeat = Some(Utc::now());
                HeartbeatFlow::Continue
            }
        }
    }

    /// Replaces a cleanly exited worker with a fresh one.
    async fn relaunch(&self) -> Result<(), SupervisorError> {
        let fallback = {
            let mut inner = self.inner.lock();
            if let Some(mut old) = inner.handle.take() {
                old.running = false;
            }
            if let Some(limit) = self.max_restarts {
                if inner.restarts >= limit {
                    inner.state = WorkerState::Stopped;
                    inner.heartbeat = None;
                    drop(inner);
                    self.emit(SupervisorEvent::WorkerFailed { code: Some(0) });
                    return Err(SupervisorError::RestartLimit(limit));
                }
            }
            inner.state = WorkerState::Starting;
            inner.last_settings.clone()
        };

        let settings = match self.config.load(&self.spec.instance_name).await {
            Ok(settings) => settings,
            Err(err) => {
                warn!(error = %err, "failed to reload settings; reusing last known");
                fallback
            }
        };
        let debug = self.config.advanced_ui_enabled().await;

        let (pid, restarts) = {
            let mut inner = self.inner.lock();
            if inner.state != WorkerState::Starting {
                debug!("restart cancelled before launch");
                return Err(SupervisorError::Cancelled);
            }
            let handle = match self.launch(&settings, debug) {
                Ok(handle) => handle,
                Err(err) => {
                    inner.state = WorkerState::Stopped;
                    inner.heartbeat = None;
                    return Err(err);
                }
            };
            inner.restarts += 1;
            inner.state = WorkerState::Running;
            inner.last_settings = settings.clone();
            let pid = handle.pid;
            inner.handle = Some(handle);
            (pid, inner.restarts)
        };
        self.push_settings(&settings);
        info!(?pid, restarts, "worker restarted");
        self.emit(SupervisorEvent::Restarted { pid, restarts });
        Ok(())
    }

    async fn heartbeat(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.tick() {
                HeartbeatFlow::Continue => {}
                HeartbeatFlow::Stop => break,
                HeartbeatFlow::Restart => {
                    if let Err(err) = self.relaunch().await {
                        error!(error = %err, "worker restart failed");
                        break;
                    }
                }
            }
        }
        debug!("heartbeat stopped");
    }
}
