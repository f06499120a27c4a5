use std::{
    path::PathBuf,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use gamewarden_process::{ServerState, ServerStatus};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};

use crate::config::{GameDefinition, InstanceConfig};
use crate::error::ServerError;
use crate::games::{self, OutputLineHandler, PlayerActivity, ServerEvent};
use crate::idle_timer::IdleTimer;
use crate::log_tailer::{self, LogSink};
use crate::notify::{self, Notifier};
use crate::pid_store::{self, PidStore};
use crate::supervisor::{Supervisor, TerminationOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    /// Another stop (explicit, idle or crash teardown) already owns the run.
    AlreadyStopping { instance: String },
    Stopped {
        instance: String,
        termination: TerminationOutcome,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredOrphan {
    pub instance: String,
    pub pid: u32,
    /// `None` when the record was stale and nothing had to be killed.
    pub termination: Option<TerminationOutcome>,
}

/// One start-to-exit lifetime of an instance.
struct ActiveRun {
    id: u64,
    instance: String,
    channel: String,
    pid: u32,
    record_key: String,
    log_path: PathBuf,
    started: Instant,
    player_count: u32,
    handler: Box<dyn OutputLineHandler>,
    live_announced: bool,
    crash_reported: bool,
    shutdown_announced: bool,
    stopping: bool,
    idle_timer: IdleTimer,
    dispatcher: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Runtime {
    state: ServerState,
    run: Option<ActiveRun>,
}

struct PendingStop {
    run_id: u64,
    instance: String,
    pid: u32,
    record_key: String,
}

struct Inner {
    definition: GameDefinition,
    supervisor: Supervisor,
    pid_store: PidStore,
    logs_dir: PathBuf,
    idle_after: Duration,
    notifier: Arc<dyn Notifier>,
    next_run_id: AtomicU64,
    runtime: Mutex<Runtime>,
}

/// Supervises every instance of one game definition; at most one runs at a time.
#[derive(Clone)]
pub struct GameServer {
    inner: Arc<Inner>,
}

impl GameServer {
    pub fn new(
        definition: GameDefinition,
        supervisor: Supervisor,
        pid_store: PidStore,
        logs_dir: PathBuf,
        idle_after: Duration,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                definition,
                supervisor,
                pid_store,
                logs_dir,
                idle_after,
                notifier,
                next_run_id: AtomicU64::new(0),
                runtime: Mutex::new(Runtime::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.definition.name
    }

    pub fn definition(&self) -> &GameDefinition {
        &self.inner.definition
    }

    fn notify(&self, channel: &str, message: &str) {
        notify::deliver(self.inner.notifier.as_ref(), channel, message);
    }

    fn resolve_instance(&self, name: Option<&str>) -> Result<&InstanceConfig, ServerError> {
        let def = &self.inner.definition;
        let found = match name {
            Some(n) => def.instance(n),
            None => def.default_instance(),
        };
        found.ok_or_else(|| ServerError::UnknownInstance {
            game: def.name.clone(),
            instance: name.unwrap_or_default().to_string(),
        })
    }

    /// Launches `instance` (the first configured one when `None`). Notifications for
    /// this run go to `channel`.
    pub async fn start(
        &self,
        instance: Option<&str>,
        channel: &str,
    ) -> Result<ServerStatus, ServerError> {
        let config = {
            let rt = self.inner.runtime.lock().await;
            self.ensure_idle(&rt)?;
            self.resolve_instance(instance)?.clone()
        };

        // Host discovery can shell out, so it happens before the runtime is locked.
        let handler = games::handler_for(self.inner.definition.kind, &config).await;

        let mut rt = self.inner.runtime.lock().await;
        self.ensure_idle(&rt)?;
        rt.state = ServerState::Starting;
        match self.launch(&config, handler, channel).await {
            Ok(run) => {
                tracing::info!(
                    game = %self.name(),
                    instance = %run.instance,
                    pid = run.pid,
                    run_id = run.id,
                    log = %run.log_path.display(),
                    "server started"
                );
                rt.run = Some(run);
                rt.state = ServerState::Running;
                Ok(self.snapshot(&rt))
            }
            Err(e) => {
                tracing::warn!(game = %self.name(), instance = %config.name, error = %e, "start failed");
                rt.state = ServerState::Idle;
                Err(e)
            }
        }
    }

    fn ensure_idle(&self, rt: &Runtime) -> Result<(), ServerError> {
        match &rt.run {
            Some(run) => Err(ServerError::AlreadyRunning {
                game: self.name().to_string(),
                instance: run.instance.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn launch(
        &self,
        config: &InstanceConfig,
        handler: Box<dyn OutputLineHandler>,
        channel: &str,
    ) -> Result<ActiveRun, ServerError> {
        let inner = &self.inner;
        let game = inner.definition.name.as_str();

        let args = handler.launch_args(config);
        let sink = LogSink::create(&inner.logs_dir, game, &config.name).map_err(ServerError::Persist)?;
        let log_path = sink.path().to_path_buf();

        let spawned = inner.supervisor.spawn(&config.command, &args, &config.cwd)?;
        let pid = spawned.pid;

        let record_key = pid_store::record_key(game, &config.name);
        let record = inner.supervisor.describe(pid, &config.command);
        if let Err(e) = inner.pid_store.save(&record_key, &record).await {
            inner.supervisor.terminate(pid).await;
            return Err(ServerError::Persist(e));
        }

        let lines = match log_tailer::spawn_tail(spawned.output, sink) {
            Ok(rx) => rx,
            Err(e) => {
                inner.supervisor.terminate(pid).await;
                if let Err(e) = inner.pid_store.remove(&record_key).await {
                    tracing::warn!(game, key = %record_key, error = %format!("{e:#}"), "pid record cleanup failed");
                }
                return Err(ServerError::Persist(
                    anyhow::Error::new(e).context("start output reader"),
                ));
            }
        };

        let mut child = spawned.child;
        let reaper_game = game.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::info!(game = %reaper_game, pid, %status, "server process exited"),
                Err(e) => tracing::warn!(game = %reaper_game, pid, error = %e, "wait for server process failed"),
            }
        });

        let id = inner.next_run_id.fetch_add(1, Ordering::Relaxed) + 1;
        let dispatcher = tokio::spawn(dispatch(Arc::downgrade(inner), id, lines));

        Ok(ActiveRun {
            id,
            instance: config.name.clone(),
            channel: channel.to_string(),
            pid,
            record_key,
            log_path,
            started: Instant::now(),
            player_count: 0,
            handler,
            live_announced: false,
            crash_reported: false,
            shutdown_announced: false,
            stopping: false,
            idle_timer: IdleTimer::new(),
            dispatcher: Some(dispatcher),
        })
    }

    /// Stops the active run. With `Some(instance)` only that instance is stopped.
    pub async fn stop(&self, instance: Option<&str>) -> Result<StopOutcome, ServerError> {
        if let Some(name) = instance {
            self.resolve_instance(Some(name))?;
        }

        let pending = {
            let mut rt = self.inner.runtime.lock().await;
            let Some(run) = rt.run.as_ref() else {
                return Ok(StopOutcome::NotRunning);
            };
            if instance.is_some_and(|n| !n.trim().eq_ignore_ascii_case(&run.instance)) {
                return Ok(StopOutcome::NotRunning);
            }
            if run.stopping {
                return Ok(StopOutcome::AlreadyStopping {
                    instance: run.instance.clone(),
                });
            }
            match begin_stop(&mut rt) {
                Some(p) => p,
                None => return Ok(StopOutcome::NotRunning),
            }
        };

        Ok(self.finish_stop(pending).await)
    }

    /// Stops the run `run_id` if it is still the active one and nobody else is stopping it.
    async fn stop_run(&self, run_id: u64) -> Option<StopOutcome> {
        let pending = {
            let mut rt = self.inner.runtime.lock().await;
            let current = rt.run.as_ref()?;
            if current.id != run_id || current.stopping {
                return None;
            }
            begin_stop(&mut rt)?
        };
        Some(self.finish_stop(pending).await)
    }

    async fn finish_stop(&self, pending: PendingStop) -> StopOutcome {
        let game = self.name();
        let termination = self.inner.supervisor.terminate(pending.pid).await;
        if let Err(e) = self.inner.pid_store.remove(&pending.record_key).await {
            tracing::warn!(game, key = %pending.record_key, error = %format!("{e:#}"), "pid record cleanup failed");
        }

        let mut rt = self.inner.runtime.lock().await;
        if rt.run.as_ref().is_some_and(|r| r.id == pending.run_id) {
            rt.run = None;
            rt.state = ServerState::Idle;
        }
        tracing::info!(
            game,
            instance = %pending.instance,
            pid = pending.pid,
            forced = ?termination.forced,
            "server stopped"
        );

        StopOutcome::Stopped {
            instance: pending.instance,
            termination,
        }
    }

    /// Feeds one line of output to the active run, as if the process had printed it.
    pub async fn handle_output_line(&self, line: &str) {
        let mut rt = self.inner.runtime.lock().await;
        if let Some(run) = rt.run.as_mut().filter(|r| !r.stopping) {
            self.dispatch_line(run, line);
        }
    }

    async fn handle_line_for(&self, run_id: u64, line: &str) {
        let mut rt = self.inner.runtime.lock().await;
        if let Some(run) = rt.run.as_mut().filter(|r| r.id == run_id && !r.stopping) {
            self.dispatch_line(run, line);
        }
    }

    fn dispatch_line(&self, run: &mut ActiveRun, line: &str) {
        if let Some(event) = run.handler.handle_line(line) {
            self.apply_event(run, event);
        }
    }

    fn apply_event(&self, run: &mut ActiveRun, event: ServerEvent) {
        let game = self.name();
        match event {
            ServerEvent::StartupComplete(info) => {
                if run.live_announced {
                    return;
                }
                run.live_announced = true;
                tracing::info!(game, instance = %run.instance, "server is live");

                let mut message = format!("{game} `{}` is live!", run.instance);
                let info = info.to_string();
                if !info.is_empty() {
                    message.push('\n');
                    message.push_str(&info);
                }
                self.notify(&run.channel, &message);

                if run.player_count == 0 {
                    let reason = run.handler.startup_idle_reason();
                    self.arm_idle(run, reason);
                }
            }
            ServerEvent::PlayerCountChanged { activity, online } => {
                run.player_count = match (online, activity) {
                    (Some(n), _) => n,
                    (None, PlayerActivity::Joined) => run.player_count.saturating_add(1),
                    (None, PlayerActivity::Left) => run.player_count.saturating_sub(1),
                };
                tracing::info!(
                    game,
                    instance = %run.instance,
                    players = run.player_count,
                    ?activity,
                    "player count changed"
                );

                if run.player_count > 0 {
                    if run.idle_timer.cancel() {
                        self.notify(&run.channel, "A player joined. Shutdown cancelled.");
                    }
                } else if activity == PlayerActivity::Left {
                    self.notify(&run.channel, "All players left. Starting shutdown timer.");
                    let reason = run.handler.empty_idle_reason();
                    self.arm_idle(run, reason);
                }
            }
            ServerEvent::Crashed(reason) => {
                if run.crash_reported {
                    return;
                }
                run.crash_reported = true;
                run.idle_timer.cancel();
                tracing::error!(game, instance = %run.instance, pid = run.pid, %reason, "server crashed");
                self.notify(
                    &run.channel,
                    &format!("{game} `{}` crashed: {reason}", run.instance),
                );

                // Teardown aborts this dispatcher, so it cannot run inline.
                let server = self.clone();
                let run_id = run.id;
                tokio::spawn(async move {
                    server.stop_run(run_id).await;
                });
            }
            ServerEvent::Exited => {
                if run.shutdown_announced {
                    return;
                }
                run.shutdown_announced = true;
                run.idle_timer.cancel();
                tracing::info!(game, instance = %run.instance, "server announced shutdown");
                self.notify(&run.channel, &format!("{game} server is shutting down."));
            }
        }
    }

    fn arm_idle(&self, run: &mut ActiveRun, reason: &'static str) {
        let after = self.inner.idle_after;
        tracing::info!(game = %self.name(), instance = %run.instance, reason, secs = after.as_secs(), "idle shutdown armed");
        self.notify(
            &run.channel,
            &format!(
                "Server will shut down in {} seconds due to: {reason}",
                after.as_secs()
            ),
        );

        let inner = Arc::downgrade(&self.inner);
        let run_id = run.id;
        run.idle_timer.arm(after, reason, move || async move {
            if let Some(inner) = inner.upgrade() {
                GameServer { inner }.expire_idle(run_id).await;
            }
        });
    }

    async fn expire_idle(&self, run_id: u64) {
        {
            let rt = self.inner.runtime.lock().await;
            let Some(run) = rt.run.as_ref().filter(|r| r.id == run_id && !r.stopping) else {
                return;
            };
            tracing::info!(game = %self.name(), instance = %run.instance, "idle shutdown expired");
            self.notify(&run.channel, "Server shutting down due to inactivity.");
        }
        self.stop_run(run_id).await;
    }

    /// The output stream of `run_id` reached EOF.
    async fn on_stream_closed(&self, run_id: u64) {
        let mut rt = self.inner.runtime.lock().await;
        let Some(run) = rt.run.take_if(|r| r.id == run_id && !r.stopping) else {
            return;
        };
        rt.state = ServerState::Idle;

        let game = self.name();
        if run.shutdown_announced {
            tracing::info!(game, instance = %run.instance, pid = run.pid, "server exited");
        } else if !run.crash_reported {
            tracing::warn!(game, instance = %run.instance, pid = run.pid, "server exited unexpectedly");
            self.notify(
                &run.channel,
                &format!("{game} `{}` crashed: process exited unexpectedly", run.instance),
            );
        }

        if let Err(e) = self.inner.pid_store.remove(&run.record_key).await {
            tracing::warn!(game, key = %run.record_key, error = %format!("{e:#}"), "pid record cleanup failed");
        }
    }

    /// Kills processes left behind by a previous supervisor and clears their records.
    pub async fn recover_orphans(&self) -> Vec<RecoveredOrphan> {
        let inner = &self.inner;
        let game = self.name();
        let active_key = {
            let rt = inner.runtime.lock().await;
            rt.run.as_ref().map(|r| r.record_key.clone())
        };

        let mut recovered = Vec::new();
        for instance in &inner.definition.instances {
            let key = pid_store::record_key(game, &instance.name);
            if active_key.as_deref() == Some(key.as_str()) {
                continue;
            }

            let record = match inner.pid_store.load(&key).await {
                Ok(Some(r)) => r,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(game, key = %key, error = %format!("{e:#}"), "discarding unreadable pid record");
                    if let Err(e) = inner.pid_store.remove(&key).await {
                        tracing::warn!(game, key = %key, error = %format!("{e:#}"), "pid record cleanup failed");
                    }
                    continue;
                }
            };

            let status = inner.supervisor.detect_orphan(&record);
            let termination = if status.alive {
                tracing::warn!(game, instance = %instance.name, pid = record.pid, name = %status.name, "terminating orphaned server");
                Some(inner.supervisor.terminate(record.pid).await)
            } else {
                tracing::info!(game, instance = %instance.name, pid = record.pid, "orphaned pid already gone");
                None
            };

            if let Err(e) = inner.pid_store.remove(&key).await {
                tracing::warn!(game, key = %key, error = %format!("{e:#}"), "pid record cleanup failed");
            }
            recovered.push(RecoveredOrphan {
                instance: instance.name.clone(),
                pid: record.pid,
                termination,
            });
        }
        recovered
    }

    pub async fn status(&self) -> ServerStatus {
        let rt = self.inner.runtime.lock().await;
        self.snapshot(&rt)
    }

    pub async fn is_running(&self) -> bool {
        self.inner.runtime.lock().await.run.is_some()
    }

    fn snapshot(&self, rt: &Runtime) -> ServerStatus {
        let mut status = ServerStatus::idle(self.name());
        status.state = rt.state;
        if let Some(run) = &rt.run {
            status.running = true;
            status.active_instance = Some(run.instance.clone());
            status.player_count = run.player_count;
            status.uptime_secs = Some(run.started.elapsed().as_secs());
            status.pid = Some(run.pid);
            status.log_path = Some(run.log_path.display().to_string());
            status.idle_shutdown = run.idle_timer.status();
        }
        status
    }
}

/// Marks the active run as stopping and detaches it from its timer and dispatcher.
fn begin_stop(rt: &mut Runtime) -> Option<PendingStop> {
    let run = rt.run.as_mut()?;
    run.stopping = true;
    run.idle_timer.cancel();
    if let Some(dispatcher) = run.dispatcher.take() {
        dispatcher.abort();
    }
    let pending = PendingStop {
        run_id: run.id,
        instance: run.instance.clone(),
        pid: run.pid,
        record_key: run.record_key.clone(),
    };
    rt.state = ServerState::Stopping;
    Some(pending)
}

/// Consumes the output of one run, strictly in order, until EOF.
async fn dispatch(inner: Weak<Inner>, run_id: u64, mut lines: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = lines.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        GameServer { inner }.handle_line_for(run_id, &line).await;
    }
    if let Some(inner) = inner.upgrade() {
        GameServer { inner }.on_stream_closed(run_id).await;
    }
}
