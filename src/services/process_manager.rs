use crate::error::{Result, SupervisorError};
use crate::models::{
    OutputLine, OutputStream, ProcessConfig, ProcessInfo, ProcessStatus, StatusChange,
    TerminalSize,
};
use crate::services::pty::{self, PtySession};
use crate::services::restart_policy::{RestartBackoff, RestartSettings};
use crate::utils::{signal_process_tree, LineBuffer, StopSignal};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::{self, Read};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(not(target_os = "windows"))]
use crate::utils::USER_PATH;

pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// How long to wait for the exit monitor to reap a force-killed process.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Receives lifecycle and output notifications from the manager.
///
/// Callbacks run on the manager's tasks (status changes under the process
/// lock), so implementations must return quickly.
pub trait ProcessEvents: Send + Sync {
    fn on_status(&self, _change: &StatusChange) {}

    fn on_output(&self, _line: &OutputLine) {}

    /// Raw pseudo-terminal bytes, not split into lines.
    fn on_terminal_output(&self, _process: &str, _data: &[u8]) {}
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub stop_grace: Duration,
    pub restart: RestartSettings,
    pub terminal_size: TerminalSize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            stop_grace: DEFAULT_STOP_GRACE,
            restart: RestartSettings::default(),
            terminal_size: TerminalSize::default(),
        }
    }
}

/// Environment a process is launched with on top of the inherited one.
pub(crate) fn launch_env(config: &ProcessConfig) -> Vec<(String, String)> {
    #[allow(unused_mut)]
    let mut env: Vec<(String, String)> = config
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    #[cfg(not(target_os = "windows"))]
    if !config.env.contains_key("PATH") {
        env.push(("PATH".to_string(), USER_PATH.clone()));
    }

    env
}

#[derive(Debug, Clone, Copy)]
struct ExitOutcome {
    code: Option<i32>,
}

enum ExitWaiter {
    Piped(Child),
    Pty(Box<dyn portable_pty::Child + Send + Sync>),
}

impl ExitWaiter {
    async fn wait(self, name: &str) -> ExitOutcome {
        match self {
            ExitWaiter::Piped(mut child) => match child.wait().await {
                Ok(status) => ExitOutcome {
                    code: status.code(),
                },
                Err(e) => {
                    warn!(process = %name, error = %e, "failed to wait for process");
                    ExitOutcome { code: None }
                }
            },
            ExitWaiter::Pty(mut child) => {
                match tokio::task::spawn_blocking(move || child.wait()).await {
                    Ok(Ok(status)) => ExitOutcome {
                        code: Some(status.exit_code() as i32),
                    },
                    Ok(Err(e)) => {
                        warn!(process = %name, error = %e, "failed to wait for pty process");
                        ExitOutcome { code: None }
                    }
                    Err(e) => {
                        warn!(process = %name, error = %e, "pty wait task failed");
                        ExitOutcome { code: None }
                    }
                }
            }
        }
    }
}

enum LaunchedIo {
    Piped {
        stdout: Option<ChildStdout>,
        stderr: Option<ChildStderr>,
    },
    Pty {
        session: PtySession,
        reader: Box<dyn Read + Send>,
    },
}

struct Launched {
    pid: u32,
    waiter: ExitWaiter,
    io: LaunchedIo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartMode {
    Manual,
    AutoRestart,
}

struct RestartRequest {
    name: String,
    delay: Duration,
}

/// What an exit monitor needs to schedule a restart without holding the
/// manager itself.
#[derive(Clone)]
struct RestartContext {
    settings: RestartSettings,
    requests: mpsc::UnboundedSender<RestartRequest>,
    cancel: CancellationToken,
}

struct ProcessRuntime {
    status: ProcessStatus,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    /// Bumped on every launch so a late monitor from a previous run is ignored.
    run_id: u64,
    exit_rx: Option<watch::Receiver<Option<ExitOutcome>>>,
    terminal: Option<PtySession>,
    hangup_requested: bool,
    backoff: RestartBackoff,
    restart_count: u32,
    last_restart_at: Option<DateTime<Utc>>,
}

struct ManagedProcess {
    config: ProcessConfig,
    runtime: Mutex<ProcessRuntime>,
}

impl ManagedProcess {
    fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            runtime: Mutex::new(ProcessRuntime {
                status: ProcessStatus::Stopped,
                pid: None,
                started_at: None,
                exit_code: None,
                run_id: 0,
                exit_rx: None,
                terminal: None,
                hangup_requested: false,
                backoff: RestartBackoff::new(),
                restart_count: 0,
                last_restart_at: None,
            }),
        }
    }

    fn snapshot(&self, rt: &ProcessRuntime) -> ProcessInfo {
        ProcessInfo {
            name: self.config.name.clone(),
            command: self.config.command.clone(),
            status: rt.status,
            pid: rt.pid,
            started_at: rt.started_at,
            restart_count: rt.restart_count,
            last_restart_at: rt.last_restart_at,
            exit_code: rt.exit_code,
            pty: self.config.pty,
            auto_restart: self.config.auto_restart,
            color: self.config.color.clone(),
        }
    }

    fn transition(&self, rt: &mut ProcessRuntime, status: ProcessStatus, events: &dyn ProcessEvents) {
        rt.status = status;
        debug!(process = %self.config.name, status = %status, pid = ?rt.pid, "status change");
        events.on_status(&StatusChange {
            process: self.config.name.clone(),
            status,
            pid: rt.pid,
            exit_code: rt.exit_code,
            timestamp: Utc::now(),
        });
    }

    fn clear_run(&self, rt: &mut ProcessRuntime) {
        rt.pid = None;
        rt.started_at = None;
        rt.terminal = None;
        rt.exit_rx = None;
    }

    fn schedule_restart(&self, rt: &mut ProcessRuntime, ctx: &RestartContext) {
        if !self.config.auto_restart || ctx.cancel.is_cancelled() {
            return;
        }
        match rt.backoff.next_delay(&ctx.settings, Instant::now()) {
            Some(delay) => {
                info!(
                    process = %self.config.name,
                    attempt = rt.backoff.attempt(),
                    delay_secs = delay.as_secs(),
                    "scheduling restart"
                );
                let request = RestartRequest {
                    name: self.config.name.clone(),
                    delay,
                };
                if ctx.requests.send(request).is_err() {
                    debug!(process = %self.config.name, "restart worker gone");
                }
            }
            None => warn!(
                process = %self.config.name,
                attempts = rt.backoff.attempt(),
                "restart attempts exhausted, leaving process crashed"
            ),
        }
    }
}

struct ManagerInner {
    processes: RwLock<HashMap<String, Arc<ManagedProcess>>>,
    events: Arc<dyn ProcessEvents>,
    settings: ManagerSettings,
    restart: RestartContext,
    shut_down: AtomicBool,
}

/// Owns every managed process and the tasks that watch them.
///
/// Cloning is cheap; clones share the same processes. Must be created inside
/// a tokio runtime, which hosts the restart worker.
#[derive(Clone)]
pub struct ProcessManager {
    inner: Arc<ManagerInner>,
}

impl ProcessManager {
    pub fn new(settings: ManagerSettings, events: Arc<dyn ProcessEvents>) -> Self {
        let (requests, restart_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let inner = Arc::new(ManagerInner {
            processes: RwLock::new(HashMap::new()),
            events,
            restart: RestartContext {
                settings: settings.restart.clone(),
                requests,
                cancel: cancel.clone(),
            },
            settings,
            shut_down: AtomicBool::new(false),
        });

        tokio::spawn(restart_worker(Arc::downgrade(&inner), restart_rx, cancel));
        Self { inner }
    }

    pub async fn register(&self, config: ProcessConfig) -> Result<()> {
        if config.name.trim().is_empty() {
            return Err(SupervisorError::Config("process name must not be empty".to_string()));
        }
        let mut processes = self.inner.processes.write().await;
        if processes.contains_key(&config.name) {
            return Err(SupervisorError::AlreadyExists(config.name));
        }
        debug!(process = %config.name, command = %config.command, "registered process");
        processes.insert(config.name.clone(), Arc::new(ManagedProcess::new(config)));
        Ok(())
    }

    pub async fn start(&self, name: &str) -> Result<ProcessInfo> {
        self.inner.start(name, StartMode::Manual).await
    }

    pub async fn stop(&self, name: &str) -> Result<ProcessInfo> {
        let process = self.inner.lookup(name).await?;
        self.inner.stop_process(&process).await
    }

    pub async fn restart(&self, name: &str) -> Result<ProcessInfo> {
        self.stop(name).await?;
        self.start(name).await
    }

    pub async fn resize_terminal(&self, name: &str, rows: u16, cols: u16) -> Result<()> {
        let process = self.inner.pty_process(name).await?;
        let rt = process.runtime.lock().await;
        let session = rt.terminal.as_ref().ok_or_else(|| terminal_closed(name))?;
        session.resize(TerminalSize { rows, cols })
    }

    pub async fn write_input(&self, name: &str, data: &[u8]) -> Result<()> {
        let process = self.inner.pty_process(name).await?;
        let writer = {
            let rt = process.runtime.lock().await;
            rt.terminal
                .as_ref()
                .ok_or_else(|| terminal_closed(name))?
                .writer()
        };

        let data = data.to_vec();
        tokio::task::spawn_blocking(move || pty::write_all(&writer, &data))
            .await
            .map_err(|e| SupervisorError::Io(io::Error::other(e.to_string())))??;
        Ok(())
    }

    /// Hangs up the terminal. The process normally exits in response, which
    /// is treated as a stop rather than a crash.
    pub async fn close_terminal(&self, name: &str) -> Result<()> {
        let process = self.inner.pty_process(name).await?;
        let mut rt = process.runtime.lock().await;
        let session = rt.terminal.take().ok_or_else(|| terminal_closed(name))?;
        rt.hangup_requested = true;
        drop(session);
        if let Some(pid) = rt.pid {
            signal_process_tree(pid, StopSignal::Hangup)?;
        }
        info!(process = %name, "terminal closed");
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<ProcessInfo> {
        let process = self.inner.lookup(name).await?;
        let rt = process.runtime.lock().await;
        Ok(process.snapshot(&rt))
    }

    /// Snapshots of every registered process, sorted by name.
    pub async fn list(&self) -> Vec<ProcessInfo> {
        let processes: Vec<_> = self.inner.processes.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(processes.len());
        for process in processes {
            let rt = process.runtime.lock().await;
            infos.push(process.snapshot(&rt));
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Cancels background work and stops every process. Safe to call twice.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down process manager");
        self.inner.restart.cancel.cancel();

        let processes: Vec<_> = self.inner.processes.read().await.values().cloned().collect();
        for process in processes {
            if let Err(e) = self.inner.stop_process(&process).await {
                error!(process = %process.config.name, error = %e, "failed to stop during shutdown");
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }
}

fn terminal_closed(name: &str) -> SupervisorError {
    SupervisorError::Io(io::Error::new(
        io::ErrorKind::NotConnected,
        format!("terminal for {} is not open", name),
    ))
}

impl ManagerInner {
    async fn lookup(&self, name: &str) -> Result<Arc<ManagedProcess>> {
        self.processes
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))
    }

    async fn pty_process(&self, name: &str) -> Result<Arc<ManagedProcess>> {
        let process = self.lookup(name).await?;
        if !process.config.pty {
            return Err(SupervisorError::NotPty(name.to_string()));
        }
        Ok(process)
    }

    async fn start(&self, name: &str, mode: StartMode) -> Result<ProcessInfo> {
        if self.restart.cancel.is_cancelled() {
            return Err(SupervisorError::ShuttingDown);
        }
        let process = self.lookup(name).await?;
        let mut rt = process.runtime.lock().await;

        if mode == StartMode::AutoRestart && rt.status != ProcessStatus::Crashed {
            debug!(process = %name, status = %rt.status, "skipping restart, process changed state");
            return Ok(process.snapshot(&rt));
        }
        if matches!(rt.status, ProcessStatus::Running | ProcessStatus::Stopping) {
            return Err(SupervisorError::AlreadyRunning(name.to_string()));
        }
        match mode {
            StartMode::AutoRestart => {
                rt.restart_count += 1;
                rt.last_restart_at = Some(Utc::now());
            }
            StartMode::Manual => rt.backoff.reset(),
        }

        rt.exit_code = None;
        rt.hangup_requested = false;
        process.transition(&mut rt, ProcessStatus::Starting, &*self.events);

        let launched = if process.config.pty {
            pty::spawn_pty(&process.config, self.settings.terminal_size).map(|spawned| Launched {
                pid: spawned.pid,
                waiter: ExitWaiter::Pty(spawned.child),
                io: LaunchedIo::Pty {
                    session: spawned.session,
                    reader: spawned.reader,
                },
            })
        } else {
            launch_piped(&process.config)
        };

        let launched = match launched {
            Ok(launched) => launched,
            Err(err) => {
                error!(process = %name, error = %err, "launch failed");
                process.clear_run(&mut rt);
                process.transition(&mut rt, ProcessStatus::Crashed, &*self.events);
                if mode == StartMode::AutoRestart {
                    process.schedule_restart(&mut rt, &self.restart);
                }
                return Err(err);
            }
        };

        rt.run_id += 1;
        let (exit_tx, exit_rx) = watch::channel(None);
        rt.pid = Some(launched.pid);
        rt.started_at = Some(Utc::now());
        rt.exit_rx = Some(exit_rx);

        let cancel = self.restart.cancel.clone();
        match launched.io {
            LaunchedIo::Piped { stdout, stderr } => {
                tokio::spawn(read_pipes(
                    name.to_string(),
                    stdout,
                    stderr,
                    self.events.clone(),
                    cancel,
                ));
            }
            LaunchedIo::Pty { session, reader } => {
                rt.terminal = Some(session);
                let events = self.events.clone();
                let reader_name = name.to_string();
                tokio::task::spawn_blocking(move || {
                    pty::pump_output(&reader_name, reader, &*events, &cancel)
                });
            }
        }

        tokio::spawn(monitor_exit(
            process.clone(),
            rt.run_id,
            launched.waiter,
            exit_tx,
            self.events.clone(),
            self.restart.clone(),
        ));

        process.transition(&mut rt, ProcessStatus::Running, &*self.events);
        info!(process = %name, pid = launched.pid, pty = process.config.pty, "process started");
        Ok(process.snapshot(&rt))
    }

    /// Signals the process and waits out the grace period. The process lock
    /// is only held while state changes; `Stopping` keeps `start` and the
    /// exit monitor from interfering in between.
    async fn stop_process(&self, process: &ManagedProcess) -> Result<ProcessInfo> {
        let name = process.config.name.as_str();
        let (pid, mut exit_rx) = {
            let mut rt = process.runtime.lock().await;
            match rt.status {
                ProcessStatus::Running => {}
                ProcessStatus::Crashed => {
                    // parks the process; a pending auto-restart sees this and backs off
                    process.transition(&mut rt, ProcessStatus::Stopped, &*self.events);
                    return Ok(process.snapshot(&rt));
                }
                _ => return Ok(process.snapshot(&rt)),
            }

            let pid = rt.pid;
            let exit_rx = rt.exit_rx.take();
            process.transition(&mut rt, ProcessStatus::Stopping, &*self.events);
            (pid, exit_rx)
        };

        let signal = if process.config.pty {
            StopSignal::Interrupt
        } else {
            StopSignal::Terminate
        };
        if let Some(pid) = pid {
            if let Err(e) = signal_process_tree(pid, signal) {
                warn!(process = %name, pid, error = %e, "failed to signal process");
            }
        }

        if !wait_for_exit(exit_rx.as_mut(), self.settings.stop_grace).await {
            warn!(
                process = %name,
                grace_ms = self.settings.stop_grace.as_millis() as u64,
                "process ignored stop signal, killing"
            );
            {
                let mut rt = process.runtime.lock().await;
                let killed = match pid {
                    Some(pid) => signal_process_tree(pid, StopSignal::Kill),
                    None => Ok(()),
                };
                if let Some(session) = rt.terminal.as_mut() {
                    session.kill();
                }
                if let Err(e) = killed {
                    process.clear_run(&mut rt);
                    process.transition(&mut rt, ProcessStatus::Crashed, &*self.events);
                    return Err(e.into());
                }
            }
            if !wait_for_exit(exit_rx.as_mut(), REAP_TIMEOUT).await {
                warn!(process = %name, "killed process was not reaped in time");
            }
        }

        let mut rt = process.runtime.lock().await;
        process.clear_run(&mut rt);
        process.transition(&mut rt, ProcessStatus::Stopped, &*self.events);
        info!(process = %name, "process stopped");
        Ok(process.snapshot(&rt))
    }
}

/// Waits for the exit monitor to report. A missing receiver or a dropped
/// sender both mean there is nothing left to wait for.
async fn wait_for_exit(
    exit_rx: Option<&mut watch::Receiver<Option<ExitOutcome>>>,
    timeout: Duration,
) -> bool {
    let Some(exit_rx) = exit_rx else {
        return true;
    };
    tokio::time::timeout(timeout, exit_rx.wait_for(|outcome| outcome.is_some()))
        .await
        .is_ok()
}

fn launch_piped(config: &ProcessConfig) -> Result<Launched> {
    let mut command = Command::new(&config.command);
    command
        .args(&config.args)
        .envs(launch_env(config))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &config.cwd {
        command.current_dir(cwd);
    }

    #[cfg(unix)]
    command.process_group(0);

    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        command.creation_flags(CREATE_NO_WINDOW);
    }

    let mut child = command.spawn().map_err(|e| SupervisorError::LaunchFailure {
        name: config.name.clone(),
        message: e.to_string(),
    })?;
    let pid = child.id().ok_or_else(|| SupervisorError::LaunchFailure {
        name: config.name.clone(),
        message: "child exited before reporting a pid".to_string(),
    })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    Ok(Launched {
        pid,
        waiter: ExitWaiter::Piped(child),
        io: LaunchedIo::Piped { stdout, stderr },
    })
}

async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut Option<R>, buf: &mut [u8]) -> io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Forwards the lines completed by one read. Returns false once the stream is done.
fn forward_chunk(
    name: &str,
    stream: OutputStream,
    read: io::Result<usize>,
    buf: &[u8],
    lines: &mut LineBuffer,
    events: &dyn ProcessEvents,
) -> bool {
    match read {
        Ok(0) => false,
        Ok(n) => {
            for text in lines.push(&buf[..n]) {
                events.on_output(&OutputLine {
                    process: name.to_string(),
                    stream,
                    text,
                });
            }
            true
        }
        Err(e) if e.kind() == io::ErrorKind::Interrupted => true,
        Err(e) => {
            debug!(process = %name, ?stream, error = %e, "output stream read failed");
            false
        }
    }
}

async fn read_pipes(
    name: String,
    mut stdout: Option<ChildStdout>,
    mut stderr: Option<ChildStderr>,
    events: Arc<dyn ProcessEvents>,
    cancel: CancellationToken,
) {
    let mut out_lines = LineBuffer::new();
    let mut err_lines = LineBuffer::new();
    let mut out_buf = vec![0u8; 8192];
    let mut err_buf = vec![0u8; 8192];

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = read_chunk(&mut stdout, &mut out_buf), if stdout.is_some() => {
                if !forward_chunk(&name, OutputStream::Stdout, read, &out_buf, &mut out_lines, &*events) {
                    stdout = None;
                }
            }
            read = read_chunk(&mut stderr, &mut err_buf), if stderr.is_some() => {
                if !forward_chunk(&name, OutputStream::Stderr, read, &err_buf, &mut err_lines, &*events) {
                    stderr = None;
                }
            }
        }
    }

    for (stream, lines) in [
        (OutputStream::Stdout, &mut out_lines),
        (OutputStream::Stderr, &mut err_lines),
    ] {
        if let Some(text) = lines.finish() {
            events.on_output(&OutputLine {
                process: name.clone(),
                stream,
                text,
            });
        }
    }
    debug!(process = %name, "output reader finished");
}

async fn monitor_exit(
    process: Arc<ManagedProcess>,
    run_id: u64,
    waiter: ExitWaiter,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
    events: Arc<dyn ProcessEvents>,
    restart: RestartContext,
) {
    let name = process.config.name.clone();
    let outcome = waiter.wait(&name).await;
    // signal before locking: a stop in progress holds the lock while it waits
    let _ = exit_tx.send(Some(outcome));

    let mut rt = process.runtime.lock().await;
    if rt.run_id != run_id {
        return;
    }
    rt.exit_code = outcome.code;
    if rt.status != ProcessStatus::Running {
        return;
    }

    process.clear_run(&mut rt);
    if rt.hangup_requested {
        info!(process = %name, code = ?outcome.code, "process exited after terminal hangup");
        process.transition(&mut rt, ProcessStatus::Stopped, &*events);
        return;
    }

    warn!(process = %name, code = ?outcome.code, "process exited unexpectedly");
    process.transition(&mut rt, ProcessStatus::Crashed, &*events);
    process.schedule_restart(&mut rt, &restart);
}

async fn restart_worker(
    manager: Weak<ManagerInner>,
    mut requests: mpsc::UnboundedReceiver<RestartRequest>,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let manager = manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(request.delay) => {}
            }
            let Some(manager) = manager.upgrade() else {
                return;
            };
            if let Err(e) = manager.start(&request.name, StartMode::AutoRestart).await {
                warn!(process = %request.name, error = %e, "automatic restart failed");
            }
        });
    }
    debug!("restart worker stopped");
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        statuses: StdMutex<Vec<StatusChange>>,
        lines: StdMutex<Vec<OutputLine>>,
        chunks: StdMutex<Vec<u8>>,
    }

    impl Recorder {
        fn statuses(&self, name: &str) -> Vec<ProcessStatus> {
            self.statuses
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.process == name)
                .map(|c| c.status)
                .collect()
        }

        fn texts(&self) -> Vec<String> {
            self.lines.lock().unwrap().iter().map(|l| l.text.clone()).collect()
        }
    }

    impl ProcessEvents for Recorder {
        fn on_status(&self, change: &StatusChange) {
            self.statuses.lock().unwrap().push(change.clone());
        }

        fn on_output(&self, line: &OutputLine) {
            self.lines.lock().unwrap().push(line.clone());
        }

        fn on_terminal_output(&self, _process: &str, data: &[u8]) {
            self.chunks.lock().unwrap().extend_from_slice(data);
        }
    }

    fn sh(name: &str, script: &str) -> ProcessConfig {
        ProcessConfig::new(name, "sh").args(["-c", script])
    }

    fn manager_with(grace: Duration) -> (ProcessManager, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let settings = ManagerSettings {
            stop_grace: grace,
            ..ManagerSettings::default()
        };
        (ProcessManager::new(settings, recorder.clone()), recorder)
    }

    async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let (manager, _) = manager_with(DEFAULT_STOP_GRACE);
        manager.register(sh("web", "sleep 1")).await.unwrap();

        let err = manager
            .register(ProcessConfig::new("web", "bin/rails"))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyExists(name) if name == "web"));

        let info = manager.get("web").await.unwrap();
        assert_eq!(info.command, "sh");
        assert_eq!(info.status, ProcessStatus::Stopped);
    }

    #[tokio::test]
    async fn unknown_process_is_not_found() {
        let (manager, _) = manager_with(DEFAULT_STOP_GRACE);
        assert!(matches!(manager.start("ghost").await, Err(SupervisorError::NotFound(_))));
        assert!(matches!(manager.stop("ghost").await, Err(SupervisorError::NotFound(_))));
    }

    #[tokio::test]
    async fn start_and_stop_walk_the_state_machine() {
        let (manager, recorder) = manager_with(Duration::from_secs(2));
        manager.register(sh("web", "sleep 30")).await.unwrap();

        let info = manager.start("web").await.unwrap();
        assert_eq!(info.status, ProcessStatus::Running);
        assert!(info.pid.unwrap_or(0) > 0);
        assert!(info.started_at.is_some());

        assert!(matches!(
            manager.start("web").await,
            Err(SupervisorError::AlreadyRunning(_))
        ));

        let stopped = manager.stop("web").await.unwrap();
        assert_eq!(stopped.status, ProcessStatus::Stopped);
        assert_eq!(stopped.pid, None);
        assert_eq!(stopped.started_at, None);

        // monitor must not report the requested exit as a crash
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            recorder.statuses("web"),
            vec![
                ProcessStatus::Starting,
                ProcessStatus::Running,
                ProcessStatus::Stopping,
                ProcessStatus::Stopped
            ]
        );
    }

    #[tokio::test]
    async fn stop_on_stopped_process_is_a_noop() {
        let (manager, recorder) = manager_with(DEFAULT_STOP_GRACE);
        manager.register(sh("web", "sleep 1")).await.unwrap();
        let info = manager.stop("web").await.unwrap();
        assert_eq!(info.status, ProcessStatus::Stopped);
        assert!(recorder.statuses("web").is_empty());
    }

    #[tokio::test]
    async fn captures_each_line_once_including_partial_tail() {
        let (manager, recorder) = manager_with(DEFAULT_STOP_GRACE);
        manager
            .register(sh("job", "printf 'one\\ntwo\\n'; printf 'oops\\n' >&2; printf 'tail'"))
            .await
            .unwrap();
        manager.start("job").await.unwrap();

        assert!(wait_until(Duration::from_secs(5), || recorder.texts().len() >= 4).await);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let lines = recorder.lines.lock().unwrap().clone();
        let stdout: Vec<_> = lines
            .iter()
            .filter(|l| l.stream == OutputStream::Stdout)
            .map(|l| l.text.as_str())
            .collect();
        let stderr: Vec<_> = lines
            .iter()
            .filter(|l| l.stream == OutputStream::Stderr)
            .map(|l| l.text.as_str())
            .collect();
        assert_eq!(stdout, vec!["one", "two", "tail"]);
        assert_eq!(stderr, vec!["oops"]);
    }

    #[tokio::test]
    async fn launch_failure_is_reported_and_marks_crashed() {
        let (manager, recorder) = manager_with(DEFAULT_STOP_GRACE);
        manager
            .register(ProcessConfig::new("broken", "/nonexistent/devrunner-missing-binary"))
            .await
            .unwrap();

        let err = manager.start("broken").await.unwrap_err();
        assert!(matches!(err, SupervisorError::LaunchFailure { .. }));
        assert_eq!(manager.get("broken").await.unwrap().status, ProcessStatus::Crashed);
        assert_eq!(
            recorder.statuses("broken"),
            vec![ProcessStatus::Starting, ProcessStatus::Crashed]
        );
    }

    #[tokio::test]
    async fn external_kill_crashes_then_restarts_after_backoff() {
        let (manager, recorder) = manager_with(Duration::from_secs(2));
        manager
            .register(sh("web", "sleep 30").auto_restart(true))
            .await
            .unwrap();
        let first_pid = manager.start("web").await.unwrap().pid.unwrap();

        signal_process_tree(first_pid, StopSignal::Kill).unwrap();

        assert!(
            wait_until(Duration::from_secs(5), || {
                recorder.statuses("web").contains(&ProcessStatus::Crashed)
            })
            .await
        );
        let crashed_at = Instant::now();
        let info = manager.get("web").await.unwrap();
        assert_eq!(info.pid, None);
        assert_eq!(info.restart_count, 0);

        assert!(
            wait_until(Duration::from_secs(5), || {
                recorder.statuses("web").len() >= 5
            })
            .await
        );
        assert!(crashed_at.elapsed() >= Duration::from_millis(800));
        assert_eq!(
            recorder.statuses("web"),
            vec![
                ProcessStatus::Starting,
                ProcessStatus::Running,
                ProcessStatus::Crashed,
                ProcessStatus::Starting,
                ProcessStatus::Running
            ]
        );

        let info = manager.get("web").await.unwrap();
        assert_eq!(info.status, ProcessStatus::Running);
        assert_ne!(info.pid, Some(first_pid));
        assert_eq!(info.restart_count, 1);
        assert!(info.last_restart_at.is_some());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn stopping_a_crashed_process_cancels_auto_restart() {
        let (manager, recorder) = manager_with(DEFAULT_STOP_GRACE);
        manager
            .register(sh("flaky", "exit 3").auto_restart(true))
            .await
            .unwrap();
        manager.start("flaky").await.unwrap();

        assert!(
            wait_until(Duration::from_secs(5), || {
                recorder.statuses("flaky").contains(&ProcessStatus::Crashed)
            })
            .await
        );
        let info = manager.stop("flaky").await.unwrap();
        assert_eq!(info.status, ProcessStatus::Stopped);
        assert_eq!(info.exit_code, Some(3));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(manager.get("flaky").await.unwrap().status, ProcessStatus::Stopped);
    }

    #[tokio::test]
    async fn stop_escalates_to_kill_after_grace_period() {
        let (manager, _) = manager_with(Duration::from_millis(300));
        manager
            .register(sh("stubborn", "trap '' TERM; while true; do sleep 0.1; done"))
            .await
            .unwrap();
        manager.start("stubborn").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        let info = manager.stop("stubborn").await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(info.status, ProcessStatus::Stopped);
        assert_eq!(info.pid, None);
    }

    #[tokio::test]
    async fn pending_stop_does_not_block_other_callers() {
        let (manager, _) = manager_with(Duration::from_secs(3));
        manager
            .register(sh("stubborn", "trap '' TERM; while true; do sleep 0.1; done"))
            .await
            .unwrap();
        manager.start("stubborn").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stopper = manager.clone();
        let stopping = tokio::spawn(async move { stopper.stop("stubborn").await });
        tokio::time::sleep(Duration::from_millis(200)).await;

        let asked = Instant::now();
        let info = manager.get("stubborn").await.unwrap();
        assert!(asked.elapsed() < Duration::from_millis(500));
        assert_eq!(info.status, ProcessStatus::Stopping);
        assert_eq!(manager.list().await.len(), 1);
        assert!(matches!(
            manager.start("stubborn").await,
            Err(SupervisorError::AlreadyRunning(_))
        ));

        let stopped = stopping.await.unwrap().unwrap();
        assert_eq!(stopped.status, ProcessStatus::Stopped);
        assert_eq!(stopped.pid, None);
    }

    #[tokio::test]
    async fn restart_launches_a_new_instance() {
        let (manager, _) = manager_with(Duration::from_secs(2));
        manager.register(sh("worker", "sleep 30")).await.unwrap();
        let first = manager.start("worker").await.unwrap().pid;

        let restarted = manager.restart("worker").await.unwrap();
        assert_eq!(restarted.status, ProcessStatus::Running);
        assert!(restarted.pid.is_some());
        assert_ne!(restarted.pid, first);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn terminal_operations_require_pty() {
        let (manager, _) = manager_with(DEFAULT_STOP_GRACE);
        manager.register(sh("web", "sleep 1")).await.unwrap();

        assert!(matches!(
            manager.resize_terminal("web", 40, 120).await,
            Err(SupervisorError::NotPty(_))
        ));
        assert!(matches!(
            manager.write_input("web", b"x").await,
            Err(SupervisorError::NotPty(_))
        ));
        assert!(matches!(
            manager.close_terminal("web").await,
            Err(SupervisorError::NotPty(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pty_process_echoes_input() {
        let (manager, recorder) = manager_with(Duration::from_secs(2));
        manager
            .register(ProcessConfig::new("console", "cat").pty(true))
            .await
            .unwrap();
        manager.start("console").await.unwrap();

        manager.resize_terminal("console", 40, 120).await.unwrap();
        manager.write_input("console", b"hello pty\n").await.unwrap();

        assert!(
            wait_until(Duration::from_secs(5), || {
                recorder.texts().iter().any(|t| t == "hello pty")
            })
            .await
        );
        assert!(!recorder.chunks.lock().unwrap().is_empty());
        assert!(recorder
            .lines
            .lock()
            .unwrap()
            .iter()
            .all(|l| l.stream == OutputStream::Pty));

        let info = manager.stop("console").await.unwrap();
        assert_eq!(info.status, ProcessStatus::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn closing_terminal_stops_without_crash() {
        let (manager, recorder) = manager_with(Duration::from_secs(2));
        manager
            .register(ProcessConfig::new("console", "cat").pty(true).auto_restart(true))
            .await
            .unwrap();
        manager.start("console").await.unwrap();

        manager.close_terminal("console").await.unwrap();
        assert!(
            wait_until(Duration::from_secs(5), || {
                recorder.statuses("console").last() == Some(&ProcessStatus::Stopped)
            })
            .await
        );
        assert!(!recorder.statuses("console").contains(&ProcessStatus::Crashed));
        assert!(manager.write_input("console", b"x").await.is_err());
    }

    #[tokio::test]
    async fn shutdown_stops_everything_and_is_idempotent() {
        let (manager, _) = manager_with(Duration::from_secs(2));
        manager.register(sh("a", "sleep 30")).await.unwrap();
        manager.register(sh("b", "sleep 30")).await.unwrap();
        manager.start("a").await.unwrap();
        manager.start("b").await.unwrap();

        manager.shutdown().await;
        manager.shutdown().await;
        assert!(manager.is_shut_down());

        for info in manager.list().await {
            assert_eq!(info.status, ProcessStatus::Stopped);
            assert_eq!(info.pid, None);
        }
        assert!(matches!(manager.start("a").await, Err(SupervisorError::ShuttingDown)));
    }
}
