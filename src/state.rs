use crate::error::Result;
use crate::models::{OutputLine, ProcessInfo, StatusChange, TerminalChunk};
use crate::plugins::{plugin_for, FrameworkPlugin};
use crate::services::{
    ExceptionTracker, LogStreamer, ProcessEvents, ProcessManager, SupervisorConfig,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Routes manager callbacks into the log pipeline and the broadcast channels.
struct EventPipeline {
    plugin: Arc<dyn FrameworkPlugin>,
    logs: Arc<LogStreamer>,
    status_tx: broadcast::Sender<StatusChange>,
    terminal_tx: broadcast::Sender<TerminalChunk>,
}

impl ProcessEvents for EventPipeline {
    fn on_status(&self, change: &StatusChange) {
        // no receivers is fine
        let _ = self.status_tx.send(change.clone());
    }

    fn on_output(&self, line: &OutputLine) {
        let entry = self.plugin.parse_log(&line.process, &line.text);
        self.logs.append(entry);
    }

    fn on_terminal_output(&self, process: &str, data: &[u8]) {
        let _ = self.terminal_tx.send(TerminalChunk {
            process: process.to_string(),
            data: data.to_vec(),
        });
    }
}

/// Wires the process manager, log streamer and exception tracker together.
pub struct Supervisor {
    config: SupervisorConfig,
    manager: ProcessManager,
    logs: Arc<LogStreamer>,
    exceptions: Arc<ExceptionTracker>,
    status_tx: broadcast::Sender<StatusChange>,
    terminal_tx: broadcast::Sender<TerminalChunk>,
}

impl Supervisor {
    /// Builds a supervisor using the plugin named by `config.framework`.
    pub async fn new(config: SupervisorConfig) -> Result<Self> {
        let plugin = plugin_for(&config.framework)?;
        Self::with_plugin(config, plugin).await
    }

    /// Builds a supervisor and registers every configured process. Nothing
    /// is started yet.
    pub async fn with_plugin(
        config: SupervisorConfig,
        plugin: Arc<dyn FrameworkPlugin>,
    ) -> Result<Self> {
        config.validate()?;

        let logs = Arc::new(LogStreamer::with_queue_size(
            config.log_capacity,
            config.subscriber_queue,
        ));
        let exceptions = Arc::new(ExceptionTracker::with_hard_capacity(
            config.exception_capacity,
            config.exception_hard_capacity,
        ));
        let tracker = exceptions.clone();
        logs.set_ingest_callback(Arc::new(move |entry| {
            tracker.track(entry);
        }));

        let (status_tx, _) = broadcast::channel(config.subscriber_queue);
        let (terminal_tx, _) = broadcast::channel(config.subscriber_queue);

        let events = Arc::new(EventPipeline {
            plugin: plugin.clone(),
            logs: logs.clone(),
            status_tx: status_tx.clone(),
            terminal_tx: terminal_tx.clone(),
        });
        let manager = ProcessManager::new(config.manager_settings(), events);
        for process in &config.processes {
            manager.register(process.clone()).await?;
        }

        info!(
            processes = config.processes.len(),
            plugin = plugin.name(),
            "supervisor ready"
        );

        Ok(Self {
            config,
            manager,
            logs,
            exceptions,
            status_tx,
            terminal_tx,
        })
    }

    pub fn manager(&self) -> &ProcessManager {
        &self.manager
    }

    pub fn logs(&self) -> &Arc<LogStreamer> {
        &self.logs
    }

    pub fn exceptions(&self) -> &Arc<ExceptionTracker> {
        &self.exceptions
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusChange> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_terminal(&self) -> broadcast::Receiver<TerminalChunk> {
        self.terminal_tx.subscribe()
    }

    /// Starts every configured process, or only those named in `only`.
    /// Failures are logged and reflected in the returned snapshots.
    pub async fn start_all(&self, only: &[String]) -> Vec<ProcessInfo> {
        for process in &self.config.processes {
            if !only.is_empty() && !only.contains(&process.name) {
                continue;
            }
            if let Err(e) = self.manager.start(&process.name).await {
                warn!(process = %process.name, error = %e, "failed to start");
            }
        }
        self.manager.list().await
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }
}
