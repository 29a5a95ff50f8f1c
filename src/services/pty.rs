use crate::error::{Result, SupervisorError};
use crate::models::{OutputLine, OutputStream, ProcessConfig, TerminalSize};
use crate::services::process_manager::{launch_env, ProcessEvents};
use crate::utils::{strip_ansi, LineBuffer};
use portable_pty::{
    native_pty_system, Child as PtyChild, ChildKiller, CommandBuilder, MasterPty, PtySize,
};
use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub type PtyWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Master side of a process's pseudo-terminal.
pub struct PtySession {
    master: Box<dyn MasterPty + Send>,
    writer: PtyWriter,
    killer: Box<dyn ChildKiller + Send + Sync>,
}

pub struct SpawnedPty {
    pub session: PtySession,
    pub child: Box<dyn PtyChild + Send + Sync>,
    pub reader: Box<dyn Read + Send>,
    pub pid: u32,
}

fn launch_failure(name: &str, err: impl std::fmt::Display) -> SupervisorError {
    SupervisorError::LaunchFailure {
        name: name.to_string(),
        message: err.to_string(),
    }
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Spawns `config` attached to a fresh pseudo-terminal.
///
/// The child becomes a session leader, so its pid doubles as its process
/// group id for signalling.
pub fn spawn_pty(config: &ProcessConfig, size: TerminalSize) -> Result<SpawnedPty> {
    let pair = native_pty_system()
        .openpty(pty_size(size))
        .map_err(|e| launch_failure(&config.name, e))?;

    let mut builder = CommandBuilder::new(&config.command);
    builder.args(&config.args);
    if let Some(cwd) = &config.cwd {
        builder.cwd(cwd);
    }
    for (key, value) in launch_env(config) {
        builder.env(key, value);
    }

    let mut child = pair
        .slave
        .spawn_command(builder)
        .map_err(|e| launch_failure(&config.name, e))?;
    // the slave must be closed here or the reader never sees EOF
    drop(pair.slave);

    let pid = match child.process_id() {
        Some(pid) => pid,
        None => {
            let _ = child.kill();
            return Err(launch_failure(&config.name, "child exited before reporting a pid"));
        }
    };

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| launch_failure(&config.name, e))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| launch_failure(&config.name, e))?;
    let killer = child.clone_killer();

    Ok(SpawnedPty {
        session: PtySession {
            master: pair.master,
            writer: Arc::new(Mutex::new(writer)),
            killer,
        },
        child,
        reader,
        pid,
    })
}

impl PtySession {
    pub fn resize(&self, size: TerminalSize) -> Result<()> {
        self.master
            .resize(pty_size(size))
            .map_err(|e| SupervisorError::Io(std::io::Error::other(e.to_string())))
    }

    pub fn writer(&self) -> PtyWriter {
        self.writer.clone()
    }

    pub fn kill(&mut self) {
        if let Err(e) = self.killer.kill() {
            debug!(error = %e, "pty child kill failed");
        }
    }
}

/// Blocking write of `data` to the terminal.
pub fn write_all(writer: &PtyWriter, data: &[u8]) -> std::io::Result<()> {
    let mut guard = writer.lock().unwrap_or_else(PoisonError::into_inner);
    guard.write_all(data)?;
    guard.flush()
}

/// Pumps terminal output until EOF or cancellation. Runs on a blocking thread.
///
/// Raw chunks go out untouched on the interactive channel; the same bytes are
/// split into lines, stripped of escape sequences, and sent as output lines.
pub fn pump_output(
    name: &str,
    mut reader: Box<dyn Read + Send>,
    events: &dyn ProcessEvents,
    cancel: &CancellationToken,
) {
    let mut lines = LineBuffer::new();
    let mut buf = [0u8; 8192];

    let emit = |text: String| {
        events.on_output(&OutputLine {
            process: name.to_string(),
            stream: OutputStream::Pty,
            text: strip_ansi(&text).into_owned(),
        });
    };

    loop {
        if cancel.is_cancelled() {
            break;
        }
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                events.on_terminal_output(name, &buf[..n]);
                for line in lines.push(&buf[..n]) {
                    emit(line);
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            // Linux reports EIO on the master once the child side hangs up
            Err(e) if e.raw_os_error() == Some(5) => break,
            Err(e) => {
                warn!(process = %name, error = %e, "pty read failed");
                break;
            }
        }
    }

    if let Some(rest) = lines.finish() {
        emit(rest);
    }
    debug!(process = %name, "pty reader finished");
}
