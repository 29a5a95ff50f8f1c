use std::io;

#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Ctrl-C equivalent; consoles and REPLs expect this.
    Interrupt,
    /// Sent when the controlling terminal goes away.
    Hangup,
    Terminate,
    Kill,
}

/// Signals the whole process group led by `pid`.
///
/// Managed processes are spawned as group leaders so that children forked by
/// wrappers (`bin/rails` → puma workers, `npm` → node) go down with them. A
/// process that no longer exists is not an error.
#[cfg(unix)]
pub fn signal_process_tree(pid: u32, signal: StopSignal) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let sig = match signal {
        StopSignal::Interrupt => Signal::SIGINT,
        StopSignal::Hangup => Signal::SIGHUP,
        StopSignal::Terminate => Signal::SIGTERM,
        StopSignal::Kill => Signal::SIGKILL,
    };
    let nix_pid = Pid::from_raw(pid as i32);

    match killpg(nix_pid, sig) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => match kill(nix_pid, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(io::Error::from_raw_os_error(e as i32)),
        },
        Err(e) => Err(io::Error::from_raw_os_error(e as i32)),
    }
}

#[cfg(target_os = "windows")]
pub fn signal_process_tree(pid: u32, signal: StopSignal) -> io::Result<()> {
    use std::process::Command;

    const CREATE_NO_WINDOW: u32 = 0x08000000;

    let pid = pid.to_string();
    let mut kill_command = Command::new("taskkill");
    match signal {
        StopSignal::Kill => kill_command.args(["/PID", &pid, "/T", "/F"]),
        _ => kill_command.args(["/PID", &pid, "/T"]),
    };
    kill_command.creation_flags(CREATE_NO_WINDOW);
    kill_command.output().map(|_| ())
}
