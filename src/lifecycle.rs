//! Process lifecycle: PID-file interlock, daemonization, signal-driven
//! shutdown, and idempotent cleanup.
//!
//! Constructed once in `run()` and passed by reference; no module-level
//! mutable state.

use std::path::{Path, PathBuf};

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};
use tracing::{debug, info, warn};

use crate::config::Mode;
use crate::error::Result;
use crate::nonce;

/// Substring that identifies a bridge process on a command line.
const BRIDGE_NEEDLE: &str = "gpg-bridge";

/// True when the pidfile names a live process whose command line identifies
/// another bridge instance. A stale file (dead pid, or a recycled pid now
/// owned by an unrelated process) does not count.
pub fn already_running(pidfile: &Path) -> bool {
    instance_running(pidfile, BRIDGE_NEEDLE)
}

fn instance_running(pidfile: &Path, needle: &str) -> bool {
    let Ok(contents) = std::fs::read_to_string(pidfile) else {
        return false;
    };
    let Ok(pid) = contents.trim().parse::<u32>() else {
        warn!("pidfile {} is unparseable, ignoring", pidfile.display());
        return false;
    };
    if pid == std::process::id() {
        return false;
    }

    let mut sys = System::new_with_specifics(
        RefreshKind::nothing().with_processes(ProcessRefreshKind::everything()),
    );
    sys.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);

    match sys.process(Pid::from_u32(pid)) {
        Some(process) => {
            let matches = process
                .cmd()
                .iter()
                .chain(std::iter::once(&process.name().to_os_string()))
                .any(|part| part.to_string_lossy().contains(needle));
            if !matches {
                debug!("pid {pid} is alive but is not a bridge, ignoring pidfile");
            }
            matches
        }
        None => false,
    }
}

pub fn write_pidfile(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{}\n", std::process::id()))?;
    Ok(())
}

/// Detach from the controlling terminal: double-fork + new session, stdin
/// from null, stderr (stdout mirrored to it) appended to `logfile` or null.
///
/// Must run before the tokio runtime is built; forking a process with live
/// runtime threads is undefined behavior in practice.
#[cfg(unix)]
pub fn daemonize(logfile: Option<&Path>) -> Result<()> {
    use std::fs::OpenOptions;
    use std::os::fd::AsRawFd;

    unsafe {
        match libc::fork() {
            -1 => return Err(std::io::Error::last_os_error().into()),
            0 => {}
            _ => libc::_exit(0),
        }
        if libc::setsid() == -1 {
            return Err(std::io::Error::last_os_error().into());
        }
        match libc::fork() {
            -1 => return Err(std::io::Error::last_os_error().into()),
            0 => {}
            _ => libc::_exit(0),
        }
    }

    let stdin_null = OpenOptions::new().read(true).open("/dev/null")?;
    let sink = match logfile {
        Some(path) => OpenOptions::new().create(true).append(true).open(path)?,
        None => OpenOptions::new().write(true).open("/dev/null")?,
    };

    unsafe {
        if libc::dup2(stdin_null.as_raw_fd(), 0) == -1
            || libc::dup2(sink.as_raw_fd(), 2) == -1
            || libc::dup2(sink.as_raw_fd(), 1) == -1
        {
            return Err(std::io::Error::last_os_error().into());
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn daemonize(_logfile: Option<&Path>) -> Result<()> {
    // The outer side is started detached by the inner; there is no
    // controlling terminal to leave.
    Ok(())
}

/// Block until a shutdown signal arrives.
///
/// The inner bridge exits on SIGHUP, SIGINT, or SIGTERM. The outer bridge
/// ignores SIGINT (it is expected to persist across console interrupts in
/// the host) and exits on SIGHUP or SIGTERM so the nonce file is removed.
pub async fn wait_for_shutdown(mode: Mode) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!("failed to register SIGHUP handler: {e}");
                return std::future::pending().await;
            }
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("failed to register SIGTERM handler: {e}");
                return std::future::pending().await;
            }
        };

        match mode {
            Mode::Inner => match signal(SignalKind::interrupt()) {
                Ok(mut interrupt) => {
                    tokio::select! {
                        _ = hangup.recv() => info!("received SIGHUP"),
                        _ = terminate.recv() => info!("received SIGTERM"),
                        _ = interrupt.recv() => info!("received SIGINT"),
                    }
                }
                Err(e) => {
                    warn!("failed to register SIGINT handler: {e}");
                    tokio::select! {
                        _ = hangup.recv() => info!("received SIGHUP"),
                        _ = terminate.recv() => info!("received SIGTERM"),
                    }
                }
            },
            Mode::Outer => {
                // Holding the stream replaces the default disposition, so
                // console interrupts are swallowed instead of killing us.
                let _interrupt = signal(SignalKind::interrupt());
                tokio::select! {
                    _ = hangup.recv() => info!("received SIGHUP"),
                    _ = terminate.recv() => info!("received SIGTERM"),
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = mode;
        let _ = tokio::signal::ctrl_c().await;
        info!("received console interrupt");
    }
}

/// Registered cleanup actions, runnable exactly once.
pub struct Cleanup {
    pidfile: Option<PathBuf>,
    noncefile: Option<PathBuf>,
    done: bool,
}

impl Cleanup {
    pub fn new(pidfile: Option<PathBuf>) -> Self {
        Self {
            pidfile,
            noncefile: None,
            done: false,
        }
    }

    /// The outer bridge registers its nonce file once it has been created.
    pub fn register_noncefile(&mut self, path: PathBuf) {
        self.noncefile = Some(path);
    }

    /// Remove pidfile and nonce file, log the exit. Safe to call twice.
    pub fn run(&mut self) {
        if self.done {
            return;
        }
        self.done = true;

        if let Some(path) = &self.pidfile {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove pidfile {}: {e}", path.display());
                }
            }
        }
        if let Some(path) = &self.noncefile {
            nonce::remove(path);
        }
        info!("exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pidfile_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.pid");

        write_pidfile(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim().parse::<u32>().unwrap(), std::process::id());
    }

    #[test]
    fn missing_pidfile_means_not_running() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!already_running(&dir.path().join("absent.pid")));
    }

    #[test]
    fn unparseable_pidfile_means_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.pid");
        std::fs::write(&path, "not a pid\n").unwrap();
        assert!(!already_running(&path));
    }

    #[test]
    fn dead_pid_means_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.pid");
        // Max pid on Linux defaults to 4194304; this one will not be live.
        std::fs::write(&path, "4194000\n").unwrap();
        assert!(!already_running(&path));
    }

    #[test]
    fn own_pid_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.pid");
        write_pidfile(&path).unwrap();
        assert!(!already_running(&path));
    }

    #[test]
    fn live_pid_with_unrelated_cmdline_means_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.pid");
        // pid 1 is alive on any host this test runs on, and is not a bridge.
        std::fs::write(&path, "1\n").unwrap();
        assert!(!already_running(&path));
    }

    #[cfg(unix)]
    #[test]
    fn live_pid_with_matching_cmdline_means_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.pid");
        // A different live process whose command line we can predict: our
        // parent, matched against its own name.
        let parent = std::os::unix::process::parent_id();
        std::fs::write(&path, format!("{parent}\n")).unwrap();

        let mut sys = System::new_with_specifics(
            RefreshKind::nothing().with_processes(ProcessRefreshKind::everything()),
        );
        sys.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(parent)]), true);
        let Some(parent_name) = sys
            .process(Pid::from_u32(parent))
            .map(|p| p.name().to_string_lossy().into_owned())
        else {
            return; // parent vanished, nothing to assert against
        };

        assert!(instance_running(&path, &parent_name));
    }

    #[test]
    fn cleanup_removes_files_once() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("bridge.pid");
        let noncefile = dir.path().join("bridge.nonce");
        std::fs::write(&pidfile, "1234\n").unwrap();
        std::fs::write(&noncefile, [0u8; 16]).unwrap();

        let mut cleanup = Cleanup::new(Some(pidfile.clone()));
        cleanup.register_noncefile(noncefile.clone());
        cleanup.run();
        assert!(!pidfile.exists());
        assert!(!noncefile.exists());

        // Second run must not warn about the now-missing files.
        cleanup.run();
    }
}
