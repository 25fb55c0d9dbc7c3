//! Cross-environment spawning of the outer bridge.
//!
//! The inner bridge runs inside the subsystem but must start a process in
//! the host environment. Path translation goes through `wslpath`; the actual
//! launch goes through the [`HostLauncher`] capability so the platform
//! specifics stay swappable and testable with a fake.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tracing::{debug, info};

use crate::error::{BridgeError, Result};

/// Handle to a spawned outer bridge.
///
/// The outer is detached into its own session and intentionally outlives
/// inner restarts; the handle carries only the observed pid for logging.
/// Stopping a running outer goes through its own pidfile, not this handle.
#[derive(Debug, Clone, Copy)]
pub struct ChildHandle {
    pub pid: u32,
}

/// Capability to start a process in the host environment.
pub trait HostLauncher: Send + Sync {
    fn launch(&self, host_program: &Path, args: &[String]) -> Result<ChildHandle>;
}

/// Production launcher: executes the host program directly (WSL forwards
/// host executables through binfmt) as a doubly-forked, session-detached
/// child so the outer survives even if the inner is killed.
pub struct WslLauncher;

impl HostLauncher for WslLauncher {
    #[cfg(unix)]
    fn launch(&self, host_program: &Path, args: &[String]) -> Result<ChildHandle> {
        use std::os::unix::process::CommandExt;

        let mut cmd = std::process::Command::new(host_program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // SAFETY: the pre_exec closure runs in the child between fork() and
        // exec() and only calls async-signal-safe functions. The first fork
        // level becomes a session leader and forks again; the intermediate
        // exits so the grandchild is reparented away from us.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                match libc::fork() {
                    -1 => Err(std::io::Error::last_os_error()),
                    0 => Ok(()),
                    _ => libc::_exit(0),
                }
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| BridgeError::Spawn(format!("{}: {e}", host_program.display())))?;
        let pid = child.id();
        // Reap the intermediate; the detached grandchild lives on.
        let _ = child.wait();

        info!("spawned outer bridge via {}", host_program.display());
        Ok(ChildHandle { pid })
    }

    #[cfg(not(unix))]
    fn launch(&self, host_program: &Path, args: &[String]) -> Result<ChildHandle> {
        let child = std::process::Command::new(host_program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| BridgeError::Spawn(format!("{}: {e}", host_program.display())))?;
        Ok(ChildHandle { pid: child.id() })
    }
}

/// Translate a subsystem path to its host-visible form (`wslpath -w`).
pub async fn to_host_path(path: &Path) -> Result<PathBuf> {
    wslpath("-w", path).await
}

/// Translate a host path to its subsystem-visible form (`wslpath -u`).
pub async fn to_subsystem_path(path: &Path) -> Result<PathBuf> {
    wslpath("-u", path).await
}

async fn wslpath(flag: &str, path: &Path) -> Result<PathBuf> {
    let output = tokio::process::Command::new("wslpath")
        .arg(flag)
        .arg(path)
        .output()
        .await
        .map_err(|e| BridgeError::Spawn(format!("wslpath not runnable: {e}")))?;

    if !output.status.success() {
        return Err(BridgeError::Spawn(format!(
            "wslpath {flag} {} exited with {}",
            path.display(),
            output.status
        )));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let translated = text.trim();
    if translated.is_empty() {
        return Err(BridgeError::Spawn(format!(
            "wslpath produced no translation for {}",
            path.display()
        )));
    }
    debug!("translated {} -> {translated}", path.display());
    Ok(PathBuf::from(translated))
}

/// Resolve the outer bridge program in the subsystem's view of the
/// filesystem: the configured override, or this binary's own name with
/// `.exe` appended, next to it. Missing program is a spawn error (exit 2).
pub fn resolve_outer_program(override_path: Option<&Path>) -> Result<PathBuf> {
    let program = match override_path {
        Some(path) => path.to_path_buf(),
        None => {
            let own = std::env::current_exe()
                .map_err(|e| BridgeError::Spawn(format!("cannot resolve own path: {e}")))?;
            let mut name = own
                .file_name()
                .ok_or_else(|| BridgeError::Spawn("own path has no file name".to_string()))?
                .to_os_string();
            name.push(".exe");
            own.with_file_name(name)
        }
    };

    if !program.exists() {
        return Err(BridgeError::Spawn(format!(
            "outer bridge executable {} not found",
            program.display()
        )));
    }
    Ok(program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records launches instead of performing them.
    pub struct RecordingLauncher {
        pub launches: Mutex<Vec<(PathBuf, Vec<String>)>>,
    }

    impl RecordingLauncher {
        pub fn new() -> Self {
            Self {
                launches: Mutex::new(Vec::new()),
            }
        }
    }

    impl HostLauncher for RecordingLauncher {
        fn launch(&self, host_program: &Path, args: &[String]) -> Result<ChildHandle> {
            self.launches
                .lock()
                .unwrap()
                .push((host_program.to_path_buf(), args.to_vec()));
            Ok(ChildHandle { pid: 4242 })
        }
    }

    #[test]
    fn resolve_override_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gpg-bridge.exe");
        let err = resolve_outer_program(Some(&missing)).unwrap_err();
        assert!(matches!(err, BridgeError::Spawn(_)));
        assert_eq!(err.exit_code(), 2);

        std::fs::write(&missing, b"").unwrap();
        let resolved = resolve_outer_program(Some(&missing)).unwrap();
        assert_eq!(resolved, missing);
    }

    #[test]
    fn recording_launcher_captures_args() {
        let launcher = RecordingLauncher::new();
        let handle = launcher
            .launch(
                Path::new("C:\\tools\\gpg-bridge.exe"),
                &["--mode".to_string(), "outer".to_string()],
            )
            .unwrap();
        assert_eq!(handle.pid, 4242);

        let launches = launcher.launches.lock().unwrap();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].1, vec!["--mode", "outer"]);
    }
}
