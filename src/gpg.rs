//! GPG toolchain integration: gpgconf path queries and agent process control.
//!
//! Both bridge halves resolve endpoint locations through `gpgconf
//! --list-dirs`, which reports the canonical per-class socket paths on the
//! subsystem side and the Assuan descriptor paths on the Windows side.

use std::path::PathBuf;

use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, RefreshKind, Signal, System};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{SocketClass, NONCE_FILE_NAME};
use crate::error::{BridgeError, Result};

/// Name of the native agent process we probe, and the subsystem process the
/// inner bridge sweeps away at startup.
const AGENT_PROCESS: &str = "gpg-agent";

/// Query `<program> --list-dirs <key>` and return the reported path.
async fn list_dir_with(program: &str, key: &str) -> Result<PathBuf> {
    let output = Command::new(program)
        .args(["--list-dirs", key])
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BridgeError::Spawn(format!("{program} not found"))
            } else {
                BridgeError::Config(format!("{program} not runnable: {e}"))
            }
        })?;

    if !output.status.success() {
        return Err(BridgeError::Config(format!(
            "{program} --list-dirs {key} exited with {}",
            output.status
        )));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let path = text.trim();
    if path.is_empty() {
        return Err(BridgeError::Config(format!(
            "{program} reported no path for {key}"
        )));
    }
    Ok(PathBuf::from(path))
}

async fn list_dir(key: &str) -> Result<PathBuf> {
    list_dir_with("gpgconf", key).await
}

/// Canonical endpoint path for a socket class: the Unix socket location on
/// the subsystem side, the Assuan descriptor location on the Windows side.
pub async fn socket_path(class: SocketClass) -> Result<PathBuf> {
    list_dir(class.gpgconf_name()).await
}

/// The agent's home directory, parent of the default nonce file.
pub async fn homedir() -> Result<PathBuf> {
    list_dir("homedir").await
}

/// Default pairing-nonce path: `<agent homedir>/bridge.nonce`, falling back
/// to the user's home directory when gpgconf is unavailable.
pub async fn default_noncefile() -> PathBuf {
    match homedir().await {
        Ok(dir) => dir.join(NONCE_FILE_NAME),
        Err(e) => {
            warn!("gpgconf homedir lookup failed ({e}), using home directory");
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".gnupg")
                .join(NONCE_FILE_NAME)
        }
    }
}

/// Default nonce path as seen by the host, for the inner side: queried
/// through the host's own gpgconf (`gpgconf.exe`, callable from the
/// subsystem). The caller translates this to a subsystem path for reading.
pub async fn host_default_noncefile() -> Result<PathBuf> {
    let homedir = list_dir_with("gpgconf.exe", "homedir").await?;
    Ok(homedir.join(NONCE_FILE_NAME))
}

/// Best-effort agent probe on the outer side: ask gpgconf to launch the
/// agent if it is not already running. Failure is logged, never fatal.
pub async fn launch_agent() {
    match Command::new("gpgconf")
        .args(["--launch", AGENT_PROCESS])
        .status()
        .await
    {
        Ok(status) if status.success() => debug!("agent probe ok"),
        Ok(status) => warn!("gpgconf --launch {AGENT_PROCESS} exited with {status}"),
        Err(e) => warn!("agent probe failed: {e}"),
    }
}

/// Best-effort sweep of subsystem-local agents on inner startup.
///
/// A local gpg-agent holding the canonical sockets would shadow the bridge,
/// so any process named `gpg-agent` is terminated. Failure to find or kill
/// one is non-fatal.
pub fn stop_local_agents() {
    let mut sys = System::new_with_specifics(
        RefreshKind::nothing().with_processes(ProcessRefreshKind::everything()),
    );
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let mut stopped = 0usize;
    for (pid, process) in sys.processes() {
        if process.name().to_string_lossy() != AGENT_PROCESS {
            continue;
        }
        // SIGTERM lets the agent clean up its sockets; fall back to a hard
        // kill where the platform has no term signal.
        let killed = process
            .kill_with(Signal::Term)
            .unwrap_or_else(|| process.kill());
        if killed {
            info!("stopped local {AGENT_PROCESS} (pid {pid})");
            stopped += 1;
        } else {
            warn!("could not stop local {AGENT_PROCESS} (pid {pid})");
        }
    }
    if stopped == 0 {
        debug!("no local {AGENT_PROCESS} running");
    }
}
