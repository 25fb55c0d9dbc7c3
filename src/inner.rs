//! Inner bridge: the subsystem-side daemon.
//!
//! Exposes one Unix socket listener per enabled class at the canonical
//! gpgconf path and multiplexes each accepted client onto an authenticated
//! TCP connection to the outer bridge.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cli::outer_args;
use crate::config::{Config, Mode, SocketClass};
use crate::error::{BridgeError, Result};
use crate::gpg;
use crate::launcher::{self, HostLauncher};
use crate::lifecycle;
use crate::nonce;
use crate::splice::ConnectionPair;

/// A bound listener for one socket class.
struct ClassListener {
    class: SocketClass,
    listener: UnixListener,
    socket_path: PathBuf,
}

pub struct InnerBridge {
    listeners: Vec<ClassListener>,
    /// Nonce file in the subsystem's view of the host filesystem.
    nonce_path: PathBuf,
    remote_address: IpAddr,
    base_port: u16,
}

impl InnerBridge {
    /// Spawn the outer bridge, sweep stray local agents, and bind the
    /// client-facing sockets.
    pub async fn start(config: &Config, launcher: &dyn HostLauncher) -> Result<InnerBridge> {
        // The nonce file must be addressable on both sides: host form goes
        // to the outer on its command line, subsystem form is what we read.
        let host_nonce_path = match &config.noncefile_path {
            Some(path) => path.clone(),
            None => gpg::host_default_noncefile().await?,
        };
        let nonce_path = launcher::to_subsystem_path(&host_nonce_path).await?;

        spawn_outer(config, launcher, host_nonce_path).await?;
        gpg::stop_local_agents();

        let mut listeners = Vec::new();
        for class in config.enabled_classes() {
            let socket_path = gpg::socket_path(class).await?;
            let listener = bind_socket(&socket_path)?;
            info!("{class} listening on {}", socket_path.display());
            listeners.push(ClassListener {
                class,
                listener,
                socket_path,
            });
        }

        Ok(InnerBridge {
            listeners,
            nonce_path,
            remote_address: config.remote_address,
            base_port: config.base_port,
        })
    }

    /// Serve until a shutdown signal arrives, then close the listeners and
    /// cancel any connections still splicing.
    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut tasks = Vec::new();
        for entry in self.listeners {
            tasks.push(tokio::spawn(accept_loop(
                entry,
                self.nonce_path.clone(),
                self.remote_address,
                self.base_port,
                shutdown_rx.clone(),
            )));
        }
        drop(shutdown_rx);

        lifecycle::wait_for_shutdown(Mode::Inner).await;
        let _ = shutdown_tx.send(true);
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }
}

/// Spawn the outer bridge in the host environment, detached.
async fn spawn_outer(
    config: &Config,
    launcher: &dyn HostLauncher,
    host_nonce_path: PathBuf,
) -> Result<()> {
    let program = launcher::resolve_outer_program(config.windows_exe_path.as_deref())?;
    let host_program = launcher::to_host_path(&program).await?;

    let mut outer_config = config.clone();
    outer_config.noncefile_path = Some(host_nonce_path);
    let args = outer_args(&outer_config);

    let handle = launcher.launch(&host_program, &args)?;
    debug!("outer bridge spawn observed as pid {}", handle.pid);
    Ok(())
}

/// Bind a stream listener at a canonical socket path. A pre-existing socket
/// is replaced; anything else at that path is a fatal configuration error.
pub fn bind_socket(path: &Path) -> Result<UnixListener> {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) => {
            use std::os::unix::fs::FileTypeExt;
            if !metadata.file_type().is_socket() {
                return Err(BridgeError::Config(format!(
                    "{} exists and is not a socket",
                    path.display()
                )));
            }
            std::fs::remove_file(path)?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
        }
        Err(e) => return Err(e.into()),
    }

    let listener = UnixListener::bind(path)?;
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(listener)
}

async fn accept_loop(
    entry: ClassListener,
    nonce_path: PathBuf,
    remote_address: IpAddr,
    base_port: u16,
    mut shutdown: watch::Receiver<bool>,
) {
    let ClassListener {
        class,
        listener,
        socket_path,
    } = entry;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let nonce_path = nonce_path.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        handle_client(stream, class, &nonce_path, remote_address, base_port, shutdown)
                            .await;
                    });
                }
                Err(e) => {
                    error!("accept failed on {class}: {e}");
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    drop(listener);
    if let Err(e) = std::fs::remove_file(&socket_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove socket {}: {e}", socket_path.display());
        }
    }
    debug!("{class} listener closed");
}

/// One client worker: nonce, connect, authenticate, splice.
pub async fn handle_client(
    client: UnixStream,
    class: SocketClass,
    nonce_path: &Path,
    remote_address: IpAddr,
    base_port: u16,
    shutdown: watch::Receiver<bool>,
) {
    let nonce = match nonce::read(nonce_path) {
        Ok(nonce) => nonce,
        Err(e) => {
            warn!("abandoning {class} client: {e}");
            return;
        }
    };

    let port = class.port_for(base_port);
    let mut outbound = match TcpStream::connect((remote_address, port)).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("abandoning {class} client: outer bridge at {remote_address}:{port} unreachable: {e}");
            return;
        }
    };

    if let Err(e) = outbound.write_all(&nonce).await {
        warn!("abandoning {class} client: nonce write failed: {e}");
        return;
    }

    debug!("{class} client connected to {remote_address}:{port}");
    if let Err(e) = ConnectionPair::new(client, outbound, shutdown).run().await {
        debug!("{class} connection ended: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("S.gpg-agent");

        let first = bind_socket(&path).unwrap();
        drop(first);
        // The stale socket file is still on disk; a second bind must win.
        assert!(path.exists());
        bind_socket(&path).unwrap();
    }

    #[tokio::test]
    async fn bind_rejects_non_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("S.gpg-agent");
        std::fs::write(&path, "not a socket").unwrap();

        let err = bind_socket(&path).unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
        // The offending file is left in place for the operator to inspect.
        assert!(path.exists());
    }

    #[tokio::test]
    async fn bind_creates_missing_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gnupg").join("S.gpg-agent");
        bind_socket(&path).unwrap();
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn bound_socket_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("S.gpg-agent");
        let _listener = bind_socket(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn short_nonce_abandons_before_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let nonce_path = dir.path().join("bridge.nonce");
        std::fs::write(&nonce_path, [7u8; 9]).unwrap();

        let socket_path = dir.path().join("S.gpg-agent");
        let listener = bind_socket(&socket_path).unwrap();
        let client = UnixStream::connect(&socket_path).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        let (_tx, rx) = watch::channel(false);
        // Port 1 is closed; if the worker tried to connect it would error
        // differently, but with a short nonce it must return before that.
        handle_client(
            accepted,
            SocketClass::AgentMain,
            &nonce_path,
            "127.0.0.1".parse().unwrap(),
            1,
            rx,
        )
        .await;
        drop(client);
    }
}
