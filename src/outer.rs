//! Outer bridge: the Windows-side daemon.
//!
//! Accepts TCP connections from the inner bridge, authenticates them by the
//! 16-byte pairing nonce, and forwards per socket class: a byte splice to
//! the agent's Assuan-emulation endpoint for the GPG classes, the
//! message-copy adapter for the SSH class.

use std::path::PathBuf;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::assuan::AssuanDescriptor;
use crate::config::{Config, ForwardMode, Mode, SocketClass};
use crate::error::Result;
use crate::gpg;
use crate::lifecycle;
use crate::nonce::{self, Nonce, NONCE_LEN};
use crate::pageant::{self, AgentHandle};
use crate::splice::ConnectionPair;

struct ClassListener {
    class: SocketClass,
    listener: TcpListener,
    /// Descriptor file for Assuan classes; `None` for the SSH class.
    descriptor_path: Option<PathBuf>,
}

pub struct OuterBridge {
    listeners: Vec<ClassListener>,
    nonce: Nonce,
    noncefile: PathBuf,
    ssh: Option<AgentHandle>,
}

impl OuterBridge {
    /// Probe the agent, persist a fresh pairing nonce, and bind one TCP
    /// listener per enabled class.
    pub async fn start(config: &Config) -> Result<OuterBridge> {
        gpg::launch_agent().await;

        let noncefile = match &config.noncefile_path {
            Some(path) => path.clone(),
            None => gpg::default_noncefile().await,
        };

        let mut descriptors = Vec::new();
        for class in config.enabled_classes() {
            if class.forward_mode() == ForwardMode::Assuan {
                descriptors.push((class, gpg::socket_path(class).await?));
            }
        }

        let ssh = if config.enable_ssh {
            Some(pageant::spawn(platform_window()?))
        } else {
            None
        };

        Self::bind(config, noncefile, descriptors, ssh).await
    }

    /// Bind listeners with explicit collaborators. Production goes through
    /// [`OuterBridge::start`]; tests inject descriptor paths and a scripted
    /// agent window.
    pub async fn bind(
        config: &Config,
        noncefile: PathBuf,
        descriptors: Vec<(SocketClass, PathBuf)>,
        ssh: Option<AgentHandle>,
    ) -> Result<OuterBridge> {
        let nonce = nonce::create(&noncefile)?;

        let mut listeners = Vec::new();
        for class in config.enabled_classes() {
            let port = class.port_for(config.base_port);
            let listener = TcpListener::bind((config.windows_address, port)).await?;
            let descriptor_path = descriptors
                .iter()
                .find(|(c, _)| *c == class)
                .map(|(_, path)| path.clone());
            info!("{class} listening on {}:{port}", config.windows_address);
            listeners.push(ClassListener {
                class,
                listener,
                descriptor_path,
            });
        }

        Ok(OuterBridge {
            listeners,
            nonce,
            noncefile,
            ssh,
        })
    }

    /// Path of the nonce file this bridge created, for cleanup registration.
    pub fn noncefile(&self) -> &PathBuf {
        &self.noncefile
    }

    /// Ports actually bound, in class order. Lets tests bind port 0.
    pub fn local_ports(&self) -> Vec<u16> {
        self.listeners
            .iter()
            .filter_map(|entry| entry.listener.local_addr().ok())
            .map(|addr| addr.port())
            .collect()
    }

    /// Serve until a shutdown signal arrives.
    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = self.spawn_accept_loops(shutdown_rx);

        lifecycle::wait_for_shutdown(Mode::Outer).await;
        let _ = shutdown_tx.send(true);
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }

    /// Start the accept loops on an externally owned shutdown channel.
    pub fn spawn_accept_loops(
        self,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let nonce = self.nonce;
        let ssh = self.ssh;
        self.listeners
            .into_iter()
            .map(|entry| {
                tokio::spawn(accept_loop(entry, nonce, ssh.clone(), shutdown.clone()))
            })
            .collect()
    }
}

/// Resolve the platform's agent window transport.
#[cfg(windows)]
fn platform_window() -> Result<Box<dyn pageant::AgentWindow>> {
    use crate::error::BridgeError;
    let window = pageant::windows::PageantWindow::open()
        .map_err(|e| BridgeError::AgentRpc(e.to_string()))?;
    Ok(Box::new(window))
}

#[cfg(not(windows))]
fn platform_window() -> Result<Box<dyn pageant::AgentWindow>> {
    use crate::error::BridgeError;
    Err(BridgeError::AgentRpc(
        "the SSH agent window only exists on the Windows side".to_string(),
    ))
}

async fn accept_loop(
    entry: ClassListener,
    nonce: Nonce,
    ssh: Option<AgentHandle>,
    mut shutdown: watch::Receiver<bool>,
) {
    let ClassListener {
        class,
        listener,
        descriptor_path,
    } = entry;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("{class} connection from {peer}");
                    let descriptor_path = descriptor_path.clone();
                    let ssh = ssh.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        handle_peer(stream, class, nonce, descriptor_path, ssh, shutdown).await;
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
    debug!("{class} listener closed");
}

/// Authenticate one peer, then hand it to the class's forwarder.
///
/// Nothing is forwarded to the agent until the first 16 bytes have matched
/// the in-memory nonce; the descriptor read deliberately happens after the
/// check so unauthenticated peers learn nothing about the agent.
pub async fn handle_peer(
    mut peer: TcpStream,
    class: SocketClass,
    nonce: Nonce,
    descriptor_path: Option<PathBuf>,
    ssh: Option<AgentHandle>,
    shutdown: watch::Receiver<bool>,
) {
    let mut presented = [0u8; NONCE_LEN];
    if let Err(e) = peer.read_exact(&mut presented).await {
        error!("{class} peer closed before authenticating: {e}");
        return;
    }
    if presented != nonce {
        error!("{class} peer presented a wrong pairing nonce, dropping");
        return;
    }

    match class.forward_mode() {
        ForwardMode::Assuan => {
            let Some(path) = descriptor_path else {
                error!("{class} has no descriptor path configured");
                return;
            };
            forward_assuan(peer, class, &path, shutdown).await;
        }
        ForwardMode::WindowsMessageCopy => {
            let Some(agent) = ssh else {
                error!("{class} has no agent window adapter");
                return;
            };
            forward_ssh(peer, class, agent).await;
        }
    }
}

/// Splice the peer onto the agent's Assuan-emulation TCP endpoint.
///
/// The descriptor is re-read for every connection: the agent rewrites it
/// with a fresh port and nonce whenever it restarts.
async fn forward_assuan(
    peer: TcpStream,
    class: SocketClass,
    descriptor_path: &std::path::Path,
    shutdown: watch::Receiver<bool>,
) {
    let descriptor = match AssuanDescriptor::read(descriptor_path) {
        Ok(descriptor) => descriptor,
        Err(e) => {
            error!("{class}: {e}");
            return;
        }
    };

    let mut agent = match TcpStream::connect(("127.0.0.1", descriptor.port)).await {
        Ok(stream) => stream,
        Err(e) => {
            error!("{class}: agent at 127.0.0.1:{} unreachable: {e}", descriptor.port);
            return;
        }
    };
    if let Err(e) = agent.write_all(&descriptor.nonce).await {
        error!("{class}: agent nonce write failed: {e}");
        return;
    }

    if let Err(e) = ConnectionPair::new(peer, agent, shutdown).run().await {
        debug!("{class} connection ended: {e}");
    }
}

/// Request/response forwarding through the serialized agent window actor.
///
/// Each client request runs its full exchange before the next is serviced;
/// adapter failures close only this client.
async fn forward_ssh(mut peer: TcpStream, class: SocketClass, agent: AgentHandle) {
    let mut buf = [0u8; 4096];
    loop {
        let n = match peer.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("{class} client read failed: {e}");
                break;
            }
        };

        let reply = match agent.request(buf[..n].to_vec()).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("{class} agent exchange failed: {e}");
                break;
            }
        };

        if let Err(e) = peer.write_all(&reply).await {
            debug!("{class} client write failed: {e}");
            break;
        }
    }
    debug!("{class} client done");
}
