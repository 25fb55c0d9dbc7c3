//! Common test utilities and helpers
#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use gpg_bridge::config::{Config, LogLevel, Mode};
use gpg_bridge::nonce::NONCE_LEN;
use gpg_bridge::pageant::{AgentWindow, RpcError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Outer-bridge config bound to loopback with ephemeral ports.
pub fn outer_config(enable_ssh: bool) -> Config {
    Config {
        mode: Mode::Outer,
        remote_address: "127.0.0.1".parse().unwrap(),
        windows_address: "127.0.0.1".parse().unwrap(),
        base_port: 0,
        enable_ssh,
        noncefile_path: None,
        logfile_path: None,
        pidfile_path: None,
        daemonize: false,
        log_level: LogLevel::Info,
        windows_logfile_path: None,
        windows_pidfile_path: None,
        windows_exe_path: None,
    }
}

/// A stand-in for the native agent's Assuan-emulation endpoint: verifies
/// the descriptor nonce, records the request, answers with a fixed reply.
pub struct FakeAssuanAgent {
    pub port: u16,
    pub nonce: [u8; NONCE_LEN],
    pub received: Arc<Mutex<Vec<u8>>>,
    pub connections: Arc<Mutex<usize>>,
}

impl FakeAssuanAgent {
    pub async fn start(reply: Vec<u8>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let nonce: [u8; NONCE_LEN] = std::array::from_fn(|i| (i as u8).wrapping_mul(7));
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(Mutex::new(0));

        let received_clone = received.clone();
        let connections_clone = connections.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                *connections_clone.lock().unwrap() += 1;
                let received = received_clone.clone();
                let reply = reply.clone();
                tokio::spawn(async move {
                    let mut presented = [0u8; NONCE_LEN];
                    if stream.read_exact(&mut presented).await.is_err() {
                        return;
                    }
                    if presented != nonce {
                        return;
                    }
                    let mut buf = [0u8; 4096];
                    if let Ok(n) = stream.read(&mut buf).await {
                        received.lock().unwrap().extend_from_slice(&buf[..n]);
                    }
                    let _ = stream.write_all(&reply).await;
                });
            }
        });

        Self {
            port,
            nonce,
            received,
            connections,
        }
    }

    /// Write this agent's descriptor file the way gpg-agent does.
    pub fn write_descriptor(&self, path: &Path) {
        let mut bytes = self.port.to_string().into_bytes();
        bytes.push(b'\n');
        bytes.extend_from_slice(&self.nonce);
        std::fs::write(path, bytes).unwrap();
    }

    pub fn received_bytes(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }

    pub fn connection_count(&self) -> usize {
        *self.connections.lock().unwrap()
    }
}

/// Scripted agent window: pops one canned outcome per exchange.
pub struct ScriptedWindow {
    pub script: Mutex<VecDeque<Result<Vec<u8>, RpcError>>>,
    pub requests: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl ScriptedWindow {
    pub fn new(script: Vec<Result<Vec<u8>, RpcError>>) -> (Self, Arc<Mutex<Vec<Vec<u8>>>>) {
        let requests = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                script: Mutex::new(script.into()),
                requests: requests.clone(),
            },
            requests,
        )
    }
}

impl AgentWindow for ScriptedWindow {
    fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, RpcError> {
        self.requests.lock().unwrap().push(request.to_vec());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(RpcError::Other("script exhausted".to_string())))
    }

    fn reopen(&mut self) -> Result<(), RpcError> {
        Ok(())
    }
}
