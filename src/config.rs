use std::net::IpAddr;
use std::path::PathBuf;

use crate::error::{BridgeError, Result};

/// Default first port of the contiguous block the bridge pair uses.
pub const DEFAULT_BASE_PORT: u16 = 6910;

/// Filename of the pairing nonce under the agent's home directory.
pub const NONCE_FILE_NAME: &str = "bridge.nonce";

/// Which half of the bridge pair this process runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Subsystem side: Unix socket listeners, connects out to the outer bridge.
    Inner,
    /// Windows side: TCP listeners, terminates on the native agent.
    Outer,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Inner => write!(f, "inner"),
            Mode::Outer => write!(f, "outer"),
        }
    }
}

/// How a socket class reaches the native agent on the Windows side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    /// Byte-stream splice to the agent's Assuan-emulation TCP endpoint.
    Assuan,
    /// Request/response exchange over the agent's Pageant-style window.
    WindowsMessageCopy,
}

/// One of the four logical agent endpoints.
///
/// The variant order is the wire order: `port_for` maps each class to
/// `base_port + index`, and both bridges derive their listener sets from
/// the same `enabled` list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketClass {
    AgentMain,
    AgentExtra,
    AgentBrowser,
    AgentSsh,
}

impl SocketClass {
    pub const ALL: [SocketClass; 4] = [
        SocketClass::AgentMain,
        SocketClass::AgentExtra,
        SocketClass::AgentBrowser,
        SocketClass::AgentSsh,
    ];

    /// The gpgconf name for this socket, used to resolve both the subsystem
    /// filesystem path and the Windows endpoint descriptor.
    pub fn gpgconf_name(self) -> &'static str {
        match self {
            SocketClass::AgentMain => "agent-socket",
            SocketClass::AgentExtra => "agent-extra-socket",
            SocketClass::AgentBrowser => "agent-browser-socket",
            SocketClass::AgentSsh => "agent-ssh-socket",
        }
    }

    pub fn index(self) -> u16 {
        match self {
            SocketClass::AgentMain => 0,
            SocketClass::AgentExtra => 1,
            SocketClass::AgentBrowser => 2,
            SocketClass::AgentSsh => 3,
        }
    }

    pub fn port_for(self, base_port: u16) -> u16 {
        base_port + self.index()
    }

    pub fn forward_mode(self) -> ForwardMode {
        match self {
            SocketClass::AgentSsh => ForwardMode::WindowsMessageCopy,
            _ => ForwardMode::Assuan,
        }
    }

    /// The classes served for a given SSH toggle, in index order.
    pub fn enabled(enable_ssh: bool) -> Vec<SocketClass> {
        SocketClass::ALL
            .into_iter()
            .filter(|c| enable_ssh || *c != SocketClass::AgentSsh)
            .collect()
    }
}

impl std::fmt::Display for SocketClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.gpgconf_name())
    }
}

/// Immutable runtime configuration, built once from the CLI.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    /// Address the inner bridge uses to reach the outer bridge.
    pub remote_address: IpAddr,
    /// Bind address for the outer bridge's TCP listeners.
    pub windows_address: IpAddr,
    pub base_port: u16,
    pub enable_ssh: bool,
    /// Shared-nonce file. `None` means "derive from the agent homedir at
    /// startup" (the homedir is only known once gpgconf has been queried).
    pub noncefile_path: Option<PathBuf>,
    pub logfile_path: Option<PathBuf>,
    pub pidfile_path: Option<PathBuf>,
    pub daemonize: bool,
    pub log_level: LogLevel,
    /// Log/PID paths forwarded verbatim to the spawned outer bridge.
    pub windows_logfile_path: Option<PathBuf>,
    pub windows_pidfile_path: Option<PathBuf>,
    /// Host-side program for the outer bridge. `None` means "this binary's
    /// name with `.exe` appended, next to it".
    pub windows_exe_path: Option<PathBuf>,
}

impl Config {
    /// Reject combinations that cannot produce a working daemon.
    pub fn validate(&self) -> Result<()> {
        if self.daemonize && self.pidfile_path.is_none() {
            return Err(BridgeError::Config(
                "--daemon requires --pidfile".to_string(),
            ));
        }
        if self.base_port.checked_add(3).is_none() {
            return Err(BridgeError::Config(format!(
                "base port {} leaves no room for 4 consecutive ports",
                self.base_port
            )));
        }
        Ok(())
    }

    pub fn enabled_classes(&self) -> Vec<SocketClass> {
        SocketClass::enabled(self.enable_ssh)
    }
}

/// Severity threshold for the logging sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Unknown,
}

impl LogLevel {
    pub fn parse(s: &str) -> LogLevel {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => LogLevel::Debug,
            "INFO" => LogLevel::Info,
            "WARN" => LogLevel::Warn,
            "ERROR" => LogLevel::Error,
            "FATAL" => LogLevel::Fatal,
            _ => LogLevel::Unknown,
        }
    }

    /// Directive string for the tracing `EnvFilter`.
    ///
    /// FATAL and UNKNOWN have no tracing equivalent; both collapse to the
    /// quietest filter that still shows fatal startup errors.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Fatal | LogLevel::Unknown => "error",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
            LogLevel::Unknown => "UNKNOWN",
        }
    }
}
