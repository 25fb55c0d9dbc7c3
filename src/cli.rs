use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

use crate::config::{Config, LogLevel, Mode, DEFAULT_BASE_PORT};
use crate::error::{BridgeError, Result};

#[derive(Parser, Debug, Clone)]
#[command(name = "gpg-bridge")]
#[command(
    author,
    version,
    about = "Bridge GPG and SSH agent sockets from a WSL subsystem to the Windows-native gpg-agent"
)]
pub struct Cli {
    /// Run as `inner` (subsystem side) or `outer` (Windows side)
    #[arg(long = "mode", value_name = "ROLE", default_value = "inner")]
    pub mode: String,

    /// Address the inner bridge uses to reach the outer bridge
    #[arg(long = "remote-address", default_value = "127.0.0.1")]
    pub remote_address: IpAddr,

    /// Bind address for the outer bridge's TCP listeners
    #[arg(long = "windows-address", default_value = "0.0.0.0")]
    pub windows_address: IpAddr,

    /// First of the 3 (or 4 with --enable-ssh) consecutive bridge ports
    #[arg(long = "base-port", default_value_t = DEFAULT_BASE_PORT)]
    pub base_port: u16,

    /// Also bridge the SSH agent socket (adds port base+3)
    #[arg(long = "enable-ssh")]
    pub enable_ssh: bool,

    /// Shared-nonce file (default: <agent homedir>/bridge.nonce)
    #[arg(long = "noncefile")]
    pub noncefile: Option<PathBuf>,

    /// Append log output to this file instead of stderr
    #[arg(long = "logfile")]
    pub logfile: Option<PathBuf>,

    /// PID-file interlock path; required with --daemon
    #[arg(long = "pidfile")]
    pub pidfile: Option<PathBuf>,

    /// Detach from the terminal and run in the background
    #[arg(long = "daemon")]
    pub daemon: bool,

    /// Log level (DEBUG, INFO, WARN, ERROR, FATAL)
    #[arg(long = "log-level", default_value = "INFO")]
    pub log_level: String,

    /// Logfile path passed through to the spawned outer bridge
    #[arg(long = "windows-logfile")]
    pub windows_logfile: Option<PathBuf>,

    /// Pidfile path passed through to the spawned outer bridge
    #[arg(long = "windows-pidfile")]
    pub windows_pidfile: Option<PathBuf>,

    /// Host-side executable for the outer bridge
    /// (default: this binary's name with `.exe`, in the same directory)
    #[arg(long = "windows-exe")]
    pub windows_exe: Option<PathBuf>,
}

impl Cli {
    pub fn into_config(self) -> Result<Config> {
        let mode = match self.mode.as_str() {
            "inner" => Mode::Inner,
            "outer" => Mode::Outer,
            other => {
                return Err(BridgeError::Config(format!(
                    "unknown mode {other:?}, expected \"inner\" or \"outer\""
                )))
            }
        };

        let config = Config {
            mode,
            remote_address: self.remote_address,
            windows_address: self.windows_address,
            base_port: self.base_port,
            enable_ssh: self.enable_ssh,
            noncefile_path: self.noncefile,
            logfile_path: self.logfile,
            pidfile_path: self.pidfile,
            daemonize: self.daemon,
            log_level: LogLevel::parse(&self.log_level),
            windows_logfile_path: self.windows_logfile,
            windows_pidfile_path: self.windows_pidfile,
            windows_exe_path: self.windows_exe,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Build the argument vector for the spawned outer bridge from the inner's
/// own configuration. The outer binds on the Windows side, so the inner's
/// `windows_*` pass-throughs become the outer's primary paths.
pub fn outer_args(config: &Config) -> Vec<String> {
    let mut args = vec![
        "--mode".to_string(),
        "outer".to_string(),
        "--base-port".to_string(),
        config.base_port.to_string(),
        "--windows-address".to_string(),
        config.windows_address.to_string(),
        "--log-level".to_string(),
        config.log_level.as_str().to_string(),
    ];
    if config.enable_ssh {
        args.push("--enable-ssh".to_string());
    }
    if let Some(path) = &config.noncefile_path {
        args.push("--noncefile".to_string());
        args.push(path.display().to_string());
    }
    if let Some(path) = &config.windows_logfile_path {
        args.push("--logfile".to_string());
        args.push(path.display().to_string());
    }
    if let Some(path) = &config.windows_pidfile_path {
        args.push("--pidfile".to_string());
        args.push(path.display().to_string());
        args.push("--daemon".to_string());
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("gpg-bridge").chain(args.iter().copied()))
    }

    #[test]
    fn defaults() {
        let config = parse(&[]).into_config().unwrap();
        assert_eq!(config.mode, Mode::Inner);
        assert_eq!(config.base_port, DEFAULT_BASE_PORT);
        assert!(!config.enable_ssh);
        assert_eq!(config.remote_address, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.windows_address, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.log_level, LogLevel::Info);
    }

    #[test]
    fn outer_mode_parses() {
        let config = parse(&["--mode", "outer"]).into_config().unwrap();
        assert_eq!(config.mode, Mode::Outer);
    }

    #[test]
    fn bogus_mode_is_config_error() {
        let err = parse(&["--mode", "sideways"]).into_config().unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn daemon_without_pidfile_is_config_error() {
        let err = parse(&["--daemon"]).into_config().unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn outer_args_carry_the_pair_contract() {
        let config = parse(&[
            "--enable-ssh",
            "--base-port",
            "7000",
            "--noncefile",
            "/mnt/c/Users/me/.gnupg/bridge.nonce",
            "--windows-pidfile",
            "C:\\Temp\\bridge.pid",
        ])
        .into_config()
        .unwrap();

        let args = outer_args(&config);
        assert!(args.contains(&"--mode".to_string()));
        assert!(args.contains(&"outer".to_string()));
        assert!(args.contains(&"7000".to_string()));
        assert!(args.contains(&"--enable-ssh".to_string()));
        assert!(args.contains(&"--noncefile".to_string()));
        assert!(args.contains(&"/mnt/c/Users/me/.gnupg/bridge.nonce".to_string()));
        assert!(args.contains(&"--daemon".to_string()));
        assert!(args.contains(&"C:\\Temp\\bridge.pid".to_string()));
        // The outer never inherits the inner's own logfile/pidfile.
        assert!(!args.contains(&"--windows-pidfile".to_string()));
    }

    #[test]
    fn outer_args_omit_daemon_without_windows_pidfile() {
        let config = parse(&[]).into_config().unwrap();
        let args = outer_args(&config);
        assert!(!args.contains(&"--daemon".to_string()));
    }
}
