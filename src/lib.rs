//! Bridge GPG and SSH agent traffic from a WSL-style subsystem to the
//! Windows-native gpg-agent.
//!
//! Two roles share this crate: the [`inner`] bridge serves the subsystem's
//! filesystem sockets and tunnels each client over authenticated TCP; the
//! [`outer`] bridge terminates those tunnels on the native agent's IPC
//! endpoints. See `DESIGN.md` for the component map.

pub mod assuan;
pub mod cli;
pub mod config;
pub mod error;
pub mod gpg;
#[cfg(unix)]
pub mod inner;
pub mod launcher;
pub mod lifecycle;
pub mod logging;
pub mod nonce;
pub mod outer;
pub mod pageant;
pub mod splice;
