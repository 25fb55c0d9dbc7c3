//! Assuan socket-emulation descriptor.
//!
//! On Windows the agent cannot serve Unix sockets, so each "socket" path
//! holds a small descriptor instead: an ASCII decimal port, a single `0x0A`,
//! then exactly 16 raw nonce bytes. The agent writes the file atomically
//! before the loopback port is listening; we re-read it on every connection
//! because the agent rotates ports across restarts.

use std::path::Path;

use crate::error::{BridgeError, Result};
use crate::nonce::{Nonce, NONCE_LEN};

/// A parsed descriptor: where the agent listens on loopback, and the nonce
/// it expects as the first bytes of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssuanDescriptor {
    pub port: u16,
    pub nonce: Nonce,
}

impl AssuanDescriptor {
    /// Parse the raw file contents.
    pub fn parse(bytes: &[u8]) -> Result<AssuanDescriptor> {
        let newline = bytes
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| BridgeError::Descriptor("no newline after port".to_string()))?;

        let port_text = std::str::from_utf8(&bytes[..newline])
            .map_err(|_| BridgeError::Descriptor("port is not ASCII".to_string()))?;
        let port: u16 = port_text
            .parse()
            .map_err(|_| BridgeError::Descriptor(format!("invalid port {port_text:?}")))?;

        let rest = &bytes[newline + 1..];
        if rest.len() != NONCE_LEN {
            return Err(BridgeError::Descriptor(format!(
                "nonce is {} bytes, expected {NONCE_LEN}",
                rest.len()
            )));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(rest);

        Ok(AssuanDescriptor { port, nonce })
    }

    /// Read and parse the descriptor file at `path`.
    pub fn read(path: &Path) -> Result<AssuanDescriptor> {
        let bytes = std::fs::read(path).map_err(|e| {
            BridgeError::Descriptor(format!("{} unreadable: {e}", path.display()))
        })?;
        Self::parse(&bytes)
    }
}
