//! Pairing nonce: 16 raw bytes, no framing.
//!
//! The outer bridge generates the nonce at startup and persists it to a file
//! readable only by the owning user; the inner bridge reads the same file
//! (through the subsystem's view of the host filesystem) and presents the
//! bytes as the first 16 of every TCP connection.

use std::path::Path;

use rand::RngCore;

use crate::error::{BridgeError, Result};

pub const NONCE_LEN: usize = 16;

pub type Nonce = [u8; NONCE_LEN];

/// Generate a fresh nonce and persist it at `path`, mode 0600.
///
/// Parent directories are created as needed. Returns the in-memory copy the
/// outer bridge authenticates against.
pub fn create(path: &Path) -> Result<Nonce> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, nonce)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(nonce)
}

/// Read the nonce back. Fewer than 16 bytes means the pairing is broken and
/// the caller must not open a connection with it.
pub fn read(path: &Path) -> Result<Nonce> {
    let bytes = std::fs::read(path).map_err(|e| {
        BridgeError::Auth(format!("nonce file {} unreadable: {e}", path.display()))
    })?;
    if bytes.len() < NONCE_LEN {
        return Err(BridgeError::Auth(format!(
            "nonce file {} holds {} bytes, expected {NONCE_LEN}",
            path.display(),
            bytes.len()
        )));
    }
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&bytes[..NONCE_LEN]);
    Ok(nonce)
}

/// Best-effort removal on clean exit.
pub fn remove(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("failed to remove nonce file {}: {e}", path.display());
        }
    }
}
