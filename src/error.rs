use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to spawn outer bridge: {0}")]
    Spawn(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Invalid Assuan descriptor: {0}")]
    Descriptor(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Agent RPC failed: {0}")]
    AgentRpc(String),
}

impl BridgeError {
    /// Process exit code for a fatal startup error.
    ///
    /// A missing host executable is the only condition that exits 2 so the
    /// helper scripts can distinguish "install the Windows binary" from
    /// "fix your flags".
    pub fn exit_code(&self) -> i32 {
        match self {
            BridgeError::Spawn(_) => 2,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
