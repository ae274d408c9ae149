//! Error types for the Aura bridge

use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Result type alias for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors that can occur anywhere in the bridge.
///
/// Only [`BridgeError::Config`] is ever surfaced to the setup caller. The
/// connection family (`Auth`, `Network`, `Timeout`, `Protocol`) is contained by the
/// session manager and retried; `Device` is logged by the dispatcher and dropped.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// True when the inference service rejected the credential.
    pub fn is_auth(&self) -> bool {
        matches!(self, BridgeError::Auth(_))
    }

    /// True for failures that mean the inference stream is gone.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            BridgeError::Auth(_)
                | BridgeError::Network(_)
                | BridgeError::Timeout(_)
                | BridgeError::Protocol(_)
                | BridgeError::Io(_)
        )
    }
}

impl From<tungstenite::Error> for BridgeError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => {
                let status = response.status();
                if status.as_u16() == 401 || status.as_u16() == 403 {
                    BridgeError::Auth(format!("handshake rejected with {}", status))
                } else {
                    BridgeError::Network(format!("handshake failed with {}", status))
                }
            }
            tungstenite::Error::Io(e) => BridgeError::Io(e),
            other => BridgeError::Network(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Protocol(err.to_string())
    }
}
