use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalingError {
    /// No connect acknowledgment arrived within the configured bound.
    #[error("timed out connecting to the signaling relay after {0:?}")]
    ConnectTimeout(Duration),
    /// The transport rejected the connection outright.
    #[error("failed to connect to the signaling relay: {0}")]
    ConnectError(String),
    #[error("signaling channel disconnected")]
    Disconnected,
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
}
