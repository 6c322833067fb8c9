use tagcall_media::MediaError;
use tagcall_signaling::SignalingError;
use tagcall_webrtc::NegotiationError;
use thiserror::Error;

/// Classified reason a call attempt failed. Terminal for the attempt; the
/// user retries explicitly, the core never does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    DeviceNotFound,
    PermissionDenied,
    ConnectTimeout,
    ConnectError,
    Negotiation,
    Unknown,
}

impl FailureKind {
    /// Message shown on the call surface.
    pub fn user_message(self) -> &'static str {
        match self {
            FailureKind::DeviceNotFound => "No microphone found. Please connect one.",
            FailureKind::PermissionDenied => "Microphone permission denied. Please allow access.",
            FailureKind::ConnectTimeout => "Could not reach the call service. Please try again.",
            FailureKind::ConnectError => "Connection to the call service failed.",
            FailureKind::Negotiation => "Call setup failed. Please try again.",
            FailureKind::Unknown => "Failed to access microphone or connect.",
        }
    }
}

impl From<&MediaError> for FailureKind {
    fn from(err: &MediaError) -> Self {
        match err {
            MediaError::DeviceNotFound => FailureKind::DeviceNotFound,
            MediaError::PermissionDenied => FailureKind::PermissionDenied,
            MediaError::Other(_) => FailureKind::Unknown,
        }
    }
}

impl From<&SignalingError> for FailureKind {
    fn from(err: &SignalingError) -> Self {
        match err {
            SignalingError::ConnectTimeout(_) | SignalingError::Timeout(_) => {
                FailureKind::ConnectTimeout
            }
            SignalingError::ConnectError(_)
            | SignalingError::Disconnected
            | SignalingError::Transport(_) => FailureKind::ConnectError,
            SignalingError::Serialization(_) => FailureKind::Unknown,
        }
    }
}

impl From<&NegotiationError> for FailureKind {
    fn from(_: &NegotiationError) -> Self {
        FailureKind::Negotiation
    }
}

#[derive(Debug, Error)]
pub enum CallError {
    /// Runtime controls are only valid while the call is connected.
    #[error("no call is currently connected")]
    NotConnected,
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}
