use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("no audio input device available")]
    DeviceNotFound,
    #[error("audio input access denied")]
    PermissionDenied,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
