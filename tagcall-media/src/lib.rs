pub mod capture;
pub mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod route;

pub use capture::{MicAcquirer, MicHandle};
pub use error::MediaError;
pub use route::{DeviceOutputRoute, FixedOutputRoute, OutputRoute};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// One encoded 20 ms audio frame.
pub type AudioFrame = Bytes;

pub const FRAME_DURATION_MS: u64 = 20;

/// Grants exclusive access to the local audio input device.
#[async_trait]
pub trait MediaAcquirer: Send + Sync + 'static {
    type Handle: AudioHandle;

    /// Requests exclusive microphone access from the platform.
    async fn acquire(&self) -> Result<Self::Handle, MediaError>;
}

/// Exclusive ownership of an acquired microphone stream.
pub trait AudioHandle: Send + Sync + 'static {
    /// Takes the encoded-frame stream. Returns `None` after the first call.
    fn take_frames(&self) -> Option<mpsc::Receiver<AudioFrame>>;

    /// Flips capture without stopping the stream; disabled capture emits
    /// silence, so re-enabling needs no reacquisition.
    fn set_enabled(&self, enabled: bool);

    fn enabled(&self) -> bool;

    /// Stops the capture stream. Idempotent; also runs on drop.
    fn release(&self);
}
