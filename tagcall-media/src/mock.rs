use crate::error::MediaError;
use crate::{AudioFrame, AudioHandle, MediaAcquirer};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;

/// Scriptable acquisition failure for [`MockAcquirer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    DeviceNotFound,
    PermissionDenied,
}

/// Observable state shared between a [`MockHandle`] and the test body.
pub struct MockHandleState {
    enabled: AtomicBool,
    released: AtomicBool,
}

impl MockHandleState {
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

/// Cloning shares the underlying state, so a clone handed to the code
/// under test can be observed from the test body.
#[derive(Clone, Default)]
pub struct MockAcquirer {
    inner: Arc<AcquirerState>,
}

#[derive(Default)]
struct AcquirerState {
    fail: Mutex<Option<MockFailure>>,
    acquired: AtomicUsize,
    last: Mutex<Option<Arc<MockHandleState>>>,
}

impl MockAcquirer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(failure: MockFailure) -> Self {
        let acquirer = Self::default();
        *acquirer.inner.fail.lock() = Some(failure);
        acquirer
    }

    pub fn acquired_count(&self) -> usize {
        self.inner.acquired.load(Ordering::SeqCst)
    }

    /// State of the most recently acquired handle.
    pub fn last_handle(&self) -> Option<Arc<MockHandleState>> {
        self.inner.last.lock().clone()
    }
}

#[async_trait]
impl MediaAcquirer for MockAcquirer {
    type Handle = MockHandle;

    async fn acquire(&self) -> Result<MockHandle, MediaError> {
        if let Some(failure) = *self.inner.fail.lock() {
            return Err(match failure {
                MockFailure::DeviceNotFound => MediaError::DeviceNotFound,
                MockFailure::PermissionDenied => MediaError::PermissionDenied,
            });
        }

        self.inner.acquired.fetch_add(1, Ordering::SeqCst);
        let state = Arc::new(MockHandleState {
            enabled: AtomicBool::new(true),
            released: AtomicBool::new(false),
        });
        *self.inner.last.lock() = Some(state.clone());

        let (frames_tx, frames_rx) = mpsc::channel(8);
        Ok(MockHandle {
            state,
            frames: Mutex::new(Some(frames_rx)),
            _frames_tx: frames_tx,
        })
    }
}

pub struct MockHandle {
    state: Arc<MockHandleState>,
    frames: Mutex<Option<mpsc::Receiver<AudioFrame>>>,
    // Keeps the frame stream open for the consumer.
    _frames_tx: mpsc::Sender<AudioFrame>,
}

impl AudioHandle for MockHandle {
    fn take_frames(&self) -> Option<mpsc::Receiver<AudioFrame>> {
        self.frames.lock().take()
    }

    fn set_enabled(&self, enabled: bool) {
        self.state.enabled.store(enabled, Ordering::SeqCst);
    }

    fn enabled(&self) -> bool {
        self.state.enabled()
    }

    fn release(&self) {
        self.state.released.store(true, Ordering::SeqCst);
    }
}
