use crate::error::{CallError, FailureKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tagcall_media::{AudioFrame, AudioHandle, OutputRoute};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a single call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    /// No call in progress; the surface has not dialed yet.
    Idle,
    /// Outgoing setup in flight, up to and including the peer's accept.
    Calling,
    /// Incoming session being established after the local accept.
    Ringing,
    Connected,
    /// Terminal for this session; hangup from either side.
    Ended,
    /// Terminal for this session; setup failed and the user must retry
    /// explicitly.
    Failed(FailureKind),
}

/// Out-of-band notifications to the call surface; status changes travel
/// through the status watch instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEvent {
    /// Remote audio started flowing into the sink.
    RemoteMedia,
    /// Emitted a fixed delay after a remote hangup so the surface can
    /// auto-dismiss.
    Dismiss,
}

/// One-second-granularity call duration counter. Counts only while started;
/// stopping retains the value for display.
pub(crate) struct ElapsedTimer {
    seconds_tx: watch::Sender<u64>,
    tick: Duration,
    task: Option<JoinHandle<()>>,
}

impl ElapsedTimer {
    pub(crate) fn new(tick: Duration) -> (Self, watch::Receiver<u64>) {
        let (seconds_tx, seconds_rx) = watch::channel(0);
        (
            Self {
                seconds_tx,
                tick,
                task: None,
            },
            seconds_rx,
        )
    }

    pub(crate) fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        let seconds_tx = self.seconds_tx.clone();
        let tick = self.tick;
        self.task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick).await;
                seconds_tx.send_modify(|seconds| *seconds += 1);
            }
        }));
    }

    pub(crate) fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ElapsedTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Surface handle to a live call session.
///
/// Dropping the handle releases the microphone immediately and triggers
/// the same teardown path as an explicit hangup.
pub struct ActiveCall {
    peer_name: String,
    status_rx: watch::Receiver<CallStatus>,
    elapsed_rx: watch::Receiver<u64>,
    events_rx: mpsc::UnboundedReceiver<CallEvent>,
    remote_audio: Option<mpsc::Receiver<AudioFrame>>,
    media: Arc<OnceLock<Arc<dyn AudioHandle>>>,
    speaker: Arc<dyn OutputRoute>,
    speaker_on: AtomicBool,
    cancel: CancellationToken,
    done_rx: watch::Receiver<bool>,
}

impl ActiveCall {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        peer_name: String,
        status_rx: watch::Receiver<CallStatus>,
        elapsed_rx: watch::Receiver<u64>,
        events_rx: mpsc::UnboundedReceiver<CallEvent>,
        remote_audio: mpsc::Receiver<AudioFrame>,
        media: Arc<OnceLock<Arc<dyn AudioHandle>>>,
        speaker: Arc<dyn OutputRoute>,
        cancel: CancellationToken,
        done_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            peer_name,
            status_rx,
            elapsed_rx,
            events_rx,
            remote_audio: Some(remote_audio),
            media,
            speaker,
            speaker_on: AtomicBool::new(false),
            cancel,
            done_rx,
        }
    }

    /// Display name of the remote party.
    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn status(&self) -> CallStatus {
        *self.status_rx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<CallStatus> {
        self.status_rx.clone()
    }

    pub fn elapsed_seconds(&self) -> u64 {
        *self.elapsed_rx.borrow()
    }

    pub fn subscribe_elapsed(&self) -> watch::Receiver<u64> {
        self.elapsed_rx.clone()
    }

    pub fn muted(&self) -> bool {
        self.media
            .get()
            .map(|media| !media.enabled())
            .unwrap_or(false)
    }

    pub fn speaker_routed(&self) -> bool {
        self.speaker_on.load(Ordering::SeqCst)
    }

    /// Flips the microphone's enabled flag without stopping the stream.
    /// Valid only while connected. Returns the new muted state.
    pub fn toggle_mute(&self) -> Result<bool, CallError> {
        if self.status() != CallStatus::Connected {
            return Err(CallError::NotConnected);
        }
        let media = self.media.get().ok_or(CallError::NotConnected)?;

        let now_muted = media.enabled();
        media.set_enabled(!now_muted);
        tracing::debug!(muted = ?now_muted, "Toggled microphone");
        Ok(now_muted)
    }

    /// Attempts loudspeaker routing, falling back to a visual-only toggle
    /// when the platform cannot reroute. Valid only while connected.
    /// Returns the new flag.
    pub fn toggle_speaker(&self) -> Result<bool, CallError> {
        if self.status() != CallStatus::Connected {
            return Err(CallError::NotConnected);
        }

        let on = !self.speaker_on.load(Ordering::SeqCst);
        match self.speaker.set_loudspeaker(on) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(?on, "Speaker routing unsupported, toggling display only");
            }
            Err(err) => {
                tracing::warn!(?err, "Speaker routing failed, toggling display only");
            }
        }
        self.speaker_on.store(on, Ordering::SeqCst);
        Ok(on)
    }

    /// Takes the remote-audio sink. Returns `None` after the first call.
    pub fn take_remote_audio(&mut self) -> Option<mpsc::Receiver<AudioFrame>> {
        self.remote_audio.take()
    }

    /// Next out-of-band event, or `None` once the session task is gone.
    pub async fn next_event(&mut self) -> Option<CallEvent> {
        self.events_rx.recv().await
    }

    /// Ends the call and waits for teardown to complete. Idempotent: a
    /// second invocation returns once teardown has happened, without
    /// emitting anything further.
    pub async fn hang_up(&self) {
        self.cancel.cancel();
        let mut done = self.done_rx.clone();
        let _ = done.wait_for(|done| *done).await;
    }
}

impl Drop for ActiveCall {
    fn drop(&mut self) {
        self.cancel.cancel();
        // Synchronous release so closing the surface frees the microphone
        // immediately; the session task's own teardown is idempotent.
        if let Some(media) = self.media.get() {
            media.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test(tokio::test)]
    async fn elapsed_counts_only_while_started() {
        let (mut timer, rx) = ElapsedTimer::new(Duration::from_millis(10));
        assert_eq!(*rx.borrow(), 0);

        timer.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        timer.stop();

        let counted = *rx.borrow();
        assert!(counted >= 2, "expected at least 2 ticks, got {counted}");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*rx.borrow(), counted);
    }

    #[test(tokio::test)]
    async fn elapsed_start_is_idempotent() {
        let (mut timer, rx) = ElapsedTimer::new(Duration::from_millis(10));
        timer.start();
        timer.start();
        tokio::time::sleep(Duration::from_millis(55)).await;
        timer.stop();

        // A doubled timer would count roughly twice as fast.
        assert!(*rx.borrow() <= 8);
    }
}
