use std::sync::Arc;
use std::time::Duration;
use tagcall_media::{AudioFrame, FRAME_DURATION_MS};
use tokio::sync::{mpsc, watch};
use tracing::{Instrument, instrument};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Pumps locally captured frames into the outgoing track.
pub(crate) struct Sender {
    shutdown_tx: watch::Sender<()>,
}

impl Sender {
    #[instrument(level = "trace", skip_all)]
    pub(crate) fn new(
        track: Arc<TrackLocalStaticSample>,
        mut input_rx: mpsc::Receiver<AudioFrame>,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(());

        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => {
                            tracing::trace!("Shutdown signalled, stopping sender");
                            break;
                        }
                        frame = input_rx.recv() => {
                            let Some(frame) = frame else { break };
                            let sample = Sample {
                                data: frame,
                                duration: Duration::from_millis(FRAME_DURATION_MS),
                                ..Default::default()
                            };
                            if let Err(err) = track.write_sample(&sample).await {
                                tracing::warn!(?err, "Failed to write sample to track");
                            }
                        }
                    }
                }
            }
            .instrument(tracing::Span::current()),
        );

        Self { shutdown_tx }
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
