use crate::session::PeerEvent;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tagcall_media::AudioFrame;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::instrument;
use webrtc::peer_connection::RTCPeerConnection;

/// Binds the first remote media stream to the surface-owned output sink.
pub(crate) struct Receiver {
    shutdown_tx: watch::Sender<()>,
}

impl Receiver {
    #[instrument(level = "trace", skip_all)]
    pub(crate) fn new(
        peer_connection: &RTCPeerConnection,
        output_tx: mpsc::Sender<AudioFrame>,
        events_tx: broadcast::Sender<PeerEvent>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let announced = Arc::new(AtomicBool::new(false));

        peer_connection.on_track(Box::new(move |track, _, _| {
            let output_tx = output_tx.clone();
            let mut shutdown_rx = shutdown_rx.clone();
            let events_tx = events_tx.clone();
            let announced = announced.clone();

            Box::pin(async move {
                if !announced.swap(true, Ordering::SeqCst) {
                    tracing::debug!("Remote media stream started");
                    let _ = events_tx.send(PeerEvent::RemoteMedia);
                }

                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => {
                            tracing::trace!("Shutdown signalled, stopping receiver");
                            break;
                        }
                        rtp = track.read_rtp() => {
                            match rtp {
                                Ok((packet, _)) => {
                                    if output_tx.send(packet.payload).await.is_err() {
                                        tracing::warn!("Output sink gone, stopping receiver");
                                        break;
                                    }
                                }
                                Err(err) => {
                                    tracing::warn!(?err, "Failed to read RTP packet");
                                    break;
                                }
                            }
                        }
                    }
                }
            })
        }));

        Self { shutdown_tx }
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.shutdown();
    }
}
