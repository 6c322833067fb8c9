use crate::config::{
    AUDIO_CHANNELS, IceConfig, OPUS_CLOCK_RATE, PEER_EVENTS_CAPACITY, TRACK_ID, TRACK_STREAM_ID,
};
use crate::error::NegotiationError;
use crate::receiver::Receiver;
use crate::sender::Sender;
use crate::session::{PeerEvent, PeerFactory, PeerSession};
use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tagcall_media::AudioFrame;
use tokio::sync::{broadcast, mpsc};
use tracing::instrument;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Creates [`Peer`] sessions configured with the given ICE servers.
#[derive(Debug, Clone, Default)]
pub struct RtcPeerFactory {
    ice: IceConfig,
}

impl RtcPeerFactory {
    pub fn new(ice: IceConfig) -> Self {
        Self { ice }
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    type Session = Peer;

    async fn create(
        &self,
        input_rx: mpsc::Receiver<AudioFrame>,
        output_tx: mpsc::Sender<AudioFrame>,
    ) -> Result<Peer, NegotiationError> {
        Peer::new(self.ice.clone(), input_rx, output_tx).await
    }
}

pub struct Peer {
    peer_connection: RTCPeerConnection,
    sender: Sender,
    receiver: Receiver,
    events_tx: broadcast::Sender<PeerEvent>,
    offer_created: AtomicBool,
    closed: AtomicBool,
}

impl Peer {
    #[instrument(level = "debug", skip(input_rx, output_tx), err)]
    pub async fn new(
        config: IceConfig,
        input_rx: mpsc::Receiver<AudioFrame>,
        output_tx: mpsc::Sender<AudioFrame>,
    ) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("Failed to register default codecs")?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .context("Failed to register default interceptors")?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = api
            .new_peer_connection(config.into_rtc())
            .await
            .context("Failed to create peer connection")?;

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: OPUS_CLOCK_RATE,
                channels: AUDIO_CHANNELS,
                ..Default::default()
            },
            TRACK_ID.to_owned(),
            TRACK_STREAM_ID.to_owned(),
        ));

        peer_connection
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("Failed to add local track")?;

        let (events_tx, _) = broadcast::channel(PEER_EVENTS_CAPACITY);

        {
            let events_tx = events_tx.clone();
            peer_connection.on_peer_connection_state_change(Box::new(move |state| {
                tracing::trace!(?state, "Peer connection state changed");
                let _ = events_tx.send(PeerEvent::ConnectionState(state));
                Box::pin(async {})
            }));
        }

        {
            let events_tx = events_tx.clone();
            peer_connection.on_ice_candidate(Box::new(
                move |candidate: Option<RTCIceCandidate>| {
                    if let Some(candidate) = candidate {
                        match candidate.to_json() {
                            Ok(init) => match serde_json::to_string(&init) {
                                Ok(init) => {
                                    tracing::trace!("Local ICE candidate discovered");
                                    let _ = events_tx.send(PeerEvent::IceCandidate(init));
                                }
                                Err(err) => {
                                    tracing::warn!(?err, "Failed to serialize ICE candidate");
                                }
                            },
                            Err(err) => {
                                tracing::warn!(?err, "Failed to serialize ICE candidate");
                            }
                        }
                    }
                    Box::pin(async {})
                },
            ));
        }

        let receiver = Receiver::new(&peer_connection, output_tx, events_tx.clone());
        let sender = Sender::new(track, input_rx);

        Ok(Self {
            peer_connection,
            sender,
            receiver,
            events_tx,
            offer_created: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl PeerSession for Peer {
    #[instrument(level = "trace", skip(self), err)]
    async fn create_offer(&self) -> Result<String, NegotiationError> {
        if self.offer_created.swap(true, Ordering::SeqCst) {
            return Err(NegotiationError::OfferAlreadyCreated);
        }

        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .context("Failed to create offer")?;

        self.peer_connection
            .set_local_description(offer)
            .await
            .context("Failed to set offer as local description")?;

        let local = self
            .peer_connection
            .local_description()
            .await
            .context("Failed to get local description")?;

        let sdp = serde_json::to_string(&local).context("Failed to serialize local description")?;

        tracing::trace!("Created SDP offer");
        Ok(sdp)
    }

    #[instrument(level = "trace", skip(self, sdp), err)]
    async fn accept_offer(&self, sdp: &str) -> Result<String, NegotiationError> {
        let offer = serde_json::from_str::<RTCSessionDescription>(sdp)
            .context("Failed to deserialize offer")?;
        self.peer_connection
            .set_remote_description(offer)
            .await
            .context("Failed to set offer as remote description")?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .context("Failed to create answer")?;
        self.peer_connection
            .set_local_description(answer)
            .await
            .context("Failed to set answer as local description")?;

        let local = self
            .peer_connection
            .local_description()
            .await
            .context("Failed to get local description for answer")?;

        let sdp = serde_json::to_string(&local).context("Failed to serialize local description")?;

        tracing::trace!("Created SDP answer");
        Ok(sdp)
    }

    #[instrument(level = "trace", skip(self, sdp), err)]
    async fn accept_answer(&self, sdp: &str) -> Result<(), NegotiationError> {
        if self.peer_connection.signaling_state() == RTCSignalingState::Stable {
            tracing::debug!("Session already stable, ignoring answer");
            return Ok(());
        }

        let answer = serde_json::from_str::<RTCSessionDescription>(sdp)
            .context("Failed to deserialize answer")?;
        self.peer_connection
            .set_remote_description(answer)
            .await
            .context("Failed to set answer as remote description")?;

        tracing::trace!("Accepted SDP answer");
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.peer_connection.remote_description().await.is_some()
    }

    #[instrument(level = "trace", skip(self, candidate), err)]
    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), NegotiationError> {
        let init = serde_json::from_str::<RTCIceCandidateInit>(candidate)
            .context("Failed to deserialize candidate")?;
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .context("Failed to add remote ICE candidate")?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events_tx.subscribe()
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn close(&self) -> Result<(), NegotiationError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            tracing::trace!("Peer already closed");
            return Ok(());
        }

        self.sender.shutdown();
        self.receiver.shutdown();
        self.peer_connection
            .close()
            .await
            .context("Failed to close peer connection")?;

        tracing::trace!("Closed peer connection");
        Ok(())
    }
}
