use crate::error::NegotiationError;
use async_trait::async_trait;
use tagcall_media::AudioFrame;
use tokio::sync::{broadcast, mpsc};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

pub type PeerConnectionState = RTCPeerConnectionState;

#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Transport-level connection state change.
    ConnectionState(PeerConnectionState),
    /// A locally discovered network-path candidate, serialized for the wire.
    IceCandidate(String),
    /// The first remote media stream arrived and is flowing to the sink.
    RemoteMedia,
}

/// Creates one peer session per call attempt, with the local media stream
/// attached before any negotiation happens.
#[async_trait]
pub trait PeerFactory: Send + Sync + 'static {
    type Session: PeerSession;

    async fn create(
        &self,
        input_rx: mpsc::Receiver<AudioFrame>,
        output_tx: mpsc::Sender<AudioFrame>,
    ) -> Result<Self::Session, NegotiationError>;
}

/// A single peer-to-peer media session under negotiation.
#[async_trait]
pub trait PeerSession: Send + Sync + 'static {
    /// Generates the local session description. Valid once per session.
    async fn create_offer(&self) -> Result<String, NegotiationError>;

    /// Callee path: applies the remote offer and produces the local answer.
    async fn accept_offer(&self, sdp: &str) -> Result<String, NegotiationError>;

    /// Caller path: applies the remote answer. Skipped without error when
    /// the session is already stable, so a duplicate answer cannot trigger
    /// renegotiation.
    async fn accept_answer(&self, sdp: &str) -> Result<(), NegotiationError>;

    /// Whether a remote description has been applied yet. Candidates must
    /// be buffered until it has.
    async fn has_remote_description(&self) -> bool;

    /// Feeds one remote network-path candidate to the transport.
    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), NegotiationError>;

    fn subscribe(&self) -> broadcast::Receiver<PeerEvent>;

    /// Releases all transport resources. Idempotent.
    async fn close(&self) -> Result<(), NegotiationError>;
}
