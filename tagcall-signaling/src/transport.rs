#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod tokio;

use crate::error::SignalingError;
use ::tokio::sync::mpsc;
use async_trait::async_trait;
use tagcall_protocol::SignalingMessage;
use tokio_tungstenite::tungstenite;

#[async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    type Sender: SignalingSender;
    type Receiver: SignalingReceiver;

    async fn connect(&self) -> Result<(Self::Sender, Self::Receiver), SignalingError>;
}

#[async_trait]
pub trait SignalingSender: Send + Sync + 'static {
    async fn send(&mut self, msg: tungstenite::Message) -> Result<(), SignalingError>;
    async fn close(&mut self) -> Result<(), SignalingError>;
}

#[async_trait]
pub trait SignalingReceiver: Send + Sync + 'static {
    /// Receives the next [`SignalingMessage`] from the relay.
    ///
    /// `send_tx` is the writer-task queue, used to answer transport-level
    /// keepalive frames without involving the channel owner.
    async fn recv(
        &mut self,
        send_tx: &mpsc::Sender<tungstenite::Message>,
    ) -> Result<SignalingMessage, SignalingError>;
}
