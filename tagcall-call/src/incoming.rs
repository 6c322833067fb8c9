use tagcall_protocol::{EventKind, SignalingMessage};
use tagcall_signaling::channel::{ChannelConfig, SignalingChannel};
use tagcall_signaling::dispatch::Binding;
use tagcall_signaling::error::SignalingError;
use tagcall_signaling::transport::SignalingTransport;
use tokio::sync::mpsc;
use tracing::instrument;

/// Display name shown when the caller did not supply one.
const FALLBACK_CALLER_NAME: &str = "Vehicle Owner";

/// An incoming-call prompt surfaced by the process-wide listener.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingCall {
    /// Ephemeral signaling address of the caller.
    pub from_id: String,
    pub caller_name: String,
    pub call_id: String,
    /// The caller's offer, applied when the call is answered.
    pub sdp: String,
}

/// Process-wide incoming-call listener.
///
/// Owns the single long-lived signaling connection, created once at
/// application start; the connection re-establishes itself after transport
/// faults. The single `callMade` slot means a second listener on the same
/// channel would displace the first.
pub struct IncomingCalls<T: SignalingTransport> {
    channel: SignalingChannel<T>,
    calls_rx: mpsc::UnboundedReceiver<SignalingMessage>,
    _binding: Binding,
}

impl<T: SignalingTransport> IncomingCalls<T> {
    /// Connects the shared channel and binds the incoming-call slot.
    #[instrument(level = "debug", skip_all, err)]
    pub async fn connect(transport: T, config: ChannelConfig) -> Result<Self, SignalingError> {
        let channel = SignalingChannel::new(transport, config);
        channel.connect().await?;
        let (binding, calls_rx) = channel.bind(EventKind::CallMade);
        tracing::info!(id = ?channel.id(), "Incoming-call listener ready");

        Ok(Self {
            channel,
            calls_rx,
            _binding: binding,
        })
    }

    /// The shared channel, used for answering or declining prompts.
    pub fn channel(&self) -> &SignalingChannel<T> {
        &self.channel
    }

    /// Waits for the next incoming-call prompt. Returns `None` once the
    /// listener has been shut down for good.
    pub async fn next(&mut self) -> Option<IncomingCall> {
        while let Some(msg) = self.calls_rx.recv().await {
            if let SignalingMessage::CallMade {
                sdp,
                from_id,
                caller_name,
                call_id,
            } = msg
            {
                tracing::debug!(?from_id, ?call_id, "Incoming call");
                let caller_name = if caller_name.is_empty() {
                    FALLBACK_CALLER_NAME.to_string()
                } else {
                    caller_name
                };
                return Some(IncomingCall {
                    from_id,
                    caller_name,
                    call_id,
                    sdp,
                });
            }
        }
        None
    }

    pub async fn close(&self) {
        self.channel.close().await;
    }
}
