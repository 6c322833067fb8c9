use crate::error::SignalingError;
use crate::transport::{SignalingReceiver, SignalingSender, SignalingTransport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tagcall_protocol::SignalingMessage;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

const MOCK_CHANNEL_SIZE: usize = 64;

/// In-memory transport for driving a channel in tests.
///
/// Cloning shares the underlying queues, so a clone handed to the client
/// under test can be observed and driven from the test body. The relay's
/// connect acknowledgment is queued automatically on every connect unless
/// suppressed.
#[derive(Clone)]
pub struct MockTransport {
    incoming_tx: broadcast::Sender<tungstenite::Message>,
    outgoing_tx: broadcast::Sender<tungstenite::Message>,
    pub ready: Arc<Notify>,
    assigned_id: Arc<Mutex<String>>,
    send_welcome: Arc<AtomicBool>,
    hang_connect: Arc<AtomicBool>,
    fail_connect: Arc<Mutex<Option<String>>>,
    connect_count: Arc<AtomicUsize>,
    disconnect: Arc<Mutex<CancellationToken>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new("chan1")
    }
}

impl MockTransport {
    pub fn new(assigned_id: &str) -> Self {
        Self {
            incoming_tx: broadcast::channel(MOCK_CHANNEL_SIZE).0,
            outgoing_tx: broadcast::channel(MOCK_CHANNEL_SIZE).0,
            ready: Arc::new(Notify::new()),
            assigned_id: Arc::new(Mutex::new(assigned_id.to_string())),
            send_welcome: Arc::new(AtomicBool::new(true)),
            hang_connect: Arc::new(AtomicBool::new(false)),
            fail_connect: Arc::new(Mutex::new(None)),
            connect_count: Arc::new(AtomicUsize::new(0)),
            disconnect: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    /// Delivers a relay message to the client under test.
    pub fn push(&self, msg: &SignalingMessage) {
        let serialized = SignalingMessage::serialize(msg).expect("serialize mock message");
        let _ = self
            .incoming_tx
            .send(tungstenite::Message::from(serialized));
    }

    /// Subscribes to the frames sent by the client under test.
    pub fn outgoing(&self) -> broadcast::Receiver<tungstenite::Message> {
        self.outgoing_tx.subscribe()
    }

    pub fn connect_count(&self) -> usize {
        self.connect_count.load(Ordering::SeqCst)
    }

    /// Makes every subsequent connect hang forever.
    pub fn hang_connects(&self) {
        self.hang_connect.store(true, Ordering::SeqCst);
    }

    /// Makes every subsequent connect fail with the given reason.
    pub fn fail_connects(&self, reason: &str) {
        *self.fail_connect.lock() = Some(reason.to_string());
    }

    /// Suppresses the automatic connect acknowledgment.
    pub fn suppress_welcome(&self) {
        self.send_welcome.store(false, Ordering::SeqCst);
    }

    /// Kills the current connection; a later connect starts fresh.
    pub fn disconnect_current(&self) {
        let mut guard = self.disconnect.lock();
        guard.cancel();
        *guard = CancellationToken::new();
    }
}

/// Reads the next [`SignalingMessage`] sent by the client under test,
/// skipping non-text frames. Returns `None` on timeout or a closed queue.
pub async fn next_sent(
    rx: &mut broadcast::Receiver<tungstenite::Message>,
    timeout: Duration,
) -> Option<SignalingMessage> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let msg = tokio::time::timeout_at(deadline, rx.recv()).await.ok()?.ok()?;
        if let tungstenite::Message::Text(text) = msg
            && let Ok(msg) = SignalingMessage::deserialize(&text)
        {
            return Some(msg);
        }
    }
}

#[async_trait]
impl SignalingTransport for MockTransport {
    type Sender = MockSender;
    type Receiver = MockReceiver;

    async fn connect(&self) -> Result<(Self::Sender, Self::Receiver), SignalingError> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        if self.hang_connect.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if let Some(reason) = self.fail_connect.lock().clone() {
            return Err(SignalingError::ConnectError(reason));
        }

        let rx = self.incoming_tx.subscribe();
        let first = self.send_welcome.load(Ordering::SeqCst).then(|| {
            let welcome = SignalingMessage::Welcome {
                id: self.assigned_id.lock().clone(),
            };
            tungstenite::Message::from(
                SignalingMessage::serialize(&welcome).expect("serialize welcome"),
            )
        });
        let disconnect = self.disconnect.lock().clone();
        self.ready.notify_waiters();

        Ok((
            MockSender {
                tx: self.outgoing_tx.clone(),
            },
            MockReceiver {
                rx,
                first,
                disconnect,
            },
        ))
    }
}

pub struct MockSender {
    tx: broadcast::Sender<tungstenite::Message>,
}

#[async_trait]
impl SignalingSender for MockSender {
    async fn send(&mut self, msg: tungstenite::Message) -> Result<(), SignalingError> {
        // Nobody observing the outgoing queue is fine in tests.
        let _ = self.tx.send(msg);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SignalingError> {
        Ok(())
    }
}

pub struct MockReceiver {
    rx: broadcast::Receiver<tungstenite::Message>,
    first: Option<tungstenite::Message>,
    disconnect: CancellationToken,
}

#[async_trait]
impl SignalingReceiver for MockReceiver {
    async fn recv(
        &mut self,
        send_tx: &mpsc::Sender<tungstenite::Message>,
    ) -> Result<SignalingMessage, SignalingError> {
        if let Some(tungstenite::Message::Text(text)) = self.first.take() {
            return SignalingMessage::deserialize(&text)
                .map_err(|err| SignalingError::Serialization(err.to_string()));
        }

        loop {
            tokio::select! {
                biased;

                _ = self.disconnect.cancelled() => {
                    tracing::debug!("Mock connection killed");
                    return Err(SignalingError::Disconnected);
                }

                msg = self.rx.recv() => {
                    match msg {
                        Ok(tungstenite::Message::Text(text)) => {
                            return SignalingMessage::deserialize(&text)
                                .map_err(|err| SignalingError::Serialization(err.to_string()));
                        }
                        Ok(tungstenite::Message::Ping(data)) => {
                            if send_tx.send(tungstenite::Message::Pong(data)).await.is_err() {
                                return Err(SignalingError::Disconnected);
                            }
                        }
                        Ok(tungstenite::Message::Close(reason)) => {
                            tracing::debug!(?reason, "Received Close frame");
                            return Err(SignalingError::Disconnected);
                        }
                        Ok(other) => {
                            tracing::trace!(?other, "Skipping non-text frame");
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(?skipped, "Mock receiver lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(SignalingError::Disconnected);
                        }
                    }
                }
            }
        }
    }
}
