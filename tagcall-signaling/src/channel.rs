use crate::dispatch::{Binding, Slots};
use crate::error::SignalingError;
use crate::transport::{SignalingReceiver, SignalingSender, SignalingTransport};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tagcall_protocol::{EventKind, SignalingMessage};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};

const SEND_CHANNEL_SIZE: usize = 100;
const FAULT_CHANNEL_SIZE: usize = 8;
const WORKER_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RECONNECT_MAX_TRIES: u8 = 8;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Upper bound for the whole connect sequence: transport handshake plus
    /// the relay's connect acknowledgment.
    pub connect_timeout: Duration,
    /// How often a lost connection is re-established before giving up.
    /// Zero disables reconnecting entirely; short-lived per-call channels
    /// must use zero so setup failures surface instead of being retried.
    pub reconnect_max_tries: u8,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_max_tries: 0,
        }
    }
}

impl ChannelConfig {
    /// Configuration for the process-wide long-lived listener connection.
    pub fn persistent() -> Self {
        Self {
            reconnect_max_tries: DEFAULT_RECONNECT_MAX_TRIES,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Default state, no connection to the relay. Also set after a requested
    /// close, a transport fault, or a failed connect attempt.
    Disconnected,
    /// Transport is up but the relay has not acknowledged the connection
    /// yet. Nothing can be sent.
    Connected,
    /// The relay acknowledged the connection and assigned an address;
    /// messages can be sent and received.
    Ready,
}

/// Bidirectional event-message connection to the signaling relay.
///
/// Wraps a [`SignalingTransport`] with connect/timeout handling, a writer
/// queue, per-event consumer slots and, for long-lived channels, automatic
/// reconnection. Clones share the same underlying connection.
#[derive(Clone)]
pub struct SignalingChannel<T: SignalingTransport> {
    inner: Arc<ChannelInner<T>>,
}

impl<T: SignalingTransport> SignalingChannel<T> {
    pub fn new(transport: T, config: ChannelConfig) -> Self {
        let (fault_tx, fault_rx) = mpsc::channel(FAULT_CHANNEL_SIZE);
        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);
        let shutdown = CancellationToken::new();

        let inner = Arc::new(ChannelInner {
            transport,
            config,
            state_tx,
            state_rx,
            local_id: Mutex::new(None),
            slots: Slots::default(),
            send_tx: Mutex::new(None),
            close_token: Mutex::new(shutdown.child_token()),
            shutdown,
            fault_tx,
            workers: Mutex::new(JoinSet::new()),
        });

        tokio::spawn(ChannelInner::supervisor_task(
            Arc::downgrade(&inner),
            inner.shutdown.clone(),
            fault_rx,
        ));

        Self { inner }
    }

    /// Connects to the relay and waits for its acknowledgment, bounded by
    /// the configured connect timeout.
    pub async fn connect(&self) -> Result<(), SignalingError> {
        self.inner.connect().await
    }

    /// The ephemeral address the relay assigned to this connection, if any.
    pub fn id(&self) -> Option<String> {
        self.inner.local_id.lock().clone()
    }

    /// Binds the single consumer slot for the given event name, replacing
    /// any previous registration. The returned [`Binding`] unbinds on drop.
    pub fn bind(
        &self,
        kind: EventKind,
    ) -> (Binding, mpsc::UnboundedReceiver<SignalingMessage>) {
        self.inner.slots.bind(kind)
    }

    /// Fire-and-forget send through the writer task.
    pub async fn send(&self, msg: SignalingMessage) -> Result<(), SignalingError> {
        self.inner.send(msg).await
    }

    /// Closes the connection. Safe to call multiple times; slot
    /// registrations are left intact.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state_tx.subscribe()
    }
}

struct ChannelInner<T: SignalingTransport> {
    transport: T,
    config: ChannelConfig,

    state_tx: watch::Sender<ChannelState>,
    state_rx: watch::Receiver<ChannelState>,

    local_id: Mutex<Option<String>>,
    slots: Slots,

    send_tx: Mutex<Option<mpsc::Sender<tungstenite::Message>>>,

    close_token: Mutex<CancellationToken>,
    shutdown: CancellationToken,
    fault_tx: mpsc::Sender<SignalingError>,

    workers: Mutex<JoinSet<()>>,
}

impl<T: SignalingTransport> Drop for ChannelInner<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.workers.lock().abort_all();
    }
}

impl<T: SignalingTransport> ChannelInner<T> {
    fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    fn set_state(&self, state: ChannelState) {
        self.state_tx.send_replace(state);
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn connect(&self) -> Result<(), SignalingError> {
        if self.state() != ChannelState::Disconnected {
            tracing::warn!("Tried to connect an already connected channel");
            return Err(SignalingError::ConnectError(
                "channel already connected".to_string(),
            ));
        }

        let timeout = self.config.connect_timeout;
        let deadline = tokio::time::Instant::now() + timeout;

        // Bound before the reader starts so a fast acknowledgment cannot
        // slip past the slot.
        let (welcome_binding, mut welcome_rx) = self.slots.bind(EventKind::Welcome);

        tracing::trace!("Connecting to signaling relay");
        let (sender, receiver) = tokio::time::timeout_at(deadline, self.transport.connect())
            .await
            .map_err(|_| SignalingError::ConnectTimeout(timeout))??;

        let (send_tx, send_rx) = mpsc::channel(SEND_CHANNEL_SIZE);
        let close_token = self.shutdown.child_token();
        *self.close_token.lock() = close_token.clone();
        {
            let mut workers = self.workers.lock();
            let handle = tokio::runtime::Handle::current();
            workers.spawn_on(
                Self::reader_task(
                    receiver,
                    send_tx.clone(),
                    self.slots.clone(),
                    self.fault_tx.clone(),
                    close_token.clone(),
                ),
                &handle,
            );
            workers.spawn_on(
                Self::writer_task(sender, send_rx, self.fault_tx.clone(), close_token),
                &handle,
            );
        }
        *self.send_tx.lock() = Some(send_tx);
        self.set_state(ChannelState::Connected);

        tracing::trace!("Transport up, awaiting relay connect acknowledgment");
        match tokio::time::timeout_at(deadline, welcome_rx.recv()).await {
            Ok(Some(SignalingMessage::Welcome { id })) => {
                tracing::debug!(?id, "Relay acknowledged connection");
                *self.local_id.lock() = Some(id);
                drop(welcome_binding);
                self.set_state(ChannelState::Ready);
                Ok(())
            }
            Ok(other) => {
                tracing::error!(?other, "Connect acknowledgment slot ended unexpectedly");
                self.set_state(ChannelState::Disconnected);
                self.teardown_connection().await;
                Err(SignalingError::Disconnected)
            }
            Err(_) => {
                tracing::warn!("Timed out waiting for relay connect acknowledgment");
                self.set_state(ChannelState::Disconnected);
                self.teardown_connection().await;
                Err(SignalingError::ConnectTimeout(timeout))
            }
        }
    }

    #[instrument(level = "debug", skip(self, msg), err)]
    async fn send(&self, msg: SignalingMessage) -> Result<(), SignalingError> {
        if self.state() != ChannelState::Ready {
            tracing::warn!("Tried to send message on a channel that is not ready");
            return Err(SignalingError::Disconnected);
        }

        let send_tx = self
            .send_tx
            .lock()
            .as_ref()
            .cloned()
            .ok_or(SignalingError::Disconnected)?;

        let serialized = SignalingMessage::serialize(&msg).map_err(|err| {
            tracing::warn!(?err, "Failed to serialize message");
            SignalingError::Serialization(err.to_string())
        })?;

        tracing::trace!(?msg, "Queueing message for relay");
        send_tx
            .send(tungstenite::Message::from(serialized))
            .await
            .map_err(|_| SignalingError::Disconnected)
    }

    #[instrument(level = "debug", skip(self))]
    async fn close(&self) {
        if self.state() == ChannelState::Disconnected {
            tracing::trace!("Channel already closed");
            return;
        }
        self.set_state(ChannelState::Disconnected);
        self.teardown_connection().await;
    }

    async fn teardown_connection(&self) {
        self.close_token.lock().cancel();

        let mut workers = {
            let mut workers = self.workers.lock();
            std::mem::replace(&mut *workers, JoinSet::new())
        };
        // Give the writer a moment to flush queued frames and close the
        // transport cleanly before pulling the plug.
        let graceful = tokio::time::timeout(WORKER_SHUTDOWN_GRACE, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if graceful.is_err() {
            tracing::warn!("Worker tasks did not stop in time, aborting");
            workers.abort_all();
            while let Some(res) = workers.join_next().await {
                if let Err(err) = res
                    && !err.is_cancelled()
                {
                    tracing::warn!(?err, "Failed to join signaling worker task");
                }
            }
        }

        self.send_tx.lock().take();
        self.local_id.lock().take();
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn reconnect(&self) -> Result<(), SignalingError> {
        let mut strategy = RetryStrategy::default();
        let mut last_err = SignalingError::Disconnected;

        for attempt in 1..=self.config.reconnect_max_tries {
            tracing::debug!(?attempt, "Reconnecting to signaling relay");
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    let delay = strategy.delay(u32::from(attempt));
                    tracing::warn!(?err, ?attempt, ?delay, "Reconnect attempt failed");
                    last_err = err;
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(last_err)
    }

    #[instrument(level = "debug", skip_all)]
    async fn supervisor_task(
        inner: Weak<Self>,
        shutdown: CancellationToken,
        mut fault_rx: mpsc::Receiver<SignalingError>,
    ) {
        tracing::debug!("Starting signaling supervisor task");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    tracing::debug!("Shutdown signal received, exiting supervisor task");
                    break;
                }

                fault = fault_rx.recv() => {
                    let Some(err) = fault else { break };
                    let Some(inner) = inner.upgrade() else { break };
                    if inner.state() == ChannelState::Disconnected {
                        // Close was requested; the fault is just the workers dying.
                        continue;
                    }

                    tracing::warn!(?err, "Signaling connection lost");
                    inner.set_state(ChannelState::Disconnected);
                    inner.teardown_connection().await;

                    if inner.config.reconnect_max_tries == 0 {
                        continue;
                    }
                    if let Err(err) = inner.reconnect().await {
                        tracing::warn!(?err, "Failed to re-establish signaling connection");
                    }
                }
            }
        }

        tracing::debug!("Signaling supervisor task finished");
    }

    #[instrument(level = "debug", skip_all)]
    fn reader_task<R: SignalingReceiver>(
        mut receiver: R,
        send_tx: mpsc::Sender<tungstenite::Message>,
        slots: Slots,
        fault_tx: mpsc::Sender<SignalingError>,
        close_token: CancellationToken,
    ) -> impl Future<Output = ()> + Send {
        async move {
            tracing::debug!("Starting signaling reader task");

            loop {
                tokio::select! {
                    biased;

                    _ = close_token.cancelled() => {
                        tracing::debug!("Close signal received, exiting reader task");
                        break;
                    }

                    msg = receiver.recv(&send_tx) => {
                        match msg {
                            Ok(message) => {
                                tracing::trace!(?message, "Received message from relay");
                                slots.dispatch(message);
                            }
                            Err(err) => {
                                tracing::warn!(?err, "Signaling receiver failed");
                                let _ = fault_tx.try_send(err);
                                break;
                            }
                        }
                    }
                }
            }
        }
        .instrument(tracing::Span::current())
    }

    #[instrument(level = "debug", skip_all)]
    fn writer_task<S: SignalingSender>(
        mut sender: S,
        mut send_rx: mpsc::Receiver<tungstenite::Message>,
        fault_tx: mpsc::Sender<SignalingError>,
        close_token: CancellationToken,
    ) -> impl Future<Output = ()> + Send {
        async move {
            tracing::debug!("Starting signaling writer task");

            loop {
                tokio::select! {
                    biased;

                    _ = close_token.cancelled() => {
                        tracing::debug!("Close signal received, flushing and closing sender");
                        while let Ok(msg) = send_rx.try_recv() {
                            if let Err(err) = sender.send(msg).await {
                                tracing::warn!(?err, "Failed to flush queued message");
                                break;
                            }
                        }
                        if let Err(err) = sender.close().await {
                            tracing::warn!(?err, "Failed to close signaling transport");
                        }
                        break;
                    }

                    msg = send_rx.recv() => {
                        match msg {
                            Some(msg) => {
                                if let Err(err) = sender.send(msg).await {
                                    tracing::warn!(?err, "Signaling sender failed");
                                    let _ = fault_tx.try_send(err);
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        }
        .instrument(tracing::Span::current())
    }
}

/// Capped exponential backoff with full jitter for reconnect attempts.
struct RetryStrategy {
    base: Duration,
    cap: Duration,
    rng: rand::rngs::StdRng,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(5),
            rng: rand::rngs::StdRng::from_os_rng(),
        }
    }
}

impl RetryStrategy {
    fn delay(&mut self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exp_nanos = self
            .base
            .as_nanos()
            .saturating_mul(1u128 << attempt.saturating_sub(1).min(32));
        let capped = exp_nanos.min(self.cap.as_nanos());
        let jitter = if capped == 0 {
            0
        } else {
            self.rng.random_range(0..=capped)
        };

        Duration::from_nanos(jitter.min(u128::from(u64::MAX)) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockTransport, next_sent};
    use pretty_assertions::assert_matches;
    use test_log::test;

    async fn connected_channel() -> (SignalingChannel<MockTransport>, MockTransport) {
        let transport = MockTransport::default();
        let channel = SignalingChannel::new(transport.clone(), ChannelConfig::default());
        channel.connect().await.expect("connect");
        assert_eq!(channel.state(), ChannelState::Ready);
        (channel, transport)
    }

    #[test(tokio::test)]
    async fn connect_assigns_id() {
        let (channel, transport) = connected_channel().await;
        assert_eq!(channel.id().as_deref(), Some("chan1"));
        assert_eq!(transport.connect_count(), 1);
    }

    #[test(tokio::test)]
    async fn connect_timeout_on_hanging_transport() {
        let transport = MockTransport::default();
        transport.hang_connects();
        let channel = SignalingChannel::new(
            transport,
            ChannelConfig {
                connect_timeout: Duration::from_millis(50),
                reconnect_max_tries: 0,
            },
        );

        let res = channel.connect().await;
        assert_matches!(res, Err(SignalingError::ConnectTimeout(_)));
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[test(tokio::test)]
    async fn connect_timeout_without_acknowledgment() {
        let transport = MockTransport::default();
        transport.suppress_welcome();
        let channel = SignalingChannel::new(
            transport,
            ChannelConfig {
                connect_timeout: Duration::from_millis(50),
                reconnect_max_tries: 0,
            },
        );

        let res = channel.connect().await;
        assert_matches!(res, Err(SignalingError::ConnectTimeout(_)));
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert!(channel.id().is_none());
    }

    #[test(tokio::test)]
    async fn connect_error_on_rejected_transport() {
        let transport = MockTransport::default();
        transport.fail_connects("relay offline");
        let channel = SignalingChannel::new(transport, ChannelConfig::default());

        let res = channel.connect().await;
        assert_matches!(res, Err(SignalingError::ConnectError(reason)) if reason == "relay offline");
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[test(tokio::test)]
    async fn send_reaches_transport() {
        let (channel, transport) = connected_channel().await;
        let mut outgoing = transport.outgoing();

        let msg = SignalingMessage::EndCall {
            target_id: "owner42".to_string(),
            session_ref: None,
        };
        channel.send(msg.clone()).await.expect("send");

        let sent = next_sent(&mut outgoing, Duration::from_millis(200)).await;
        assert_eq!(sent, Some(msg));
    }

    #[test(tokio::test)]
    async fn send_before_connect_fails() {
        let channel =
            SignalingChannel::new(MockTransport::default(), ChannelConfig::default());

        let res = channel
            .send(SignalingMessage::CallEnded)
            .await;
        assert_matches!(res, Err(SignalingError::Disconnected));
    }

    #[test(tokio::test)]
    async fn bound_slot_receives_dispatched_messages() {
        let (channel, transport) = connected_channel().await;
        let (_binding, mut rx) = channel.bind(EventKind::IceCandidate);

        let msg = SignalingMessage::IceCandidate {
            target_id: "chan1".to_string(),
            candidate: "candidate1".to_string(),
            call_id: "call1".to_string(),
        };
        transport.push(&msg);

        let received = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("timely dispatch");
        assert_eq!(received, Some(msg));
    }

    #[test(tokio::test)]
    async fn rebinding_replaces_previous_consumer() {
        let (channel, transport) = connected_channel().await;
        let (_b1, mut rx1) = channel.bind(EventKind::CallEnded);
        let (_b2, mut rx2) = channel.bind(EventKind::CallEnded);

        transport.push(&SignalingMessage::CallEnded);

        let received = tokio::time::timeout(Duration::from_millis(200), rx2.recv())
            .await
            .expect("timely dispatch");
        assert_eq!(received, Some(SignalingMessage::CallEnded));
        assert_eq!(rx1.recv().await, None);
    }

    #[test(tokio::test)]
    async fn close_is_idempotent() {
        let (channel, _transport) = connected_channel().await;

        channel.close().await;
        assert_eq!(channel.state(), ChannelState::Disconnected);

        channel.close().await;
        assert_eq!(channel.state(), ChannelState::Disconnected);

        let res = channel.send(SignalingMessage::CallEnded).await;
        assert_matches!(res, Err(SignalingError::Disconnected));
    }

    /// Polls until the channel has re-established a fresh connection.
    async fn await_reconnected(channel: &SignalingChannel<MockTransport>, transport: &MockTransport) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if transport.connect_count() >= 2 && channel.state() == ChannelState::Ready {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "channel did not reconnect in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test(tokio::test)]
    async fn reconnects_after_transport_fault() {
        let transport = MockTransport::default();
        let channel = SignalingChannel::new(transport.clone(), ChannelConfig::persistent());
        channel.connect().await.expect("connect");

        transport.disconnect_current();

        await_reconnected(&channel, &transport).await;
    }

    #[test(tokio::test)]
    async fn slots_survive_reconnect() {
        let transport = MockTransport::default();
        let channel = SignalingChannel::new(transport.clone(), ChannelConfig::persistent());
        channel.connect().await.expect("connect");
        let (_binding, mut rx) = channel.bind(EventKind::CallEnded);

        transport.disconnect_current();
        await_reconnected(&channel, &transport).await;

        transport.push(&SignalingMessage::CallEnded);
        let received = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("timely dispatch");
        assert_eq!(received, Some(SignalingMessage::CallEnded));
    }
}
