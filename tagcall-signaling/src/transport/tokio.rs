use crate::error::SignalingError;
use crate::transport::{SignalingReceiver, SignalingSender, SignalingTransport};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::{Duration, Instant};
use tagcall_protocol::SignalingMessage;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite};

const PING_INTERVAL: Duration = Duration::from_secs(15);
const IDLE_CUTOFF: Duration = Duration::from_secs(45);

/// WebSocket transport towards the signaling relay.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl SignalingTransport for WsTransport {
    type Sender = WsSender;
    type Receiver = WsReceiver;

    #[tracing::instrument(level = "debug", err)]
    async fn connect(&self) -> Result<(Self::Sender, Self::Receiver), SignalingError> {
        tracing::debug!("Connecting to signaling relay");
        let (stream, response) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|err| {
                tracing::warn!(?err, "Failed to connect to signaling relay");
                SignalingError::ConnectError(err.to_string())
            })?;
        tracing::debug!(status = ?response.status(), "WebSocket handshake completed");

        let (ws_tx, ws_rx) = stream.split();
        Ok((WsSender { ws_tx }, WsReceiver::new(ws_rx)))
    }
}

pub struct WsSender {
    ws_tx: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, tungstenite::Message>,
}

#[async_trait]
impl SignalingSender for WsSender {
    #[tracing::instrument(level = "trace", skip_all, err)]
    async fn send(&mut self, msg: tungstenite::Message) -> Result<(), SignalingError> {
        self.ws_tx.send(msg).await.map_err(|err| {
            tracing::warn!(?err, "Failed to send message to relay");
            SignalingError::Transport(anyhow::anyhow!(err))
        })
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn close(&mut self) -> Result<(), SignalingError> {
        let _ = self
            .ws_tx
            .send(tungstenite::Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            })))
            .await
            .inspect_err(|err| {
                tracing::warn!(?err, "Failed to send Close frame");
            });

        self.ws_tx.close().await.map_err(|err| {
            tracing::warn!(?err, "Failed to close WebSocket connection");
            SignalingError::Transport(anyhow::anyhow!(err))
        })
    }
}

pub struct WsReceiver {
    ws_rx: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    ping_timer: tokio::time::Interval,
    last_rx: Instant,
}

impl WsReceiver {
    fn new(ws_rx: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>) -> Self {
        let mut ping_timer = tokio::time::interval(PING_INTERVAL);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        Self {
            ws_rx,
            ping_timer,
            last_rx: Instant::now(),
        }
    }
}

#[async_trait]
impl SignalingReceiver for WsReceiver {
    async fn recv(
        &mut self,
        send_tx: &mpsc::Sender<tungstenite::Message>,
    ) -> Result<SignalingMessage, SignalingError> {
        loop {
            tokio::select! {
                _ = self.ping_timer.tick() => {
                    if self.last_rx.elapsed() > IDLE_CUTOFF {
                        tracing::warn!("No traffic from relay within idle cutoff, treating connection as dead");
                        return Err(SignalingError::Disconnected);
                    }
                    if send_tx
                        .send(tungstenite::Message::Ping(tungstenite::Bytes::new()))
                        .await
                        .is_err()
                    {
                        return Err(SignalingError::Disconnected);
                    }
                }
                msg = self.ws_rx.next() => {
                    let Some(msg) = msg else {
                        tracing::warn!("WebSocket stream closed");
                        return Err(SignalingError::Disconnected);
                    };
                    self.last_rx = Instant::now();
                    match msg {
                        Ok(tungstenite::Message::Text(text)) => {
                            return SignalingMessage::deserialize(&text).map_err(|err| {
                                tracing::warn!(?err, "Failed to deserialize message");
                                SignalingError::Serialization(err.to_string())
                            });
                        }
                        Ok(tungstenite::Message::Close(reason)) => {
                            tracing::debug!(?reason, "Received Close WebSocket frame");
                            return Err(SignalingError::Disconnected);
                        }
                        Ok(tungstenite::Message::Ping(data)) => {
                            if send_tx.send(tungstenite::Message::Pong(data)).await.is_err() {
                                return Err(SignalingError::Disconnected);
                            }
                        }
                        Ok(other) => {
                            tracing::trace!(?other, "Skipping non-text WebSocket frame");
                        }
                        Err(err) => {
                            tracing::warn!(?err, "Failed to receive message");
                            return Err(SignalingError::Transport(anyhow::anyhow!(err)));
                        }
                    }
                }
            }
        }
    }
}
