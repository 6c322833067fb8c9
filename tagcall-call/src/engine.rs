use crate::config::{CallConfig, REMOTE_AUDIO_QUEUE};
use crate::error::FailureKind;
use crate::incoming::IncomingCall;
use crate::session::{ActiveCall, CallEvent, CallStatus, ElapsedTimer};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tagcall_media::{AudioFrame, AudioHandle, DeviceOutputRoute, MediaAcquirer, OutputRoute};
use tagcall_protocol::{EventKind, SignalingMessage};
use tagcall_signaling::channel::{ChannelConfig, SignalingChannel};
use tagcall_signaling::dispatch::Binding;
use tagcall_signaling::transport::SignalingTransport;
use tagcall_webrtc::session::{PeerEvent, PeerFactory, PeerSession};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};
use uuid::Uuid;

/// The remote party of a call: signaling address plus display name.
#[derive(Debug, Clone)]
pub struct CallTarget {
    pub id: String,
    pub name: String,
}

/// Orchestrates the call lifecycle: media acquisition, signaling, peer
/// negotiation, runtime controls and teardown.
///
/// At most one session is live per engine; starting a new call first fully
/// tears down the previous one.
pub struct CallEngine<T, M, P>
where
    T: SignalingTransport + Clone,
    M: MediaAcquirer,
    P: PeerFactory,
{
    transport: T,
    media: Arc<M>,
    peers: Arc<P>,
    speaker: Arc<dyn OutputRoute>,
    config: CallConfig,
    active: Mutex<Option<ActiveSlot>>,
}

struct ActiveSlot {
    cancel: CancellationToken,
    done_rx: watch::Receiver<bool>,
}

/// Everything the session task needs that is not part of the setup inputs.
struct SessionHandles {
    status_tx: watch::Sender<CallStatus>,
    elapsed: ElapsedTimer,
    events_tx: mpsc::UnboundedSender<CallEvent>,
    done_tx: watch::Sender<bool>,
    cancel: CancellationToken,
    media_cell: Arc<OnceLock<Arc<dyn AudioHandle>>>,
    remote_tx: mpsc::Sender<AudioFrame>,
}

impl<T, M, P> CallEngine<T, M, P>
where
    T: SignalingTransport + Clone,
    M: MediaAcquirer,
    P: PeerFactory,
{
    pub fn new(transport: T, media: M, peers: P, config: CallConfig) -> Self {
        Self {
            transport,
            media: Arc::new(media),
            peers: Arc::new(peers),
            speaker: Arc::new(DeviceOutputRoute),
            config,
            active: Mutex::new(None),
        }
    }

    /// Replaces the default speaker-routing probe.
    pub fn with_speaker_route(mut self, route: Arc<dyn OutputRoute>) -> Self {
        self.speaker = route;
        self
    }

    /// Starts an outgoing call towards `target`, carrying an optional
    /// opaque correlation reference. Returns the session handle right away;
    /// progress is reported through its status watch.
    #[instrument(level = "debug", skip(self, session_ref), fields(target = %target.id))]
    pub async fn dial(&self, target: CallTarget, session_ref: Option<String>) -> ActiveCall {
        self.supersede_active().await;

        let (handles, call) = self.create_session(CallStatus::Calling, &target.name);
        let transport = self.transport.clone();
        let media = self.media.clone();
        let peers = self.peers.clone();
        let config = self.config.clone();

        tokio::spawn(
            run_outgoing(transport, media, peers, config, target, session_ref, handles)
                .instrument(tracing::info_span!("call", direction = "outgoing")),
        );

        call
    }

    /// Accepts an incoming call on the shared listener channel. The channel
    /// is borrowed: teardown drops this call's event bindings but leaves
    /// the connection up for future calls.
    #[instrument(level = "debug", skip(self, incoming, channel), fields(from = %incoming.from_id))]
    pub async fn answer(
        &self,
        incoming: IncomingCall,
        channel: &SignalingChannel<T>,
    ) -> ActiveCall {
        self.supersede_active().await;

        let (handles, call) = self.create_session(CallStatus::Ringing, &incoming.caller_name);
        let media = self.media.clone();
        let peers = self.peers.clone();
        let config = self.config.clone();
        let channel = channel.clone();

        tokio::spawn(
            run_incoming(channel, media, peers, config, incoming, handles)
                .instrument(tracing::info_span!("call", direction = "incoming")),
        );

        call
    }

    /// Declines an incoming call. There is no dedicated reject event;
    /// declining converges on the hangup event.
    #[instrument(level = "debug", skip(self, incoming, channel), fields(from = %incoming.from_id), err)]
    pub async fn decline(
        &self,
        incoming: &IncomingCall,
        channel: &SignalingChannel<T>,
    ) -> Result<(), crate::error::CallError> {
        channel
            .send(SignalingMessage::EndCall {
                target_id: incoming.from_id.clone(),
                session_ref: None,
            })
            .await?;
        Ok(())
    }

    fn create_session(
        &self,
        initial: CallStatus,
        peer_name: &str,
    ) -> (SessionHandles, ActiveCall) {
        let (status_tx, status_rx) = watch::channel(initial);
        let (elapsed, elapsed_rx) = ElapsedTimer::new(self.config.elapsed_tick);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);
        let (remote_tx, remote_rx) = mpsc::channel(REMOTE_AUDIO_QUEUE);
        let cancel = CancellationToken::new();
        let media_cell = Arc::new(OnceLock::new());

        let call = ActiveCall::new(
            peer_name.to_string(),
            status_rx,
            elapsed_rx,
            events_rx,
            remote_rx,
            media_cell.clone(),
            self.speaker.clone(),
            cancel.clone(),
            done_rx.clone(),
        );

        *self.active.lock() = Some(ActiveSlot {
            cancel: cancel.clone(),
            done_rx,
        });

        (
            SessionHandles {
                status_tx,
                elapsed,
                events_tx,
                done_tx,
                cancel,
                media_cell,
                remote_tx,
            },
            call,
        )
    }

    async fn supersede_active(&self) {
        let previous = { self.active.lock().take() };
        if let Some(slot) = previous {
            tracing::debug!("Superseding previous call session");
            slot.cancel.cancel();
            let mut done = slot.done_rx;
            let _ = done.wait_for(|done| *done).await;
        }
    }
}

/// Outgoing sequence: acquire media, connect the per-call channel, bind
/// relay events, build the negotiator, create the offer, put it on the
/// wire, then hand over to the event loop.
async fn run_outgoing<T, M, P>(
    transport: T,
    media: Arc<M>,
    peers: Arc<P>,
    config: CallConfig,
    target: CallTarget,
    session_ref: Option<String>,
    handles: SessionHandles,
) where
    T: SignalingTransport + Clone,
    M: MediaAcquirer,
    P: PeerFactory,
{
    let SessionHandles {
        status_tx,
        elapsed,
        events_tx,
        done_tx,
        cancel,
        media_cell,
        remote_tx,
    } = handles;

    let call_id = Uuid::new_v4().to_string();
    tracing::debug!(?call_id, "Starting outgoing call");

    // A media failure never touches signaling; there is nothing to release
    // yet either.
    let media_handle: Arc<dyn AudioHandle> = match media.acquire().await {
        Ok(handle) => Arc::new(handle),
        Err(err) => {
            tracing::warn!(?err, "Failed to acquire microphone");
            status_tx.send_replace(CallStatus::Failed((&err).into()));
            done_tx.send_replace(true);
            return;
        }
    };
    let _ = media_cell.set(media_handle.clone());

    // Short-lived per-call channel; setup failures surface, never retried.
    let channel = SignalingChannel::new(
        transport,
        ChannelConfig {
            connect_timeout: config.connect_timeout,
            reconnect_max_tries: 0,
        },
    );
    if let Err(err) = channel.connect().await {
        tracing::warn!(?err, "Failed to connect signaling channel");
        fail(&status_tx, &done_tx, (&err).into(), &media_handle, None, &channel, true).await;
        return;
    }
    let Some(caller_id) = channel.id() else {
        fail(&status_tx, &done_tx, FailureKind::Unknown, &media_handle, None, &channel, true)
            .await;
        return;
    };

    // Bound before the offer leaves so no relay event can be missed.
    let (accept_binding, accept_rx) = channel.bind(EventKind::CallAccepted);
    let (ice_binding, ice_rx) = channel.bind(EventKind::IceCandidate);
    let (ended_binding, ended_rx) = channel.bind(EventKind::CallEnded);

    let Some(frames_rx) = media_handle.take_frames() else {
        fail(&status_tx, &done_tx, FailureKind::Unknown, &media_handle, None, &channel, true)
            .await;
        return;
    };
    let peer = match peers.create(frames_rx, remote_tx).await {
        Ok(peer) => peer,
        Err(err) => {
            tracing::warn!(?err, "Failed to construct peer session");
            fail(&status_tx, &done_tx, (&err).into(), &media_handle, None, &channel, true).await;
            return;
        }
    };
    let peer_events = peer.subscribe();

    let offer = match peer.create_offer().await {
        Ok(offer) => offer,
        Err(err) => {
            tracing::warn!(?err, "Failed to create offer");
            fail(
                &status_tx,
                &done_tx,
                (&err).into(),
                &media_handle,
                Some(&peer),
                &channel,
                true,
            )
            .await;
            return;
        }
    };

    // Exactly one offer per outgoing call.
    let offer_msg = SignalingMessage::CallUser {
        target_id: target.id.clone(),
        sdp: offer,
        caller_id,
        caller_name: config.caller_name.clone(),
        call_id: call_id.clone(),
        session_ref: session_ref.clone(),
    };
    if let Err(err) = channel.send(offer_msg).await {
        tracing::warn!(?err, "Failed to send call offer");
        fail(
            &status_tx,
            &done_tx,
            (&err).into(),
            &media_handle,
            Some(&peer),
            &channel,
            true,
        )
        .await;
        return;
    }

    let runtime = CallRuntime {
        channel,
        owns_channel: true,
        peer,
        peer_events: Some(peer_events),
        media: media_handle,
        target_id: target.id,
        call_id,
        session_ref,
        status_tx,
        events_tx,
        elapsed,
        accept_rx: Some(accept_rx),
        ice_rx: Some(ice_rx),
        ended_rx: Some(ended_rx),
        _bindings: vec![accept_binding, ice_binding, ended_binding],
        accepted: false,
        pending_local: Vec::new(),
        pending_remote: Vec::new(),
        end_sent: false,
        done_tx,
        dismiss_delay: config.dismiss_delay,
    };
    runtime.run(cancel).await;
}

/// Incoming accept sequence: acquire media, build the negotiator against
/// the received offer, send the answer, go straight to connected. The
/// shared listener channel is never closed from here.
async fn run_incoming<T, M, P>(
    channel: SignalingChannel<T>,
    media: Arc<M>,
    peers: Arc<P>,
    config: CallConfig,
    incoming: IncomingCall,
    handles: SessionHandles,
) where
    T: SignalingTransport + Clone,
    M: MediaAcquirer,
    P: PeerFactory,
{
    let SessionHandles {
        status_tx,
        mut elapsed,
        events_tx,
        done_tx,
        cancel,
        media_cell,
        remote_tx,
    } = handles;

    tracing::debug!(call_id = ?incoming.call_id, "Answering incoming call");

    let media_handle: Arc<dyn AudioHandle> = match media.acquire().await {
        Ok(handle) => Arc::new(handle),
        Err(err) => {
            tracing::warn!(?err, "Failed to acquire microphone");
            status_tx.send_replace(CallStatus::Failed((&err).into()));
            done_tx.send_replace(true);
            return;
        }
    };
    let _ = media_cell.set(media_handle.clone());

    // Replaces any stale bindings from a previous call on the shared channel.
    let (ice_binding, ice_rx) = channel.bind(EventKind::IceCandidate);
    let (ended_binding, ended_rx) = channel.bind(EventKind::CallEnded);

    let Some(frames_rx) = media_handle.take_frames() else {
        fail(&status_tx, &done_tx, FailureKind::Unknown, &media_handle, None, &channel, false)
            .await;
        return;
    };
    let peer = match peers.create(frames_rx, remote_tx).await {
        Ok(peer) => peer,
        Err(err) => {
            tracing::warn!(?err, "Failed to construct peer session");
            fail(&status_tx, &done_tx, (&err).into(), &media_handle, None, &channel, false).await;
            return;
        }
    };
    let peer_events = peer.subscribe();

    let answer = match peer.accept_offer(&incoming.sdp).await {
        Ok(answer) => answer,
        Err(err) => {
            tracing::warn!(?err, "Failed to answer remote offer");
            fail(
                &status_tx,
                &done_tx,
                (&err).into(),
                &media_handle,
                Some(&peer),
                &channel,
                false,
            )
            .await;
            return;
        }
    };

    let accept_msg = SignalingMessage::CallAccepted {
        sdp: answer,
        call_id: incoming.call_id.clone(),
    };
    if let Err(err) = channel.send(accept_msg).await {
        tracing::warn!(?err, "Failed to send accept");
        fail(
            &status_tx,
            &done_tx,
            (&err).into(),
            &media_handle,
            Some(&peer),
            &channel,
            false,
        )
        .await;
        return;
    }

    // The offer already established intent; the local accept goes straight
    // to connected with no further round trip.
    status_tx.send_replace(CallStatus::Connected);
    elapsed.start();

    let runtime = CallRuntime {
        channel,
        owns_channel: false,
        peer,
        peer_events: Some(peer_events),
        media: media_handle,
        target_id: incoming.from_id,
        call_id: incoming.call_id,
        session_ref: None,
        status_tx,
        events_tx,
        elapsed,
        accept_rx: None,
        ice_rx: Some(ice_rx),
        ended_rx: Some(ended_rx),
        _bindings: vec![ice_binding, ended_binding],
        accepted: true,
        pending_local: Vec::new(),
        pending_remote: Vec::new(),
        end_sent: false,
        done_tx,
        dismiss_delay: config.dismiss_delay,
    };
    runtime.run(cancel).await;
}

/// Terminal setup-failure path: classify, then release media, close the
/// peer transport and (for owned channels) the signaling channel, in that
/// order.
#[allow(clippy::too_many_arguments)]
async fn fail<T: SignalingTransport>(
    status_tx: &watch::Sender<CallStatus>,
    done_tx: &watch::Sender<bool>,
    kind: FailureKind,
    media: &Arc<dyn AudioHandle>,
    peer: Option<&dyn PeerSession>,
    channel: &SignalingChannel<T>,
    close_channel: bool,
) {
    tracing::warn!(?kind, user_message = kind.user_message(), "Call attempt failed");
    status_tx.send_replace(CallStatus::Failed(kind));

    media.release();
    if let Some(peer) = peer
        && let Err(err) = peer.close().await
    {
        tracing::warn!(?err, "Failed to close peer after failed setup");
    }
    if close_channel {
        channel.close().await;
    }
    done_tx.send_replace(true);
}

enum LoopEvent {
    Hangup,
    Accept(Option<SignalingMessage>),
    Ice(Option<SignalingMessage>),
    Ended(Option<SignalingMessage>),
    Peer(Option<PeerEvent>),
}

/// Live state of a call session between setup and teardown.
struct CallRuntime<T: SignalingTransport, S: PeerSession> {
    channel: SignalingChannel<T>,
    owns_channel: bool,
    peer: S,
    peer_events: Option<broadcast::Receiver<PeerEvent>>,
    media: Arc<dyn AudioHandle>,
    target_id: String,
    call_id: String,
    session_ref: Option<String>,
    status_tx: watch::Sender<CallStatus>,
    events_tx: mpsc::UnboundedSender<CallEvent>,
    elapsed: ElapsedTimer,
    accept_rx: Option<mpsc::UnboundedReceiver<SignalingMessage>>,
    ice_rx: Option<mpsc::UnboundedReceiver<SignalingMessage>>,
    ended_rx: Option<mpsc::UnboundedReceiver<SignalingMessage>>,
    _bindings: Vec<Binding>,
    accepted: bool,
    pending_local: Vec<String>,
    pending_remote: Vec<String>,
    end_sent: bool,
    done_tx: watch::Sender<bool>,
    dismiss_delay: Duration,
}

impl<T: SignalingTransport, S: PeerSession> CallRuntime<T, S> {
    #[instrument(level = "debug", skip_all, fields(call_id = %self.call_id))]
    async fn run(mut self, cancel: CancellationToken) {
        self.drain_early_candidates();
        self.flush_pending_local().await;

        loop {
            let event = tokio::select! {
                biased;

                _ = cancel.cancelled() => LoopEvent::Hangup,
                msg = recv_opt(&mut self.accept_rx) => LoopEvent::Accept(msg),
                msg = recv_opt(&mut self.ended_rx) => LoopEvent::Ended(msg),
                msg = recv_opt(&mut self.ice_rx) => LoopEvent::Ice(msg),
                event = recv_peer(&mut self.peer_events) => LoopEvent::Peer(event),
            };

            match event {
                LoopEvent::Hangup => {
                    tracing::debug!("Local hangup");
                    self.status_tx.send_replace(CallStatus::Ended);
                    self.teardown(true).await;
                    break;
                }
                LoopEvent::Accept(Some(msg)) => {
                    if self.on_accept(msg).await {
                        break;
                    }
                }
                LoopEvent::Accept(None) => self.accept_rx = None,
                LoopEvent::Ice(Some(msg)) => self.on_remote_candidate(msg).await,
                LoopEvent::Ice(None) => self.ice_rx = None,
                LoopEvent::Ended(Some(_)) => {
                    self.on_remote_hangup().await;
                    break;
                }
                LoopEvent::Ended(None) => self.ended_rx = None,
                LoopEvent::Peer(Some(event)) => self.on_peer_event(event).await,
                LoopEvent::Peer(None) => self.peer_events = None,
            }
        }
    }

    /// Consumes the peer's accept at most once; later accepts are ignored.
    /// Returns whether the session ended.
    async fn on_accept(&mut self, msg: SignalingMessage) -> bool {
        let SignalingMessage::CallAccepted { sdp, call_id } = msg else {
            return false;
        };
        if call_id != self.call_id {
            tracing::debug!(?call_id, "Ignoring accept for another call");
            return false;
        }
        if self.accepted {
            tracing::debug!("Duplicate accept event, ignoring");
            return false;
        }
        self.accepted = true;

        tracing::debug!("Call accepted by peer");
        if let Err(err) = self.peer.accept_answer(&sdp).await {
            tracing::warn!(?err, "Failed to apply remote answer");
            self.status_tx
                .send_replace(CallStatus::Failed(FailureKind::from(&err)));
            self.teardown(false).await;
            return true;
        }

        self.flush_pending_remote().await;
        self.status_tx.send_replace(CallStatus::Connected);
        self.elapsed.start();
        false
    }

    async fn on_remote_candidate(&mut self, msg: SignalingMessage) {
        let SignalingMessage::IceCandidate {
            candidate, call_id, ..
        } = msg
        else {
            return;
        };
        if call_id != self.call_id {
            tracing::debug!(?call_id, "Dropping candidate for another call");
            return;
        }

        if self.peer.has_remote_description().await {
            apply_candidate(&self.peer, &candidate).await;
        } else {
            tracing::trace!("Buffering early remote candidate");
            self.pending_remote.push(candidate);
        }
    }

    async fn flush_pending_remote(&mut self) {
        for candidate in std::mem::take(&mut self.pending_remote) {
            apply_candidate(&self.peer, &candidate).await;
        }
    }

    async fn on_remote_hangup(&mut self) {
        tracing::debug!("Remote party ended the call");
        self.status_tx.send_replace(CallStatus::Ended);
        // No hangup back; re-sending would loop the event through the relay.
        self.teardown(false).await;

        tokio::time::sleep(self.dismiss_delay).await;
        let _ = self.events_tx.send(CallEvent::Dismiss);
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate(candidate) => self.send_local_candidate(candidate).await,
            PeerEvent::RemoteMedia => {
                let _ = self.events_tx.send(CallEvent::RemoteMedia);
            }
            PeerEvent::ConnectionState(state) => {
                tracing::debug!(?state, "Peer connection state changed");
            }
        }
    }

    /// Candidates discovered while the offer or answer was still in flight
    /// sit in the peer event queue; pull them into the local buffer so they
    /// can be flushed now that the wire knows about the call.
    fn drain_early_candidates(&mut self) {
        let Some(events) = self.peer_events.as_mut() else {
            return;
        };
        while let Ok(event) = events.try_recv() {
            match event {
                PeerEvent::IceCandidate(candidate) => self.pending_local.push(candidate),
                PeerEvent::RemoteMedia => {
                    let _ = self.events_tx.send(CallEvent::RemoteMedia);
                }
                PeerEvent::ConnectionState(state) => {
                    tracing::debug!(?state, "Peer connection state changed");
                }
            }
        }
    }

    async fn flush_pending_local(&mut self) {
        for candidate in std::mem::take(&mut self.pending_local) {
            self.send_local_candidate(candidate).await;
        }
    }

    /// Trickles one locally discovered candidate to the current peer,
    /// scoped by the session's call id.
    async fn send_local_candidate(&mut self, candidate: String) {
        let msg = SignalingMessage::IceCandidate {
            target_id: self.target_id.clone(),
            candidate,
            call_id: self.call_id.clone(),
        };
        if let Err(err) = self.channel.send(msg).await {
            tracing::warn!(?err, "Failed to trickle local candidate");
        }
    }

    /// Single release discipline for every exit path: hangup event first
    /// when locally initiated, then media, the peer transport, and the
    /// signaling channel (owned channels only).
    async fn teardown(&mut self, send_end: bool) {
        if send_end && !self.end_sent {
            self.end_sent = true;
            let msg = SignalingMessage::EndCall {
                target_id: self.target_id.clone(),
                session_ref: self.session_ref.clone(),
            };
            if let Err(err) = self.channel.send(msg).await {
                tracing::debug!(?err, "Failed to send hangup event");
            }
        }

        self.media.release();
        if let Err(err) = self.peer.close().await {
            tracing::warn!(?err, "Failed to close peer session");
        }
        if self.owns_channel {
            self.channel.close().await;
        }

        self.elapsed.stop();
        self._bindings.clear();
        self.done_tx.send_replace(true);
    }
}

/// A single bad candidate must not abort the call; the transport tries
/// the remaining paths.
async fn apply_candidate<S: PeerSession>(peer: &S, candidate: &str) {
    if let Err(err) = peer.add_remote_candidate(candidate).await {
        tracing::warn!(?err, "Failed to apply remote candidate, continuing");
    }
}

async fn recv_opt(
    rx: &mut Option<mpsc::UnboundedReceiver<SignalingMessage>>,
) -> Option<SignalingMessage> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_peer(rx: &mut Option<broadcast::Receiver<PeerEvent>>) -> Option<PeerEvent> {
    let Some(receiver) = rx else {
        return std::future::pending().await;
    };
    loop {
        match receiver.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(?skipped, "Peer event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
