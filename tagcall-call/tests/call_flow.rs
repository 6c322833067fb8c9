use pretty_assertions::assert_matches;
use std::sync::Arc;
use std::time::Duration;
use tagcall_call::config::CallConfig;
use tagcall_call::engine::{CallEngine, CallTarget};
use tagcall_call::error::{CallError, FailureKind};
use tagcall_call::incoming::IncomingCalls;
use tagcall_call::session::{ActiveCall, CallEvent, CallStatus};
use tagcall_media::FixedOutputRoute;
use tagcall_media::mock::{MockAcquirer, MockFailure};
use tagcall_protocol::SignalingMessage;
use tagcall_signaling::channel::{ChannelConfig, ChannelState};
use tagcall_signaling::transport::mock::{MockTransport, next_sent};
use tagcall_webrtc::PeerEvent;
use tagcall_webrtc::mock::MockPeerFactory;
use test_log::test;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite;

const WAIT: Duration = Duration::from_secs(2);
const SHORT: Duration = Duration::from_millis(300);

type TestEngine = CallEngine<MockTransport, MockAcquirer, MockPeerFactory>;

fn test_config() -> CallConfig {
    CallConfig {
        connect_timeout: Duration::from_millis(200),
        dismiss_delay: Duration::from_millis(50),
        elapsed_tick: Duration::from_millis(20),
        caller_name: "Scanner".to_string(),
    }
}

fn owner() -> CallTarget {
    CallTarget {
        id: "owner42".to_string(),
        name: "Vehicle Owner".to_string(),
    }
}

fn engine_with(transport: &MockTransport, media: &MockAcquirer, peers: &MockPeerFactory) -> TestEngine {
    CallEngine::new(
        transport.clone(),
        media.clone(),
        peers.clone(),
        test_config(),
    )
    .with_speaker_route(Arc::new(FixedOutputRoute::new(false)))
}

async fn wait_for_status(
    call: &ActiveCall,
    predicate: impl Fn(&CallStatus) -> bool,
) -> CallStatus {
    let mut status = call.subscribe_status();
    *tokio::time::timeout(WAIT, status.wait_for(|s| predicate(s)))
        .await
        .expect("status change in time")
        .expect("status watch alive")
}

/// Dials, answers the offer on behalf of the remote peer, and waits for
/// the session to connect. Returns the live call, its id, and the outgoing
/// frame queue (already past the offer).
async fn connect_call(
    engine: &TestEngine,
    transport: &MockTransport,
) -> (
    ActiveCall,
    String,
    broadcast::Receiver<tungstenite::Message>,
) {
    let mut outgoing = transport.outgoing();
    let call = engine.dial(owner(), None).await;

    let call_id = loop {
        match next_sent(&mut outgoing, WAIT).await.expect("offer sent") {
            SignalingMessage::CallUser { call_id, .. } => break call_id,
            _ => continue,
        }
    };
    transport.push(&SignalingMessage::CallAccepted {
        sdp: "answer-sdp".to_string(),
        call_id: call_id.clone(),
    });

    wait_for_status(&call, |s| *s == CallStatus::Connected).await;
    (call, call_id, outgoing)
}

async fn drain_sent(
    rx: &mut broadcast::Receiver<tungstenite::Message>,
    window: Duration,
) -> Vec<SignalingMessage> {
    let mut messages = Vec::new();
    while let Some(msg) = next_sent(rx, window).await {
        messages.push(msg);
    }
    messages
}

async fn eventually(description: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {description}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[test(tokio::test)]
async fn outgoing_call_connects_on_accept() {
    let transport = MockTransport::default();
    let media = MockAcquirer::new();
    let peers = MockPeerFactory::new();
    let engine = engine_with(&transport, &media, &peers);

    let mut outgoing = transport.outgoing();
    let call = engine.dial(owner(), Some("interaction9".to_string())).await;
    assert_eq!(call.status(), CallStatus::Calling);
    assert_eq!(call.elapsed_seconds(), 0);

    let call_id = match next_sent(&mut outgoing, WAIT).await.expect("offer sent") {
        SignalingMessage::CallUser {
            target_id,
            caller_id,
            caller_name,
            call_id,
            session_ref,
            sdp,
        } => {
            assert_eq!(target_id, "owner42");
            assert_eq!(caller_id, "chan1");
            assert_eq!(caller_name, "Scanner");
            assert_eq!(session_ref.as_deref(), Some("interaction9"));
            assert_eq!(sdp, "offer-1");
            call_id
        }
        other => panic!("expected CallUser, got {other:?}"),
    };

    transport.push(&SignalingMessage::CallAccepted {
        sdp: "answer-sdp".to_string(),
        call_id,
    });

    wait_for_status(&call, |s| *s == CallStatus::Connected).await;
    assert_eq!(
        peers.state().remote_descriptions(),
        vec!["answer-sdp".to_string()]
    );

    // The elapsed counter starts incrementing from zero once connected.
    let mut elapsed = call.subscribe_elapsed();
    tokio::time::timeout(WAIT, elapsed.wait_for(|s| *s >= 1))
        .await
        .expect("elapsed advancing")
        .expect("elapsed watch alive");

    call.hang_up().await;
}

#[test(tokio::test)]
async fn duplicate_accept_is_consumed_once() {
    let transport = MockTransport::default();
    let media = MockAcquirer::new();
    let peers = MockPeerFactory::new();
    let engine = engine_with(&transport, &media, &peers);

    let (call, call_id, _outgoing) = connect_call(&engine, &transport).await;

    transport.push(&SignalingMessage::CallAccepted {
        sdp: "another-answer".to_string(),
        call_id,
    });
    tokio::time::sleep(SHORT).await;

    assert_eq!(call.status(), CallStatus::Connected);
    assert_eq!(
        peers.state().remote_descriptions(),
        vec!["answer-sdp".to_string()]
    );

    call.hang_up().await;
}

#[test(tokio::test)]
async fn missing_microphone_fails_before_signaling() {
    let transport = MockTransport::default();
    let media = MockAcquirer::failing(MockFailure::DeviceNotFound);
    let peers = MockPeerFactory::new();
    let engine = engine_with(&transport, &media, &peers);

    let mut outgoing = transport.outgoing();
    let call = engine.dial(owner(), None).await;

    let status =
        wait_for_status(&call, |s| matches!(s, CallStatus::Failed(_))).await;
    assert_eq!(status, CallStatus::Failed(FailureKind::DeviceNotFound));

    // No signaling connection is attempted and no offer ever leaves.
    assert_eq!(transport.connect_count(), 0);
    assert!(drain_sent(&mut outgoing, SHORT).await.is_empty());
}

#[test(tokio::test)]
async fn denied_microphone_maps_to_permission_denied() {
    let transport = MockTransport::default();
    let media = MockAcquirer::failing(MockFailure::PermissionDenied);
    let peers = MockPeerFactory::new();
    let engine = engine_with(&transport, &media, &peers);

    let call = engine.dial(owner(), None).await;

    let status =
        wait_for_status(&call, |s| matches!(s, CallStatus::Failed(_))).await;
    assert_eq!(status, CallStatus::Failed(FailureKind::PermissionDenied));
    assert_eq!(
        FailureKind::PermissionDenied.user_message(),
        "Microphone permission denied. Please allow access."
    );
    assert_eq!(transport.connect_count(), 0);
}

#[test(tokio::test)]
async fn relay_connect_timeout_fails_and_releases_media() {
    let transport = MockTransport::default();
    transport.hang_connects();
    let media = MockAcquirer::new();
    let peers = MockPeerFactory::new();
    let engine = engine_with(&transport, &media, &peers);

    let call = engine.dial(owner(), None).await;

    let status =
        wait_for_status(&call, |s| matches!(s, CallStatus::Failed(_))).await;
    assert_eq!(status, CallStatus::Failed(FailureKind::ConnectTimeout));

    let handle = media.last_handle().expect("media was acquired");
    assert!(handle.released());
}

#[test(tokio::test)]
async fn local_hangup_sends_exactly_one_end_call() {
    let transport = MockTransport::default();
    let media = MockAcquirer::new();
    let peers = MockPeerFactory::new();
    let engine = engine_with(&transport, &media, &peers);

    let (call, _call_id, mut outgoing) = connect_call(&engine, &transport).await;

    call.hang_up().await;
    assert_eq!(call.status(), CallStatus::Ended);

    // Teardown released everything, in one pass.
    assert!(media.last_handle().expect("media acquired").released());
    assert_eq!(peers.state().closes(), 1);

    // Idempotent: hanging up again emits nothing further.
    call.hang_up().await;

    let sent = drain_sent(&mut outgoing, SHORT).await;
    let end_calls = sent
        .iter()
        .filter(|msg| matches!(msg, SignalingMessage::EndCall { .. }))
        .count();
    assert_eq!(end_calls, 1);
    match sent
        .iter()
        .find(|msg| matches!(msg, SignalingMessage::EndCall { .. }))
        .expect("one hangup event")
    {
        SignalingMessage::EndCall { target_id, .. } => assert_eq!(target_id, "owner42"),
        _ => unreachable!(),
    }
}

#[test(tokio::test)]
async fn remote_hangup_ends_without_echoing_and_dismisses() {
    let transport = MockTransport::default();
    let media = MockAcquirer::new();
    let peers = MockPeerFactory::new();
    let engine = engine_with(&transport, &media, &peers);

    let (mut call, _call_id, mut outgoing) = connect_call(&engine, &transport).await;

    transport.push(&SignalingMessage::CallEnded);

    wait_for_status(&call, |s| *s == CallStatus::Ended).await;
    assert!(media.last_handle().expect("media acquired").released());

    // The surface auto-dismisses a fixed delay after the remote hangup.
    let event = tokio::time::timeout(WAIT, call.next_event())
        .await
        .expect("dismiss event in time");
    assert_eq!(event, Some(CallEvent::Dismiss));

    // No hangup event is echoed back to the relay.
    let sent = drain_sent(&mut outgoing, SHORT).await;
    assert!(
        !sent
            .iter()
            .any(|msg| matches!(msg, SignalingMessage::EndCall { .. })),
        "unexpected outbound hangup: {sent:?}"
    );
}

#[test(tokio::test)]
async fn early_remote_candidates_are_buffered_until_accept() {
    let transport = MockTransport::default();
    let media = MockAcquirer::new();
    let peers = MockPeerFactory::new();
    let engine = engine_with(&transport, &media, &peers);

    let mut outgoing = transport.outgoing();
    let call = engine.dial(owner(), None).await;

    let call_id = loop {
        match next_sent(&mut outgoing, WAIT).await.expect("offer sent") {
            SignalingMessage::CallUser { call_id, .. } => break call_id,
            _ => continue,
        }
    };

    // Candidate arrives before the answer; it must not hit the negotiator.
    transport.push(&SignalingMessage::IceCandidate {
        target_id: "chan1".to_string(),
        candidate: "remote-cand-1".to_string(),
        call_id: call_id.clone(),
    });
    tokio::time::sleep(SHORT).await;
    assert!(peers.state().remote_candidates().is_empty());

    transport.push(&SignalingMessage::CallAccepted {
        sdp: "answer-sdp".to_string(),
        call_id,
    });
    wait_for_status(&call, |s| *s == CallStatus::Connected).await;

    let peers_state = peers.state();
    eventually("buffered candidate applied", || {
        peers_state.remote_candidates() == vec!["remote-cand-1".to_string()]
    })
    .await;

    call.hang_up().await;
}

#[test(tokio::test)]
async fn candidates_for_other_calls_are_dropped() {
    let transport = MockTransport::default();
    let media = MockAcquirer::new();
    let peers = MockPeerFactory::new();
    let engine = engine_with(&transport, &media, &peers);

    let (call, _call_id, _outgoing) = connect_call(&engine, &transport).await;

    transport.push(&SignalingMessage::IceCandidate {
        target_id: "chan1".to_string(),
        candidate: "cross-talk".to_string(),
        call_id: "some-other-call".to_string(),
    });
    tokio::time::sleep(SHORT).await;

    assert!(peers.state().remote_candidates().is_empty());

    call.hang_up().await;
}

#[test(tokio::test)]
async fn local_candidates_trickle_to_the_peer() {
    let transport = MockTransport::default();
    let media = MockAcquirer::new();
    let peers = MockPeerFactory::new();
    let engine = engine_with(&transport, &media, &peers);

    let (call, call_id, mut outgoing) = connect_call(&engine, &transport).await;

    peers
        .state()
        .emit(PeerEvent::IceCandidate("local-cand-1".to_string()));

    let trickled = loop {
        match next_sent(&mut outgoing, WAIT).await.expect("candidate sent") {
            msg @ SignalingMessage::IceCandidate { .. } => break msg,
            _ => continue,
        }
    };
    assert_eq!(
        trickled,
        SignalingMessage::IceCandidate {
            target_id: "owner42".to_string(),
            candidate: "local-cand-1".to_string(),
            call_id,
        }
    );

    call.hang_up().await;
}

#[test(tokio::test)]
async fn runtime_controls_require_a_connected_call() {
    let transport = MockTransport::default();
    transport.hang_connects();
    let media = MockAcquirer::new();
    let peers = MockPeerFactory::new();
    let engine = engine_with(&transport, &media, &peers);

    let call = engine.dial(owner(), None).await;
    assert_eq!(call.status(), CallStatus::Calling);

    assert_matches!(call.toggle_mute(), Err(CallError::NotConnected));
    assert_matches!(call.toggle_speaker(), Err(CallError::NotConnected));
}

#[test(tokio::test)]
async fn toggle_mute_flips_track_enabled_state() {
    let transport = MockTransport::default();
    let media = MockAcquirer::new();
    let peers = MockPeerFactory::new();
    let engine = engine_with(&transport, &media, &peers);

    let (call, _call_id, _outgoing) = connect_call(&engine, &transport).await;
    let handle = media.last_handle().expect("media acquired");

    assert!(!call.muted());
    assert_eq!(call.toggle_mute().expect("toggle while connected"), true);
    assert!(!handle.enabled());
    assert!(call.muted());

    assert_eq!(call.toggle_mute().expect("toggle while connected"), false);
    assert!(handle.enabled());

    call.hang_up().await;
}

#[test(tokio::test)]
async fn toggle_speaker_falls_back_to_visual_toggle() {
    let transport = MockTransport::default();
    let media = MockAcquirer::new();
    let peers = MockPeerFactory::new();
    let engine = engine_with(&transport, &media, &peers);

    let (call, _call_id, _outgoing) = connect_call(&engine, &transport).await;

    assert!(!call.speaker_routed());
    assert_eq!(call.toggle_speaker().expect("toggle while connected"), true);
    assert!(call.speaker_routed());
    assert_eq!(call.toggle_speaker().expect("toggle while connected"), false);
    assert!(!call.speaker_routed());

    call.hang_up().await;
}

#[test(tokio::test)]
async fn dialing_again_supersedes_the_previous_session() {
    let transport = MockTransport::default();
    let media = MockAcquirer::new();
    let peers = MockPeerFactory::new();
    let engine = engine_with(&transport, &media, &peers);

    let (first, first_call_id, mut outgoing) = connect_call(&engine, &transport).await;

    let second = engine.dial(owner(), None).await;

    // The first session is fully torn down before the second starts.
    assert_eq!(first.status(), CallStatus::Ended);

    let second_call_id = loop {
        match next_sent(&mut outgoing, WAIT).await.expect("second offer") {
            SignalingMessage::CallUser { call_id, .. } => break call_id,
            _ => continue,
        }
    };
    assert_ne!(second_call_id, first_call_id);

    second.hang_up().await;
}

#[test(tokio::test)]
async fn elapsed_resets_for_each_attempt() {
    let transport = MockTransport::default();
    let media = MockAcquirer::new();
    let peers = MockPeerFactory::new();
    let engine = engine_with(&transport, &media, &peers);

    let (first, _call_id, _outgoing) = connect_call(&engine, &transport).await;
    let mut elapsed = first.subscribe_elapsed();
    tokio::time::timeout(WAIT, elapsed.wait_for(|s| *s >= 1))
        .await
        .expect("first call elapsed advancing")
        .expect("elapsed watch alive");

    first.hang_up().await;
    let frozen = first.elapsed_seconds();
    tokio::time::sleep(SHORT).await;
    // Stopped, not reset, after the call ends.
    assert_eq!(first.elapsed_seconds(), frozen);

    let second = engine.dial(owner(), None).await;
    assert_eq!(second.elapsed_seconds(), 0);
    second.hang_up().await;
}

#[test(tokio::test)]
async fn incoming_call_is_answered_on_the_shared_channel() {
    let transport = MockTransport::new("owner-chan");
    let media = MockAcquirer::new();
    let peers = MockPeerFactory::new();
    let engine = engine_with(&transport, &media, &peers);

    let mut listener = IncomingCalls::connect(
        transport.clone(),
        ChannelConfig {
            connect_timeout: Duration::from_millis(200),
            reconnect_max_tries: 8,
        },
    )
    .await
    .expect("listener connects");

    transport.push(&SignalingMessage::CallMade {
        sdp: "offer-sdp".to_string(),
        from_id: "caller-1".to_string(),
        caller_name: "Scanner".to_string(),
        call_id: "call-abc".to_string(),
    });

    let incoming = tokio::time::timeout(WAIT, listener.next())
        .await
        .expect("prompt in time")
        .expect("listener alive");
    assert_eq!(incoming.from_id, "caller-1");
    assert_eq!(incoming.caller_name, "Scanner");
    assert_eq!(incoming.call_id, "call-abc");

    let mut outgoing = transport.outgoing();
    let call = engine.answer(incoming, listener.channel()).await;

    let accept = loop {
        match next_sent(&mut outgoing, WAIT).await.expect("accept sent") {
            msg @ SignalingMessage::CallAccepted { .. } => break msg,
            _ => continue,
        }
    };
    assert_eq!(
        accept,
        SignalingMessage::CallAccepted {
            sdp: "answer-1".to_string(),
            call_id: "call-abc".to_string(),
        }
    );

    wait_for_status(&call, |s| *s == CallStatus::Connected).await;
    assert_eq!(
        peers.state().remote_descriptions(),
        vec!["offer-sdp".to_string()]
    );

    call.hang_up().await;

    // The shared listener connection stays up after the call ends.
    assert_eq!(listener.channel().state(), ChannelState::Ready);
    let sent = drain_sent(&mut outgoing, SHORT).await;
    let end_calls = sent
        .iter()
        .filter(|msg| matches!(msg, SignalingMessage::EndCall { .. }))
        .count();
    assert_eq!(end_calls, 1);
}

#[test(tokio::test)]
async fn declining_sends_the_hangup_event() {
    let transport = MockTransport::new("owner-chan");
    let media = MockAcquirer::new();
    let peers = MockPeerFactory::new();
    let engine = engine_with(&transport, &media, &peers);

    let mut listener = IncomingCalls::connect(transport.clone(), ChannelConfig::persistent())
        .await
        .expect("listener connects");

    transport.push(&SignalingMessage::CallMade {
        sdp: "offer-sdp".to_string(),
        from_id: "caller-1".to_string(),
        caller_name: String::new(),
        call_id: "call-abc".to_string(),
    });

    let incoming = tokio::time::timeout(WAIT, listener.next())
        .await
        .expect("prompt in time")
        .expect("listener alive");
    // The original surface substitutes a fallback display name.
    assert_eq!(incoming.caller_name, "Vehicle Owner");

    let mut outgoing = transport.outgoing();
    engine
        .decline(&incoming, listener.channel())
        .await
        .expect("decline sent");

    let declined = next_sent(&mut outgoing, WAIT).await.expect("hangup sent");
    assert_eq!(
        declined,
        SignalingMessage::EndCall {
            target_id: "caller-1".to_string(),
            session_ref: None,
        }
    );

    // No media is ever acquired for a declined call.
    assert_eq!(media.acquired_count(), 0);
}
