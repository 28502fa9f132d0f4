use super::*;

use std::sync::atomic::Ordering;

use rtc_integration::{IceConnectionState, TrackKind};
use shared::protocol::{Profile, SdpKind};

use crate::{
    memory::InMemoryBackend,
    test_support::{
        candidate, description, eventually, events, profile, FakeMediaDevices, FakePeer,
        FakePeerFactory,
    },
};

const STUN: &str = "stun:stun.l.google.com:19302";

struct Party {
    profile: Profile,
    engine: Arc<CallSignalingEngine>,
    media: Arc<FakeMediaDevices>,
    peers: Arc<FakePeerFactory>,
    events: broadcast::Sender<ClientEvent>,
}

impl Party {
    fn new(backend: &InMemoryBackend, name: &str) -> Self {
        let profile = profile(name);
        let media = Arc::new(FakeMediaDevices::default());
        let peers = Arc::new(FakePeerFactory::default());
        let events = events();
        let engine = Arc::new(CallSignalingEngine::new(
            Arc::new(backend.clone()),
            Arc::new(backend.clone()),
            media.clone(),
            peers.clone(),
            RtcConfiguration::with_stun_urls([STUN]),
            SessionContext::new(profile.clone()),
            events.clone(),
        ));
        Self {
            profile,
            engine,
            media,
            peers,
            events,
        }
    }

    fn id(&self) -> UserId {
        self.profile.id
    }

    fn peer(&self) -> Arc<FakePeer> {
        self.peers.last().expect("peer connection created")
    }
}

fn signal(room_id: RoomId, from: UserId, to: UserId, kind: SignalKind, payload: Value) -> CallSignal {
    CallSignal {
        id: None,
        room_id,
        caller_id: from,
        callee_id: to,
        kind,
        payload,
        created_at: None,
    }
}

fn call_start(room_id: RoomId, from: UserId, to: UserId, media: MediaKind) -> CallSignal {
    let payload = serde_json::to_value(CallStartPayload { call_type: media }).expect("payload");
    signal(room_id, from, to, SignalKind::CallStart, payload)
}

fn sdp(room_id: RoomId, from: UserId, to: UserId, kind: SdpKind) -> CallSignal {
    let signal_kind = match kind {
        SdpKind::Offer => SignalKind::Offer,
        SdpKind::Answer => SignalKind::Answer,
    };
    let payload = serde_json::to_value(SdpPayload {
        sdp: description(kind, "remote"),
    })
    .expect("payload");
    signal(room_id, from, to, signal_kind, payload)
}

fn ice(room_id: RoomId, from: UserId, to: UserId, n: u32) -> CallSignal {
    let payload = serde_json::to_value(IceCandidatePayload {
        candidate: candidate(n),
    })
    .expect("payload");
    signal(room_id, from, to, SignalKind::IceCandidate, payload)
}

fn bare(room_id: RoomId, from: UserId, to: UserId, kind: SignalKind) -> CallSignal {
    signal(room_id, from, to, kind, json!({}))
}

async fn sent_signals(backend: &InMemoryBackend) -> Vec<CallSignal> {
    backend
        .rows(Table::CallSignals)
        .await
        .into_iter()
        .map(|row| serde_json::from_value(row).expect("signal row"))
        .collect()
}

async fn sent_kinds(backend: &InMemoryBackend, from: UserId) -> Vec<SignalKind> {
    sent_signals(backend)
        .await
        .into_iter()
        .filter(|s| s.caller_id == from)
        .map(|s| s.kind)
        .collect()
}

fn drain_states(events: &mut broadcast::Receiver<ClientEvent>) -> Vec<CallState> {
    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ClientEvent::CallStateChanged(snapshot) = event {
            states.push(snapshot.state);
        }
    }
    states
}

#[tokio::test]
async fn caller_connects_on_answer_and_releases_on_end() {
    let backend = InMemoryBackend::new();
    let (alice, bob) = (Party::new(&backend, "alice"), Party::new(&backend, "bob"));
    let room = RoomId::random();
    let mut states = alice.events.subscribe();

    alice
        .engine
        .start_call(room, bob.id(), MediaKind::Video)
        .await
        .expect("start");

    let snapshot = alice.engine.snapshot().await;
    assert_eq!(snapshot.state, CallState::Calling);
    assert_eq!(snapshot.media, MediaKind::Video);
    assert_eq!(snapshot.remote_user, Some(bob.id()));
    assert!(snapshot.has_local_stream);
    assert_eq!(
        *alice.media.requests.lock().expect("requests"),
        vec![MediaConstraints { audio: true, video: true }]
    );

    let peer = alice.peer();
    assert_eq!(peer.config, RtcConfiguration::with_stun_urls([STUN]));
    assert_eq!(
        peer.calls(),
        vec!["add_track:mic", "add_track:camera", "create_offer", "set_local:Offer"]
    );

    let sent = sent_signals(&backend).await;
    assert_eq!(
        sent.iter().map(|s| s.kind).collect::<Vec<_>>(),
        vec![SignalKind::CallStart, SignalKind::Offer]
    );
    assert!(sent.iter().all(|s| s.room_id == room && s.callee_id == bob.id()));
    assert_eq!(sent[0].payload, json!({ "callType": "video" }));
    assert_eq!(sent[1].payload["sdp"]["type"], "offer");

    alice
        .engine
        .handle_signal(sdp(room, bob.id(), alice.id(), SdpKind::Answer))
        .await;
    assert_eq!(alice.engine.state().await, CallState::Connected);
    assert!(peer.calls().contains(&"set_remote:Answer".to_string()));

    alice.engine.end_call().await.expect("end");
    assert_eq!(alice.engine.snapshot().await, CallSnapshot::default());
    assert_eq!(peer.close_count(), 1);
    assert_eq!(alice.media.last_stream().expect("stream").stop_count(), 1);
    assert_eq!(
        sent_kinds(&backend, alice.id()).await.last(),
        Some(&SignalKind::CallEnd)
    );
    assert_eq!(
        drain_states(&mut states),
        vec![CallState::Calling, CallState::Connected, CallState::Idle]
    );
}

#[tokio::test]
async fn callee_answers_a_queued_offer_on_accept() {
    let backend = InMemoryBackend::new();
    let (alice, bob) = (Party::new(&backend, "alice"), Party::new(&backend, "bob"));
    let room = RoomId::random();

    bob.engine
        .handle_signal(call_start(room, alice.id(), bob.id(), MediaKind::Audio))
        .await;
    let snapshot = bob.engine.snapshot().await;
    assert_eq!(snapshot.state, CallState::Incoming);
    assert_eq!(snapshot.room_id, Some(room));
    assert_eq!(snapshot.remote_user, Some(alice.id()));
    assert!(!snapshot.has_local_stream);

    bob.engine
        .handle_signal(sdp(room, alice.id(), bob.id(), SdpKind::Offer))
        .await;
    assert_eq!(bob.peers.count(), 0);
    assert_eq!(bob.engine.state().await, CallState::Incoming);

    bob.engine.accept_call().await.expect("accept");

    assert_eq!(bob.engine.state().await, CallState::Connected);
    assert_eq!(
        bob.peer().calls(),
        vec!["add_track:mic", "set_remote:Offer", "create_answer", "set_local:Answer"]
    );
    let sent = sent_signals(&backend).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, SignalKind::Answer);
    assert_eq!(sent[0].caller_id, bob.id());
    assert_eq!(sent[0].callee_id, alice.id());
}

#[tokio::test]
async fn early_candidates_are_applied_in_order_after_the_offer() {
    let backend = InMemoryBackend::new();
    let (alice, bob) = (Party::new(&backend, "alice"), Party::new(&backend, "bob"));
    let room = RoomId::random();

    bob.engine
        .handle_signal(call_start(room, alice.id(), bob.id(), MediaKind::Audio))
        .await;
    bob.engine.handle_signal(ice(room, alice.id(), bob.id(), 1)).await;
    bob.engine.accept_call().await.expect("accept");
    bob.engine.handle_signal(ice(room, alice.id(), bob.id(), 2)).await;
    assert!(bob.peer().applied_candidates().is_empty());

    bob.engine
        .handle_signal(sdp(room, alice.id(), bob.id(), SdpKind::Offer))
        .await;
    bob.engine.handle_signal(ice(room, alice.id(), bob.id(), 3)).await;

    let calls = bob.peer().calls();
    let remote_at = calls
        .iter()
        .position(|c| c == "set_remote:Offer")
        .expect("remote description");
    let first_candidate = calls
        .iter()
        .position(|c| c.starts_with("add_ice_candidate:"))
        .expect("candidate");
    assert!(remote_at < first_candidate);
    let expected: Vec<String> = [1, 2, 3].into_iter().map(|n| candidate(n).candidate).collect();
    assert_eq!(bob.peer().applied_candidates(), expected);
    assert_eq!(bob.engine.state().await, CallState::Connected);
    assert_eq!(sent_kinds(&backend, bob.id()).await, vec![SignalKind::Answer]);
}

#[tokio::test]
async fn caller_buffers_candidates_until_the_answer() {
    let backend = InMemoryBackend::new();
    let (alice, bob) = (Party::new(&backend, "alice"), Party::new(&backend, "bob"));
    let room = RoomId::random();

    alice
        .engine
        .start_call(room, bob.id(), MediaKind::Audio)
        .await
        .expect("start");
    alice.engine.handle_signal(ice(room, bob.id(), alice.id(), 7)).await;
    assert!(alice.peer().applied_candidates().is_empty());

    alice
        .engine
        .handle_signal(sdp(room, bob.id(), alice.id(), SdpKind::Answer))
        .await;
    assert_eq!(alice.peer().applied_candidates(), vec![candidate(7).candidate]);
}

#[tokio::test]
async fn cleanup_is_idempotent() {
    let backend = InMemoryBackend::new();
    let (alice, bob) = (Party::new(&backend, "alice"), Party::new(&backend, "bob"));
    let mut states = alice.events.subscribe();

    alice.engine.cleanup().await;
    assert!(drain_states(&mut states).is_empty());

    alice
        .engine
        .start_call(RoomId::random(), bob.id(), MediaKind::Audio)
        .await
        .expect("start");
    alice.engine.cleanup().await;
    alice.engine.cleanup().await;

    assert_eq!(alice.engine.snapshot().await, CallSnapshot::default());
    assert!(alice.engine.local_stream().await.is_none());
    assert_eq!(alice.peer().close_count(), 1);
    assert_eq!(alice.media.last_stream().expect("stream").stop_count(), 1);
    assert_eq!(
        drain_states(&mut states),
        vec![CallState::Calling, CallState::Idle]
    );
}

#[tokio::test]
async fn transitions_from_the_wrong_state_are_rejected() {
    let backend = InMemoryBackend::new();
    let (alice, bob) = (Party::new(&backend, "alice"), Party::new(&backend, "bob"));

    let err = alice.engine.accept_call().await.expect_err("nothing to accept");
    assert!(matches!(
        err,
        CallError::InvalidTransition {
            from: CallState::Idle,
            ..
        }
    ));
    assert!(alice.engine.reject_call().await.is_err());
    assert!(alice.engine.end_call().await.is_err());

    alice
        .engine
        .start_call(RoomId::random(), bob.id(), MediaKind::Audio)
        .await
        .expect("start");
    let err = alice
        .engine
        .start_call(RoomId::random(), bob.id(), MediaKind::Audio)
        .await
        .expect_err("already calling");
    assert!(matches!(
        err,
        CallError::InvalidTransition {
            from: CallState::Calling,
            ..
        }
    ));
    assert!(alice.engine.accept_call().await.is_err());
    assert_eq!(alice.peers.count(), 1);
    assert_eq!(alice.engine.state().await, CallState::Calling);
}

#[tokio::test]
async fn media_failure_returns_to_idle_without_signalling() {
    let backend = InMemoryBackend::new();
    let (alice, bob) = (Party::new(&backend, "alice"), Party::new(&backend, "bob"));
    alice.media.fail.store(true, Ordering::SeqCst);
    let mut states = alice.events.subscribe();

    let err = alice
        .engine
        .start_call(RoomId::random(), bob.id(), MediaKind::Video)
        .await
        .expect_err("no camera");

    assert!(matches!(err, CallError::Media(_)));
    assert_eq!(alice.engine.snapshot().await, CallSnapshot::default());
    assert_eq!(alice.peers.count(), 0);
    assert!(sent_signals(&backend).await.is_empty());
    assert_eq!(
        drain_states(&mut states),
        vec![CallState::Calling, CallState::Idle]
    );
}

#[tokio::test]
async fn peer_connection_failure_stops_captured_media() {
    let backend = InMemoryBackend::new();
    let (alice, bob) = (Party::new(&backend, "alice"), Party::new(&backend, "bob"));
    let room = RoomId::random();
    bob.peers.fail.store(true, Ordering::SeqCst);
    bob.engine
        .handle_signal(call_start(room, alice.id(), bob.id(), MediaKind::Audio))
        .await;

    let err = bob.engine.accept_call().await.expect_err("no peer");

    assert!(matches!(err, CallError::PeerConnection(_)));
    assert_eq!(bob.engine.state().await, CallState::Idle);
    assert_eq!(bob.media.last_stream().expect("stream").stop_count(), 1);
}

#[tokio::test]
async fn busy_callee_rejects_a_second_caller() {
    let backend = InMemoryBackend::new();
    let (alice, bob, carol) = (
        Party::new(&backend, "alice"),
        Party::new(&backend, "bob"),
        Party::new(&backend, "carol"),
    );
    let room = RoomId::random();
    let other_room = RoomId::random();
    alice
        .engine
        .start_call(room, bob.id(), MediaKind::Audio)
        .await
        .expect("start");

    alice
        .engine
        .handle_signal(call_start(other_room, carol.id(), alice.id(), MediaKind::Video))
        .await;

    let snapshot = alice.engine.snapshot().await;
    assert_eq!(snapshot.state, CallState::Calling);
    assert_eq!(snapshot.remote_user, Some(bob.id()));
    let reject = sent_signals(&backend)
        .await
        .into_iter()
        .find(|s| s.kind == SignalKind::CallReject)
        .expect("reject sent");
    assert_eq!(reject.caller_id, alice.id());
    assert_eq!(reject.callee_id, carol.id());
    assert_eq!(reject.room_id, other_room);
}

#[tokio::test]
async fn signals_for_other_calls_are_ignored() {
    let backend = InMemoryBackend::new();
    let (alice, bob, carol) = (
        Party::new(&backend, "alice"),
        Party::new(&backend, "bob"),
        Party::new(&backend, "carol"),
    );
    let room = RoomId::random();

    alice
        .engine
        .handle_signal(call_start(room, bob.id(), carol.id(), MediaKind::Audio))
        .await;
    assert_eq!(alice.engine.state().await, CallState::Idle);

    alice
        .engine
        .start_call(room, bob.id(), MediaKind::Audio)
        .await
        .expect("start");
    alice
        .engine
        .handle_signal(bare(room, carol.id(), alice.id(), SignalKind::CallEnd))
        .await;
    alice
        .engine
        .handle_signal(bare(RoomId::random(), bob.id(), alice.id(), SignalKind::CallEnd))
        .await;
    alice
        .engine
        .handle_signal(sdp(room, carol.id(), alice.id(), SdpKind::Answer))
        .await;

    assert_eq!(alice.engine.state().await, CallState::Calling);
    assert!(!alice.peer().has_remote_description());
}

#[tokio::test]
async fn remote_hangup_and_rejection_release_the_call() {
    let backend = InMemoryBackend::new();
    let (alice, bob) = (Party::new(&backend, "alice"), Party::new(&backend, "bob"));
    let room = RoomId::random();

    alice
        .engine
        .start_call(room, bob.id(), MediaKind::Audio)
        .await
        .expect("start");
    alice
        .engine
        .handle_signal(bare(room, bob.id(), alice.id(), SignalKind::CallReject))
        .await;
    assert_eq!(alice.engine.state().await, CallState::Idle);
    assert_eq!(alice.peer().close_count(), 1);

    bob.engine
        .handle_signal(call_start(room, alice.id(), bob.id(), MediaKind::Audio))
        .await;
    bob.engine
        .handle_signal(bare(room, alice.id(), bob.id(), SignalKind::CallEnd))
        .await;
    assert_eq!(bob.engine.state().await, CallState::Idle);
}

#[tokio::test]
async fn rejecting_an_incoming_call_notifies_the_caller() {
    let backend = InMemoryBackend::new();
    let (alice, bob) = (Party::new(&backend, "alice"), Party::new(&backend, "bob"));
    let room = RoomId::random();
    bob.engine
        .handle_signal(call_start(room, alice.id(), bob.id(), MediaKind::Video))
        .await;

    bob.engine.reject_call().await.expect("reject");

    assert_eq!(bob.engine.snapshot().await, CallSnapshot::default());
    assert_eq!(bob.media.requests.lock().expect("requests").len(), 0);
    let sent = sent_signals(&backend).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, SignalKind::CallReject);
    assert_eq!(sent[0].callee_id, alice.id());
}

#[tokio::test]
async fn malformed_offer_resets_the_call() {
    let backend = InMemoryBackend::new();
    let (alice, bob) = (Party::new(&backend, "alice"), Party::new(&backend, "bob"));
    let room = RoomId::random();
    bob.engine
        .handle_signal(call_start(room, alice.id(), bob.id(), MediaKind::Audio))
        .await;

    bob.engine
        .handle_signal(signal(room, alice.id(), bob.id(), SignalKind::Offer, json!({ "sdp": 5 })))
        .await;

    assert_eq!(bob.engine.state().await, CallState::Idle);
}

#[tokio::test]
async fn lost_connection_cleans_up() {
    let backend = InMemoryBackend::new();
    let (alice, bob) = (Party::new(&backend, "alice"), Party::new(&backend, "bob"));
    let room = RoomId::random();
    alice
        .engine
        .start_call(room, bob.id(), MediaKind::Audio)
        .await
        .expect("start");
    alice
        .engine
        .handle_signal(sdp(room, bob.id(), alice.id(), SdpKind::Answer))
        .await;
    let peer = alice.peer();

    peer.emit(PeerConnectionEvent::IceConnectionStateChanged(IceConnectionState::Checking));
    peer.emit(PeerConnectionEvent::IceConnectionStateChanged(IceConnectionState::Failed));

    let engine = &alice.engine;
    assert!(eventually(|| async move { engine.state().await == CallState::Idle }).await);
    assert_eq!(peer.close_count(), 1);
}

#[tokio::test]
async fn disconnect_and_hangup_release_the_call_once() {
    let backend = InMemoryBackend::new();
    let (alice, bob) = (Party::new(&backend, "alice"), Party::new(&backend, "bob"));
    let room = RoomId::random();
    let mut states = alice.events.subscribe();

    alice
        .engine
        .start_call(room, bob.id(), MediaKind::Audio)
        .await
        .expect("start");
    alice
        .engine
        .handle_signal(sdp(room, bob.id(), alice.id(), SdpKind::Answer))
        .await;
    let first = alice.peer();
    first.emit(PeerConnectionEvent::IceConnectionStateChanged(IceConnectionState::Disconnected));

    let engine = &alice.engine;
    assert!(eventually(|| async move { engine.state().await == CallState::Idle }).await);
    engine.cleanup().await;
    assert!(matches!(
        engine.end_call().await,
        Err(CallError::InvalidTransition { from: CallState::Idle, .. })
    ));
    assert_eq!(first.close_count(), 1);
    assert_eq!(
        drain_states(&mut states),
        vec![CallState::Calling, CallState::Connected, CallState::Idle]
    );

    engine
        .start_call(room, bob.id(), MediaKind::Audio)
        .await
        .expect("second call");
    let second = alice.peer();
    engine.end_call().await.expect("end");
    second.emit(PeerConnectionEvent::IceConnectionStateChanged(IceConnectionState::Disconnected));
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    assert_eq!(engine.snapshot().await, CallSnapshot::default());
    assert_eq!(second.close_count(), 1);
    assert_eq!(first.close_count(), 1);
    assert_eq!(drain_states(&mut states), vec![CallState::Calling, CallState::Idle]);
}

#[tokio::test]
async fn repeated_call_start_from_the_current_caller_is_ignored() {
    let backend = InMemoryBackend::new();
    let (alice, bob) = (Party::new(&backend, "alice"), Party::new(&backend, "bob"));
    let room = RoomId::random();

    bob.engine
        .handle_signal(call_start(room, alice.id(), bob.id(), MediaKind::Video))
        .await;
    bob.engine
        .handle_signal(call_start(room, alice.id(), bob.id(), MediaKind::Video))
        .await;

    let snapshot = bob.engine.snapshot().await;
    assert_eq!(snapshot.state, CallState::Incoming);
    assert_eq!(snapshot.remote_user, Some(alice.id()));
    assert!(sent_kinds(&backend, bob.id()).await.is_empty());

    bob.engine.accept_call().await.expect("accept");
    assert_eq!(bob.engine.state().await, CallState::Connected);
    assert!(sent_kinds(&backend, bob.id()).await.is_empty());
}

#[tokio::test]
async fn local_candidates_and_remote_tracks_are_forwarded() {
    let backend = InMemoryBackend::new();
    let (alice, bob) = (Party::new(&backend, "alice"), Party::new(&backend, "bob"));
    let room = RoomId::random();
    let mut events = alice.events.subscribe();
    alice
        .engine
        .start_call(room, bob.id(), MediaKind::Video)
        .await
        .expect("start");
    let peer = alice.peer();

    peer.emit(PeerConnectionEvent::IceCandidate(candidate(4)));
    let track = RemoteTrack {
        track_id: "remote-video".to_string(),
        stream_id: "stream-1".to_string(),
        kind: TrackKind::Video,
    };
    peer.emit(PeerConnectionEvent::TrackAdded(track.clone()));

    let engine = &alice.engine;
    assert!(eventually(|| async move { engine.snapshot().await.remote_tracks.len() == 1 }).await);
    let backend_ref = &backend;
    assert!(
        eventually(|| async move {
            sent_kinds(backend_ref, alice.profile.id)
                .await
                .contains(&SignalKind::IceCandidate)
        })
        .await
    );
    let relayed = sent_signals(&backend)
        .await
        .into_iter()
        .find(|s| s.kind == SignalKind::IceCandidate)
        .expect("candidate signal");
    assert_eq!(relayed.callee_id, bob.id());
    assert_eq!(relayed.payload["candidate"]["candidate"], candidate(4).candidate);

    let mut added = None;
    while let Ok(event) = events.try_recv() {
        if let ClientEvent::RemoteTrackAdded(remote) = event {
            added = Some(remote);
        }
    }
    assert_eq!(added, Some(track));
}

#[tokio::test]
async fn two_listening_engines_complete_a_call_over_the_table() {
    let backend = InMemoryBackend::new();
    let (alice, bob) = (Party::new(&backend, "alice"), Party::new(&backend, "bob"));
    let room = RoomId::random();
    alice.engine.start_listening().await.expect("listen");
    bob.engine.start_listening().await.expect("listen");

    alice
        .engine
        .start_call(room, bob.id(), MediaKind::Audio)
        .await
        .expect("start");
    let (caller, callee) = (&alice.engine, &bob.engine);
    assert!(eventually(|| async move { callee.state().await == CallState::Incoming }).await);

    callee.accept_call().await.expect("accept");
    assert!(eventually(|| async move { caller.state().await == CallState::Connected }).await);
    assert_eq!(callee.state().await, CallState::Connected);
    assert_eq!(callee.snapshot().await.remote_user, Some(alice.id()));

    caller.end_call().await.expect("end");
    assert!(eventually(|| async move { callee.state().await == CallState::Idle }).await);
    assert_eq!(bob.peer().close_count(), 1);

    alice.engine.stop_listening().await;
    bob.engine.stop_listening().await;
}
