#![allow(dead_code)]

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rtc_integration::{
    LocalMediaStream, LocalTrack, MediaConstraints, MediaDevices, PeerConnection,
    PeerConnectionEvent, PeerConnectionFactory, RtcConfiguration, TrackKind,
};
use serde_json::{json, Value};
use shared::{
    domain::{MessageId, MessageStatus, RoomId, RoomKind, Table, UserId},
    protocol::{IceCandidateInit, Profile, SdpKind, SessionDescription},
};
use tokio::sync::broadcast;

use crate::{memory::InMemoryBackend, ClientEvent};

pub fn profile(username: &str) -> Profile {
    Profile {
        id: UserId::random(),
        username: username.to_string(),
        avatar_url: None,
        last_seen: None,
    }
}

pub fn ts(raw: &str) -> DateTime<Utc> {
    raw.parse().expect("timestamp")
}

pub fn events() -> broadcast::Sender<ClientEvent> {
    broadcast::channel(256).0
}

pub async fn seed_profiles(backend: &InMemoryBackend, profiles: &[&Profile]) {
    backend
        .seed(
            Table::Profiles,
            profiles
                .iter()
                .map(|p| serde_json::to_value(p).expect("profile row")),
        )
        .await;
}

/// Seeds a room with its memberships and returns its id.
pub async fn seed_room(
    backend: &InMemoryBackend,
    kind: RoomKind,
    name: Option<&str>,
    created_at: &str,
    members: &[UserId],
) -> RoomId {
    let room_id = RoomId::random();
    backend
        .seed(
            Table::Rooms,
            [json!({
                "id": room_id,
                "name": name,
                "type": kind,
                "created_by": members.first(),
                "created_at": created_at,
            })],
        )
        .await;
    backend
        .seed(
            Table::RoomMemberships,
            members
                .iter()
                .map(|user_id| json!({ "room_id": room_id, "user_id": user_id })),
        )
        .await;
    room_id
}

pub fn message_row(
    room_id: RoomId,
    sender_id: UserId,
    content: &str,
    created_at: &str,
    status: MessageStatus,
) -> Value {
    json!({
        "id": MessageId::random(),
        "room_id": room_id,
        "sender_id": sender_id,
        "content": content,
        "created_at": created_at,
        "status": status,
        "file_url": null,
        "file_name": null,
        "file_type": null,
    })
}

/// Polls `check` until it holds, for about a second of (possibly paused)
/// runtime time.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

pub fn candidate(n: u32) -> IceCandidateInit {
    IceCandidateInit {
        candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host"),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    }
}

pub fn description(kind: SdpKind, tag: &str) -> SessionDescription {
    SessionDescription {
        kind,
        sdp: format!("v=0\r\no=- {tag} 2 IN IP4 127.0.0.1\r\n"),
    }
}

pub struct FakeStream {
    tracks: Vec<LocalTrack>,
    stops: AtomicUsize,
}

impl FakeStream {
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalMediaStream for FakeStream {
    fn tracks(&self) -> Vec<LocalTrack> {
        self.tracks.clone()
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeMediaDevices {
    pub fail: AtomicBool,
    pub requests: Mutex<Vec<MediaConstraints>>,
    pub streams: Mutex<Vec<Arc<FakeStream>>>,
}

impl FakeMediaDevices {
    pub fn last_stream(&self) -> Option<Arc<FakeStream>> {
        self.streams.lock().expect("streams").last().cloned()
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Arc<dyn LocalMediaStream>> {
        self.requests.lock().expect("requests").push(constraints);
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("permission denied"));
        }
        let mut tracks = vec![LocalTrack {
            track_id: "mic".to_string(),
            kind: TrackKind::Audio,
        }];
        if constraints.video {
            tracks.push(LocalTrack {
                track_id: "camera".to_string(),
                kind: TrackKind::Video,
            });
        }
        let stream = Arc::new(FakeStream {
            tracks,
            stops: AtomicUsize::new(0),
        });
        self.streams.lock().expect("streams").push(stream.clone());
        Ok(stream)
    }
}

/// Records every negotiation call as a short string.
pub struct FakePeer {
    pub config: RtcConfiguration,
    calls: Mutex<Vec<String>>,
    remote_set: AtomicBool,
    closes: AtomicUsize,
    events: broadcast::Sender<PeerConnectionEvent>,
}

impl FakePeer {
    fn new(config: RtcConfiguration) -> Self {
        Self {
            config,
            calls: Mutex::new(Vec::new()),
            remote_set: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
            events: broadcast::channel(64).0,
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("calls").push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| call.strip_prefix("add_ice_candidate:").map(str::to_string))
            .collect()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn emit(&self, event: PeerConnectionEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        self.record(format!("add_track:{}", track.track_id));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.record("create_offer".to_string());
        Ok(description(SdpKind::Offer, "local"))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record("create_answer".to_string());
        Ok(description(SdpKind::Answer, "local"))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.record(format!("set_local:{:?}", description.kind));
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.record(format!("set_remote:{:?}", description.kind));
        self.remote_set.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        self.remote_set.load(Ordering::SeqCst)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()> {
        if !self.has_remote_description() {
            return Err(anyhow!("remote description not set"));
        }
        self.record(format!("add_ice_candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.record("close".to_string());
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<PeerConnectionEvent> {
        self.events.subscribe()
    }
}

#[derive(Default)]
pub struct FakePeerFactory {
    pub fail: AtomicBool,
    pub created: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    pub fn last(&self) -> Option<Arc<FakePeer>> {
        self.created.lock().expect("created").last().cloned()
    }

    pub fn count(&self) -> usize {
        self.created.lock().expect("created").len()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(&self, configuration: RtcConfiguration) -> Result<Arc<dyn PeerConnection>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("peer connection unavailable"));
        }
        let peer = Arc::new(FakePeer::new(configuration));
        self.created.lock().expect("created").push(peer.clone());
        Ok(peer)
    }
}
