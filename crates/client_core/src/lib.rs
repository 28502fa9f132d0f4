use std::{collections::HashSet, future::Future, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rtc_integration::{
    LocalMediaStream, MediaConstraints, MediaDevices, PeerConnection, PeerConnectionFactory,
    RemoteTrack, RtcConfiguration,
};
use shared::{
    domain::{MediaKind, RoomId, UserId},
    protocol::{Message, Profile, Room},
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{info, warn};

pub mod backend;
pub mod call;
pub mod config;
pub mod context;
pub mod error;
pub mod memory;
pub mod messages;
pub mod presence;
pub mod profiles;
pub mod realtime_ws;
pub mod rest;
pub mod rooms;
pub mod router;
pub mod typing;

use backend::{ObjectStorage, RealtimeHub, RowStore};
use call::{CallSignalingEngine, CallSnapshot};
use config::ClientSettings;
use context::SessionContext;
use error::{CallError, RoomError, SendError};
use memory::InMemoryBackend;
use messages::{MessageStore, OutgoingFile};
use presence::PresenceTracker;
use profiles::ProfileCache;
use rooms::RoomDirectory;
use router::RealtimeEventRouter;
use typing::TypingCoordinator;

const EVENT_CAPACITY: usize = 512;

/// Change notifications for the view layer. Each one says what to re-read,
/// not the new state itself.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    RoomsUpdated,
    MessagesUpdated { room_id: RoomId },
    TypingUpdated { room_id: RoomId },
    PresenceUpdated,
    CallStateChanged(CallSnapshot),
    RemoteTrackAdded(RemoteTrack),
    Error(String),
}

pub fn spawn_logged<F>(operation: &'static str, task: F) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = task.await {
            warn!("{operation} failed: {err:#}");
        }
    })
}

pub struct MissingMediaDevices;

#[async_trait]
impl MediaDevices for MissingMediaDevices {
    async fn get_user_media(
        &self,
        _constraints: MediaConstraints,
    ) -> Result<Arc<dyn LocalMediaStream>> {
        Err(anyhow!("no media capture backend configured"))
    }
}

pub struct MissingPeerConnectionFactory;

#[async_trait]
impl PeerConnectionFactory for MissingPeerConnectionFactory {
    async fn create(&self, _configuration: RtcConfiguration) -> Result<Arc<dyn PeerConnection>> {
        Err(anyhow!("no peer connection backend configured"))
    }
}

#[derive(Clone)]
pub struct ClientDeps {
    pub store: Arc<dyn RowStore>,
    pub hub: Arc<dyn RealtimeHub>,
    pub storage: Arc<dyn ObjectStorage>,
    pub media_devices: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerConnectionFactory>,
}

impl ClientDeps {
    pub fn in_memory(backend: &InMemoryBackend) -> Self {
        Self {
            store: Arc::new(backend.clone()),
            hub: Arc::new(backend.clone()),
            storage: Arc::new(backend.clone()),
            media_devices: Arc::new(MissingMediaDevices),
            peers: Arc::new(MissingPeerConnectionFactory),
        }
    }

    pub fn with_media(
        mut self,
        media_devices: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnectionFactory>,
    ) -> Self {
        self.media_devices = media_devices;
        self.peers = peers;
        self
    }
}

pub struct ChatClient {
    context: SessionContext,
    events: broadcast::Sender<ClientEvent>,
    profiles: Arc<ProfileCache>,
    rooms: Arc<RoomDirectory>,
    messages: Arc<MessageStore>,
    presence: Arc<PresenceTracker>,
    typing: Arc<TypingCoordinator>,
    router: Arc<RealtimeEventRouter>,
    calls: Arc<CallSignalingEngine>,
}

impl ChatClient {
    pub fn new(viewer: Profile, settings: &ClientSettings, deps: ClientDeps) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let context = SessionContext::new(viewer);
        let profiles = Arc::new(ProfileCache::new(deps.store.clone()));
        let rooms = Arc::new(RoomDirectory::new(
            deps.store.clone(),
            profiles.clone(),
            events.clone(),
            settings.profile_search_limit,
        ));
        let messages = Arc::new(MessageStore::new(
            deps.store.clone(),
            deps.storage.clone(),
            settings.storage_bucket.clone(),
            profiles.clone(),
            context.clone(),
            events.clone(),
        ));
        let presence = Arc::new(PresenceTracker::new(
            deps.hub.clone(),
            deps.store.clone(),
            profiles.clone(),
            context.clone(),
            events.clone(),
            settings.heartbeat_interval,
        ));
        let typing = Arc::new(TypingCoordinator::new(
            deps.hub.clone(),
            context.clone(),
            events.clone(),
            settings.typing_expiry,
        ));
        let router = Arc::new(RealtimeEventRouter::new(
            deps.hub.clone(),
            context.clone(),
            profiles.clone(),
            rooms.clone(),
            messages.clone(),
        ));
        let calls = Arc::new(CallSignalingEngine::new(
            deps.store,
            deps.hub,
            deps.media_devices,
            deps.peers,
            RtcConfiguration::with_stun_urls(settings.stun_urls.iter().cloned()),
            context.clone(),
            events.clone(),
        ));

        Self {
            context,
            events,
            profiles,
            rooms,
            messages,
            presence,
            typing,
            router,
            calls,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn viewer(&self) -> Profile {
        self.context.viewer()
    }

    pub fn active_room(&self) -> Option<RoomId> {
        self.context.active_room()
    }

    pub async fn start(&self) -> Result<Vec<Room>> {
        let viewer = self.context.viewer();
        info!(user_id = %viewer.id, username = %viewer.username, "session: starting");
        self.profiles.insert(viewer.clone()).await;

        self.router.start().await?;
        self.calls.start_listening().await?;
        if let Err(err) = self.presence.start().await {
            warn!("session: presence unavailable: {err:#}");
            let _ = self
                .events
                .send(ClientEvent::Error(format!("presence unavailable: {err:#}")));
        }
        Ok(self.rooms.load_rooms(viewer.id).await)
    }

    pub async fn select_room(&self, room_id: RoomId) -> Vec<Message> {
        self.context.set_active_room(Some(room_id));
        self.messages.reset(Some(room_id)).await;
        self.rooms.clear_unread(room_id).await;
        if let Err(err) = self.typing.bind_room(room_id).await {
            warn!(room_id = %room_id, "session: typing listener unavailable: {err:#}");
        }
        self.messages.load_history(room_id).await
    }

    pub async fn close_room(&self) {
        self.context.set_active_room(None);
        self.typing.unbind().await;
        self.messages.reset(None).await;
    }

    pub async fn send_message(
        &self,
        text: &str,
        file: Option<OutgoingFile>,
    ) -> std::result::Result<Message, SendError> {
        let room_id = self.context.active_room().ok_or(SendError::NoActiveRoom)?;
        match self.messages.send(room_id, text, file).await {
            Ok(message) => {
                self.rooms.record_sent(&message).await;
                Ok(message)
            }
            Err(err) => {
                let _ = self.events.send(ClientEvent::Error(err.to_string()));
                Err(err)
            }
        }
    }

    pub fn set_typing(&self, is_typing: bool) -> Option<JoinHandle<()>> {
        self.typing.set_typing(is_typing)
    }

    pub async fn start_or_get_private_room(
        &self,
        other: UserId,
    ) -> std::result::Result<Room, RoomError> {
        self.rooms
            .start_or_get_private_room(self.context.viewer_id(), other)
            .await
    }

    pub async fn create_group_room(
        &self,
        name: &str,
        members: &[UserId],
    ) -> std::result::Result<Room, RoomError> {
        self.rooms
            .create_group_room(self.context.viewer_id(), name, members)
            .await
    }

    pub async fn search_profiles(&self, query: &str) -> Vec<Profile> {
        self.rooms
            .search_profiles(self.context.viewer_id(), query)
            .await
    }

    pub async fn reload_rooms(&self) -> Vec<Room> {
        self.rooms.load_rooms(self.context.viewer_id()).await
    }

    pub async fn rooms(&self) -> Vec<Room> {
        self.rooms.rooms().await
    }

    pub async fn filter_rooms(&self, query: &str) -> Vec<Room> {
        self.rooms
            .filter_rooms(self.context.viewer_id(), query)
            .await
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.messages.entries().await
    }

    pub async fn profile(&self, user_id: UserId) -> Option<Profile> {
        self.profiles.get(user_id).await
    }

    pub async fn username(&self, user_id: UserId) -> String {
        self.profiles.username(user_id).await
    }

    pub async fn typing_users(&self) -> Vec<String> {
        let mut names: Vec<String> = self.typing.typing_users().await.into_values().collect();
        names.sort();
        names
    }

    pub async fn online_users(&self) -> HashSet<UserId> {
        self.presence.online_users().await
    }

    pub async fn start_call(
        &self,
        room_id: RoomId,
        callee: UserId,
        media: MediaKind,
    ) -> std::result::Result<(), CallError> {
        self.calls.start_call(room_id, callee, media).await
    }

    pub async fn accept_call(&self) -> std::result::Result<(), CallError> {
        self.calls.accept_call().await
    }

    pub async fn reject_call(&self) -> std::result::Result<(), CallError> {
        self.calls.reject_call().await
    }

    pub async fn end_call(&self) -> std::result::Result<(), CallError> {
        self.calls.end_call().await
    }

    pub async fn call_snapshot(&self) -> CallSnapshot {
        self.calls.snapshot().await
    }

    pub async fn shutdown(&self) {
        self.router.stop().await;
        self.calls.stop_listening().await;
        self.calls.cleanup().await;
        self.typing.unbind().await;
        self.presence.stop().await;
        info!("session: stopped");
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
