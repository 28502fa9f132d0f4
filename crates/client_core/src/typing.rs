use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use shared::{
    domain::{RoomId, UserId},
    protocol::TypingBroadcast,
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time,
};
use tracing::{debug, warn};

use crate::{
    backend::{BroadcastEnvelope, BroadcastHandle, RealtimeHub},
    context::SessionContext,
    spawn_logged, ClientEvent,
};

pub const TYPING_EVENT: &str = "typing";
const SEND_LINGER: Duration = Duration::from_millis(300);

pub fn room_topic(room_id: RoomId) -> String {
    format!("room:{room_id}")
}

struct TypingEntry {
    username: String,
    generation: u64,
    expiry: JoinHandle<()>,
}

/// Typing map of one bound room. A fresh one is created per binding so a
/// late event from an old listener cannot reach the current room.
struct RoomTyping {
    room_id: RoomId,
    entries: Mutex<HashMap<UserId, TypingEntry>>,
    generation: AtomicU64,
    expiry: Duration,
    events: broadcast::Sender<ClientEvent>,
}

impl RoomTyping {
    async fn apply(self: &Arc<Self>, signal: TypingBroadcast) {
        let mut entries = self.entries.lock().await;
        if !signal.is_typing {
            if let Some(entry) = entries.remove(&signal.user_id) {
                entry.expiry.abort();
                let _ = self.events.send(ClientEvent::TypingUpdated {
                    room_id: self.room_id,
                });
            }
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let expiry = self.spawn_expiry(signal.user_id, generation);
        let previous = entries.insert(
            signal.user_id,
            TypingEntry {
                username: signal.username,
                generation,
                expiry,
            },
        );
        if let Some(previous) = previous {
            previous.expiry.abort();
        }
        let _ = self.events.send(ClientEvent::TypingUpdated {
            room_id: self.room_id,
        });
    }

    fn spawn_expiry(self: &Arc<Self>, sender: UserId, generation: u64) -> JoinHandle<()> {
        let state = self.clone();
        tokio::spawn(async move {
            time::sleep(state.expiry).await;
            let mut entries = state.entries.lock().await;
            let current = entries
                .get(&sender)
                .is_some_and(|entry| entry.generation == generation);
            if current {
                entries.remove(&sender);
                let _ = state.events.send(ClientEvent::TypingUpdated {
                    room_id: state.room_id,
                });
            }
        })
    }

    async fn clear(&self) {
        for (_, entry) in self.entries.lock().await.drain() {
            entry.expiry.abort();
        }
    }
}

struct Binding {
    state: Arc<RoomTyping>,
    channel: Arc<dyn BroadcastHandle>,
    listener: JoinHandle<()>,
}

pub struct TypingCoordinator {
    hub: Arc<dyn RealtimeHub>,
    context: SessionContext,
    events: broadcast::Sender<ClientEvent>,
    expiry: Duration,
    binding: Mutex<Option<Binding>>,
}

impl TypingCoordinator {
    pub fn new(
        hub: Arc<dyn RealtimeHub>,
        context: SessionContext,
        events: broadcast::Sender<ClientEvent>,
        expiry: Duration,
    ) -> Self {
        Self {
            hub,
            context,
            events,
            expiry,
            binding: Mutex::new(None),
        }
    }

    pub async fn bind_room(&self, room_id: RoomId) -> Result<()> {
        let mut binding = self.binding.lock().await;
        if let Some(previous) = binding.take() {
            release(previous).await;
        }

        let channel = self.hub.join_broadcast(&room_topic(room_id)).await?;
        let state = Arc::new(RoomTyping {
            room_id,
            entries: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            expiry: self.expiry,
            events: self.events.clone(),
        });
        let listener = spawn_listener(state.clone(), channel.subscribe(), self.context.clone());
        *binding = Some(Binding {
            state,
            channel,
            listener,
        });
        let _ = self.events.send(ClientEvent::TypingUpdated { room_id });
        Ok(())
    }

    pub async fn unbind(&self) {
        if let Some(previous) = self.binding.lock().await.take() {
            release(previous).await;
        }
    }

    pub fn set_typing(&self, is_typing: bool) -> Option<JoinHandle<()>> {
        let room_id = self.context.active_room()?;
        let viewer = self.context.viewer();
        let hub = self.hub.clone();
        let payload = TypingBroadcast {
            user_id: viewer.id,
            username: viewer.username,
            is_typing,
        };
        Some(spawn_logged("typing: broadcast", async move {
            let channel = hub.join_broadcast(&room_topic(room_id)).await?;
            let sent = channel
                .send(TYPING_EVENT, serde_json::to_value(&payload)?)
                .await;
            time::sleep(SEND_LINGER).await;
            let left = channel.leave().await;
            sent.and(left)
        }))
    }

    pub async fn typing_users(&self) -> HashMap<UserId, String> {
        let Some(state) = self.binding.lock().await.as_ref().map(|b| b.state.clone()) else {
            return HashMap::new();
        };
        let entries = state.entries.lock().await;
        entries
            .iter()
            .map(|(id, entry)| (*id, entry.username.clone()))
            .collect()
    }

    pub async fn bound_room(&self) -> Option<RoomId> {
        self.binding.lock().await.as_ref().map(|b| b.state.room_id)
    }
}

async fn release(binding: Binding) {
    binding.listener.abort();
    binding.state.clear().await;
    if let Err(err) = binding.channel.leave().await {
        warn!(room_id = %binding.state.room_id, "typing: failed to leave channel: {err:#}");
    }
}

fn spawn_listener(
    state: Arc<RoomTyping>,
    mut inbox: broadcast::Receiver<BroadcastEnvelope>,
    context: SessionContext,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let envelope = match inbox.recv().await {
                Ok(envelope) => envelope,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "typing: listener lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if envelope.event != TYPING_EVENT {
                continue;
            }
            let signal: TypingBroadcast = match serde_json::from_value(envelope.payload) {
                Ok(signal) => signal,
                Err(err) => {
                    debug!("typing: ignoring malformed broadcast: {err}");
                    continue;
                }
            };
            if signal.user_id == context.viewer_id() {
                continue;
            }
            state.apply(signal).await;
        }
    })
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
