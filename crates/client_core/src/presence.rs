use std::{collections::HashSet, sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use shared::{
    domain::{Table, UserId},
    protocol::PresencePayload,
};
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    backend::{PresenceHandle, Query, RealtimeHub, RowStore},
    context::SessionContext,
    profiles::ProfileCache,
    ClientEvent,
};

pub const PRESENCE_TOPIC: &str = "online-users";

struct PresenceChannel {
    handle: Arc<dyn PresenceHandle>,
    sync_task: JoinHandle<()>,
}

pub struct PresenceTracker {
    hub: Arc<dyn RealtimeHub>,
    store: Arc<dyn RowStore>,
    profiles: Arc<ProfileCache>,
    context: SessionContext,
    events: broadcast::Sender<ClientEvent>,
    heartbeat_interval: Duration,
    online: Arc<RwLock<HashSet<UserId>>>,
    channel: Mutex<Option<PresenceChannel>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceTracker {
    pub fn new(
        hub: Arc<dyn RealtimeHub>,
        store: Arc<dyn RowStore>,
        profiles: Arc<ProfileCache>,
        context: SessionContext,
        events: broadcast::Sender<ClientEvent>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            hub,
            store,
            profiles,
            context,
            events,
            heartbeat_interval,
            online: Arc::new(RwLock::new(HashSet::new())),
            channel: Mutex::new(None),
            heartbeat: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<()> {
        {
            let mut heartbeat = self.heartbeat.lock().await;
            if heartbeat.is_none() {
                *heartbeat = Some(self.spawn_heartbeat());
            }
        }

        let mut channel = self.channel.lock().await;
        if channel.is_some() {
            return Ok(());
        }

        let viewer = self.context.viewer_id();
        let handle = self
            .hub
            .join_presence(PRESENCE_TOPIC, &viewer.to_string())
            .await?;
        let sync_task = self.spawn_sync_listener(handle.subscribe_sync());
        let payload = PresencePayload {
            user_id: viewer,
            online_at: Utc::now(),
        };
        if let Err(err) = handle.track(serde_json::to_value(&payload)?).await {
            sync_task.abort();
            let _ = handle.leave().await;
            return Err(err);
        }
        info!(user_id = %viewer, "presence: joined");
        *channel = Some(PresenceChannel { handle, sync_task });
        Ok(())
    }

    fn spawn_sync_listener(&self, mut sync: broadcast::Receiver<Vec<String>>) -> JoinHandle<()> {
        let online = self.online.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                match sync.recv().await {
                    Ok(keys) => {
                        let members: HashSet<UserId> =
                            keys.iter().filter_map(|key| key.parse().ok()).collect();
                        debug!(online = members.len(), "presence: sync");
                        *online.write().await = members;
                        let _ = events.send(ClientEvent::PresenceUpdated);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "presence: sync receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let profiles = self.profiles.clone();
        let viewer = self.context.viewer_id();
        let mut ticker = time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                let now = Utc::now();
                let result = store
                    .update(
                        Query::new(Table::Profiles).eq("id", viewer),
                        json!({ "last_seen": now }),
                    )
                    .await;
                match result {
                    Ok(()) => profiles.record_last_seen(viewer, now).await,
                    Err(err) => warn!(user_id = %viewer, "presence: heartbeat failed: {err:#}"),
                }
            }
        })
    }

    pub async fn stop(&self) {
        if let Some(heartbeat) = self.heartbeat.lock().await.take() {
            heartbeat.abort();
        }
        if let Some(channel) = self.channel.lock().await.take() {
            channel.sync_task.abort();
            if let Err(err) = channel.handle.leave().await {
                warn!("presence: failed to leave channel: {err:#}");
            }
        }
        self.online.write().await.clear();
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.online.read().await.contains(&user_id)
    }

    pub async fn online_users(&self) -> HashSet<UserId> {
        self.online.read().await.clone()
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
