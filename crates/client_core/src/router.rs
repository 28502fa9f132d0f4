use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use shared::{
    domain::Table,
    protocol::{Message, MessageStatusPatch},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    backend::{ChangeKind, RealtimeHub},
    context::SessionContext,
    messages::MessageStore,
    profiles::ProfileCache,
    rooms::RoomDirectory,
};

/// Session-scoped subscription to message change events. It reads the
/// active room from the shared context at event time.
pub struct RealtimeEventRouter {
    hub: Arc<dyn RealtimeHub>,
    context: SessionContext,
    profiles: Arc<ProfileCache>,
    rooms: Arc<RoomDirectory>,
    messages: Arc<MessageStore>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RealtimeEventRouter {
    pub fn new(
        hub: Arc<dyn RealtimeHub>,
        context: SessionContext,
        profiles: Arc<ProfileCache>,
        rooms: Arc<RoomDirectory>,
        messages: Arc<MessageStore>,
    ) -> Self {
        Self {
            hub,
            context,
            profiles,
            rooms,
            messages,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Ok(());
        }
        let inserts = self
            .hub
            .subscribe_changes(Table::Messages, ChangeKind::Insert)
            .await?;
        let updates = self
            .hub
            .subscribe_changes(Table::Messages, ChangeKind::Update)
            .await?;

        let router = self.clone();
        tasks.push(tokio::spawn(async move {
            pump(inserts, "insert", |row| {
                let router = router.clone();
                async move { router.handle_insert(row).await }
            })
            .await;
        }));
        let router = self.clone();
        tasks.push(tokio::spawn(async move {
            pump(updates, "update", |row| {
                let router = router.clone();
                async move { router.handle_update(row).await }
            })
            .await;
        }));
        info!("router: subscribed to message changes");
        Ok(())
    }

    pub async fn stop(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }

    pub async fn handle_insert(&self, row: Value) {
        let message: Message = match serde_json::from_value(row) {
            Ok(message) => message,
            Err(err) => {
                warn!("router: ignoring malformed message insert: {err}");
                return;
            }
        };
        let ctx = self.context.snapshot();

        if !self.profiles.contains(message.sender_id).await {
            let profiles = self.profiles.clone();
            let sender = message.sender_id;
            tokio::spawn(async move {
                profiles.ensure([sender]).await;
            });
        }

        if ctx.active_room == Some(message.room_id) {
            let appended = self.messages.apply_insert(message.clone()).await;
            if appended && message.sender_id != ctx.viewer.id {
                self.messages.spawn_mark_read(vec![message.id]);
            }
        }

        let known = self
            .rooms
            .apply_incoming_message(&message, ctx.viewer.id, ctx.active_room)
            .await;
        if !known {
            debug!(room_id = %message.room_id, "router: message for unknown room, reloading rooms");
            self.rooms.load_rooms(ctx.viewer.id).await;
        }
    }

    pub async fn handle_update(&self, row: Value) {
        let patch: MessageStatusPatch = match serde_json::from_value(row) {
            Ok(patch) => patch,
            Err(err) => {
                warn!("router: ignoring malformed message update: {err}");
                return;
            }
        };
        if !self.messages.apply_status_update(&patch).await {
            debug!(message_id = %patch.id, "router: status update for message not in log");
        }
        self.rooms.apply_status(patch.id, patch.status).await;
    }
}

async fn pump<F, Fut>(mut changes: broadcast::Receiver<Value>, label: &'static str, mut handle: F)
where
    F: FnMut(Value) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    loop {
        match changes.recv().await {
            Ok(row) => handle(row).await,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "router: {label} stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("router: {label} stream closed");
                break;
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;
