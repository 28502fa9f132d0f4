use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use shared::{
    domain::{MessageId, MessageStatus, RoomId, Table},
    protocol::{FileAttachment, Message, MessageStatusPatch, NewMessageRow},
};
use tokio::{
    sync::{broadcast, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    backend::{insert_one, select_as, ObjectStorage, Query, RowStore},
    context::SessionContext,
    error::SendError,
    profiles::ProfileCache,
    spawn_logged, ClientEvent,
};

#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
struct MessageLog {
    room_id: Option<RoomId>,
    entries: Vec<Message>,
    /// Ids of optimistic entries whose durable insert has not resolved.
    pending: HashSet<MessageId>,
    epoch: u64,
    touched: HashMap<MessageId, u64>,
}

impl MessageLog {
    fn touch(&mut self, id: MessageId) {
        self.epoch += 1;
        self.touched.insert(id, self.epoch);
    }

    fn merge_history(&mut self, history: &[Message], since: u64) -> Vec<Message> {
        let mut merged = history.to_vec();
        for entry in self.entries.drain(..) {
            let live = self.pending.contains(&entry.id)
                || self.touched.get(&entry.id).is_some_and(|at| *at > since);
            if live && !merged.iter().any(|m| m.id == entry.id) {
                merged.push(entry);
            }
        }
        merged.sort_by_key(|m| m.created_at);
        self.touched.retain(|_, at| *at > since);
        merged
    }
}

pub struct MessageStore {
    store: Arc<dyn RowStore>,
    storage: Arc<dyn ObjectStorage>,
    bucket: String,
    profiles: Arc<ProfileCache>,
    context: SessionContext,
    events: broadcast::Sender<ClientEvent>,
    log: RwLock<MessageLog>,
}

pub fn upload_path(owner: impl std::fmt::Display, millis: i64, file_name: &str) -> String {
    format!("{owner}/{millis}-{file_name}")
}

pub fn file_placeholder(file_name: &str) -> String {
    format!("sent a file: {file_name}")
}

pub async fn mark_messages_read(store: &dyn RowStore, ids: &[MessageId]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    store
        .update(
            Query::new(Table::Messages).any_of("id", ids),
            json!({ "status": MessageStatus::Read }),
        )
        .await
}

impl MessageStore {
    pub fn new(
        store: Arc<dyn RowStore>,
        storage: Arc<dyn ObjectStorage>,
        bucket: impl Into<String>,
        profiles: Arc<ProfileCache>,
        context: SessionContext,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            store,
            storage,
            bucket: bucket.into(),
            profiles,
            context,
            events,
            log: RwLock::new(MessageLog::default()),
        }
    }

    pub async fn reset(&self, room_id: Option<RoomId>) {
        let mut log = self.log.write().await;
        log.room_id = room_id;
        log.entries.clear();
        log.pending.clear();
        log.touched.clear();
    }

    /// Replaces the log with the room's full history, oldest first, keeping
    /// entries that arrived or were sent while the fetch was in flight. Other
    /// senders' unread messages are marked read in the background. The
    /// returned history carries the statuses as fetched.
    pub async fn load_history(&self, room_id: RoomId) -> Vec<Message> {
        let since = self.log.read().await.epoch;
        let query = Query::new(Table::Messages)
            .eq("room_id", room_id)
            .order_by("created_at", false);
        let history = match select_as::<Message>(self.store.as_ref(), query).await {
            Ok(history) => history,
            Err(err) => {
                warn!(room_id = %room_id, "messages: failed to load history: {err:#}");
                Vec::new()
            }
        };

        self.profiles
            .ensure(history.iter().map(|m| m.sender_id))
            .await;

        if !self.context.is_active(room_id) {
            debug!(room_id = %room_id, "messages: discarding history for inactive room");
            return history;
        }

        {
            let mut guard = self.log.write().await;
            let log = &mut *guard;
            if log.room_id == Some(room_id) {
                log.entries = log.merge_history(&history, since);
            } else {
                log.room_id = Some(room_id);
                log.entries = history.clone();
                log.pending.clear();
                log.touched.clear();
            }
        }
        let _ = self.events.send(ClientEvent::MessagesUpdated { room_id });

        let viewer = self.context.viewer_id();
        let unread: Vec<MessageId> = history
            .iter()
            .filter(|m| m.sender_id != viewer && m.status != MessageStatus::Read)
            .map(|m| m.id)
            .collect();
        self.spawn_mark_read(unread);
        history
    }

    pub async fn send(
        &self,
        room_id: RoomId,
        content: &str,
        file: Option<OutgoingFile>,
    ) -> std::result::Result<Message, SendError> {
        let text = content.trim();
        if text.is_empty() && file.is_none() {
            return Err(SendError::EmptyMessage);
        }
        let viewer = self.context.viewer_id();

        let attachment = match file {
            Some(file) => Some(self.upload(&file).await?),
            None => None,
        };
        let content = match &attachment {
            Some(file) if text.is_empty() => file_placeholder(&file.name),
            _ => text.to_string(),
        };

        let optimistic = Message {
            id: MessageId::random(),
            room_id,
            sender_id: viewer,
            content,
            created_at: Utc::now(),
            status: MessageStatus::Sent,
            file: attachment,
        };
        let local_id = optimistic.id;
        self.push_optimistic(optimistic.clone()).await;

        let row = NewMessageRow {
            room_id,
            sender_id: viewer,
            content: &optimistic.content,
            status: MessageStatus::Sent,
            file_url: optimistic.file.as_ref().map(|f| f.url.as_str()),
            file_name: optimistic.file.as_ref().map(|f| f.name.as_str()),
            file_type: optimistic.file.as_ref().map(|f| f.mime_type.as_str()),
        };
        match insert_one::<_, Message>(self.store.as_ref(), Table::Messages, &row).await {
            Ok(persisted) => {
                self.confirm(local_id, &persisted).await;
                info!(room_id = %room_id, message_id = %persisted.id, "messages: sent");
                Ok(persisted)
            }
            Err(err) => {
                self.roll_back(local_id, room_id).await;
                warn!(room_id = %room_id, "messages: send failed: {err:#}");
                Err(SendError::Persist(format!("{err:#}")))
            }
        }
    }

    async fn upload(&self, file: &OutgoingFile) -> std::result::Result<FileAttachment, SendError> {
        let path = upload_path(
            self.context.viewer_id(),
            Utc::now().timestamp_millis(),
            &file.name,
        );
        self.storage
            .upload(&self.bucket, &path, file.bytes.clone(), &file.mime_type)
            .await
            .map_err(|err| SendError::Upload(format!("{err:#}")))?;
        Ok(FileAttachment {
            url: self.storage.public_url(&self.bucket, &path),
            name: file.name.clone(),
            mime_type: file.mime_type.clone(),
        })
    }

    async fn push_optimistic(&self, message: Message) {
        let room_id = message.room_id;
        {
            let mut log = self.log.write().await;
            log.pending.insert(message.id);
            if log.room_id == Some(room_id) {
                log.touch(message.id);
                log.entries.push(message);
            }
        }
        let _ = self.events.send(ClientEvent::MessagesUpdated { room_id });
    }

    async fn confirm(&self, local_id: MessageId, persisted: &Message) {
        {
            let mut log = self.log.write().await;
            log.pending.remove(&local_id);
            let echoed = log.entries.iter().any(|m| m.id == persisted.id);
            if echoed {
                log.entries.retain(|m| m.id != local_id);
            } else if let Some(entry) = log.entries.iter_mut().find(|m| m.id == local_id) {
                *entry = persisted.clone();
                log.touch(persisted.id);
            }
        }
        let _ = self.events.send(ClientEvent::MessagesUpdated {
            room_id: persisted.room_id,
        });
    }

    async fn roll_back(&self, local_id: MessageId, room_id: RoomId) {
        {
            let mut log = self.log.write().await;
            log.pending.remove(&local_id);
            log.entries.retain(|m| m.id != local_id);
        }
        let _ = self.events.send(ClientEvent::MessagesUpdated { room_id });
    }

    pub async fn mark_read(&self, ids: &[MessageId]) -> Result<()> {
        mark_messages_read(self.store.as_ref(), ids).await
    }

    pub fn spawn_mark_read(&self, ids: Vec<MessageId>) -> Option<JoinHandle<()>> {
        if ids.is_empty() {
            return None;
        }
        let store = self.store.clone();
        Some(spawn_logged("messages: mark read", async move {
            mark_messages_read(store.as_ref(), &ids).await
        }))
    }

    pub async fn apply_insert(&self, message: Message) -> bool {
        let room_id = message.room_id;
        {
            let mut log = self.log.write().await;
            if log.room_id != Some(room_id) || log.entries.iter().any(|m| m.id == message.id) {
                return false;
            }
            log.touch(message.id);
            log.entries.push(message);
        }
        let _ = self.events.send(ClientEvent::MessagesUpdated { room_id });
        true
    }

    pub async fn apply_status_update(&self, patch: &MessageStatusPatch) -> bool {
        let room_id = {
            let mut log = self.log.write().await;
            let Some(entry) = log.entries.iter_mut().find(|m| m.id == patch.id) else {
                return false;
            };
            let next = entry.status.advanced_to(patch.status);
            if next == entry.status {
                return false;
            }
            entry.status = next;
            entry.room_id
        };
        let _ = self.events.send(ClientEvent::MessagesUpdated { room_id });
        true
    }

    pub async fn entries(&self) -> Vec<Message> {
        self.log.read().await.entries.clone()
    }

    pub async fn loaded_room(&self) -> Option<RoomId> {
        self.log.read().await.room_id
    }

    pub async fn is_pending(&self, id: MessageId) -> bool {
        self.log.read().await.pending.contains(&id)
    }
}

#[cfg(test)]
#[path = "tests/messages_tests.rs"]
mod tests;
