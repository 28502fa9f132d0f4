use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::Result;
use futures::future::join_all;
use shared::{
    domain::{MessageId, MessageStatus, RoomId, RoomKind, Table, UserId},
    protocol::{MembershipRow, Message, NewRoomRow, Profile, Room, RoomRow},
};
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::{
    backend::{insert_as, insert_one, select_as, Query, RowStore},
    error::RoomError,
    profiles::ProfileCache,
    ClientEvent,
};

pub struct RoomDirectory {
    store: Arc<dyn RowStore>,
    profiles: Arc<ProfileCache>,
    events: broadcast::Sender<ClientEvent>,
    search_limit: usize,
    rooms: RwLock<Vec<Room>>,
}

pub fn sort_by_recency(rooms: &mut [Room]) {
    rooms.sort_by(|a, b| b.recency().cmp(&a.recency()));
}

impl RoomDirectory {
    pub fn new(
        store: Arc<dyn RowStore>,
        profiles: Arc<ProfileCache>,
        events: broadcast::Sender<ClientEvent>,
        search_limit: usize,
    ) -> Self {
        Self {
            store,
            profiles,
            events,
            search_limit,
            rooms: RwLock::new(Vec::new()),
        }
    }

    /// Rebuilds the room list for `principal` and replaces the cached
    /// snapshot. A failed lookup keeps the previous snapshot.
    pub async fn load_rooms(&self, principal: UserId) -> Vec<Room> {
        match self.fetch_rooms(principal).await {
            Ok(rooms) => {
                *self.rooms.write().await = rooms.clone();
                let _ = self.events.send(ClientEvent::RoomsUpdated);
                rooms
            }
            Err(err) => {
                warn!(principal = %principal, "rooms: failed to load rooms: {err:#}");
                self.rooms.read().await.clone()
            }
        }
    }

    async fn fetch_rooms(&self, principal: UserId) -> Result<Vec<Room>> {
        let own: Vec<MembershipRow> = select_as(
            self.store.as_ref(),
            Query::new(Table::RoomMemberships).eq("user_id", principal),
        )
        .await?;
        if own.is_empty() {
            return Ok(Vec::new());
        }
        let room_ids: Vec<RoomId> = own.iter().map(|m| m.room_id).collect();

        let rows: Vec<RoomRow> = select_as(
            self.store.as_ref(),
            Query::new(Table::Rooms).any_of("id", &room_ids),
        )
        .await?;
        let memberships: Vec<MembershipRow> = select_as(
            self.store.as_ref(),
            Query::new(Table::RoomMemberships).any_of("room_id", &room_ids),
        )
        .await?;

        let participant_ids: HashSet<UserId> = memberships.iter().map(|m| m.user_id).collect();
        let profiles = self.profiles.ensure(participant_ids).await;

        let mut members_by_room: HashMap<RoomId, Vec<Profile>> = HashMap::new();
        for membership in &memberships {
            if let Some(profile) = profiles.get(&membership.user_id) {
                members_by_room
                    .entry(membership.room_id)
                    .or_default()
                    .push(profile.clone());
            }
        }

        let mut rooms = join_all(rows.into_iter().map(|row| {
            let participants = members_by_room.remove(&row.id).unwrap_or_default();
            self.hydrate(Room::from_row(row, participants), principal)
        }))
        .await;
        sort_by_recency(&mut rooms);
        Ok(rooms)
    }

    async fn hydrate(&self, mut room: Room, principal: UserId) -> Room {
        let latest = select_as::<Message>(
            self.store.as_ref(),
            Query::new(Table::Messages)
                .eq("room_id", room.id)
                .order_by("created_at", true)
                .limit(1),
        )
        .await;
        match latest {
            Ok(mut messages) => room.last_message = messages.pop(),
            Err(err) => warn!(room_id = %room.id, "rooms: last message lookup failed: {err:#}"),
        }

        let unread = self
            .store
            .count(
                Query::new(Table::Messages)
                    .eq("room_id", room.id)
                    .neq("sender_id", principal)
                    .neq("status", MessageStatus::Read.as_str()),
            )
            .await;
        match unread {
            Ok(count) => room.unread_count = count,
            Err(err) => warn!(room_id = %room.id, "rooms: unread count failed: {err:#}"),
        }
        room
    }

    /// Returns the private room shared by `principal` and `other`, creating
    /// it when none exists. The first match in membership order wins.
    pub async fn start_or_get_private_room(
        &self,
        principal: UserId,
        other: UserId,
    ) -> std::result::Result<Room, RoomError> {
        if principal == other {
            return Err(RoomError::Create(
                "cannot start a private room with yourself".into(),
            ));
        }

        if let Some(existing) = self
            .find_private_room(principal, other)
            .await
            .map_err(|err| RoomError::Lookup(format!("{err:#}")))?
        {
            self.load_rooms(principal).await;
            return Ok(self.room_view(existing).await);
        }

        let created: RoomRow = insert_one(
            self.store.as_ref(),
            Table::Rooms,
            &NewRoomRow {
                name: None,
                kind: RoomKind::Private,
                created_by: principal,
            },
        )
        .await
        .map_err(|err| RoomError::Create(format!("{err:#}")))?;
        self.add_members(created.id, &[principal, other]).await?;
        info!(room_id = %created.id, "rooms: created private room");

        self.load_rooms(principal).await;
        Ok(self.room_view(created).await)
    }

    async fn find_private_room(
        &self,
        principal: UserId,
        other: UserId,
    ) -> Result<Option<RoomRow>> {
        let own: Vec<MembershipRow> = select_as(
            self.store.as_ref(),
            Query::new(Table::RoomMemberships).eq("user_id", principal),
        )
        .await?;
        if own.is_empty() {
            return Ok(None);
        }
        let own_ids: Vec<RoomId> = own.iter().map(|m| m.room_id).collect();

        let shared_ids: HashSet<RoomId> = select_as::<MembershipRow>(
            self.store.as_ref(),
            Query::new(Table::RoomMemberships)
                .eq("user_id", other)
                .any_of("room_id", &own_ids),
        )
        .await?
        .into_iter()
        .map(|m| m.room_id)
        .collect();
        if shared_ids.is_empty() {
            return Ok(None);
        }

        let private_rooms: Vec<RoomRow> = select_as(
            self.store.as_ref(),
            Query::new(Table::Rooms)
                .any_of("id", &shared_ids)
                .eq("type", "private"),
        )
        .await?;

        Ok(own_ids
            .iter()
            .find_map(|id| private_rooms.iter().find(|row| row.id == *id))
            .cloned())
    }

    pub async fn create_group_room(
        &self,
        principal: UserId,
        name: &str,
        members: &[UserId],
    ) -> std::result::Result<Room, RoomError> {
        let mut member_ids = vec![principal];
        for id in members {
            if !member_ids.contains(id) {
                member_ids.push(*id);
            }
        }
        if member_ids.len() < 2 {
            return Err(RoomError::Create("a group needs at least one other member".into()));
        }

        let name = name.trim();
        let created: RoomRow = insert_one(
            self.store.as_ref(),
            Table::Rooms,
            &NewRoomRow {
                name: (!name.is_empty()).then_some(name),
                kind: RoomKind::Group,
                created_by: principal,
            },
        )
        .await
        .map_err(|err| RoomError::Create(format!("{err:#}")))?;
        self.add_members(created.id, &member_ids).await?;
        info!(room_id = %created.id, members = member_ids.len(), "rooms: created group room");

        self.load_rooms(principal).await;
        Ok(self.room_view(created).await)
    }

    async fn add_members(
        &self,
        room_id: RoomId,
        members: &[UserId],
    ) -> std::result::Result<(), RoomError> {
        let rows: Vec<MembershipRow> = members
            .iter()
            .map(|user_id| MembershipRow {
                room_id,
                user_id: *user_id,
            })
            .collect();
        let refs: Vec<&MembershipRow> = rows.iter().collect();
        insert_as::<MembershipRow, MembershipRow>(
            self.store.as_ref(),
            Table::RoomMemberships,
            &refs,
        )
        .await
        .map_err(|err| RoomError::Create(format!("{err:#}")))?;
        Ok(())
    }

    async fn room_view(&self, row: RoomRow) -> Room {
        if let Some(room) = self.room(row.id).await {
            return room;
        }
        Room::from_row(row, Vec::new())
    }

    pub async fn search_profiles(&self, principal: UserId, query: &str) -> Vec<Profile> {
        let query = query.trim();
        if query.is_empty() {
            return Vec::new();
        }

        let result = select_as::<Profile>(
            self.store.as_ref(),
            Query::new(Table::Profiles)
                .ilike("username", format!("%{query}%"))
                .neq("id", principal)
                .order_by("username", false)
                .limit(self.search_limit),
        )
        .await;
        match result {
            Ok(found) => {
                self.profiles.insert_many(found.iter().cloned()).await;
                found
            }
            Err(err) => {
                warn!("rooms: profile search failed: {err:#}");
                Vec::new()
            }
        }
    }

    pub async fn apply_incoming_message(
        &self,
        message: &Message,
        viewer: UserId,
        active_room: Option<RoomId>,
    ) -> bool {
        let found = {
            let mut rooms = self.rooms.write().await;
            let Some(room) = rooms.iter_mut().find(|r| r.id == message.room_id) else {
                return false;
            };
            set_last_message(room, message);
            if message.sender_id != viewer && active_room != Some(message.room_id) {
                room.unread_count += 1;
            }
            sort_by_recency(&mut rooms);
            true
        };
        let _ = self.events.send(ClientEvent::RoomsUpdated);
        found
    }

    pub async fn record_sent(&self, message: &Message) {
        {
            let mut rooms = self.rooms.write().await;
            let Some(room) = rooms.iter_mut().find(|r| r.id == message.room_id) else {
                return;
            };
            set_last_message(room, message);
            sort_by_recency(&mut rooms);
        }
        let _ = self.events.send(ClientEvent::RoomsUpdated);
    }

    pub async fn apply_status(&self, message_id: MessageId, status: MessageStatus) {
        let mut rooms = self.rooms.write().await;
        for room in rooms.iter_mut() {
            if let Some(last) = room.last_message.as_mut().filter(|m| m.id == message_id) {
                last.status = last.status.advanced_to(status);
            }
        }
    }

    pub async fn clear_unread(&self, room_id: RoomId) {
        {
            let mut rooms = self.rooms.write().await;
            let Some(room) = rooms.iter_mut().find(|r| r.id == room_id) else {
                return;
            };
            if room.unread_count == 0 {
                return;
            }
            room.unread_count = 0;
        }
        let _ = self.events.send(ClientEvent::RoomsUpdated);
    }

    pub async fn rooms(&self) -> Vec<Room> {
        self.rooms.read().await.clone()
    }

    pub async fn room(&self, room_id: RoomId) -> Option<Room> {
        self.rooms
            .read()
            .await
            .iter()
            .find(|r| r.id == room_id)
            .cloned()
    }

    pub async fn filter_rooms(&self, viewer: UserId, query: &str) -> Vec<Room> {
        let needle = query.trim().to_lowercase();
        self.rooms
            .read()
            .await
            .iter()
            .filter(|room| room.display_name(viewer).to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }
}

fn set_last_message(room: &mut Room, message: &Message) {
    let newer = room
        .last_message
        .as_ref()
        .map_or(true, |last| last.created_at <= message.created_at);
    if newer {
        room.last_message = Some(message.clone());
    }
}

#[cfg(test)]
#[path = "tests/rooms_tests.rs"]
mod tests;
