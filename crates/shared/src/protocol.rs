use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{
    MediaKind, MessageId, MessageStatus, RoomId, RoomKind, SignalId, SignalKind, UserId,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRow {
    pub id: RoomId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: RoomKind,
    #[serde(default)]
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewRoomRow<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<&'a str>,
    #[serde(rename = "type")]
    pub kind: RoomKind,
    pub created_by: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipRow {
    pub room_id: RoomId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub url: String,
    pub name: String,
    pub mime_type: String,
}

impl FileAttachment {
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// A chat message. On the wire the attachment is spread over three nullable
/// `file_*` columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "MessageRow", into = "MessageRow")]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub file: Option<FileAttachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MessageRow {
    id: MessageId,
    room_id: RoomId,
    sender_id: UserId,
    #[serde(default)]
    content: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    status: MessageStatus,
    #[serde(default)]
    file_url: Option<String>,
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    file_type: Option<String>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        let file = match (row.file_url, row.file_name) {
            (Some(url), Some(name)) => Some(FileAttachment {
                url,
                name,
                mime_type: row
                    .file_type
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
            }),
            _ => None,
        };
        Self {
            id: row.id,
            room_id: row.room_id,
            sender_id: row.sender_id,
            content: row.content,
            created_at: row.created_at,
            status: row.status,
            file,
        }
    }
}

impl From<Message> for MessageRow {
    fn from(message: Message) -> Self {
        let (file_url, file_name, file_type) = match message.file {
            Some(file) => (Some(file.url), Some(file.name), Some(file.mime_type)),
            None => (None, None, None),
        };
        Self {
            id: message.id,
            room_id: message.room_id,
            sender_id: message.sender_id,
            content: message.content,
            created_at: message.created_at,
            status: message.status,
            file_url,
            file_name,
            file_type,
        }
    }
}

/// Insert payload for a message; the store assigns `id` and `created_at`.
#[derive(Debug, Clone, Serialize)]
pub struct NewMessageRow<'a> {
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: &'a str,
    pub status: MessageStatus,
    pub file_url: Option<&'a str>,
    pub file_name: Option<&'a str>,
    pub file_type: Option<&'a str>,
}

/// Partial update event payload for a message row.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageStatusPatch {
    pub id: MessageId,
    pub status: MessageStatus,
}

/// A room joined with its participants, latest message and unread count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    pub id: RoomId,
    pub name: Option<String>,
    pub kind: RoomKind,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub participants: Vec<Profile>,
    pub last_message: Option<Message>,
    pub unread_count: u64,
}

impl Room {
    pub fn from_row(row: RoomRow, participants: Vec<Profile>) -> Self {
        Self {
            id: row.id,
            name: row.name,
            kind: row.kind,
            created_by: row.created_by,
            created_at: row.created_at,
            participants,
            last_message: None,
            unread_count: 0,
        }
    }

    /// Timestamp used to order the room list, newest first.
    pub fn recency(&self) -> DateTime<Utc> {
        self.last_message
            .as_ref()
            .map(|message| message.created_at)
            .unwrap_or(self.created_at)
    }

    pub fn other_participant(&self, viewer: UserId) -> Option<&Profile> {
        self.participants.iter().find(|p| p.id != viewer)
    }

    pub fn display_name(&self, viewer: UserId) -> String {
        if let Some(name) = self.name.as_deref().filter(|name| !name.is_empty()) {
            return name.to_string();
        }
        self.other_participant(viewer)
            .map(|p| p.username.clone())
            .unwrap_or_else(|| "Unknown".to_string())
    }

    pub fn has_participant(&self, user_id: UserId) -> bool {
        self.participants.iter().any(|p| p.id == user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// A signaling record relayed through the `call_signals` table. `caller_id`
/// is always the sender of this record and `callee_id` its addressee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSignal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<SignalId>,
    pub room_id: RoomId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStartPayload {
    pub call_type: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpPayload {
    pub sdp: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    pub candidate: IceCandidateInit,
}

/// Ephemeral typing notification sent on the `room:{id}` broadcast topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingBroadcast {
    pub user_id: UserId,
    pub username: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub user_id: UserId,
    pub online_at: DateTime<Utc>,
}
