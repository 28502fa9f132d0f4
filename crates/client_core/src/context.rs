use std::sync::Arc;

use shared::{
    domain::{RoomId, UserId},
    protocol::Profile,
};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveContext {
    pub viewer: Profile,
    pub active_room: Option<RoomId>,
}

/// Current viewer and active room, shared by every listener of a session.
/// Listeners read it at event time instead of capturing it when they
/// subscribe, so a room switch is visible to them immediately.
#[derive(Clone)]
pub struct SessionContext {
    cell: Arc<watch::Sender<ActiveContext>>,
}

impl SessionContext {
    pub fn new(viewer: Profile) -> Self {
        let (cell, _) = watch::channel(ActiveContext {
            viewer,
            active_room: None,
        });
        Self {
            cell: Arc::new(cell),
        }
    }

    pub fn viewer_id(&self) -> UserId {
        self.cell.borrow().viewer.id
    }

    pub fn viewer(&self) -> Profile {
        self.cell.borrow().viewer.clone()
    }

    pub fn active_room(&self) -> Option<RoomId> {
        self.cell.borrow().active_room
    }

    pub fn is_active(&self, room_id: RoomId) -> bool {
        self.active_room() == Some(room_id)
    }

    pub fn set_active_room(&self, room_id: Option<RoomId>) {
        self.cell.send_modify(|ctx| ctx.active_room = room_id);
    }

    pub fn snapshot(&self) -> ActiveContext {
        self.cell.borrow().clone()
    }
}
