use thiserror::Error;

use crate::call::CallState;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("no active room selected")]
    NoActiveRoom,
    #[error("message has neither text nor a file")]
    EmptyMessage,
    #[error("failed to upload attachment: {0}")]
    Upload(String),
    #[error("failed to persist message: {0}")]
    Persist(String),
}

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("failed to look up rooms: {0}")]
    Lookup(String),
    #[error("failed to create room: {0}")]
    Create(String),
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("cannot {action} while call is {from:?}")]
    InvalidTransition { from: CallState, action: &'static str },
    #[error("failed to acquire local media: {0}")]
    Media(String),
    #[error("failed to set up peer connection: {0}")]
    PeerConnection(String),
    #[error("session negotiation failed: {0}")]
    Negotiation(String),
    #[error("failed to send call signal: {0}")]
    Signal(String),
}
