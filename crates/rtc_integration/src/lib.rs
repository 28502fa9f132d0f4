use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::MediaKind,
    protocol::{IceCandidateInit, SessionDescription},
};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtcConfiguration {
    pub ice_servers: Vec<IceServer>,
}

impl RtcConfiguration {
    /// One ICE server entry per STUN url.
    pub fn with_stun_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ice_servers: urls
                .into_iter()
                .map(|url| IceServer {
                    urls: vec![url.into()],
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn for_call(kind: MediaKind) -> Self {
        Self {
            audio: true,
            video: kind == MediaKind::Video,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub track_id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub track_id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    /// States after which the session cannot carry media any more.
    pub fn is_terminal_failure(self) -> bool {
        matches!(
            self,
            IceConnectionState::Disconnected | IceConnectionState::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerConnectionEvent {
    IceCandidate(IceCandidateInit),
    TrackAdded(RemoteTrack),
    IceConnectionStateChanged(IceConnectionState),
}

#[async_trait]
pub trait LocalMediaStream: Send + Sync {
    fn tracks(&self) -> Vec<LocalTrack>;
    async fn stop(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> anyhow::Result<Arc<dyn LocalMediaStream>>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> anyhow::Result<()>;
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;
    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription)
        -> anyhow::Result<()>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> anyhow::Result<()>;
    fn has_remote_description(&self) -> bool;
    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;
    fn subscribe_events(&self) -> broadcast::Receiver<PeerConnectionEvent>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        configuration: RtcConfiguration,
    ) -> anyhow::Result<Arc<dyn PeerConnection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_calls_do_not_request_video() {
        assert_eq!(
            MediaConstraints::for_call(MediaKind::Audio),
            MediaConstraints {
                audio: true,
                video: false
            }
        );
        assert!(MediaConstraints::for_call(MediaKind::Video).video);
    }

    #[test]
    fn stun_urls_become_separate_ice_servers() {
        let config = RtcConfiguration::with_stun_urls([
            "stun:stun.l.google.com:19302",
            "stun:stun1.l.google.com:19302",
        ]);
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[1].urls, vec!["stun:stun1.l.google.com:19302"]);
    }

    #[test]
    fn only_disconnected_and_failed_end_a_call() {
        assert!(IceConnectionState::Failed.is_terminal_failure());
        assert!(IceConnectionState::Disconnected.is_terminal_failure());
        assert!(!IceConnectionState::Checking.is_terminal_failure());
        assert!(!IceConnectionState::Closed.is_terminal_failure());
    }
}
