//! One-call-at-a-time signaling state machine. Signals are relayed as rows
//! of the `call_signals` table; the peer connection and media capture are
//! injected through the `rtc_integration` traits.

use std::sync::Arc;

use anyhow::Result;
use rtc_integration::{
    LocalMediaStream, MediaConstraints, MediaDevices, PeerConnection, PeerConnectionEvent,
    PeerConnectionFactory, RemoteTrack, RtcConfiguration,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use shared::{
    domain::{MediaKind, RoomId, SignalKind, Table, UserId},
    protocol::{
        CallSignal, CallStartPayload, IceCandidateInit, IceCandidatePayload, SdpPayload,
        SessionDescription,
    },
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    backend::{ChangeKind, RealtimeHub, RowStore},
    context::SessionContext,
    error::CallError,
    ClientEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    #[default]
    Idle,
    Calling,
    Incoming,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallSnapshot {
    pub state: CallState,
    pub media: MediaKind,
    pub room_id: Option<RoomId>,
    pub remote_user: Option<UserId>,
    pub has_local_stream: bool,
    pub remote_tracks: Vec<RemoteTrack>,
}

#[derive(Default)]
struct ActiveCall {
    state: CallState,
    media: MediaKind,
    room_id: Option<RoomId>,
    remote_user: Option<UserId>,
    peer: Option<Arc<dyn PeerConnection>>,
    peer_events: Option<JoinHandle<()>>,
    local_stream: Option<Arc<dyn LocalMediaStream>>,
    remote_tracks: Vec<RemoteTrack>,
    pending_candidates: Vec<IceCandidateInit>,
    pending_offer: Option<SessionDescription>,
    /// Bumped on every reset; peer events from an older call are dropped.
    generation: u64,
}

impl ActiveCall {
    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            state: self.state,
            media: self.media,
            room_id: self.room_id,
            remote_user: self.remote_user,
            has_local_stream: self.local_stream.is_some(),
            remote_tracks: self.remote_tracks.clone(),
        }
    }

    fn is_released(&self) -> bool {
        self.state == CallState::Idle
            && self.peer.is_none()
            && self.local_stream.is_none()
            && self.room_id.is_none()
    }

    fn matches(&self, signal: &CallSignal) -> bool {
        self.state != CallState::Idle
            && self.room_id == Some(signal.room_id)
            && self.remote_user == Some(signal.caller_id)
    }
}

pub struct CallSignalingEngine {
    store: Arc<dyn RowStore>,
    hub: Arc<dyn RealtimeHub>,
    media_devices: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerConnectionFactory>,
    rtc_config: RtcConfiguration,
    context: SessionContext,
    events: broadcast::Sender<ClientEvent>,
    call: Mutex<ActiveCall>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

fn decode<T: DeserializeOwned>(payload: Value, kind: SignalKind) -> Result<T, CallError> {
    serde_json::from_value(payload)
        .map_err(|err| CallError::Negotiation(format!("malformed {} payload: {err}", kind.as_str())))
}

fn encode<T: Serialize>(payload: &T) -> Result<Value, CallError> {
    serde_json::to_value(payload).map_err(|err| CallError::Signal(err.to_string()))
}

impl CallSignalingEngine {
    pub fn new(
        store: Arc<dyn RowStore>,
        hub: Arc<dyn RealtimeHub>,
        media_devices: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnectionFactory>,
        rtc_config: RtcConfiguration,
        context: SessionContext,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            store,
            hub,
            media_devices,
            peers,
            rtc_config,
            context,
            events,
            call: Mutex::new(ActiveCall::default()),
            listener: Mutex::new(None),
        }
    }

    pub async fn snapshot(&self) -> CallSnapshot {
        self.call.lock().await.snapshot()
    }

    pub async fn state(&self) -> CallState {
        self.call.lock().await.state
    }

    pub async fn local_stream(&self) -> Option<Arc<dyn LocalMediaStream>> {
        self.call.lock().await.local_stream.clone()
    }

    pub async fn start_listening(self: &Arc<Self>) -> Result<()> {
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            return Ok(());
        }
        let mut inserts = self
            .hub
            .subscribe_changes(Table::CallSignals, ChangeKind::Insert)
            .await?;
        let engine = self.clone();
        *listener = Some(tokio::spawn(async move {
            loop {
                match inserts.recv().await {
                    Ok(row) => match serde_json::from_value::<CallSignal>(row) {
                        Ok(signal) => engine.handle_signal(signal).await,
                        Err(err) => warn!("call: ignoring malformed signal: {err}"),
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "call: signal stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
        Ok(())
    }

    pub async fn stop_listening(&self) {
        if let Some(listener) = self.listener.lock().await.take() {
            listener.abort();
        }
    }

    pub async fn start_call(
        self: &Arc<Self>,
        room_id: RoomId,
        callee: UserId,
        media: MediaKind,
    ) -> Result<(), CallError> {
        let mut call = self.call.lock().await;
        if call.state != CallState::Idle {
            return Err(CallError::InvalidTransition {
                from: call.state,
                action: "start a call",
            });
        }
        call.state = CallState::Calling;
        call.media = media;
        call.room_id = Some(room_id);
        call.remote_user = Some(callee);
        self.notify(&call);
        info!(room_id = %room_id, callee = %callee, ?media, "call: calling");

        if let Err(err) = self.place_call(&mut call, room_id, callee).await {
            warn!(room_id = %room_id, "call: failed to start: {err}");
            self.reset(&mut call).await;
            return Err(err);
        }
        Ok(())
    }

    async fn place_call(
        self: &Arc<Self>,
        call: &mut ActiveCall,
        room_id: RoomId,
        callee: UserId,
    ) -> Result<(), CallError> {
        let peer = self.prepare_media(call, room_id, callee).await?;

        let announce = encode(&CallStartPayload {
            call_type: call.media,
        })?;
        self.send_signal(room_id, callee, SignalKind::CallStart, announce)
            .await?;

        let offer = peer
            .create_offer()
            .await
            .map_err(|err| CallError::Negotiation(format!("{err:#}")))?;
        peer.set_local_description(offer.clone())
            .await
            .map_err(|err| CallError::Negotiation(format!("{err:#}")))?;
        self.send_signal(room_id, callee, SignalKind::Offer, encode(&SdpPayload { sdp: offer })?)
            .await
    }

    pub async fn accept_call(self: &Arc<Self>) -> Result<(), CallError> {
        let mut call = self.call.lock().await;
        if call.state != CallState::Incoming {
            return Err(CallError::InvalidTransition {
                from: call.state,
                action: "accept a call",
            });
        }
        let (Some(room_id), Some(caller)) = (call.room_id, call.remote_user) else {
            self.reset(&mut call).await;
            return Err(CallError::Negotiation("incoming call has no caller".into()));
        };

        match self.take_call(&mut call, room_id, caller).await {
            Ok(()) => {
                info!(room_id = %room_id, caller = %caller, "call: accepted");
                self.notify(&call);
                Ok(())
            }
            Err(err) => {
                warn!(room_id = %room_id, "call: failed to accept: {err}");
                self.reset(&mut call).await;
                Err(err)
            }
        }
    }

    async fn take_call(
        self: &Arc<Self>,
        call: &mut ActiveCall,
        room_id: RoomId,
        caller: UserId,
    ) -> Result<(), CallError> {
        let peer = self.prepare_media(call, room_id, caller).await?;
        call.state = CallState::Connected;
        if let Some(offer) = call.pending_offer.take() {
            self.answer_offer(call, &peer, room_id, caller, offer).await?;
        }
        Ok(())
    }

    async fn prepare_media(
        self: &Arc<Self>,
        call: &mut ActiveCall,
        room_id: RoomId,
        remote: UserId,
    ) -> Result<Arc<dyn PeerConnection>, CallError> {
        let stream = self
            .media_devices
            .get_user_media(MediaConstraints::for_call(call.media))
            .await
            .map_err(|err| CallError::Media(format!("{err:#}")))?;
        call.local_stream = Some(stream.clone());

        let peer = self
            .peers
            .create(self.rtc_config.clone())
            .await
            .map_err(|err| CallError::PeerConnection(format!("{err:#}")))?;
        call.peer = Some(peer.clone());
        call.peer_events = Some(tokio::spawn(self.clone().forward_peer_events(
            peer.subscribe_events(),
            call.generation,
            room_id,
            remote,
        )));

        for track in stream.tracks() {
            peer.add_track(&track)
                .await
                .map_err(|err| CallError::PeerConnection(format!("{err:#}")))?;
        }
        Ok(peer)
    }

    async fn answer_offer(
        &self,
        call: &mut ActiveCall,
        peer: &Arc<dyn PeerConnection>,
        room_id: RoomId,
        caller: UserId,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        peer.set_remote_description(offer)
            .await
            .map_err(|err| CallError::Negotiation(format!("{err:#}")))?;
        self.flush_candidates(call, peer).await;

        let answer = peer
            .create_answer()
            .await
            .map_err(|err| CallError::Negotiation(format!("{err:#}")))?;
        peer.set_local_description(answer.clone())
            .await
            .map_err(|err| CallError::Negotiation(format!("{err:#}")))?;
        self.send_signal(room_id, caller, SignalKind::Answer, encode(&SdpPayload { sdp: answer })?)
            .await?;
        call.state = CallState::Connected;
        Ok(())
    }

    async fn flush_candidates(&self, call: &mut ActiveCall, peer: &Arc<dyn PeerConnection>) {
        for candidate in call.pending_candidates.drain(..) {
            if let Err(err) = peer.add_ice_candidate(candidate).await {
                warn!("call: failed to apply buffered ice candidate: {err:#}");
            }
        }
    }

    pub async fn reject_call(&self) -> Result<(), CallError> {
        let mut call = self.call.lock().await;
        if call.state != CallState::Incoming {
            return Err(CallError::InvalidTransition {
                from: call.state,
                action: "reject a call",
            });
        }
        let sent = self.signal_other_party(&call, SignalKind::CallReject).await;
        info!("call: rejected");
        self.reset(&mut call).await;
        sent
    }

    pub async fn end_call(&self) -> Result<(), CallError> {
        let mut call = self.call.lock().await;
        if !matches!(call.state, CallState::Calling | CallState::Connected) {
            return Err(CallError::InvalidTransition {
                from: call.state,
                action: "end a call",
            });
        }
        let sent = self.signal_other_party(&call, SignalKind::CallEnd).await;
        info!("call: ended");
        self.reset(&mut call).await;
        sent
    }

    async fn signal_other_party(&self, call: &ActiveCall, kind: SignalKind) -> Result<(), CallError> {
        match (call.room_id, call.remote_user) {
            (Some(room_id), Some(remote)) => {
                self.send_signal(room_id, remote, kind, json!({})).await
            }
            _ => Ok(()),
        }
    }

    /// Releases media and the peer connection and returns to idle. Safe to
    /// call in any state, any number of times.
    pub async fn cleanup(&self) {
        let mut call = self.call.lock().await;
        self.reset(&mut call).await;
    }

    async fn cleanup_generation(&self, generation: u64) {
        let mut call = self.call.lock().await;
        if call.generation == generation {
            self.reset(&mut call).await;
        }
    }

    async fn reset(&self, call: &mut ActiveCall) {
        let was_released = call.is_released();
        if let Some(task) = call.peer_events.take() {
            task.abort();
        }
        if let Some(stream) = call.local_stream.take() {
            if let Err(err) = stream.stop().await {
                warn!("call: failed to stop local media: {err:#}");
            }
        }
        if let Some(peer) = call.peer.take() {
            if let Err(err) = peer.close().await {
                warn!("call: failed to close peer connection: {err:#}");
            }
        }
        *call = ActiveCall {
            generation: call.generation + 1,
            ..ActiveCall::default()
        };
        if !was_released {
            debug!("call: released");
            self.notify(call);
        }
    }

    pub async fn handle_signal(&self, signal: CallSignal) {
        if signal.callee_id != self.context.viewer_id() {
            return;
        }
        let mut call = self.call.lock().await;

        if signal.kind == SignalKind::CallStart {
            self.on_call_start(&mut call, signal).await;
            return;
        }
        if !call.matches(&signal) {
            debug!(
                kind = signal.kind.as_str(),
                room_id = %signal.room_id,
                "call: ignoring signal for another call"
            );
            return;
        }

        let kind = signal.kind;
        let outcome = match kind {
            SignalKind::Offer => self.on_offer(&mut call, signal).await,
            SignalKind::Answer => self.on_answer(&mut call, signal).await,
            SignalKind::IceCandidate => self.on_ice_candidate(&mut call, signal).await,
            SignalKind::CallEnd | SignalKind::CallReject => {
                info!(kind = kind.as_str(), "call: remote party hung up");
                self.reset(&mut call).await;
                Ok(())
            }
            SignalKind::CallStart => Ok(()),
        };
        if let Err(err) = outcome {
            warn!(kind = kind.as_str(), "call: {err}");
            self.reset(&mut call).await;
        }
    }

    async fn on_call_start(&self, call: &mut ActiveCall, signal: CallSignal) {
        if call.state != CallState::Idle {
            if call.state == CallState::Incoming && call.matches(&signal) {
                debug!(caller = %signal.caller_id, "call: repeated call start ignored");
                return;
            }
            info!(caller = %signal.caller_id, "call: busy, rejecting incoming call");
            if let Err(err) = self
                .send_signal(signal.room_id, signal.caller_id, SignalKind::CallReject, json!({}))
                .await
            {
                warn!("call: failed to reject while busy: {err}");
            }
            return;
        }
        let media = serde_json::from_value::<CallStartPayload>(signal.payload)
            .map(|p| p.call_type)
            .unwrap_or_default();
        call.state = CallState::Incoming;
        call.media = media;
        call.room_id = Some(signal.room_id);
        call.remote_user = Some(signal.caller_id);
        info!(room_id = %signal.room_id, caller = %signal.caller_id, ?media, "call: incoming");
        self.notify(call);
    }

    async fn on_offer(&self, call: &mut ActiveCall, signal: CallSignal) -> Result<(), CallError> {
        let SdpPayload { sdp } = decode(signal.payload, SignalKind::Offer)?;
        match (call.state, call.peer.clone()) {
            (CallState::Incoming, None) => {
                debug!("call: queueing offer until the call is accepted");
                call.pending_offer = Some(sdp);
                Ok(())
            }
            (CallState::Connected, Some(peer)) if !peer.has_remote_description() => {
                self.answer_offer(call, &peer, signal.room_id, signal.caller_id, sdp)
                    .await?;
                self.notify(call);
                Ok(())
            }
            (state, _) => {
                debug!(?state, "call: ignoring offer");
                Ok(())
            }
        }
    }

    async fn on_answer(&self, call: &mut ActiveCall, signal: CallSignal) -> Result<(), CallError> {
        let (CallState::Calling, Some(peer)) = (call.state, call.peer.clone()) else {
            debug!(state = ?call.state, "call: ignoring answer");
            return Ok(());
        };
        let SdpPayload { sdp } = decode(signal.payload, SignalKind::Answer)?;
        peer.set_remote_description(sdp)
            .await
            .map_err(|err| CallError::Negotiation(format!("{err:#}")))?;
        self.flush_candidates(call, &peer).await;
        call.state = CallState::Connected;
        info!("call: connected");
        self.notify(call);
        Ok(())
    }

    async fn on_ice_candidate(
        &self,
        call: &mut ActiveCall,
        signal: CallSignal,
    ) -> Result<(), CallError> {
        let IceCandidatePayload { candidate } = decode(signal.payload, SignalKind::IceCandidate)?;
        match call.peer.clone() {
            Some(peer) if peer.has_remote_description() => {
                if let Err(err) = peer.add_ice_candidate(candidate).await {
                    warn!("call: failed to apply ice candidate: {err:#}");
                }
            }
            _ => call.pending_candidates.push(candidate),
        }
        Ok(())
    }

    async fn send_signal(
        &self,
        room_id: RoomId,
        to: UserId,
        kind: SignalKind,
        payload: Value,
    ) -> Result<(), CallError> {
        let signal = CallSignal {
            id: None,
            room_id,
            caller_id: self.context.viewer_id(),
            callee_id: to,
            kind,
            payload,
            created_at: None,
        };
        let row = encode(&signal)?;
        self.store
            .insert(Table::CallSignals, vec![row])
            .await
            .map(|_| ())
            .map_err(|err| CallError::Signal(format!("{err:#}")))
    }

    async fn forward_peer_events(
        self: Arc<Self>,
        mut events: broadcast::Receiver<PeerConnectionEvent>,
        generation: u64,
        room_id: RoomId,
        remote: UserId,
    ) {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "call: peer events lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match event {
                PeerConnectionEvent::IceCandidate(candidate) => {
                    let sent = match encode(&IceCandidatePayload { candidate }) {
                        Ok(payload) => {
                            self.send_signal(room_id, remote, SignalKind::IceCandidate, payload)
                                .await
                        }
                        Err(err) => Err(err),
                    };
                    if let Err(err) = sent {
                        warn!("call: failed to send ice candidate: {err}");
                    }
                }
                PeerConnectionEvent::TrackAdded(track) => {
                    let mut call = self.call.lock().await;
                    if call.generation != generation {
                        break;
                    }
                    call.remote_tracks.push(track.clone());
                    let _ = self.events.send(ClientEvent::RemoteTrackAdded(track));
                    self.notify(&call);
                }
                PeerConnectionEvent::IceConnectionStateChanged(state) => {
                    debug!(?state, "call: ice connection state changed");
                    if state.is_terminal_failure() {
                        info!(?state, "call: connection lost");
                        let engine = self.clone();
                        tokio::spawn(async move { engine.cleanup_generation(generation).await });
                        break;
                    }
                }
            }
        }
    }

    fn notify(&self, call: &ActiveCall) {
        let _ = self
            .events
            .send(ClientEvent::CallStateChanged(call.snapshot()));
    }
}

#[cfg(test)]
#[path = "tests/call_tests.rs"]
mod tests;
