//! Realtime hub over the service's Phoenix-channel websocket. One socket is
//! shared by every change feed, presence channel and broadcast channel.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared::domain::Table;
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};
use url::Url;

use crate::backend::{
    BroadcastEnvelope, BroadcastHandle, ChangeKind, PresenceHandle, RealtimeHub,
};

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(25);
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixFrame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

impl PhoenixFrame {
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            reference: None,
        }
    }
}

pub fn channel_topic(name: &str) -> String {
    format!("realtime:{name}")
}

fn changes_topic(table: Table, kind: ChangeKind) -> String {
    channel_topic(&format!("changes:{table}:{}", kind.as_event().to_ascii_lowercase()))
}

pub fn join_payload(
    changes: Option<(Table, ChangeKind)>,
    presence_key: Option<&str>,
) -> Value {
    let postgres_changes: Vec<Value> = changes
        .map(|(table, kind)| {
            vec![json!({
                "event": kind.as_event(),
                "schema": "public",
                "table": table.as_str(),
            })]
        })
        .unwrap_or_default();
    json!({
        "config": {
            "broadcast": { "self": false, "ack": false },
            "presence": { "key": presence_key.unwrap_or_default() },
            "postgres_changes": postgres_changes,
        }
    })
}

pub fn parse_change(payload: &Value) -> Option<(Table, ChangeKind, Value)> {
    let data = payload.get("data")?;
    let table = Table::from_name(data.get("table")?.as_str()?)?;
    let kind = ChangeKind::from_event(data.get("type")?.as_str()?)?;
    let record = data.get("record")?.clone();
    Some((table, kind, record))
}

/// Folds a `presence_state` or `presence_diff` payload into per-key
/// connection counts. Returns `false` for other events.
pub fn fold_presence(state: &mut BTreeMap<String, usize>, event: &str, payload: &Value) -> bool {
    fn metas(entry: &Value) -> usize {
        entry
            .get("metas")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(1)
    }

    match event {
        "presence_state" => {
            state.clear();
            if let Some(entries) = payload.as_object() {
                for (key, entry) in entries {
                    state.insert(key.clone(), metas(entry));
                }
            }
            true
        }
        "presence_diff" => {
            if let Some(joins) = payload.get("joins").and_then(Value::as_object) {
                for (key, entry) in joins {
                    *state.entry(key.clone()).or_default() += metas(entry);
                }
            }
            if let Some(leaves) = payload.get("leaves").and_then(Value::as_object) {
                for (key, entry) in leaves {
                    let gone = match state.get_mut(key) {
                        Some(count) => {
                            *count = count.saturating_sub(metas(entry));
                            *count == 0
                        }
                        None => false,
                    };
                    if gone {
                        state.remove(key);
                    }
                }
            }
            true
        }
        _ => false,
    }
}

struct PresenceRoute {
    members: BTreeMap<String, usize>,
    sync: broadcast::Sender<Vec<String>>,
}

struct BroadcastRoute {
    inbox: broadcast::Sender<BroadcastEnvelope>,
    handles: usize,
}

#[derive(Default)]
struct Routes {
    changes: HashMap<(Table, ChangeKind), broadcast::Sender<Value>>,
    presence: HashMap<String, PresenceRoute>,
    broadcasts: HashMap<String, BroadcastRoute>,
}

struct HubInner {
    outbound: mpsc::UnboundedSender<PhoenixFrame>,
    next_ref: AtomicU64,
    routes: Mutex<Routes>,
}

impl HubInner {
    fn push(&self, mut frame: PhoenixFrame) -> Result<()> {
        frame.reference = Some(self.next_ref.fetch_add(1, Ordering::Relaxed).to_string());
        self.outbound
            .send(frame)
            .map_err(|_| anyhow!("realtime socket is closed"))
    }

    async fn route(&self, frame: PhoenixFrame) {
        match frame.event.as_str() {
            "postgres_changes" => {
                let Some((table, kind, record)) = parse_change(&frame.payload) else {
                    debug!(topic = %frame.topic, "realtime: unrecognised change payload");
                    return;
                };
                let routes = self.routes.lock().await;
                if let Some(sender) = routes.changes.get(&(table, kind)) {
                    let _ = sender.send(record);
                }
            }
            "presence_state" | "presence_diff" => {
                let mut routes = self.routes.lock().await;
                if let Some(route) = routes.presence.get_mut(&frame.topic) {
                    fold_presence(&mut route.members, &frame.event, &frame.payload);
                    let _ = route.sync.send(route.members.keys().cloned().collect());
                }
            }
            "broadcast" => {
                let envelope = BroadcastEnvelope {
                    event: frame
                        .payload
                        .get("event")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    payload: frame.payload.get("payload").cloned().unwrap_or(Value::Null),
                };
                let routes = self.routes.lock().await;
                if let Some(route) = routes.broadcasts.get(&frame.topic) {
                    let _ = route.inbox.send(envelope);
                }
            }
            "phx_reply" => {
                let status = frame.payload.get("status").and_then(Value::as_str);
                if status != Some("ok") {
                    warn!(topic = %frame.topic, payload = %frame.payload, "realtime: request refused");
                }
            }
            "phx_error" | "phx_close" => {
                warn!(topic = %frame.topic, event = %frame.event, "realtime: channel closed by server");
            }
            _ => {}
        }
    }
}

pub struct WsRealtimeHub {
    inner: Arc<HubInner>,
    tasks: Vec<JoinHandle<()>>,
}

impl WsRealtimeHub {
    pub async fn connect(url: &Url, heartbeat: Duration) -> Result<Self> {
        let (socket, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("connect realtime socket at {}", url.host_str().unwrap_or("?")))?;
        let (mut sink, mut source) = socket.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<PhoenixFrame>();
        let inner = Arc::new(HubInner {
            outbound,
            next_ref: AtomicU64::new(1),
            routes: Mutex::new(Routes::default()),
        });

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("realtime: failed to encode frame: {err}");
                        continue;
                    }
                };
                if let Err(err) = sink.send(WsMessage::Text(text)).await {
                    warn!("realtime: socket write failed: {err}");
                    break;
                }
            }
        });

        let reader_inner = inner.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<PhoenixFrame>(&text) {
                        Ok(frame) => reader_inner.route(frame).await,
                        Err(err) => debug!("realtime: ignoring undecodable frame: {err}"),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("realtime: socket read failed: {err}");
                        break;
                    }
                }
            }
            info!("realtime: socket closed");
        });

        let heartbeat_inner = inner.clone();
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = time::interval(heartbeat);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let frame = PhoenixFrame::new("phoenix", "heartbeat", json!({}));
                if heartbeat_inner.push(frame).is_err() {
                    break;
                }
            }
        });

        info!("realtime: connected");
        Ok(Self {
            inner,
            tasks: vec![writer, reader, heartbeat_task],
        })
    }

    pub fn close(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for WsRealtimeHub {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl RealtimeHub for WsRealtimeHub {
    async fn subscribe_changes(
        &self,
        table: Table,
        kind: ChangeKind,
    ) -> Result<broadcast::Receiver<Value>> {
        let mut routes = self.inner.routes.lock().await;
        if let Some(sender) = routes.changes.get(&(table, kind)) {
            return Ok(sender.subscribe());
        }
        self.inner.push(PhoenixFrame::new(
            changes_topic(table, kind),
            "phx_join",
            join_payload(Some((table, kind)), None),
        ))?;
        let (sender, receiver) = broadcast::channel(CHANNEL_CAPACITY);
        routes.changes.insert((table, kind), sender);
        Ok(receiver)
    }

    async fn join_presence(&self, topic: &str, key: &str) -> Result<Arc<dyn PresenceHandle>> {
        let topic = channel_topic(topic);
        let mut routes = self.inner.routes.lock().await;
        let sync = match routes.presence.get(&topic) {
            Some(route) => route.sync.clone(),
            None => {
                self.inner.push(PhoenixFrame::new(
                    topic.clone(),
                    "phx_join",
                    join_payload(None, Some(key)),
                ))?;
                let sync = broadcast::channel(CHANNEL_CAPACITY).0;
                routes.presence.insert(
                    topic.clone(),
                    PresenceRoute {
                        members: BTreeMap::new(),
                        sync: sync.clone(),
                    },
                );
                sync
            }
        };
        Ok(Arc::new(WsPresence {
            inner: self.inner.clone(),
            topic,
            sync,
        }))
    }

    async fn join_broadcast(&self, topic: &str) -> Result<Arc<dyn BroadcastHandle>> {
        let topic = channel_topic(topic);
        let mut routes = self.inner.routes.lock().await;
        let inbox = match routes.broadcasts.get_mut(&topic) {
            Some(route) => {
                route.handles += 1;
                route.inbox.clone()
            }
            None => {
                self.inner.push(PhoenixFrame::new(
                    topic.clone(),
                    "phx_join",
                    join_payload(None, None),
                ))?;
                let inbox = broadcast::channel(CHANNEL_CAPACITY).0;
                routes.broadcasts.insert(
                    topic.clone(),
                    BroadcastRoute {
                        inbox: inbox.clone(),
                        handles: 1,
                    },
                );
                inbox
            }
        };
        Ok(Arc::new(WsBroadcast {
            inner: self.inner.clone(),
            topic,
            inbox,
        }))
    }
}

struct WsPresence {
    inner: Arc<HubInner>,
    topic: String,
    sync: broadcast::Sender<Vec<String>>,
}

#[async_trait]
impl PresenceHandle for WsPresence {
    async fn track(&self, payload: Value) -> Result<()> {
        self.inner.push(PhoenixFrame::new(
            self.topic.clone(),
            "presence",
            json!({ "type": "presence", "event": "track", "payload": payload }),
        ))
    }

    fn subscribe_sync(&self) -> broadcast::Receiver<Vec<String>> {
        self.sync.subscribe()
    }

    async fn leave(&self) -> Result<()> {
        self.inner.routes.lock().await.presence.remove(&self.topic);
        self.inner
            .push(PhoenixFrame::new(self.topic.clone(), "phx_leave", json!({})))
    }
}

struct WsBroadcast {
    inner: Arc<HubInner>,
    topic: String,
    inbox: broadcast::Sender<BroadcastEnvelope>,
}

#[async_trait]
impl BroadcastHandle for WsBroadcast {
    async fn send(&self, event: &str, payload: Value) -> Result<()> {
        self.inner.push(PhoenixFrame::new(
            self.topic.clone(),
            "broadcast",
            json!({ "type": "broadcast", "event": event, "payload": payload }),
        ))
    }

    fn subscribe(&self) -> broadcast::Receiver<BroadcastEnvelope> {
        self.inbox.subscribe()
    }

    /// The channel itself is left once its last handle leaves.
    async fn leave(&self) -> Result<()> {
        let mut routes = self.inner.routes.lock().await;
        let last = match routes.broadcasts.get_mut(&self.topic) {
            Some(route) => {
                route.handles = route.handles.saturating_sub(1);
                route.handles == 0
            }
            None => false,
        };
        if last {
            routes.broadcasts.remove(&self.topic);
            self.inner
                .push(PhoenixFrame::new(self.topic.clone(), "phx_leave", json!({})))?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/realtime_ws_tests.rs"]
mod tests;
