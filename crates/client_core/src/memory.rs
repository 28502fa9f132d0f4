//! Process-local implementation of every backend capability. Rows live in
//! plain JSON vectors, change events and channels are fanned out through
//! tokio broadcast senders.

use std::{
    cmp::Ordering,
    collections::{BTreeSet, HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering as AtomicOrdering},
        Arc,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use shared::domain::Table;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::backend::{
    BroadcastEnvelope, BroadcastHandle, ChangeKind, Filter, ObjectStorage, PresenceHandle, Query,
    RealtimeHub, RowStore,
};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    Select(Table),
    Insert(Table),
    Update(Table),
    Upload,
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Default)]
struct PresenceTopic {
    members: HashMap<u64, String>,
    sync: Option<broadcast::Sender<Vec<String>>>,
}

impl PresenceTopic {
    fn sender(&mut self) -> broadcast::Sender<Vec<String>> {
        self.sync
            .get_or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    fn publish(&mut self) {
        let keys: BTreeSet<String> = self.members.values().cloned().collect();
        let _ = self.sender().send(keys.into_iter().collect());
    }
}

#[derive(Default)]
struct State {
    tables: HashMap<Table, Vec<Value>>,
    changes: HashMap<(Table, ChangeKind), broadcast::Sender<Value>>,
    presence: HashMap<String, PresenceTopic>,
    broadcast_members: HashMap<String, Vec<(u64, broadcast::Sender<BroadcastEnvelope>)>>,
    sent_broadcasts: Vec<(String, BroadcastEnvelope)>,
    objects: HashMap<String, StoredObject>,
    failures: HashSet<FailurePoint>,
    selects: Vec<Query>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    next_member: AtomicU64,
}

#[derive(Clone, Default)]
pub struct InMemoryBackend {
    shared: Arc<Shared>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, table: Table, rows: impl IntoIterator<Item = Value>) {
        let mut state = self.shared.state.lock().await;
        let target = state.tables.entry(table).or_default();
        for row in rows {
            target.push(with_server_defaults(row));
        }
    }

    pub async fn rows(&self, table: Table) -> Vec<Value> {
        let state = self.shared.state.lock().await;
        state.tables.get(&table).cloned().unwrap_or_default()
    }

    pub async fn set_failure(&self, point: FailurePoint, failing: bool) {
        let mut state = self.shared.state.lock().await;
        if failing {
            state.failures.insert(point);
        } else {
            state.failures.remove(&point);
        }
    }

    pub async fn recorded_selects(&self) -> Vec<Query> {
        self.shared.state.lock().await.selects.clone()
    }

    pub async fn sent_broadcasts(&self, topic: &str) -> Vec<BroadcastEnvelope> {
        let state = self.shared.state.lock().await;
        state
            .sent_broadcasts
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, envelope)| envelope.clone())
            .collect()
    }

    pub async fn broadcast_member_count(&self, topic: &str) -> usize {
        let state = self.shared.state.lock().await;
        state
            .broadcast_members
            .get(topic)
            .map(Vec::len)
            .unwrap_or_default()
    }

    pub async fn object(&self, bucket: &str, path: &str) -> Option<StoredObject> {
        let state = self.shared.state.lock().await;
        state.objects.get(&object_key(bucket, path)).cloned()
    }

    fn next_member_id(&self) -> u64 {
        self.shared.next_member.fetch_add(1, AtomicOrdering::Relaxed)
    }
}

fn object_key(bucket: &str, path: &str) -> String {
    format!("{bucket}/{path}")
}

fn fail_if(state: &State, point: FailurePoint) -> Result<()> {
    if state.failures.contains(&point) {
        return Err(anyhow!("injected failure: {point:?}"));
    }
    Ok(())
}

fn with_server_defaults(row: Value) -> Value {
    let mut object = match row {
        Value::Object(map) => map,
        other => return other,
    };
    if !object.get("id").is_some_and(|v| !v.is_null()) {
        object.insert("id".into(), Value::String(Uuid::new_v4().to_string()));
    }
    if !object.get("created_at").is_some_and(|v| !v.is_null()) {
        object.insert(
            "created_at".into(),
            Value::String(Utc::now().to_rfc3339()),
        );
    }
    Value::Object(object)
}

/// Filter comparisons run on the textual form of a column, matching how the
/// REST filters are expressed.
fn column_text(row: &Value, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn ilike_matches(value: &str, pattern: &str) -> bool {
    let value = value.to_lowercase();
    let pattern = pattern.to_lowercase();
    let parts: Vec<&str> = pattern.split('%').collect();
    if parts.len() == 1 {
        return value == pattern;
    }

    let mut rest = value.as_str();
    for (index, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if index == 0 {
            let Some(stripped) = rest.strip_prefix(part) else {
                return false;
            };
            rest = stripped;
        } else if index == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            let Some(found) = rest.find(part) else {
                return false;
            };
            rest = &rest[found + part.len()..];
        }
    }
    true
}

fn matches(row: &Value, filter: &Filter) -> bool {
    match filter {
        Filter::Eq(column, expected) => column_text(row, column).as_ref() == Some(expected),
        Filter::Neq(column, expected) => column_text(row, column)
            .map(|v| &v != expected)
            .unwrap_or(false),
        Filter::In(column, expected) => column_text(row, column)
            .map(|v| expected.contains(&v))
            .unwrap_or(false),
        Filter::ILike(column, pattern) => column_text(row, column)
            .map(|v| ilike_matches(&v, pattern))
            .unwrap_or(false),
    }
}

fn compare_column(a: &Value, b: &Value, column: &str) -> Ordering {
    match (a.get(column), b.get(column)) {
        (Some(Value::String(x)), Some(Value::String(y))) => {
            match (
                DateTime::parse_from_rfc3339(x),
                DateTime::parse_from_rfc3339(y),
            ) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                _ => x.cmp(y),
            }
        }
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::Null) | None, Some(Value::Null) | None) => Ordering::Equal,
        (Some(Value::Null) | None, _) => Ordering::Less,
        (_, Some(Value::Null) | None) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

fn run_query(state: &State, query: &Query) -> Vec<Value> {
    let mut rows: Vec<Value> = state
        .tables
        .get(&query.table)
        .map(|rows| {
            rows.iter()
                .filter(|row| query.filters.iter().all(|f| matches(row, f)))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    if let Some(order) = &query.order {
        rows.sort_by(|a, b| {
            let ordering = compare_column(a, b, &order.column);
            if order.descending {
                ordering.reverse()
            } else {
                ordering
            }
        });
    }
    if let Some(limit) = query.limit {
        rows.truncate(limit);
    }
    rows
}

fn change_sender(
    state: &mut State,
    table: Table,
    kind: ChangeKind,
) -> broadcast::Sender<Value> {
    state
        .changes
        .entry((table, kind))
        .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
        .clone()
}

#[async_trait]
impl RowStore for InMemoryBackend {
    async fn select(&self, query: Query) -> Result<Vec<Value>> {
        let mut state = self.shared.state.lock().await;
        state.selects.push(query.clone());
        fail_if(&state, FailurePoint::Select(query.table))?;
        Ok(run_query(&state, &query))
    }

    async fn count(&self, query: Query) -> Result<u64> {
        let state = self.shared.state.lock().await;
        fail_if(&state, FailurePoint::Select(query.table))?;
        Ok(run_query(&state, &query).len() as u64)
    }

    async fn insert(&self, table: Table, rows: Vec<Value>) -> Result<Vec<Value>> {
        let mut state = self.shared.state.lock().await;
        fail_if(&state, FailurePoint::Insert(table))?;
        let inserted: Vec<Value> = rows.into_iter().map(with_server_defaults).collect();
        state
            .tables
            .entry(table)
            .or_default()
            .extend(inserted.iter().cloned());
        let sender = change_sender(&mut state, table, ChangeKind::Insert);
        for row in &inserted {
            let _ = sender.send(row.clone());
        }
        Ok(inserted)
    }

    async fn update(&self, query: Query, patch: Value) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        fail_if(&state, FailurePoint::Update(query.table))?;
        let Value::Object(patch) = patch else {
            return Err(anyhow!("update patch must be a JSON object"));
        };

        let mut updated = Vec::new();
        if let Some(rows) = state.tables.get_mut(&query.table) {
            for row in rows
                .iter_mut()
                .filter(|row| query.filters.iter().all(|f| matches(row, f)))
            {
                if let Value::Object(fields) = &mut *row {
                    merge(fields, &patch);
                }
                updated.push(row.clone());
            }
        }

        let sender = change_sender(&mut state, query.table, ChangeKind::Update);
        for row in updated {
            let _ = sender.send(row);
        }
        Ok(())
    }
}

fn merge(fields: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        fields.insert(key.clone(), value.clone());
    }
}

struct MemoryPresence {
    backend: InMemoryBackend,
    topic: String,
    key: String,
    member_id: u64,
    sync: broadcast::Sender<Vec<String>>,
}

#[async_trait]
impl PresenceHandle for MemoryPresence {
    async fn track(&self, _payload: Value) -> Result<()> {
        let mut state = self.backend.shared.state.lock().await;
        let topic = state.presence.entry(self.topic.clone()).or_default();
        topic.members.insert(self.member_id, self.key.clone());
        topic.publish();
        Ok(())
    }

    fn subscribe_sync(&self) -> broadcast::Receiver<Vec<String>> {
        self.sync.subscribe()
    }

    async fn leave(&self) -> Result<()> {
        let mut state = self.backend.shared.state.lock().await;
        if let Some(topic) = state.presence.get_mut(&self.topic) {
            if topic.members.remove(&self.member_id).is_some() {
                topic.publish();
            }
        }
        Ok(())
    }
}

struct MemoryBroadcast {
    backend: InMemoryBackend,
    topic: String,
    member_id: u64,
    inbox: broadcast::Sender<BroadcastEnvelope>,
}

#[async_trait]
impl BroadcastHandle for MemoryBroadcast {
    async fn send(&self, event: &str, payload: Value) -> Result<()> {
        let envelope = BroadcastEnvelope {
            event: event.to_string(),
            payload,
        };
        let mut state = self.backend.shared.state.lock().await;
        state
            .sent_broadcasts
            .push((self.topic.clone(), envelope.clone()));
        if let Some(members) = state.broadcast_members.get(&self.topic) {
            for (member_id, inbox) in members {
                if *member_id != self.member_id {
                    let _ = inbox.send(envelope.clone());
                }
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BroadcastEnvelope> {
        self.inbox.subscribe()
    }

    async fn leave(&self) -> Result<()> {
        let mut state = self.backend.shared.state.lock().await;
        if let Some(members) = state.broadcast_members.get_mut(&self.topic) {
            members.retain(|(member_id, _)| *member_id != self.member_id);
            if members.is_empty() {
                state.broadcast_members.remove(&self.topic);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RealtimeHub for InMemoryBackend {
    async fn subscribe_changes(
        &self,
        table: Table,
        kind: ChangeKind,
    ) -> Result<broadcast::Receiver<Value>> {
        let mut state = self.shared.state.lock().await;
        Ok(change_sender(&mut state, table, kind).subscribe())
    }

    async fn join_presence(&self, topic: &str, key: &str) -> Result<Arc<dyn PresenceHandle>> {
        let member_id = self.next_member_id();
        let mut state = self.shared.state.lock().await;
        let sync = state.presence.entry(topic.to_string()).or_default().sender();
        Ok(Arc::new(MemoryPresence {
            backend: self.clone(),
            topic: topic.to_string(),
            key: key.to_string(),
            member_id,
            sync,
        }))
    }

    async fn join_broadcast(&self, topic: &str) -> Result<Arc<dyn BroadcastHandle>> {
        let member_id = self.next_member_id();
        let (inbox, _) = broadcast::channel(CHANNEL_CAPACITY);
        let mut state = self.shared.state.lock().await;
        state
            .broadcast_members
            .entry(topic.to_string())
            .or_default()
            .push((member_id, inbox.clone()));
        Ok(Arc::new(MemoryBroadcast {
            backend: self.clone(),
            topic: topic.to_string(),
            member_id,
            inbox,
        }))
    }
}

#[async_trait]
impl ObjectStorage for InMemoryBackend {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        fail_if(&state, FailurePoint::Upload)?;
        state.objects.insert(
            object_key(bucket, path),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("memory://{bucket}/{path}")
    }
}

#[cfg(test)]
#[path = "tests/memory_tests.rs"]
mod tests;
