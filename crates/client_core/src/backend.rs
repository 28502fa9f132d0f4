//! Capability traits for the remote service: row store, realtime hub and
//! object storage. The engines only ever talk to these seams.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use shared::domain::Table;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Eq(String, String),
    Neq(String, String),
    In(String, Vec<String>),
    ILike(String, String),
}

impl Filter {
    pub fn column(&self) -> &str {
        match self {
            Filter::Eq(column, _)
            | Filter::Neq(column, _)
            | Filter::In(column, _)
            | Filter::ILike(column, _) => column,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub table: Table,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(table: Table) -> Self {
        Self {
            table,
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    pub fn eq(mut self, column: &str, value: impl ToString) -> Self {
        self.filters
            .push(Filter::Eq(column.to_string(), value.to_string()));
        self
    }

    pub fn neq(mut self, column: &str, value: impl ToString) -> Self {
        self.filters
            .push(Filter::Neq(column.to_string(), value.to_string()));
        self
    }

    pub fn any_of<I, V>(mut self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: ToString,
    {
        self.filters.push(Filter::In(
            column.to_string(),
            values.into_iter().map(|v| v.to_string()).collect(),
        ));
        self
    }

    pub fn ilike(mut self, column: &str, pattern: impl Into<String>) -> Self {
        self.filters
            .push(Filter::ILike(column.to_string(), pattern.into()));
        self
    }

    pub fn order_by(mut self, column: &str, descending: bool) -> Self {
        self.order = Some(Order {
            column: column.to_string(),
            descending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Update,
}

impl ChangeKind {
    pub fn as_event(self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
        }
    }

    pub fn from_event(event: &str) -> Option<Self> {
        match event {
            "INSERT" => Some(ChangeKind::Insert),
            "UPDATE" => Some(ChangeKind::Update),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastEnvelope {
    pub event: String,
    pub payload: Value,
}

#[async_trait]
pub trait RowStore: Send + Sync {
    async fn select(&self, query: Query) -> Result<Vec<Value>>;
    async fn count(&self, query: Query) -> Result<u64>;
    /// Inserts rows and returns them as persisted, server defaults included.
    async fn insert(&self, table: Table, rows: Vec<Value>) -> Result<Vec<Value>>;
    async fn update(&self, query: Query, patch: Value) -> Result<()>;
}

#[async_trait]
pub trait PresenceHandle: Send + Sync {
    async fn track(&self, payload: Value) -> Result<()>;
    fn subscribe_sync(&self) -> broadcast::Receiver<Vec<String>>;
    async fn leave(&self) -> Result<()>;
}

#[async_trait]
pub trait BroadcastHandle: Send + Sync {
    async fn send(&self, event: &str, payload: Value) -> Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<BroadcastEnvelope>;
    async fn leave(&self) -> Result<()>;
}

#[async_trait]
pub trait RealtimeHub: Send + Sync {
    async fn subscribe_changes(
        &self,
        table: Table,
        kind: ChangeKind,
    ) -> Result<broadcast::Receiver<Value>>;
    async fn join_presence(&self, topic: &str, key: &str) -> Result<Arc<dyn PresenceHandle>>;
    async fn join_broadcast(&self, topic: &str) -> Result<Arc<dyn BroadcastHandle>>;
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<()>;
    fn public_url(&self, bucket: &str, path: &str) -> String;
}

pub async fn select_as<T: DeserializeOwned>(store: &dyn RowStore, query: Query) -> Result<Vec<T>> {
    let table = query.table;
    store
        .select(query)
        .await?
        .into_iter()
        .map(|row| {
            serde_json::from_value(row).with_context(|| format!("malformed {table} row"))
        })
        .collect()
}

pub async fn insert_as<T: Serialize + ?Sized, R: DeserializeOwned>(
    store: &dyn RowStore,
    table: Table,
    rows: &[&T],
) -> Result<Vec<R>> {
    let rows = rows
        .iter()
        .map(|row| serde_json::to_value(row))
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("failed to encode {table} rows"))?;
    store
        .insert(table, rows)
        .await?
        .into_iter()
        .map(|row| {
            serde_json::from_value(row).with_context(|| format!("malformed {table} row"))
        })
        .collect()
}

pub async fn insert_one<T: Serialize + ?Sized, R: DeserializeOwned>(
    store: &dyn RowStore,
    table: Table,
    row: &T,
) -> Result<R> {
    insert_as::<T, R>(store, table, &[row])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("{table} insert returned no row"))
}
