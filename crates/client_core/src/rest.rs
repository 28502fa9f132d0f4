use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response};
use serde_json::Value;
use shared::{
    domain::Table,
    error::{ApiError, ApiException},
};
use tracing::debug;

use crate::backend::{Filter, ObjectStorage, Query, RowStore};

#[derive(Clone)]
pub struct RestBackend {
    http: Client,
    base_url: String,
    api_key: String,
    access_token: Option<String>,
}

pub fn query_pairs(query: &Query) -> Vec<(String, String)> {
    let mut pairs = vec![("select".to_string(), "*".to_string())];
    for filter in &query.filters {
        let value = match filter {
            Filter::Eq(_, v) => format!("eq.{v}"),
            Filter::Neq(_, v) => format!("neq.{v}"),
            Filter::In(_, values) => format!("in.({})", values.join(",")),
            Filter::ILike(_, pattern) => format!("ilike.{pattern}"),
        };
        pairs.push((filter.column().to_string(), value));
    }
    if let Some(order) = &query.order {
        let direction = if order.descending { "desc" } else { "asc" };
        pairs.push(("order".to_string(), format!("{}.{direction}", order.column)));
    }
    if let Some(limit) = query.limit {
        pairs.push(("limit".to_string(), limit.to_string()));
    }
    pairs
}

/// Total from a `Content-Range` header such as `0-9/42` or `*/0`.
pub fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

async fn ensure_success(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let err = ApiException::from(ApiError::from_response(status.as_u16(), &body));
    Err(anyhow::Error::new(err).context(format!("{what} failed with status {status}")))
}

impl RestBackend {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            access_token: None,
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    fn table_url(&self, table: Table) -> String {
        format!("{}/rest/v1/{}", self.base_url, table.as_str())
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
        request
            .header("apikey", &self.api_key)
            .header(header::AUTHORIZATION, format!("Bearer {bearer}"))
    }
}

#[async_trait]
impl RowStore for RestBackend {
    async fn select(&self, query: Query) -> Result<Vec<Value>> {
        let table = query.table;
        let response = self
            .authorized(self.http.get(self.table_url(table)))
            .query(&query_pairs(&query))
            .send()
            .await
            .with_context(|| format!("select from {table}"))?;
        ensure_success(response, "select")
            .await?
            .json()
            .await
            .with_context(|| format!("decode {table} rows"))
    }

    async fn count(&self, query: Query) -> Result<u64> {
        let table = query.table;
        let response = self
            .authorized(self.http.get(self.table_url(table)))
            .query(&query_pairs(&query))
            .query(&[("limit", "1")])
            .header("Prefer", "count=exact")
            .send()
            .await
            .with_context(|| format!("count {table} rows"))?;
        let response = ensure_success(response, "count").await?;
        response
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(content_range_total)
            .ok_or_else(|| anyhow!("{table} count response had no usable Content-Range"))
    }

    async fn insert(&self, table: Table, rows: Vec<Value>) -> Result<Vec<Value>> {
        debug!(table = %table, rows = rows.len(), "rest: insert");
        let response = self
            .authorized(self.http.post(self.table_url(table)))
            .header("Prefer", "return=representation")
            .json(&rows)
            .send()
            .await
            .with_context(|| format!("insert into {table}"))?;
        ensure_success(response, "insert")
            .await?
            .json()
            .await
            .with_context(|| format!("decode inserted {table} rows"))
    }

    async fn update(&self, query: Query, patch: Value) -> Result<()> {
        let table = query.table;
        let filters: Vec<(String, String)> = query_pairs(&query)
            .into_iter()
            .filter(|(key, _)| key != "select")
            .collect();
        let response = self
            .authorized(self.http.patch(self.table_url(table)))
            .query(&filters)
            .header("Prefer", "return=minimal")
            .json(&patch)
            .send()
            .await
            .with_context(|| format!("update {table}"))?;
        ensure_success(response, "update").await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for RestBackend {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        let url = format!("{}/storage/v1/object/{bucket}/{path}", self.base_url);
        let response = self
            .authorized(self.http.post(url))
            .header(header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .with_context(|| format!("upload {bucket}/{path}"))?;
        ensure_success(response, "upload").await?;
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/storage/v1/object/public/{bucket}/{path}", self.base_url)
    }
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod tests;
