//! Elasticsearch REST client.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{json, Value};

use crate::bulk::{build_bulk_body, parse_bulk_response, BulkItemStatus, BulkOp};
use crate::{EsOpts, SearchSink};

/// HTTP client for one destination index.
#[derive(Clone)]
pub struct EsClient {
    http: Client,
    opts: EsOpts,
}

impl EsClient {
    pub fn new(opts: EsOpts) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build Elasticsearch HTTP client")?;
        Ok(Self { http, opts })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{path}",
            self.opts.es_endpoint.trim_end_matches('/')
        )
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.opts.es_username {
            Some(username) => request.basic_auth(username, self.opts.es_password.as_deref()),
            None => request,
        }
    }

    /// Mapping installed when the index is first created: a join field
    /// relating parent documents to their promoted children.
    fn index_mapping(&self) -> Value {
        json!({
            "mappings": {
                "properties": {
                    (self.opts.join_field.as_str()): {
                        "type": "join",
                        "relations": {
                            (self.opts.parent_relation.as_str()): self.opts.child_relation,
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl SearchSink for EsClient {
    async fn ensure_index(&self) -> anyhow::Result<()> {
        let index_url = self.url(&self.opts.es_index);

        let head = self
            .authed(self.http.head(&index_url))
            .send()
            .await
            .with_context(|| format!("Failed to reach Elasticsearch at '{index_url}'"))?;

        match head.status() {
            StatusCode::OK => {
                tracing::debug!("Index '{}' already exists", self.opts.es_index);
                return Ok(());
            }
            StatusCode::NOT_FOUND => {}
            status => anyhow::bail!("Unexpected status {status} checking index '{index_url}'"),
        }

        tracing::info!(
            "Creating index '{}' with join field '{}' ({} -> {})",
            self.opts.es_index,
            self.opts.join_field,
            self.opts.parent_relation,
            self.opts.child_relation
        );

        let response = self
            .authed(self.http.put(&index_url))
            .json(&self.index_mapping())
            .send()
            .await
            .with_context(|| format!("Failed to create index '{index_url}'"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Index creation returned {status}: {body}");
        }
        Ok(())
    }

    async fn bulk(&self, ops: &[BulkOp]) -> anyhow::Result<Vec<BulkItemStatus>> {
        let body = build_bulk_body(ops)?;
        let bulk_url = self.url(&format!("{}/_bulk", self.opts.es_index));

        let response = self
            .authed(self.http.post(&bulk_url))
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .with_context(|| format!("Bulk request to '{bulk_url}' failed"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Bulk request returned {status}: {body}");
        }

        let envelope: Value = response
            .json()
            .await
            .context("Failed to decode bulk response")?;
        let statuses = parse_bulk_response(&envelope)?;

        if statuses.len() != ops.len() {
            anyhow::bail!(
                "Bulk response item count {} does not match request count {}",
                statuses.len(),
                ops.len()
            );
        }
        Ok(statuses)
    }
}
