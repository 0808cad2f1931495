//! REST document store client.
//!
//! Speaks a Cosmos-flavoured document API:
//!
//! | Operation          | Request                                                 |
//! |--------------------|---------------------------------------------------------|
//! | read               | `GET  {endpoint}/dbs/{db}/colls/{coll}/docs/{id}`       |
//! | replace_if_match   | `PUT  .../docs/{id}` + `If-Match` / `If-None-Match: *`  |
//! | upsert             | `PUT  .../docs/{id}`                                    |
//! | insert             | `POST .../docs`                                         |
//! | change feed        | `GET  .../changes?maxItems=&continuation=`              |
//!
//! The partition key travels in the `x-partition-key` header and the version
//! tag in the `ETag` response header.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, ETAG, IF_MATCH, IF_NONE_MATCH};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use etl_core::config::StoreConfig;

use crate::document::{ConditionalWrite, DocumentStore, StoredDocument, Version};
use crate::error::StoreError;
use crate::feed::ChangeFeed;

pub const PARTITION_HEADER: &str = "x-partition-key";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// [`DocumentStore`] backed by a remote HTTP document service.
#[derive(Debug, Clone)]
pub struct HttpDocumentStore {
    client: reqwest::Client,
    endpoint: String,
    database: String,
    key: Option<String>,
}

impl HttpDocumentStore {
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            database: config.database.clone(),
            key: config.key.clone(),
        })
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/dbs/{}/colls/{}", self.endpoint, self.database, collection)
    }

    fn doc_url(&self, collection: &str, id: &str) -> String {
        format!("{}/docs/{}", self.collection_url(collection), id)
    }

    fn request(&self, method: Method, url: &str, partition: Option<&str>) -> RequestBuilder {
        let mut req = self
            .client
            .request(method, url)
            .header(ACCEPT, "application/json");
        if let Some(partition) = partition {
            req = req.header(PARTITION_HEADER, partition);
        }
        if let Some(ref key) = self.key {
            req = req.header(AUTHORIZATION, key);
        }
        req
    }

    /// Change feed over one collection, starting from the beginning.
    pub fn change_feed(&self, collection: &str) -> HttpChangeFeed {
        HttpChangeFeed {
            store: self.clone(),
            collection: collection.to_string(),
            cursor: Mutex::new(Continuation::default()),
        }
    }
}

fn version_of(resp: &Response) -> Result<Version, StoreError> {
    resp.headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(Version::new)
        .ok_or_else(|| StoreError::Protocol(format!("{} response carried no ETag", resp.url())))
}

async fn status_error(resp: Response) -> StoreError {
    let status = resp.status().as_u16();
    let body = resp
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    StoreError::Status { status, body }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn read(
        &self,
        collection: &str,
        id: &str,
        partition: &str,
    ) -> Result<Option<StoredDocument>, StoreError> {
        let url = self.doc_url(collection, id);
        let resp = self.request(Method::GET, &url, Some(partition)).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            debug!(collection, id, "document not found");
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }
        let version = version_of(&resp)?;
        let body: Value = resp.json().await?;
        Ok(Some(StoredDocument {
            id: id.to_string(),
            partition: partition.to_string(),
            version,
            body,
        }))
    }

    async fn replace_if_match(
        &self,
        collection: &str,
        id: &str,
        partition: &str,
        body: Value,
        expected: Option<&Version>,
    ) -> Result<ConditionalWrite, StoreError> {
        let url = self.doc_url(collection, id);
        let req = self.request(Method::PUT, &url, Some(partition)).json(&body);
        let req = match expected {
            Some(version) => req.header(IF_MATCH, version.as_str()),
            None => req.header(IF_NONE_MATCH, "*"),
        };
        let resp = req.send().await?;
        match resp.status() {
            StatusCode::PRECONDITION_FAILED | StatusCode::CONFLICT => {
                debug!(collection, id, "conditional write rejected");
                Ok(ConditionalWrite::VersionConflict)
            }
            s if s.is_success() => Ok(ConditionalWrite::Written(version_of(&resp)?)),
            _ => Err(status_error(resp).await),
        }
    }

    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        partition: &str,
        body: Value,
    ) -> Result<Version, StoreError> {
        let url = self.doc_url(collection, id);
        let resp = self
            .request(Method::PUT, &url, Some(partition))
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }
        version_of(&resp)
    }

    async fn insert(
        &self,
        collection: &str,
        id: &str,
        partition: &str,
        body: Value,
    ) -> Result<Version, StoreError> {
        let url = format!("{}/docs", self.collection_url(collection));
        let resp = self
            .request(Method::POST, &url, Some(partition))
            .json(&body)
            .send()
            .await?;
        if resp.status() == StatusCode::CONFLICT {
            return Err(StoreError::AlreadyExists {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }
        version_of(&resp)
    }
}

// ── Change feed ───────────────────────────────────────────────

/// One page of the remote change feed.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePage {
    pub documents: Vec<ChangeEntry>,
    /// Token to resume after this page. Absent when the page is empty.
    #[serde(default)]
    pub continuation: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEntry {
    pub id: String,
    pub partition_key: String,
    pub etag: String,
    pub body: Value,
}

#[derive(Debug, Default)]
struct Continuation {
    committed: Option<String>,
    pending: Option<String>,
}

/// [`ChangeFeed`] that pages through the remote `changes` endpoint.
pub struct HttpChangeFeed {
    store: HttpDocumentStore,
    collection: String,
    cursor: Mutex<Continuation>,
}

impl HttpChangeFeed {
    fn cursor(&self) -> MutexGuard<'_, Continuation> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ChangeFeed for HttpChangeFeed {
    async fn poll(&self, max_items: usize) -> Result<Vec<StoredDocument>, StoreError> {
        let from = self.cursor().committed.clone();
        let url = format!("{}/changes", self.store.collection_url(&self.collection));
        let mut query = vec![("maxItems", max_items.to_string())];
        if let Some(token) = from {
            query.push(("continuation", token));
        }
        let resp = self
            .store
            .request(Method::GET, &url, None)
            .query(&query)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }
        let page: ChangePage = resp.json().await?;
        self.cursor().pending = page.continuation;
        Ok(page
            .documents
            .into_iter()
            .map(|e| StoredDocument {
                id: e.id,
                partition: e.partition_key,
                version: Version::new(e.etag),
                body: e.body,
            })
            .collect())
    }

    async fn commit(&self) -> Result<(), StoreError> {
        let mut cursor = self.cursor();
        if let Some(token) = cursor.pending.take() {
            cursor.committed = Some(token);
        }
        Ok(())
    }
}
