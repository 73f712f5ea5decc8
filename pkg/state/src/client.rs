use async_trait::async_trait;
use pkg_constants::network::DEVICE_DB_PREFIX;
use pkg_types::document::{Document, Revision};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::StoreError;

/// The document store as seen by the coordinator: single-document reads and
/// compare-and-swap writes, nothing else.
///
/// Implementations perform no caching and no retries.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document. Fails with `StoreError::NotFound` if it is absent.
    async fn get(&self, id: &str) -> Result<Document, StoreError>;

    /// Write a document.
    ///
    /// With `Some(revision)` the write only succeeds if the stored revision
    /// still matches; with `None` it only succeeds if the document does not
    /// exist yet. Either mismatch fails with `StoreError::Conflict`.
    async fn put(
        &self,
        id: &str,
        revision: Option<&Revision>,
        body: &Value,
    ) -> Result<Revision, StoreError>;
}

#[derive(Deserialize)]
struct PutResponse {
    rev: String,
}

/// Document store backed by a CouchDB-compatible HTTP API.
///
/// Each device has its own database, `<base>/d_<device>`. An optional bearer
/// token is attached to every request as-is.
#[derive(Clone)]
pub struct CouchStore {
    http: reqwest::Client,
    db_url: String,
    token: Option<String>,
}

impl CouchStore {
    pub fn new(base_url: &str, device: &str, token: Option<String>) -> Result<Self, StoreError> {
        let db_url = format!(
            "{}/{}{}",
            base_url.trim_end_matches('/'),
            DEVICE_DB_PREFIX,
            device
        );
        info!("Using document store at {}", db_url);

        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            db_url,
            token,
        })
    }

    pub fn db_url(&self) -> &str {
        &self.db_url
    }

    fn doc_url(&self, id: &str) -> String {
        format!("{}/{}", self.db_url, id)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.header("Authorization", format!("Bearer {}", token)),
            None => req,
        }
    }
}

#[async_trait]
impl DocumentStore for CouchStore {
    async fn get(&self, id: &str) -> Result<Document, StoreError> {
        let resp = self
            .authorize(self.http.get(self.doc_url(id)))
            .send()
            .await?;

        match resp.status() {
            StatusCode::NOT_FOUND => {
                return Err(StoreError::NotFound { id: id.to_string() });
            }
            status if !status.is_success() => {
                return Err(StoreError::Transport {
                    message: format!("GET {} returned {}", id, status),
                });
            }
            _ => {}
        }

        let body: Value = resp.json().await?;
        split_store_fields(id, body)
    }

    async fn put(
        &self,
        id: &str,
        revision: Option<&Revision>,
        body: &Value,
    ) -> Result<Revision, StoreError> {
        let mut doc = match body {
            Value::Object(fields) => fields.clone(),
            _ => return Err(StoreError::InvalidBody { id: id.to_string() }),
        };
        doc.insert("_id".to_string(), Value::String(id.to_string()));
        if let Some(rev) = revision {
            doc.insert("_rev".to_string(), Value::String(rev.to_string()));
        }

        let resp = self
            .authorize(self.http.put(self.doc_url(id)))
            .json(&doc)
            .send()
            .await?;

        match resp.status() {
            StatusCode::CONFLICT => Err(StoreError::Conflict { id: id.to_string() }),
            StatusCode::NOT_FOUND => Err(StoreError::NotFound { id: id.to_string() }),
            status if !status.is_success() => Err(StoreError::Transport {
                message: format!("PUT {} returned {}", id, status),
            }),
            _ => {
                let written: PutResponse = resp.json().await?;
                debug!("PUT {} -> rev {}", id, written.rev);
                Ok(Revision::new(written.rev))
            }
        }
    }
}

/// Move the store's `_id`/`_rev` bookkeeping out of a fetched body.
fn split_store_fields(id: &str, body: Value) -> Result<Document, StoreError> {
    let Value::Object(mut fields) = body else {
        return Err(StoreError::InvalidBody { id: id.to_string() });
    };
    fields.remove("_id");
    let revision = match fields.remove("_rev") {
        Some(Value::String(rev)) => Revision::new(rev),
        _ => {
            return Err(StoreError::Transport {
                message: format!("document {} came back without a _rev", id),
            });
        }
    };
    Ok(Document::new(id, revision, Value::Object(fields)))
}
