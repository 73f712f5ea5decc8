//! In-memory `DocumentStore` with deterministic CAS.
//!
//! Every `get`/`put` yields once before touching the map, the way a real
//! round trip would suspend the caller. Coordinators driven concurrently on
//! one task (e.g. with `tokio::join!`) therefore interleave step by step,
//! which makes bootstrap races reproducible.

use async_trait::async_trait;
use pkg_types::document::{Document, Revision};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::client::DocumentStore;
use crate::error::StoreError;

#[derive(Debug, Clone)]
struct StoredDoc {
    revision: Revision,
    body: Value,
}

#[derive(Debug, Default)]
struct MemoryInner {
    seq: u64,
    docs: HashMap<String, StoredDoc>,
    /// Every body accepted per document, in commit order.
    history: HashMap<String, Vec<Value>>,
    reads: HashMap<String, u64>,
    writes: HashMap<String, u64>,
    fail_reads: u32,
    fail_writes: u32,
    /// Writes from "another session" that land just before our next put.
    staged: HashMap<String, Value>,
}

impl MemoryInner {
    fn commit(&mut self, id: &str, body: Value) -> Revision {
        self.seq += 1;
        let revision = Revision::new(format!("{}-{}", self.seq, uuid::Uuid::new_v4().simple()));
        self.history
            .entry(id.to_string())
            .or_default()
            .push(body.clone());
        self.docs.insert(
            id.to_string(),
            StoredDoc {
                revision: revision.clone(),
                body,
            },
        );
        revision
    }
}

/// Shared in-memory store. Clones see the same documents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconditionally write a document, as an external writer (the device)
    /// would. Returns the new revision.
    pub async fn seed(&self, id: &str, body: Value) -> Revision {
        self.inner.lock().await.commit(id, body)
    }

    /// Current revision and body of a document, without counting as a read.
    pub async fn document(&self, id: &str) -> Option<Document> {
        let inner = self.inner.lock().await;
        inner
            .docs
            .get(id)
            .map(|d| Document::new(id, d.revision.clone(), d.body.clone()))
    }

    /// Bodies of every accepted write to `id`, oldest first.
    pub async fn history(&self, id: &str) -> Vec<Value> {
        let inner = self.inner.lock().await;
        inner.history.get(id).cloned().unwrap_or_default()
    }

    pub async fn read_count(&self, id: &str) -> u64 {
        let inner = self.inner.lock().await;
        inner.reads.get(id).copied().unwrap_or(0)
    }

    pub async fn write_count(&self, id: &str) -> u64 {
        let inner = self.inner.lock().await;
        inner.writes.get(id).copied().unwrap_or(0)
    }

    /// Fail the next `n` reads (of any document) with a transport error.
    pub async fn fail_next_reads(&self, n: u32) {
        self.inner.lock().await.fail_reads = n;
    }

    /// Fail the next `n` writes (of any document) with a transport error.
    pub async fn fail_next_writes(&self, n: u32) {
        self.inner.lock().await.fail_writes = n;
    }

    /// Have another writer commit `body` to `id` right before the next put
    /// to that document is evaluated.
    pub async fn stage_foreign_write(&self, id: &str, body: Value) {
        self.inner.lock().await.staged.insert(id.to_string(), body);
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Document, StoreError> {
        tokio::task::yield_now().await;
        let mut inner = self.inner.lock().await;

        if inner.fail_reads > 0 {
            inner.fail_reads -= 1;
            return Err(StoreError::Transport {
                message: format!("injected read failure on {}", id),
            });
        }

        *inner.reads.entry(id.to_string()).or_default() += 1;
        match inner.docs.get(id) {
            Some(d) => Ok(Document::new(id, d.revision.clone(), d.body.clone())),
            None => Err(StoreError::NotFound { id: id.to_string() }),
        }
    }

    async fn put(
        &self,
        id: &str,
        revision: Option<&Revision>,
        body: &Value,
    ) -> Result<Revision, StoreError> {
        tokio::task::yield_now().await;
        let mut inner = self.inner.lock().await;

        if inner.fail_writes > 0 {
            inner.fail_writes -= 1;
            return Err(StoreError::Transport {
                message: format!("injected write failure on {}", id),
            });
        }
        if !body.is_object() {
            return Err(StoreError::InvalidBody { id: id.to_string() });
        }
        if let Some(foreign) = inner.staged.remove(id) {
            inner.commit(id, foreign);
        }

        let current = inner.docs.get(id).map(|d| &d.revision);
        let matches = match (revision, current) {
            (None, None) => true,
            (Some(expected), Some(stored)) => expected == stored,
            _ => false,
        };
        if !matches {
            return Err(StoreError::Conflict { id: id.to_string() });
        }

        *inner.writes.entry(id.to_string()).or_default() += 1;
        Ok(inner.commit(id, body.clone()))
    }
}
