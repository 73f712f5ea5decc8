use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque CAS token handed out by the document store.
///
/// Changes on every successful write. Callers never inspect it; they only
/// hand it back to `put` to prove which version they read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    pub fn new(rev: impl Into<String>) -> Self {
        Self(rev.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A document as returned by the store: its id, current revision and body.
///
/// Store bookkeeping fields (`_id`, `_rev`) are never part of `body`.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub revision: Revision,
    pub body: Value,
}

impl Document {
    pub fn new(id: impl Into<String>, revision: Revision, body: Value) -> Self {
        Self {
            id: id.into(),
            revision,
            body,
        }
    }

    /// Decode the body into a typed view.
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.body)
    }
}
