use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use pkg_constants::state::CONTROL_SCHEMA_VERSION;

use crate::document::{Document, Revision};

/// Keys owned by the lease itself (or by the store). Application payloads
/// must not carry them.
pub const RESERVED_KEYS: &[&str] = &[
    "ownerSessionId",
    "fenceToken",
    "issuedAt",
    "schemaVersion",
    "_id",
    "_rev",
];

/// Check whether a lease issued at `issued_at` is still valid at `now`.
///
/// The test is symmetric: an `issued_at` up to `window_ms` in the future
/// also counts as valid.
pub fn lease_valid(issued_at: i64, now: i64, window_ms: u64) -> bool {
    now.abs_diff(issued_at) <= window_ms
}

/// The control document: lease fields plus the application payload that
/// rides along with them.
///
/// Stored as `{ ownerSessionId, fenceToken, issuedAt, schemaVersion, ...payload }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    /// Session that last successfully wrote the lease.
    pub owner_session_id: String,
    /// Incremented on every successful write; never reused.
    pub fence_token: u64,
    /// Writer's wall clock at write time (ms since epoch).
    pub issued_at: i64,
    pub schema_version: String,
    /// Store revision this record was read at (or written as).
    #[serde(skip)]
    pub revision: Option<Revision>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl LeaseRecord {
    /// A brand new lease, as written when the control document does not exist yet.
    pub fn genesis(owner_session_id: &str, issued_at: i64) -> Self {
        Self {
            owner_session_id: owner_session_id.to_string(),
            fence_token: 0,
            issued_at,
            schema_version: CONTROL_SCHEMA_VERSION.to_string(),
            revision: None,
            payload: Map::new(),
        }
    }

    /// Decode a control document fetched from the store.
    pub fn decode(doc: &Document) -> serde_json::Result<Self> {
        let mut record: LeaseRecord = doc.decode()?;
        record.revision = Some(doc.revision.clone());
        Ok(record)
    }

    /// Encode the record into a document body. The revision is not part of it.
    pub fn encode(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    /// The record that the next write by `owner_session_id` would produce:
    /// fence bumped by one, fresh `issued_at`, payload carried over.
    ///
    /// The revision is kept so the write can CAS against it. Returns `None`
    /// once the fence token is exhausted; it must never wrap.
    pub fn successor(&self, owner_session_id: &str, issued_at: i64) -> Option<Self> {
        Some(Self {
            owner_session_id: owner_session_id.to_string(),
            fence_token: self.fence_token.checked_add(1)?,
            issued_at,
            schema_version: CONTROL_SCHEMA_VERSION.to_string(),
            revision: self.revision.clone(),
            payload: self.payload.clone(),
        })
    }

    /// Merge application fields into the payload; later values win.
    pub fn merge_payload(&mut self, fields: Map<String, Value>) {
        for (key, value) in fields {
            self.payload.insert(key, value);
        }
    }

    pub fn is_valid_at(&self, now: i64, window_ms: u64) -> bool {
        lease_valid(self.issued_at, now, window_ms)
    }

    pub fn is_owned_by(&self, session_id: &str) -> bool {
        self.owner_session_id == session_id
    }

    pub fn has_current_schema(&self) -> bool {
        self.schema_version == CONTROL_SCHEMA_VERSION
    }

    /// Milliseconds since issuance (negative when stamped in the future).
    pub fn age_ms(&self, now: i64) -> i64 {
        now - self.issued_at
    }

    pub fn issued_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.issued_at)
    }

    /// Decode the payload into a typed view such as `ControlCommand`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(Value::Object(self.payload.clone()))
    }
}

/// Return the first reserved key present in `fields`, if any.
pub fn find_reserved_key(fields: &Map<String, Value>) -> Option<&'static str> {
    RESERVED_KEYS
        .iter()
        .copied()
        .find(|key| fields.contains_key(*key))
}
