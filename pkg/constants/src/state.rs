//! Control lease / document store constants.

/// Document id of the lease-protected control document.
pub const CONTROL_DOC: &str = "control";

/// Document id of the telemetry document written by the device.
pub const DEVICE_DOC: &str = "device";

/// How long a control lease stays valid after `issuedAt`, in milliseconds.
pub const LEASE_WINDOW_MS: u64 = 10_000;

/// The lease is renewed every `LEASE_WINDOW_MS / RENEW_INTERVAL_DIVISOR` ms.
pub const RENEW_INTERVAL_DIVISOR: u64 = 2;

/// Minimum spacing between two store reads of the same cached document.
pub const READ_CACHE_TTL_MS: u64 = 100;

/// Schema version stamped on every control document write.
pub const CONTROL_SCHEMA_VERSION: &str = "2022.5.14";
