//! Document store connection constants.

/// Default base URL of the replicated document store.
pub const DEFAULT_DB_URL: &str = "http://127.0.0.1:5984";

/// Every device gets its own database named `DEVICE_DB_PREFIX + device`.
pub const DEVICE_DB_PREFIX: &str = "d_";

/// Device name used when neither the CLI nor the config file names one.
pub const DEFAULT_DEVICE_NAME: &str = "rover";
