use serde::{Deserialize, Serialize};

/// Connection configuration file (YAML).
///
/// Example `config.yaml`:
/// ```yaml
/// db-url: https://db.example.com
/// device: rover-1
/// token: eyJhbGciOi...
/// lease-window-ms: 10000
/// read-ttl-ms: 100
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfigFile {
    #[serde(default, alias = "db-url")]
    pub db_url: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
    /// Bearer credential attached to every store request.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default, alias = "lease-window-ms")]
    pub lease_window_ms: Option<u64>,
    #[serde(default, alias = "read-ttl-ms")]
    pub read_ttl_ms: Option<u64>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}
