use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Operating mode requested of (or reported by) the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMode {
    Safe,
    Manual,
    Auto,
}

impl std::fmt::Display for ControlMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlMode::Safe => write!(f, "SAFE"),
            ControlMode::Manual => write!(f, "MANUAL"),
            ControlMode::Auto => write!(f, "AUTO"),
        }
    }
}

impl std::str::FromStr for ControlMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SAFE" => Ok(ControlMode::Safe),
            "MANUAL" => Ok(ControlMode::Manual),
            "AUTO" => Ok(ControlMode::Auto),
            other => anyhow::bail!("unknown control mode '{}' (expected safe, manual or auto)", other),
        }
    }
}

/// Session description offered to the device over the control document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebrtcOffer {
    pub sdp: String,
}

/// Typed application payload carried on the control lease.
///
/// Absent fields are left out of the payload so a write only touches what
/// it names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ControlMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webrtc: Option<WebrtcOffer>,
}

impl ControlCommand {
    pub fn mode(mode: ControlMode) -> Self {
        Self {
            mode: Some(mode),
            ..Default::default()
        }
    }

    /// Flatten into the field map merged into the lease record.
    pub fn into_payload(self) -> Map<String, Value> {
        let mut fields = Map::new();
        if let Some(mode) = self.mode {
            fields.insert("mode".to_string(), Value::String(mode.to_string()));
        }
        if let Some(offer) = self.webrtc {
            let mut webrtc = Map::new();
            webrtc.insert("sdp".to_string(), Value::String(offer.sdp));
            fields.insert("webrtc".to_string(), Value::Object(webrtc));
        }
        fields
    }
}
