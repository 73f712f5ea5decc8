use serde::{Deserialize, Serialize};

use crate::control::{ControlMode, WebrtcOffer};
use crate::lease::LeaseRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaMeta {
    pub version: String,
}

/// The device's echo of the last control write it applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlResponse {
    pub session_id: String,
    /// Fence token of the applied control write.
    pub v: u64,
}

/// Typed view of the telemetry document written by the device.
///
/// The coordinator treats the device document as opaque; this view is for
/// callers that want to interpret it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    pub meta: SchemaMeta,
    pub mode: ControlMode,
    /// Device clock, in seconds since epoch.
    pub utc_epoch: f64,
    #[serde(default)]
    pub control_response: Option<ControlResponse>,
    #[serde(default)]
    pub webrtc: Option<WebrtcOffer>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    /// m/s, +y is the front of the robot
    #[serde(default)]
    pub velocity: Option<[f64; 3]>,
    /// deg/s
    #[serde(default)]
    pub angular_velocity: Option<[f64; 3]>,
    #[serde(default)]
    pub acceleration: Option<[f64; 3]>,
    /// Percent, 0..=100
    #[serde(default)]
    pub battery: Option<f64>,
    /// Meters, counterclockwise from the front of the vehicle.
    #[serde(default)]
    pub ultrasonics: Option<[f64; 4]>,
}

impl DeviceState {
    /// Whether the device has applied the given lease write (or a later one
    /// from the same session).
    pub fn acknowledges(&self, lease: &LeaseRecord) -> bool {
        self.control_response
            .as_ref()
            .is_some_and(|r| r.session_id == lease.owner_session_id && r.v >= lease.fence_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> DeviceState {
        serde_json::from_value(json!({
            "meta": { "version": "2022.5.14" },
            "mode": "MANUAL",
            "utcEpoch": 1_700_000_000.5,
            "controlResponse": { "sessionId": "s1", "v": 4 },
            "battery": 87.0,
            "ultrasonics": [1.0, 2.5, 0.3, 4.0],
        }))
        .unwrap()
    }

    #[test]
    fn decode_partial_telemetry() {
        let state = sample();
        assert_eq!(state.mode, ControlMode::Manual);
        assert_eq!(state.battery, Some(87.0));
        assert_eq!(state.ultrasonics, Some([1.0, 2.5, 0.3, 4.0]));
        assert!(state.velocity.is_none());
        assert!(state.latitude.is_none());
    }

    #[test]
    fn acknowledges_matching_session_and_fence() {
        let state = sample();
        let mut lease = LeaseRecord::genesis("s1", 0);

        lease.fence_token = 4;
        assert!(state.acknowledges(&lease));
        lease.fence_token = 3;
        assert!(state.acknowledges(&lease));
        lease.fence_token = 5;
        assert!(!state.acknowledges(&lease));

        let other = LeaseRecord::genesis("s2", 0);
        assert!(!state.acknowledges(&other));
    }
}
