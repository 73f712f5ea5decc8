//! Filesystem path constants.

/// Default config file path for `teleopctl`.
pub const DEFAULT_CONFIG: &str = "/etc/teleop/config.yaml";
