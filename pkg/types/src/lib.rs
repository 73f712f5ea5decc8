//! Shared data types for the teleop control plane.
//!
//! Everything that crosses the document store boundary is defined here:
//! the control lease record, the typed payloads piggybacked on it, the
//! device telemetry view, and the YAML config file.

pub mod config;
pub mod control;
pub mod device;
pub mod document;
pub mod lease;
