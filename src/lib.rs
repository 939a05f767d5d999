//! Triage policy: an adaptive decision policy for email triage that learns
//! rules and signal weights from user feedback.

pub mod config;
pub mod error;
pub mod policy;
pub mod proposer;
pub mod store;
