//! Operational HTTP handlers

pub mod status;

pub use status::{health_handler, HealthResponse, RuntimeStats, StatusResponse};
