//! HTTP server for the signaling relay, health checks and metrics

pub mod shared;
pub use shared::RelayState;

pub mod http_server;
pub use http_server::{router, run_relay_server};
