//! HTTP and WebSocket server for assetforge.
//!
//! Exposes the job control routes, health checks and the live-progress
//! channel on top of a running scheduler.

pub mod error;
pub mod routes;
pub mod state;
pub mod ws;

pub use state::AppState;
