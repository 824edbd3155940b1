//! termrelay-server: bridges authenticated WebSocket clients to PTY-backed
//! local shells and SSH channels, with reconnection inside a grace window.

pub mod auth;
pub mod config;
pub mod relay;
pub mod server;
pub mod session;
pub mod ssh;
pub mod transport;

pub use config::{ConfigOverrides, RelayLimits, ServerConfig};
pub use server::RelayServer;
