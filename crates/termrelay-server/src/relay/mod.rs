//! Relay engine: connection handles, the session/connection registry and
//! the per-connection pumps.

pub mod connection;
pub mod engine;
pub mod registry;

pub use connection::{ConnectionHandle, ConnectionId, Outbound};
pub use engine::RelayEngine;
pub use registry::ConnectionRegistry;
