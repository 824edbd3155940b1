//! Network transport: WebSocket upgrade with bearer auth, optional TLS.

pub mod tls;
pub mod websocket;
