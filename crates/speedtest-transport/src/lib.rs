//! Transports for proxy test sessions.
//!
//! Provides:
//! - WebSocket push channel with reconnect (feature: websocket)
//! - HTTP task starter (feature: http)

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::HttpStarter;
#[cfg(feature = "websocket")]
pub use websocket::{ConnectionEvent, ConnectionManager};
