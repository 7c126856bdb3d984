//! Core building blocks for proxy test sessions.
//!
//! This crate provides:
//! - `protocol` - Push-channel envelopes, typed payloads, client messages
//! - `SessionState` - Session-in-progress reduced from push events
//! - `MessageDispatcher` - Sole writer of the state, with broadcast + replay
//! - `TestConfig` / `ClientConfig` - What to test and where the runner lives
//! - Starter, push-channel and slot-storage traits

pub mod config;
pub mod dispatcher;
pub mod protocol;
pub mod state;
pub mod traits;

pub use config::{ClientConfig, ReconnectPolicy, StoreLimits, TestConfig, TestMode};
pub use dispatcher::{MessageDispatcher, SessionUpdate};
pub use protocol::{ClientMessage, SessionEvent};
pub use state::SessionState;
pub use traits::{PushChannel, SlotStorage, TestStarter};
