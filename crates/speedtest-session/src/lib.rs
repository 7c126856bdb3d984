//! Session lifecycle and saved-session storage for proxy tests.
//!
//! Provides:
//! - `SessionController` - Start, track and stop one test session
//! - `SessionStore` - Bounded history of completed sessions
//! - Slot implementations (memory, file)

pub mod controller;
pub mod export;
pub mod record;
pub mod storage;
pub mod store;

pub use controller::{CompletedSession, ControllerError, SessionController, SessionPhase, StopOutcome};
pub use export::ExportFormat;
pub use record::{SavedRecord, SessionMeta, SessionSummary, TestType};
pub use store::{SessionStore, StoreError, StoreStats};
