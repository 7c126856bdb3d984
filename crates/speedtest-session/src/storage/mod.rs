//! Slot storage implementations.

#[cfg(feature = "fs")]
pub mod file;
#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "fs")]
pub use file::FileSlot;
#[cfg(feature = "memory")]
pub use memory::MemorySlot;

/// Name of the slot holding saved sessions.
pub const SLOT_KEY: &str = "clash-speedtest-sessions";
