//! Seams between the session layer and its transports.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::{config::TestConfig, protocol::ClientMessage};

/// Backend-issued task identifier.
pub type TaskId = String;

/// Start-call error.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("Request failed: {0}")]
    Transport(String),
    #[error("Runner rejected the test: {0}")]
    Rejected(String),
    #[error("Runner response carried no task id")]
    MissingTaskId,
    #[error("Invalid runner response: {0}")]
    InvalidResponse(String),
}

/// Issues the request/response call that creates a backend task.
#[async_trait]
pub trait TestStarter: Send + Sync {
    /// Ask the runner to start testing `config`.
    ///
    /// # Returns
    /// The task identifier the runner assigned.
    async fn start(&self, config: &TestConfig) -> Result<TaskId, StartError>;
}

/// Push channel as seen by the session layer.
pub trait PushChannel: Send + Sync {
    /// Whether the channel is open right now.
    fn is_connected(&self) -> bool;

    /// Request a connection. Does not wait for it to open.
    fn connect(&self);

    /// Send a message. Returns `false` if it was not delivered to an open
    /// channel.
    fn send(&self, message: &ClientMessage) -> bool;
}

impl<T: PushChannel + ?Sized> PushChannel for Arc<T> {
    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn connect(&self) {
        (**self).connect();
    }

    fn send(&self, message: &ClientMessage) -> bool {
        (**self).send(message)
    }
}

#[async_trait]
impl<T: TestStarter + ?Sized> TestStarter for Arc<T> {
    async fn start(&self, config: &TestConfig) -> Result<TaskId, StartError> {
        (**self).start(config).await
    }
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage quota exceeded: {needed} bytes needed, {quota} allowed")]
    QuotaExceeded { needed: usize, quota: usize },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// A single durable key-value slot holding one serialized document.
#[async_trait]
pub trait SlotStorage: Send + Sync {
    /// Read the slot; `None` if it was never written or was removed.
    async fn read(&self) -> Result<Option<String>, StorageError>;

    /// Replace the slot's contents.
    async fn write(&self, contents: &str) -> Result<(), StorageError>;

    /// Remove the slot.
    async fn remove(&self) -> Result<(), StorageError>;
}
