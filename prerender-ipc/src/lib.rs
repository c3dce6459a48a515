//! Inter-process communication for prerender
//!
//! This crate provides the message protocol and line-delimited JSON framing
//! used between the pool coordinator and its render worker processes.

pub mod error;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use error::IpcError;
pub use protocol::{
    CoordinatorMessage, MessageEnvelope, WorkerError, WorkerMessage, WorkerStatus,
    IPC_PROTOCOL_VERSION,
};
pub use transport::{MessageReader, MessageWriter};
