//! # Error Taxonomy
//!
//! Purpose: One error type shared across the workspace so every layer
//! (engine, persistence, replication, dispatch) reports failures the same
//! way, and so the server can render each kind as the right wire reply.
//!
//! ## Design Principles
//! 1. **Typed Kinds**: Each failure class is a distinct variant, not a string.
//! 2. **Wire-Ready Messages**: `wire_message` produces the exact `-…` reply body.
//! 3. **No Leakage**: Internal failures surface a safe generic message.

use std::io;

use thiserror::Error;

/// Result alias used across the workspace.
pub type RudisResult<T> = Result<T, RudisError>;

/// Error kinds for every subsystem.
///
/// Command-level kinds render through [`RudisError::wire_message`];
/// persistence and replication kinds are logged server-side and never turn
/// into command replies.
#[derive(Debug, Error)]
pub enum RudisError {
    /// Unknown command name.
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// Command received the wrong number of arguments.
    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(String),

    /// Operation against a key holding a different value variant.
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    /// Argument was expected to be an integer.
    #[error("value is not an integer or out of range")]
    NotAnInteger,

    /// Argument was expected to be a float.
    #[error("value is not a valid float")]
    NotAFloat,

    /// List or range index outside the valid bounds.
    #[error("index out of range")]
    IndexOutOfRange,

    /// Shard index outside the configured database count.
    #[error("DB index is out of range")]
    UnknownShard,

    /// Key required by the command does not exist.
    #[error("no such key")]
    NoSuchKey,

    /// Cluster-only command issued while cluster mode is disabled.
    #[error("This instance has cluster support disabled")]
    ClusterDisabled,

    /// Write command issued against a read-only slave.
    #[error("READONLY You can't write against a read only replica")]
    ReadOnlySlave,

    /// Malformed inbound line or token stream.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Snapshot or append-log failure. Logged, never a command reply.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// Snapshot body could not be decoded under any compression setting.
    #[error("snapshot is corrupt: {0}")]
    Corrupt(String),

    /// Replication connect/read failure.
    #[error("replication failure: {0}")]
    Replication(String),

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Unexpected internal failure; the message stays generic on the wire.
    #[error("internal error")]
    Internal,
}

impl RudisError {
    /// Renders the error as the body of a `-…\r\n` reply.
    ///
    /// `WRONGTYPE` and `READONLY` carry their own prefix; everything else
    /// gets the conventional `ERR` prefix. Server-internal kinds collapse to
    /// a generic message so nothing about the host leaks to clients.
    pub fn wire_message(&self) -> String {
        match self {
            RudisError::WrongType | RudisError::ReadOnlySlave => self.to_string(),
            RudisError::Persistence(_)
            | RudisError::Corrupt(_)
            | RudisError::Replication(_)
            | RudisError::Io(_)
            | RudisError::Internal => "ERR internal error".to_string(),
            other => format!("ERR {other}"),
        }
    }

    /// True for kinds that should never leave the server as command replies.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            RudisError::Persistence(_)
                | RudisError::Corrupt(_)
                | RudisError::Replication(_)
                | RudisError::Io(_)
                | RudisError::Internal
        )
    }
}
