//! Error types shared by every layer of the messaging engine
//!
//! [`ContextError`] is what callers see. [`StreamError`] is local to one
//! stream and is always fatal to it: the broker turns it into a disconnect
//! and the stream's waiters observe [`ContextError::LostConnection`].
//! [`CallError`] is data, not control flow: it is produced on the invoke
//! side, shipped back in the reply and reconstructed here.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a stream's framing or transport
#[derive(Debug, Error)]
pub enum StreamError {
    /// Framing, MAC or decoding failure. The stream is desynchronized or
    /// compromised and is disconnected.
    #[error("corrupt message: {0}")]
    CorruptMessage(String),

    /// I/O failure on one of the stream's descriptors
    #[error("stream I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors surfaced to users of contexts, channels and the router
#[derive(Debug, Error)]
pub enum ContextError {
    /// The channel was closed, or its peer went away
    #[error("channel closed")]
    ChannelClosed,

    /// The stream carrying this context is gone
    #[error("lost connection to context {context}")]
    LostConnection { context: String },

    /// A deadline expired while awaiting a reply
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Stream(#[from] StreamError),

    /// The child never completed the bootstrap handshake
    #[error("bootstrap failed: {0}")]
    BootstrapFailed(String),

    /// A password prompt appeared but no password was configured
    #[error("a password was requested but none was configured")]
    PasswordRequired,

    /// A second password prompt appeared after one was sent
    #[error("the configured password was rejected")]
    PasswordIncorrect,

    /// The remote function raised
    #[error(transparent)]
    Call(#[from] CallError),

    /// A message arrived for a handle nobody listens on, or for a
    /// one-shot handle that already fired
    #[error("no such handle: {0}")]
    NoSuchHandle(u64),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// The router is shutting down and accepts no new work
    #[error("router is shut down")]
    Shutdown,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ContextError {
    pub fn lost(context: impl Into<String>) -> Self {
        ContextError::LostConnection {
            context: context.into(),
        }
    }

}

impl From<bincode::Error> for ContextError {
    fn from(e: bincode::Error) -> Self {
        ContextError::Serialization(e.to_string())
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, ContextError>;

/// Failure of a remote function, captured where it ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallError {
    /// Short classification, e.g. `"not_found"`, `"bad_argument"`, `"panic"`
    pub kind: String,
    /// Human-readable message
    pub message: String,
    /// Stack trace captured at the failure site (may be empty)
    pub trace: String,
}

impl CallError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: String::new(),
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = trace.into();
        self
    }

    pub fn not_found(function: &str) -> Self {
        Self::new("not_found", format!("no such function: {}", function))
    }

    pub fn bad_argument(message: impl Into<String>) -> Self {
        Self::new("bad_argument", message)
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "remote call failed: {}: {}", self.kind, self.message)?;
        if !self.trace.is_empty() {
            write!(f, "\n{}", self.trace)?;
        }
        Ok(())
    }
}

impl std::error::Error for CallError {}
