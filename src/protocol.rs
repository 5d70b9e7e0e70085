//! Tether message model
//!
//! A [`Message`] is the unit routed between contexts. Its `data` is an
//! opaque bincode payload whose type depends on the destination handle:
//!
//! | Handle             | Payload                              |
//! |--------------------|--------------------------------------|
//! | [`CALL_FUNCTION`]  | [`CallRequest`]                      |
//! | reply handles      | `Result<Value, CallError>`           |
//! | [`FORWARD_LOG`]    | [`LogRecord`]                        |
//! | [`ADD_ROUTE`]      | [`RouteUpdate`]                      |
//! | [`DEL_ROUTE`]      | [`RouteUpdate`]                      |
//! | [`SHUTDOWN`]       | empty                                |
//! | [`GET_MODULE`]     | [`ModuleRequest`] / [`ModuleReply`]  |
//! | channel handles    | [`Value`]                            |
//!
//! Framing of messages on the wire lives in [`crate::codec`].

use crate::error::{CallError, ContextError, Result};
use crate::value::{Kwargs, Value};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Identifies one process in the tree. The root is always [`ROOT_ID`].
pub type ContextId = u32;

/// Identifies one logical channel within a stream
pub type Handle = u64;

/// Context id of the process that owns the whole tree
pub const ROOT_ID: ContextId = 0;

/// Module fetch service, answered by a source provider
pub const GET_MODULE: Handle = 100;
/// Function invocation
pub const CALL_FUNCTION: Handle = 101;
/// Log records forwarded from a child to its parent
pub const FORWARD_LOG: Handle = 102;
/// Route announcements travelling upstream
pub const ADD_ROUTE: Handle = 103;
/// Ask a context to exit cleanly
pub const SHUTDOWN: Handle = 104;
/// Route withdrawals travelling upstream
pub const DEL_ROUTE: Handle = 105;

/// First dynamically allocated handle; everything below is well-known
pub const FIRST_DYNAMIC_HANDLE: Handle = 1000;

/// `reply_to` value meaning "no reply wanted"
pub const NO_REPLY: Handle = 0;

/// `reply_to` value marking a dead/closed sentinel
pub const IS_DEAD: Handle = u64::MAX;

/// A routed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub dst_id: ContextId,
    pub src_id: ContextId,
    pub handle: Handle,
    pub reply_to: Handle,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(dst_id: ContextId, src_id: ContextId, handle: Handle, data: Vec<u8>) -> Self {
        Self {
            dst_id,
            src_id,
            handle,
            reply_to: NO_REPLY,
            data,
        }
    }

    /// Build a message carrying a serialized payload
    pub fn encode<T: Serialize>(
        dst_id: ContextId,
        src_id: ContextId,
        handle: Handle,
        payload: &T,
    ) -> Result<Self> {
        Ok(Self::new(dst_id, src_id, handle, bincode::serialize(payload)?))
    }

    pub fn with_reply_to(mut self, reply_to: Handle) -> Self {
        self.reply_to = reply_to;
        self
    }

    /// The "peer gone" sentinel delivered to a handle
    pub fn dead(dst_id: ContextId, src_id: ContextId, handle: Handle) -> Self {
        Self {
            dst_id,
            src_id,
            handle,
            reply_to: IS_DEAD,
            data: Vec::new(),
        }
    }

    pub fn is_dead(&self) -> bool {
        self.reply_to == IS_DEAD
    }

    pub fn wants_reply(&self) -> bool {
        self.reply_to != NO_REPLY && self.reply_to != IS_DEAD
    }

    /// Deserialize the payload
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        if self.is_dead() {
            return Err(ContextError::ChannelClosed);
        }
        bincode::deserialize(&self.data).map_err(ContextError::from)
    }

    /// Build the reply to this message, addressed back to its sender
    pub fn reply<T: Serialize>(&self, src_id: ContextId, payload: &T) -> Result<Message> {
        Message::encode(self.src_id, src_id, self.reply_to, payload)
    }

    /// Build a dead reply to this message
    pub fn dead_reply(&self, src_id: ContextId) -> Message {
        Message::dead(self.src_id, src_id, self.reply_to)
    }
}

/// Payload of a [`CALL_FUNCTION`] message. The reply handle travels in
/// the message's `reply_to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    /// Registered function name, e.g. `"core.getpid"`
    pub function: String,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
}

/// Payload of a reply to a [`CallRequest`]
pub type CallReply = std::result::Result<Value, CallError>;

/// A log event forwarded from a child
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// 0=error, 1=warn, 2=info, 3=debug, 4=trace
    pub level: u8,
    pub target: String,
    pub message: String,
}

/// Announces that `context_id` is (or is no longer) reachable through
/// the sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteUpdate {
    pub context_id: ContextId,
    pub name: String,
}

/// Request on [`GET_MODULE`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRequest {
    pub fullname: String,
}

/// Reply on [`GET_MODULE`]; `None` when the module is unknown
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleReply {
    pub module: Option<ModuleSource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSource {
    pub path: String,
    pub source: Vec<u8>,
    pub is_package: bool,
}
