//! A peer process and the call surface onto it
//!
//! A [`Context`] names one remote process and owns the stream that
//! reaches it (for a proxied context, the stream to the intermediary).
//! Calls are request/reply pairs correlated by a fresh reply handle:
//!
//! 1. Allocate a reply handle.
//! 2. Register a one-shot handler for it that feeds a [`Latch`].
//! 3. Enqueue a [`CallRequest`] on [`CALL_FUNCTION`] with `reply_to` set.
//! 4. Block on the latch until the reply, the deadline or a disconnect.
//!
//! A call whose deadline expires disconnects the stream: the peer is
//! assumed wedged, and every other call on that stream fails with it.

use crate::error::{ContextError, Result};
use crate::latch::Latch;
use crate::protocol::{
    CallReply, CallRequest, ContextId, Handle, Message, ModuleReply, ModuleRequest, ModuleSource,
    CALL_FUNCTION, GET_MODULE, SHUTDOWN,
};
use crate::router::Router;
use crate::stream::Stream;
use crate::value::{Kwargs, Value};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A connected peer
pub struct Context {
    id: ContextId,
    name: String,
    router: Router,
    stream: Arc<Stream>,
    pid: Option<u32>,
    proxied: bool,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Context {
    pub(crate) fn new(
        router: Router,
        id: ContextId,
        name: &str,
        stream: Arc<Stream>,
        pid: Option<u32>,
        proxied: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.to_string(),
            router,
            stream,
            pid,
            proxied,
        })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Process id of the spawned transport, when known
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }

    /// Whether this context is reached through another child
    pub fn is_proxied(&self) -> bool {
        self.proxied
    }

    /// A proxied context is connected while its route survives; the
    /// intermediary withdraws it when the far stream breaks
    pub fn is_connected(&self) -> bool {
        self.stream.is_connected()
            && (!self.proxied || self.router.routes_through(self.id, &self.stream))
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ContextError::lost(self.name.clone()))
        }
    }

    /// Shut the router down when this context's stream disconnects
    ///
    /// Used by children: once the parent is gone there is nothing left to
    /// serve.
    pub fn finalize_on_disconnect(&self) {
        let broker = self.router.broker_handle();
        let name = self.name.clone();
        self.stream.on_disconnect(Box::new(move || {
            tracing::debug!(context = %name, "lost parent; shutting down");
            broker.stop();
        }));
    }

    /// Send a value to `handle` in this context without waiting
    pub fn send<T: Serialize>(&self, handle: Handle, payload: &T) -> Result<()> {
        let msg = Message::encode(self.id, self.router.id(), handle, payload)?;
        self.stream.enqueue(&msg)
    }

    /// Start a call and return without waiting for the reply
    pub fn call_async(
        &self,
        function: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<PendingCall> {
        self.ensure_connected()?;
        let handle = self.router.allocate_handle();
        let latch = Arc::new(Latch::new());
        let sink = Arc::clone(&latch);
        self.stream
            .add_handler(handle, false, Arc::new(move |msg| sink.put(msg)))?;

        let request = CallRequest {
            function: function.to_string(),
            args,
            kwargs,
        };
        let sent = Message::encode(self.id, self.router.id(), CALL_FUNCTION, &request)
            .map(|msg| msg.with_reply_to(handle))
            .and_then(|msg| self.stream.enqueue(&msg));
        if let Err(err) = sent {
            self.stream.remove_handler(handle);
            return Err(err);
        }

        tracing::trace!(context = %self.name, function, handle, "call sent");
        Ok(PendingCall {
            context: self.name.clone(),
            function: function.to_string(),
            stream: Arc::clone(&self.stream),
            handle,
            latch,
        })
    }

    /// Call with the router's default deadline
    pub fn call(&self, function: &str, args: Vec<Value>) -> Result<Value> {
        self.call_with(
            function,
            args,
            Kwargs::new(),
            self.router.config().call_timeout,
        )
    }

    /// Call with keyword arguments and an explicit deadline
    ///
    /// `None` waits until the reply arrives or the stream disconnects.
    pub fn call_with(
        &self,
        function: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.call_async(function, args, kwargs)?.wait(timeout)
    }

    /// Fetch a module's source from this context's provider
    pub fn get_module(&self, fullname: &str, timeout: Option<Duration>) -> Result<Option<ModuleSource>> {
        self.ensure_connected()?;
        let handle = self.router.allocate_handle();
        let latch = Arc::new(Latch::new());
        let sink = Arc::clone(&latch);
        self.stream
            .add_handler(handle, false, Arc::new(move |msg| sink.put(msg)))?;

        let request = ModuleRequest {
            fullname: fullname.to_string(),
        };
        let sent = Message::encode(self.id, self.router.id(), GET_MODULE, &request)
            .map(|msg| msg.with_reply_to(handle))
            .and_then(|msg| self.stream.enqueue(&msg));
        if let Err(err) = sent {
            self.stream.remove_handler(handle);
            return Err(err);
        }

        let reply = match latch.get(timeout) {
            Ok(reply) => reply,
            Err(err) => {
                self.stream.remove_handler(handle);
                return Err(err);
            }
        };
        if reply.is_dead() {
            return Err(ContextError::lost(self.name.clone()));
        }
        Ok(reply.decode::<ModuleReply>()?.module)
    }

    /// Ask the peer to exit; its stream closes once it has
    pub fn shutdown(&self) -> Result<()> {
        let msg = Message::new(self.id, self.router.id(), SHUTDOWN, Vec::new());
        self.stream.enqueue(&msg)
    }

    /// Tear down the connection
    ///
    /// A proxied context shares its stream with the intermediary, so it
    /// is asked to shut down instead.
    pub fn disconnect(&self) {
        if self.proxied {
            if let Err(err) = self.shutdown() {
                tracing::debug!(context = %self.name, error = %err, "shutdown request failed");
            }
            return;
        }
        self.stream.disconnect();
    }
}

/// A call awaiting its reply
#[derive(Debug)]
pub struct PendingCall {
    context: String,
    function: String,
    stream: Arc<Stream>,
    handle: Handle,
    latch: Arc<Latch<Message>>,
}

impl PendingCall {
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Whether the reply (or a disconnect) has arrived
    pub fn is_ready(&self) -> bool {
        !self.latch.is_empty()
    }

    /// Block until the reply arrives
    ///
    /// Fails with [`ContextError::Timeout`] after `timeout`, disconnecting
    /// the stream; with [`ContextError::LostConnection`] if the stream
    /// goes first; with [`ContextError::Call`] if the function failed.
    pub fn wait(self, timeout: Option<Duration>) -> Result<Value> {
        let msg = match self.latch.get(timeout) {
            Ok(msg) => msg,
            Err(ContextError::Timeout(after)) => {
                tracing::warn!(
                    context = %self.context,
                    function = %self.function,
                    ?after,
                    "call timed out; disconnecting"
                );
                self.stream.disconnect();
                return Err(ContextError::Timeout(after));
            }
            Err(err) => return Err(err),
        };

        if msg.is_dead() {
            return Err(ContextError::lost(self.context.clone()));
        }
        match msg.decode::<CallReply>()? {
            Ok(value) => Ok(value),
            Err(err) => Err(ContextError::Call(err)),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        // Already gone if the reply arrived
        self.stream.remove_handler(self.handle);
    }
}
