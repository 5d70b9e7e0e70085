//! Message routing between contexts
//!
//! Each process owns exactly one [`Router`]. The router owns the broker,
//! the route table (`context id -> stream`) and the handlers for the
//! well-known handles. Every decoded frame passes through
//! [`RouterCore::dispatch`] on the broker thread:
//!
//! 1. Frames whose `src_id` is routed through a different stream than
//!    the one they arrived on are dropped.
//! 2. Frames for the local context go to the arrival stream's handle
//!    map, then to the router's global handlers.
//! 3. Everything else is forwarded along the route table, or upstream
//!    towards the root when no route is known.
//!
//! A frame that cannot be delivered is logged, and if its sender asked
//! for a reply it receives a dead reply instead of waiting forever. The
//! same holds for requests already forwarded onto a stream that breaks:
//! the router remembers which replies each outgoing stream still owes
//! and answers them dead when it goes, then withdraws the lost routes
//! upstream with [`DEL_ROUTE`].

use crate::bootstrap::{self, ProcessSpawner, Spawner};
use crate::broker::{Broker, BrokerHandle};
use crate::codec::Codec;
use crate::config::{ConnectOptions, RouterConfig};
use crate::context::Context;
use crate::error::{ContextError, Result};
use crate::latch::lock;
use crate::logging;
use crate::protocol::{
    ContextId, Handle, LogRecord, Message, RouteUpdate, ADD_ROUTE, DEL_ROUTE,
    FIRST_DYNAMIC_HANDLE, FORWARD_LOG, ROOT_ID, SHUTDOWN,
};
use crate::side::Side;
use crate::stream::{Callback, Dispatch, Stream, StreamId};
use crate::value::{Kwargs, Value};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How long children get to exit on their own once their stream closes
const CHILD_EXIT_GRACE: Duration = Duration::from_secs(2);

/// How long children get after SIGTERM before SIGKILL
const CHILD_TERM_GRACE: Duration = Duration::from_millis(500);

/// Extra time a proxied connect waits beyond the child's own deadline
const PROXY_CONNECT_SLACK: Duration = Duration::from_secs(5);

/// A spawned child process awaiting reaping
#[derive(Debug)]
struct ChildProcess {
    pid: Pid,
    name: String,
}

impl ChildProcess {
    /// Check whether the child has exited, reaping it if so
    fn try_reap(&self) -> bool {
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => false,
            Ok(status) => {
                tracing::debug!(context = %self.name, ?status, "child exited");
                true
            }
            // ECHILD: already reaped or never ours
            Err(_) => true,
        }
    }
}

/// Request carried by `core.connect` when a parent asks this process to
/// spawn a grandchild on its behalf
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConnect {
    pub context_id: ContextId,
    pub name: String,
    pub method: crate::transport::Method,
    pub program: Option<String>,
    pub connect_timeout_ms: Option<u64>,
    pub key_hex: Option<String>,
    pub password: Option<String>,
}

/// Shared routing state; the broker's dispatch target
pub(crate) struct RouterCore {
    my_id: ContextId,
    name: String,
    parent_id: Option<ContextId>,
    config: RouterConfig,
    broker: BrokerHandle,
    handlers: Mutex<HashMap<Handle, Callback>>,
    routes: Mutex<HashMap<ContextId, Arc<Stream>>>,
    names: Mutex<HashMap<ContextId, String>>,
    upstream: Mutex<Option<Arc<Stream>>>,
    /// Replies owed by each outgoing stream: `(requester, reply handle)`
    in_flight: Mutex<HashMap<StreamId, HashSet<(ContextId, Handle)>>>,
    next_handle: AtomicU64,
    next_context_id: AtomicU32,
    children: Mutex<Vec<ChildProcess>>,
}

impl RouterCore {
    fn stream_for(&self, id: ContextId) -> Option<Arc<Stream>> {
        if let Some(stream) = lock(&self.routes).get(&id) {
            return Some(Arc::clone(stream));
        }
        lock(&self.upstream).clone()
    }

    fn is_upstream(&self, stream: &Arc<Stream>) -> bool {
        self.is_upstream_id(stream.id())
    }

    fn is_upstream_id(&self, stream_id: StreamId) -> bool {
        lock(&self.upstream)
            .as_ref()
            .is_some_and(|up| up.id() == stream_id)
    }

    fn routes_through(&self, id: ContextId, stream: &Arc<Stream>) -> bool {
        lock(&self.routes)
            .get(&id)
            .is_some_and(|routed| Arc::ptr_eq(routed, stream))
    }

    fn context_name(&self, id: ContextId) -> String {
        lock(&self.names)
            .get(&id)
            .cloned()
            .unwrap_or_else(|| format!("context-{}", id))
    }

    /// Whether `msg` claims a source it could not have come from
    fn is_spoofed(&self, stream: &Arc<Stream>, msg: &Message) -> bool {
        if msg.src_id == self.my_id {
            return true;
        }
        let expected = lock(&self.routes).get(&msg.src_id).cloned();
        match expected {
            Some(expected) => !Arc::ptr_eq(&expected, stream),
            None => !self.is_upstream(stream),
        }
    }

    fn add_route(&self, id: ContextId, stream: &Arc<Stream>, name: &str) {
        tracing::debug!(router = %self.name, context = id, via = stream.name(), "adding route");
        lock(&self.routes).insert(id, Arc::clone(stream));
        lock(&self.names).insert(id, name.to_string());
    }

    /// Drop every route through a stream that went away, fail the
    /// requests it still owed replies for, and withdraw the routes
    /// upstream
    fn forget_stream(&self, stream_id: StreamId) {
        let mut removed = Vec::new();
        lock(&self.routes).retain(|id, stream| {
            let keep = stream.id() != stream_id;
            if !keep {
                removed.push(*id);
            }
            keep
        });
        if !removed.is_empty() {
            tracing::debug!(router = %self.name, contexts = ?removed, "routes removed");
        }

        let owed = lock(&self.in_flight).remove(&stream_id).unwrap_or_default();
        for (requester, reply_to) in owed {
            tracing::debug!(dst = requester, handle = reply_to, "failing forwarded request");
            if let Err(err) = self.route(Message::dead(requester, self.my_id, reply_to)) {
                tracing::debug!(error = %err, "could not return dead reply");
            }
        }

        if self.is_upstream_id(stream_id) {
            return;
        }
        for context_id in removed {
            self.notify_upstream(
                DEL_ROUTE,
                &RouteUpdate {
                    context_id,
                    name: self.context_name(context_id),
                },
            );
        }
    }

    /// Send a message towards its destination
    fn route(&self, msg: Message) -> Result<()> {
        if msg.dst_id == self.my_id {
            return self.deliver_global(msg);
        }
        let stream = self
            .stream_for(msg.dst_id)
            .ok_or_else(|| ContextError::lost(self.context_name(msg.dst_id)))?;
        stream.enqueue(&msg)
    }

    /// Tell the sender its request went nowhere
    fn reply_dead(&self, msg: &Message) {
        if !msg.wants_reply() {
            return;
        }
        if let Err(err) = self.route(msg.dead_reply(self.my_id)) {
            tracing::debug!(error = %err, "could not return dead reply");
        }
    }

    /// Run the global handler for `msg`
    ///
    /// A handle nobody listens on (including a one-shot handle that
    /// already fired) is [`ContextError::NoSuchHandle`]; the sender gets
    /// a dead reply if it asked for one.
    fn deliver_global(&self, msg: Message) -> Result<()> {
        let handler = lock(&self.handlers).get(&msg.handle).cloned();
        match handler {
            Some(handler) => {
                handler(msg);
                Ok(())
            }
            None if msg.is_dead() => {
                tracing::trace!(handle = msg.handle, "dropping dead message for unknown handle");
                Ok(())
            }
            None => {
                self.reply_dead(&msg);
                Err(ContextError::NoSuchHandle(msg.handle))
            }
        }
    }

    fn deliver_local(&self, stream: &Arc<Stream>, msg: Message) -> Result<()> {
        match msg.handle {
            ADD_ROUTE => self.on_add_route(stream, &msg),
            DEL_ROUTE => self.on_del_route(stream, &msg),
            FORWARD_LOG => self.on_forward_log(&msg),
            SHUTDOWN => self.on_shutdown_request(stream, &msg),
            _ => {
                return match stream.deliver(msg) {
                    Ok(()) => Ok(()),
                    Err(msg) => self.deliver_global(msg),
                };
            }
        }
        Ok(())
    }

    fn forward(&self, stream: &Arc<Stream>, msg: Message) {
        // A reply coming back settles what its stream owed
        if let Some(owed) = lock(&self.in_flight).get_mut(&stream.id()) {
            owed.remove(&(msg.dst_id, msg.handle));
        }

        match self.stream_for(msg.dst_id) {
            Some(out) if !Arc::ptr_eq(&out, stream) => {
                let owed = msg.wants_reply().then_some((msg.src_id, msg.reply_to));
                if let Some(entry) = owed {
                    lock(&self.in_flight).entry(out.id()).or_default().insert(entry);
                }
                if let Err(err) = out.enqueue(&msg) {
                    tracing::debug!(dst = msg.dst_id, error = %err, "forwarding failed");
                    if let Some(entry) = owed {
                        if let Some(pending) = lock(&self.in_flight).get_mut(&out.id()) {
                            pending.remove(&entry);
                        }
                    }
                    self.reply_dead(&msg);
                }
            }
            _ => {
                tracing::warn!(
                    router = %self.name,
                    dst = msg.dst_id,
                    src = msg.src_id,
                    handle = msg.handle,
                    "no route to context"
                );
                self.reply_dead(&msg);
            }
        }
    }

    fn on_add_route(&self, stream: &Arc<Stream>, msg: &Message) {
        let update: RouteUpdate = match msg.decode() {
            Ok(update) => update,
            Err(err) => {
                tracing::warn!(error = %err, "malformed route update");
                return;
            }
        };
        self.add_route(update.context_id, stream, &update.name);
        self.notify_upstream(ADD_ROUTE, &update);
    }

    fn on_del_route(&self, stream: &Arc<Stream>, msg: &Message) {
        let update: RouteUpdate = match msg.decode() {
            Ok(update) => update,
            Err(err) => {
                tracing::warn!(error = %err, "malformed route update");
                return;
            }
        };
        // Only the stream a route goes through may withdraw it
        if !self.routes_through(update.context_id, stream) {
            return;
        }
        lock(&self.routes).remove(&update.context_id);
        tracing::debug!(router = %self.name, context = update.context_id, "route withdrawn");
        self.notify_upstream(DEL_ROUTE, &update);
    }

    /// Propagate a route change towards the root
    fn notify_upstream(&self, handle: Handle, update: &RouteUpdate) {
        let Some(parent_id) = self.parent_id else {
            return;
        };
        let result = Message::encode(parent_id, self.my_id, handle, update)
            .and_then(|msg| self.route(msg));
        if let Err(err) = result {
            tracing::debug!(error = %err, "could not propagate route");
        }
    }

    fn on_forward_log(&self, msg: &Message) {
        match msg.decode::<LogRecord>() {
            Ok(record) => logging::emit_remote(&self.context_name(msg.src_id), &record),
            Err(err) => tracing::debug!(error = %err, "malformed log record"),
        }
    }

    fn on_shutdown_request(&self, stream: &Arc<Stream>, msg: &Message) {
        if !self.is_upstream(stream) {
            tracing::warn!(src = msg.src_id, "ignoring shutdown request from a child");
            return;
        }
        tracing::info!(router = %self.name, "shutdown requested by parent");
        self.broker.stop();
    }

    fn reap_children(&self) {
        let mut remaining = std::mem::take(&mut *lock(&self.children));
        if remaining.is_empty() {
            return;
        }

        // Children exit by themselves once their parent stream closes
        let deadline = Instant::now() + CHILD_EXIT_GRACE;
        while !remaining.is_empty() && Instant::now() < deadline {
            remaining.retain(|child| !child.try_reap());
            std::thread::sleep(Duration::from_millis(20));
        }

        for child in &remaining {
            tracing::debug!(context = %child.name, pid = child.pid.as_raw(), "sending SIGTERM");
            let _ = kill(child.pid, Signal::SIGTERM);
        }
        let deadline = Instant::now() + CHILD_TERM_GRACE;
        while !remaining.is_empty() && Instant::now() < deadline {
            remaining.retain(|child| !child.try_reap());
            std::thread::sleep(Duration::from_millis(20));
        }

        // Force kill any remaining children
        for child in &remaining {
            tracing::warn!(context = %child.name, pid = child.pid.as_raw(), "killing child");
            let _ = kill(child.pid, Signal::SIGKILL);
            let _ = waitpid(child.pid, None);
        }
    }
}

impl Dispatch for RouterCore {
    fn dispatch(&self, stream: &Arc<Stream>, msg: Message) {
        if self.is_spoofed(stream, &msg) {
            tracing::warn!(
                router = %self.name,
                stream = stream.name(),
                src = msg.src_id,
                "dropping message with spoofed source"
            );
            return;
        }

        if msg.dst_id == self.my_id {
            let (handle, src) = (msg.handle, msg.src_id);
            if let Err(err) = self.deliver_local(stream, msg) {
                tracing::warn!(router = %self.name, handle, src, error = %err, "undeliverable message");
            }
        } else {
            self.forward(stream, msg);
        }
    }

    fn on_shutdown(&self) {
        let handlers: Vec<(Handle, Callback)> = lock(&self.handlers).drain().collect();
        for (handle, handler) in handlers {
            handler(Message::dead(self.my_id, self.my_id, handle));
        }
        lock(&self.routes).clear();
        lock(&self.in_flight).clear();
        lock(&self.upstream).take();
    }
}

/// Entry point to the messaging engine for one process
///
/// Cheap to clone; all clones share one broker thread.
#[derive(Clone)]
pub struct Router {
    core: Arc<RouterCore>,
    broker: Arc<Broker>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("id", &self.core.my_id)
            .field("name", &self.core.name)
            .finish()
    }
}

impl Router {
    /// Root router configured from ~/.tetherrc and the environment
    pub fn new() -> Result<Self> {
        Self::with_config(RouterConfig::load())
    }

    /// Root router with explicit settings
    pub fn with_config(config: RouterConfig) -> Result<Self> {
        Self::build(ROOT_ID, "master".to_string(), None, config)
    }

    fn build(
        my_id: ContextId,
        name: String,
        parent_id: Option<ContextId>,
        config: RouterConfig,
    ) -> Result<Self> {
        let broker = Broker::new()?;
        let core = Arc::new(RouterCore {
            my_id,
            name,
            parent_id,
            config,
            broker: broker.handle(),
            handlers: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
            names: Mutex::new(HashMap::new()),
            upstream: Mutex::new(None),
            in_flight: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(FIRST_DYNAMIC_HANDLE),
            next_context_id: AtomicU32::new(ROOT_ID + 1),
            children: Mutex::new(Vec::new()),
        });
        broker.start(Arc::clone(&core) as Arc<dyn Dispatch>)?;
        tracing::debug!(id = my_id, "router started");
        Ok(Self {
            core,
            broker: Arc::new(broker),
        })
    }

    /// Router for a child process
    ///
    /// Nothing is read from the parent until
    /// [`attach_upstream`](Self::attach_upstream), so handlers installed
    /// in between see every request.
    pub(crate) fn for_child(
        my_id: ContextId,
        name: String,
        parent_id: ContextId,
        config: RouterConfig,
    ) -> Result<Self> {
        Self::build(my_id, name, Some(parent_id), config)
    }

    /// Start talking to the parent over the bootstrap channel
    ///
    /// The router shuts down once the parent's stream disconnects.
    pub(crate) fn attach_upstream(
        &self,
        codec: Codec,
        receive: Side,
        transmit: Side,
    ) -> Result<Arc<Context>> {
        let parent_id = self
            .core
            .parent_id
            .ok_or_else(|| ContextError::lost("parent"))?;
        let stream = Stream::new(
            "parent",
            self.core.my_id,
            parent_id,
            codec,
            receive,
            transmit,
            self.broker_handle(),
            Vec::new(),
        );
        *lock(&self.core.upstream) = Some(Arc::clone(&stream));
        self.attach(&stream, parent_id, "parent")?;

        let parent = Context::new(self.clone(), parent_id, "parent", stream, None, false);
        parent.finalize_on_disconnect();
        Ok(parent)
    }

    pub fn id(&self) -> ContextId {
        self.core.my_id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn config(&self) -> &RouterConfig {
        &self.core.config
    }

    pub fn parent_id(&self) -> Option<ContextId> {
        self.core.parent_id
    }

    pub(crate) fn broker_handle(&self) -> BrokerHandle {
        self.broker.handle()
    }

    pub fn is_alive(&self) -> bool {
        self.broker.handle().is_alive()
    }

    /// Fresh handle, never reused within this process
    pub fn allocate_handle(&self) -> Handle {
        self.core.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Fresh context id; non-root routers ask upstream
    pub fn allocate_id(&self) -> Result<ContextId> {
        if self.core.my_id == ROOT_ID {
            return Ok(self.core.next_context_id.fetch_add(1, Ordering::Relaxed));
        }
        let parent = self.parent()?;
        let id = parent.call("core.allocate_id", Vec::new())?;
        id.as_int()
            .and_then(|id| ContextId::try_from(id).ok())
            .ok_or_else(|| ContextError::Serialization(format!("bad context id: {}", id)))
    }

    /// Context for the upstream stream
    fn parent(&self) -> Result<Arc<Context>> {
        let parent_id = self
            .core
            .parent_id
            .ok_or_else(|| ContextError::lost("parent"))?;
        let stream = lock(&self.core.upstream)
            .clone()
            .ok_or_else(|| ContextError::lost("parent"))?;
        Ok(Context::new(self.clone(), parent_id, "parent", stream, None, false))
    }

    /// Register a handler for messages addressed to this process on
    /// `handle` that no stream-level handler claimed
    ///
    /// Runs on the broker thread; it must not block.
    pub fn add_handler(&self, handle: Handle, callback: Callback) {
        lock(&self.core.handlers).insert(handle, callback);
    }

    pub fn remove_handler(&self, handle: Handle) -> bool {
        lock(&self.core.handlers).remove(&handle).is_some()
    }

    /// Send a message towards its destination
    pub fn route(&self, msg: Message) -> Result<()> {
        self.core.route(msg)
    }

    /// Install a route and start polling `stream`
    pub(crate) fn attach(&self, stream: &Arc<Stream>, id: ContextId, name: &str) -> Result<()> {
        self.core.add_route(id, stream, name);
        let core = Arc::downgrade(&self.core);
        let stream_id = stream.id();
        stream.on_disconnect(Box::new(move || {
            if let Some(core) = core.upgrade() {
                core.forget_stream(stream_id);
            }
        }));
        if !self.broker.handle().register(Arc::clone(stream)) {
            stream.disconnect();
            return Err(ContextError::Shutdown);
        }
        Ok(())
    }

    /// Whether messages for `id` currently travel over `stream`
    pub fn routes_through(&self, id: ContextId, stream: &Arc<Stream>) -> bool {
        self.core.routes_through(id, stream)
    }

    /// Add a route to `id` through an existing stream
    pub fn add_route(&self, id: ContextId, via: &Context, name: &str) {
        self.core.add_route(id, via.stream(), name);
    }

    /// Spawn a child on this machine
    pub fn local(&self) -> Result<Arc<Context>> {
        self.connect(ConnectOptions::local("local"))
    }

    /// Spawn and bootstrap a child using the given transport
    pub fn connect(&self, options: ConnectOptions) -> Result<Arc<Context>> {
        self.connect_with_spawner(options, &ProcessSpawner)
    }

    /// Like [`connect`](Self::connect), with a custom process spawner
    pub fn connect_with_spawner(
        &self,
        options: ConnectOptions,
        spawner: &dyn Spawner,
    ) -> Result<Arc<Context>> {
        let id = self.allocate_id()?;
        self.connect_as(id, options, spawner)
    }

    pub(crate) fn connect_as(
        &self,
        id: ContextId,
        options: ConnectOptions,
        spawner: &dyn Spawner,
    ) -> Result<Arc<Context>> {
        if !self.is_alive() {
            return Err(ContextError::Shutdown);
        }
        let child = bootstrap::connect(self, id, &options, spawner)?;

        if let Some(pid) = child.pid {
            lock(&self.core.children).push(ChildProcess {
                pid: Pid::from_raw(pid as i32),
                name: options.name.clone(),
            });
        }
        self.attach(&child.stream, id, &options.name)?;
        self.core.notify_upstream(
            ADD_ROUTE,
            &RouteUpdate {
                context_id: id,
                name: options.name.clone(),
            },
        );

        tracing::info!(context = %options.name, id, pid = ?child.pid, "connected");
        Ok(Context::new(
            self.clone(),
            id,
            &options.name,
            child.stream,
            child.pid,
            false,
        ))
    }

    /// Ask `via` to spawn a child of its own, reachable from here
    pub fn connect_via(&self, via: &Context, options: ConnectOptions) -> Result<Arc<Context>> {
        let id = self.allocate_id()?;
        let timeout = options
            .connect_timeout
            .unwrap_or(self.core.config.connect_timeout);
        let request = ProxyConnect {
            context_id: id,
            name: options.name.clone(),
            method: options.method.clone(),
            program: options.program.as_ref().map(|p| p.display().to_string()),
            connect_timeout_ms: Some(bootstrap::saturating_millis(timeout)),
            key_hex: options.key.as_ref().map(|k| k.to_hex()),
            password: options.password.clone(),
        };
        // JSON, since the tagged `Method` enum does not survive bincode
        let payload = serde_json::to_string(&request)
            .map_err(|e| ContextError::Serialization(e.to_string()))?;

        let pid = via.call_with(
            "core.connect",
            vec![Value::Str(payload)],
            Kwargs::new(),
            Some(timeout.saturating_add(PROXY_CONNECT_SLACK)),
        )?;

        self.core.add_route(id, via.stream(), &options.name);
        self.core.notify_upstream(
            ADD_ROUTE,
            &RouteUpdate {
                context_id: id,
                name: options.name.clone(),
            },
        );

        tracing::info!(context = %options.name, id, via = via.name(), "connected via proxy");
        Ok(Context::new(
            self.clone(),
            id,
            &options.name,
            Arc::clone(via.stream()),
            pid.as_int().map(|pid| pid as u32),
            true,
        ))
    }

    /// Stop the broker; every stream disconnects
    pub fn shutdown(&self) {
        tracing::debug!(router = %self.core.name, "shutting down");
        self.broker.shutdown();
    }

    /// Wait for the broker thread, then reap child processes
    pub fn join(&self) {
        self.broker.join();
        self.core.reap_children();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::AuthKey;
    use crate::latch::Latch;
    use std::io::{Read, Write};
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;

    /// Attach a fake peer with id `peer_id` and return its socket end
    fn fake_peer(router: &Router, peer_id: ContextId, codec: &Codec) -> (Arc<Stream>, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let ours = OwnedFd::from(ours);
        let transmit = Side::new("tx", ours.try_clone().unwrap()).unwrap();
        let receive = Side::new("rx", ours).unwrap();
        let stream = Stream::new(
            format!("peer-{}", peer_id),
            router.id(),
            peer_id,
            codec.clone(),
            receive,
            transmit,
            router.broker_handle(),
            Vec::new(),
        );
        router.attach(&stream, peer_id, &format!("peer-{}", peer_id)).unwrap();
        (stream, theirs)
    }

    fn read_message(peer: &mut UnixStream, codec: &Codec) -> Message {
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            if let Some((msg, _)) = codec.decode(&buf).unwrap() {
                return msg;
            }
            let n = peer.read(&mut chunk).unwrap();
            assert!(n > 0, "peer closed");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[test]
    fn test_handles_are_monotonic() {
        let router = Router::with_config(RouterConfig::default()).unwrap();
        let a = router.allocate_handle();
        let b = router.allocate_handle();
        assert!(a >= FIRST_DYNAMIC_HANDLE);
        assert!(b > a);
        assert_eq!(router.allocate_id().unwrap(), 1);
        assert_eq!(router.allocate_id().unwrap(), 2);
        router.shutdown();
        router.join();
    }

    #[test]
    fn test_global_handler_receives_local_messages() {
        let router = Router::with_config(RouterConfig::default()).unwrap();
        let codec = Codec::new(AuthKey::generate());
        let (_stream, mut peer) = fake_peer(&router, 1, &codec);

        let latch = Arc::new(Latch::new());
        let sink = Arc::clone(&latch);
        router.add_handler(5000, Arc::new(move |msg| sink.put(msg)));

        let msg = Message::new(ROOT_ID, 1, 5000, b"hi".to_vec());
        peer.write_all(&codec.encode(&msg).unwrap()).unwrap();
        assert_eq!(latch.get(Some(Duration::from_secs(5))).unwrap(), msg);

        router.shutdown();
        router.join();
    }

    #[test]
    fn test_unknown_handle_gets_dead_reply() {
        let router = Router::with_config(RouterConfig::default()).unwrap();
        let codec = Codec::unauthenticated();
        let (_stream, mut peer) = fake_peer(&router, 1, &codec);

        let msg = Message::new(ROOT_ID, 1, 7777, Vec::new()).with_reply_to(2000);
        peer.write_all(&codec.encode(&msg).unwrap()).unwrap();

        let reply = read_message(&mut peer, &codec);
        assert!(reply.is_dead());
        assert_eq!(reply.dst_id, 1);
        assert_eq!(reply.handle, 2000);

        router.shutdown();
        router.join();
    }

    #[test]
    fn test_forwarding_between_peers() {
        let router = Router::with_config(RouterConfig::default()).unwrap();
        let codec_a = Codec::new(AuthKey::generate());
        let codec_b = Codec::new(AuthKey::generate());
        let (_a, mut peer_a) = fake_peer(&router, 1, &codec_a);
        let (_b, mut peer_b) = fake_peer(&router, 2, &codec_b);

        let msg = Message::new(2, 1, 4242, b"across".to_vec());
        peer_a.write_all(&codec_a.encode(&msg).unwrap()).unwrap();

        // Re-authenticated with the outgoing stream's key
        assert_eq!(read_message(&mut peer_b, &codec_b), msg);

        router.shutdown();
        router.join();
    }

    #[test]
    fn test_spoofed_source_is_dropped() {
        let router = Router::with_config(RouterConfig::default()).unwrap();
        let codec = Codec::unauthenticated();
        let (_a, mut peer_a) = fake_peer(&router, 1, &codec);
        let (_b, _peer_b) = fake_peer(&router, 2, &codec);

        let latch = Arc::new(Latch::new());
        let sink = Arc::clone(&latch);
        router.add_handler(5000, Arc::new(move |msg| sink.put(msg)));

        // Peer 1 pretends to be peer 2, then speaks honestly
        let spoofed = Message::new(ROOT_ID, 2, 5000, b"forged".to_vec());
        let honest = Message::new(ROOT_ID, 1, 5000, b"real".to_vec());
        peer_a.write_all(&codec.encode(&spoofed).unwrap()).unwrap();
        peer_a.write_all(&codec.encode(&honest).unwrap()).unwrap();

        assert_eq!(latch.get(Some(Duration::from_secs(5))).unwrap(), honest);
        assert!(latch.is_empty());

        router.shutdown();
        router.join();
    }

    #[test]
    fn test_add_route_message() {
        let router = Router::with_config(RouterConfig::default()).unwrap();
        let codec = Codec::unauthenticated();
        let (_a, mut peer_a) = fake_peer(&router, 1, &codec);

        let update = RouteUpdate {
            context_id: 9,
            name: "grandchild".to_string(),
        };
        let msg = Message::encode(ROOT_ID, 1, ADD_ROUTE, &update).unwrap();
        peer_a.write_all(&codec.encode(&msg).unwrap()).unwrap();

        // Wait until the route is visible, then send through it
        let deadline = Instant::now() + Duration::from_secs(5);
        while !lock(&router.core.routes).contains_key(&9) {
            assert!(Instant::now() < deadline, "route never installed");
            std::thread::sleep(Duration::from_millis(10));
        }
        router
            .route(Message::new(9, ROOT_ID, 3000, b"down".to_vec()))
            .unwrap();
        let got = read_message(&mut peer_a, &codec);
        assert_eq!(got.dst_id, 9);
        assert_eq!(got.data, b"down");

        router.shutdown();
        router.join();
    }

    #[test]
    fn test_routes_removed_on_disconnect() {
        let router = Router::with_config(RouterConfig::default()).unwrap();
        let (stream, _peer) = fake_peer(&router, 1, &Codec::unauthenticated());
        assert!(lock(&router.core.routes).contains_key(&1));

        stream.disconnect();
        assert!(!lock(&router.core.routes).contains_key(&1));
        assert!(matches!(
            router.route(Message::new(1, ROOT_ID, 3000, Vec::new())),
            Err(ContextError::LostConnection { .. })
        ));

        router.shutdown();
        router.join();
    }

    #[test]
    fn test_one_shot_handle_fires_once() {
        let router = Router::with_config(RouterConfig::default()).unwrap();
        let (stream, _peer) = fake_peer(&router, 1, &Codec::unauthenticated());

        let latch = Arc::new(Latch::new());
        let sink = Arc::clone(&latch);
        stream
            .add_handler(3000, false, Arc::new(move |msg| sink.put(msg)))
            .unwrap();

        let msg = Message::new(ROOT_ID, 1, 3000, b"once".to_vec());
        assert!(router.core.deliver_local(&stream, msg.clone()).is_ok());
        assert!(matches!(
            router.core.deliver_local(&stream, msg),
            Err(ContextError::NoSuchHandle(3000))
        ));
        assert_eq!(latch.len(), 1);
        assert!(matches!(
            router.route(Message::new(ROOT_ID, ROOT_ID, 7777, Vec::new())),
            Err(ContextError::NoSuchHandle(7777))
        ));

        router.shutdown();
        router.join();
    }

    #[test]
    fn test_forwarded_request_fails_when_target_goes() {
        let router = Router::with_config(RouterConfig::default()).unwrap();
        let codec = Codec::unauthenticated();
        let (_a, mut peer_a) = fake_peer(&router, 1, &codec);
        let (_b, mut peer_b) = fake_peer(&router, 2, &codec);

        let answered = Message::new(2, 1, 4242, b"first".to_vec()).with_reply_to(2001);
        let stranded = Message::new(2, 1, 4242, b"second".to_vec()).with_reply_to(2000);
        peer_a.write_all(&codec.encode(&answered).unwrap()).unwrap();
        assert_eq!(read_message(&mut peer_b, &codec), answered);
        let reply = answered.reply(2, &"done").unwrap();
        peer_b.write_all(&codec.encode(&reply).unwrap()).unwrap();
        assert_eq!(read_message(&mut peer_a, &codec), reply);

        peer_a.write_all(&codec.encode(&stranded).unwrap()).unwrap();
        assert_eq!(read_message(&mut peer_b, &codec), stranded);
        drop(peer_b);

        let dead = read_message(&mut peer_a, &codec);
        assert!(dead.is_dead());
        assert_eq!(dead.dst_id, 1);
        assert_eq!(dead.handle, 2000);

        router.shutdown();
        router.join();
    }

    #[test]
    fn test_lost_descendant_is_withdrawn_upstream() {
        let mid = Router::for_child(5, "mid".to_string(), ROOT_ID, RouterConfig::default()).unwrap();
        let codec = Codec::unauthenticated();
        let (ours, mut parent) = UnixStream::pair().unwrap();
        let ours = OwnedFd::from(ours);
        mid.attach_upstream(
            codec.clone(),
            Side::new("rx", ours.try_clone().unwrap()).unwrap(),
            Side::new("tx", ours).unwrap(),
        )
        .unwrap();

        let (_stream, descendant) = fake_peer(&mid, 9, &codec);
        drop(descendant);

        let msg = read_message(&mut parent, &codec);
        assert_eq!(msg.handle, DEL_ROUTE);
        assert_eq!((msg.dst_id, msg.src_id), (ROOT_ID, 5));
        assert_eq!(msg.decode::<RouteUpdate>().unwrap().context_id, 9);
        assert!(!lock(&mid.core.routes).contains_key(&9));

        mid.shutdown();
        mid.join();
    }

    #[test]
    fn test_route_withdrawn_only_by_its_stream() {
        let router = Router::with_config(RouterConfig::default()).unwrap();
        let codec = Codec::unauthenticated();
        let (_a, mut peer_a) = fake_peer(&router, 1, &codec);
        let (_b, mut peer_b) = fake_peer(&router, 2, &codec);

        let marker = Arc::new(Latch::new());
        let sink = Arc::clone(&marker);
        router.add_handler(5000, Arc::new(move |msg| sink.put(msg)));

        let update = RouteUpdate {
            context_id: 9,
            name: "grandchild".to_string(),
        };
        let add = Message::encode(ROOT_ID, 1, ADD_ROUTE, &update).unwrap();
        peer_a.write_all(&codec.encode(&add).unwrap()).unwrap();
        peer_a
            .write_all(&codec.encode(&Message::new(ROOT_ID, 1, 5000, Vec::new())).unwrap())
            .unwrap();
        marker.get(Some(Duration::from_secs(5))).unwrap();
        assert!(lock(&router.core.routes).contains_key(&9));

        // Peer 2 does not carry context 9
        let foreign = Message::encode(ROOT_ID, 2, DEL_ROUTE, &update).unwrap();
        peer_b.write_all(&codec.encode(&foreign).unwrap()).unwrap();
        peer_b
            .write_all(&codec.encode(&Message::new(ROOT_ID, 2, 5000, Vec::new())).unwrap())
            .unwrap();
        marker.get(Some(Duration::from_secs(5))).unwrap();
        assert!(lock(&router.core.routes).contains_key(&9));

        let del = Message::encode(ROOT_ID, 1, DEL_ROUTE, &update).unwrap();
        peer_a.write_all(&codec.encode(&del).unwrap()).unwrap();
        peer_a
            .write_all(&codec.encode(&Message::new(ROOT_ID, 1, 5000, Vec::new())).unwrap())
            .unwrap();
        marker.get(Some(Duration::from_secs(5))).unwrap();
        assert!(!lock(&router.core.routes).contains_key(&9));

        router.shutdown();
        router.join();
    }

    #[test]
    fn test_shutdown_closes_global_handlers() {
        let router = Router::with_config(RouterConfig::default()).unwrap();
        let latch: Arc<Latch<Message>> = Arc::new(Latch::new());
        let sink = Arc::clone(&latch);
        router.add_handler(
            6000,
            Arc::new(move |msg| {
                if msg.is_dead() {
                    sink.close();
                }
            }),
        );
        router.shutdown();
        router.join();
        assert!(latch.is_closed());
        assert!(!router.is_alive());
        assert!(matches!(router.local(), Err(ContextError::Shutdown)));
    }
}
