//! Framed, multiplexed connection to one peer
//!
//! A [`Stream`] owns the two [`Side`]s of a transport, the inbound and
//! outbound byte buffers, and the handle map that routes decoded messages
//! to callbacks. Only the broker thread performs I/O on a stream; any
//! thread may [`enqueue`](Stream::enqueue) output or register handlers.
//!
//! State machine: `Connecting -> Connected -> Disconnected`. Disconnection
//! is terminal and wakes every registered handler with a dead message.

use crate::broker::{BrokerHandle, Command};
use crate::codec::Codec;
use crate::error::{ContextError, Result, StreamError};
use crate::latch::lock;
use crate::protocol::{ContextId, Handle, Message};
use crate::side::Side;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Bytes requested per read call
const CHUNK_SIZE: usize = 128 * 1024;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique stream identifier
pub type StreamId = u64;

/// Callback invoked with each message addressed to a handle, or with a
/// dead message when the stream goes away
pub type Callback = Arc<dyn Fn(Message) + Send + Sync>;

/// Hook run once when a stream disconnects
pub type DisconnectHook = Box<dyn FnOnce() + Send>;

/// Receives every message decoded from a stream
///
/// The router implements this to deliver locally or forward; tests use
/// simple recorders.
pub trait Dispatch: Send + Sync {
    fn dispatch(&self, stream: &Arc<Stream>, msg: Message);

    /// Called once on the broker thread after every stream is gone
    fn on_shutdown(&self) {}
}

/// Lifecycle of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created, not yet registered with the broker
    Connecting,
    /// Registered and exchanging frames
    Connected,
    /// Terminal
    Disconnected,
}

/// Result of draining the receive side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// More data may arrive
    Open,
    /// The peer closed its end
    Eof,
}

/// Result of flushing the transmit side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Output buffer is empty; write interest can be dropped
    Drained,
    /// The OS accepted part of the buffer; wait for the next writable event
    Pending,
}

struct Registration {
    persist: bool,
    callback: Callback,
}

struct StreamInner {
    state: StreamState,
    input: Vec<u8>,
    output: Vec<u8>,
    handlers: HashMap<Handle, Registration>,
    hooks: Vec<DisconnectHook>,
}

/// One transport connection to a peer context
pub struct Stream {
    id: StreamId,
    name: String,
    local_id: ContextId,
    remote_id: ContextId,
    codec: Codec,
    receive: Side,
    transmit: Side,
    broker: BrokerHandle,
    inner: Mutex<StreamInner>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("remote_id", &self.remote_id)
            .field("state", &self.state())
            .finish()
    }
}

impl Stream {
    /// Create a stream over two sides
    ///
    /// `initial_input` holds bytes already read from the receive side
    /// (e.g. frames that followed the bootstrap acknowledgement).
    pub fn new(
        name: impl Into<String>,
        local_id: ContextId,
        remote_id: ContextId,
        codec: Codec,
        receive: Side,
        transmit: Side,
        broker: BrokerHandle,
        initial_input: Vec<u8>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            local_id,
            remote_id,
            codec,
            receive,
            transmit,
            broker,
            inner: Mutex::new(StreamInner {
                state: StreamState::Connecting,
                input: initial_input,
                output: Vec::new(),
                handlers: HashMap::new(),
                hooks: Vec::new(),
            }),
        })
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn remote_id(&self) -> ContextId {
        self.remote_id
    }

    pub fn local_id(&self) -> ContextId {
        self.local_id
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub(crate) fn receive_side(&self) -> &Side {
        &self.receive
    }

    pub(crate) fn transmit_side(&self) -> &Side {
        &self.transmit
    }

    pub fn state(&self) -> StreamState {
        lock(&self.inner).state
    }

    pub fn is_connected(&self) -> bool {
        self.state() != StreamState::Disconnected
    }

    /// Called by the broker once the stream is registered
    pub(crate) fn mark_connected(&self) {
        let mut inner = lock(&self.inner);
        if inner.state == StreamState::Connecting {
            inner.state = StreamState::Connected;
        }
    }

    pub(crate) fn has_pending_output(&self) -> bool {
        !lock(&self.inner).output.is_empty()
    }

    /// Number of bytes waiting to be written
    pub fn pending_output(&self) -> usize {
        lock(&self.inner).output.len()
    }

    fn lost(&self) -> ContextError {
        ContextError::lost(self.name.clone())
    }

    /// Register a callback for `handle`
    ///
    /// A non-persistent callback is removed before it runs, so it fires at
    /// most once. Fails if the stream is already disconnected, since the
    /// callback would otherwise never be woken.
    pub fn add_handler(&self, handle: Handle, persist: bool, callback: Callback) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.state == StreamState::Disconnected {
            return Err(self.lost());
        }
        inner
            .handlers
            .insert(handle, Registration { persist, callback });
        Ok(())
    }

    /// Remove a handler without invoking it
    pub fn remove_handler(&self, handle: Handle) -> bool {
        lock(&self.inner).handlers.remove(&handle).is_some()
    }

    pub fn has_handler(&self, handle: Handle) -> bool {
        lock(&self.inner).handlers.contains_key(&handle)
    }

    /// Run `hook` when the stream disconnects; runs immediately if it
    /// already has.
    pub fn on_disconnect(&self, hook: DisconnectHook) {
        let mut inner = lock(&self.inner);
        if inner.state == StreamState::Disconnected {
            drop(inner);
            hook();
            return;
        }
        inner.hooks.push(hook);
    }

    /// Deliver a message to this stream's handle map
    ///
    /// Gives the message back if no handler is registered for its handle.
    pub fn deliver(&self, msg: Message) -> std::result::Result<(), Message> {
        let callback = {
            let mut inner = lock(&self.inner);
            let persist = match inner.handlers.get(&msg.handle) {
                Some(registration) => registration.persist,
                None => return Err(msg),
            };
            if persist {
                inner.handlers.get(&msg.handle).map(|r| Arc::clone(&r.callback))
            } else {
                inner.handlers.remove(&msg.handle).map(|r| r.callback)
            }
        };
        match callback {
            Some(callback) => {
                callback(msg);
                Ok(())
            }
            None => Err(msg),
        }
    }

    /// Serialize a message into the output buffer
    ///
    /// Thread-safe. Wakes the broker when the buffer goes from empty to
    /// non-empty so it starts watching for writability.
    pub fn enqueue(&self, msg: &Message) -> Result<()> {
        let frame = self.codec.encode(msg)?;
        let was_empty = {
            let mut inner = lock(&self.inner);
            if inner.state == StreamState::Disconnected {
                return Err(self.lost());
            }
            let was_empty = inner.output.is_empty();
            inner.output.extend_from_slice(&frame);
            was_empty
        };
        tracing::trace!(
            stream = %self.name,
            dst = msg.dst_id,
            handle = msg.handle,
            len = frame.len(),
            "enqueued frame"
        );
        if was_empty && !self.broker.defer(Command::StartWrite(self.id)) {
            return Err(ContextError::Shutdown);
        }
        Ok(())
    }

    /// Drain the receive side and dispatch every complete frame
    ///
    /// Partial frames stay buffered for the next call. Frames decoded
    /// before a corrupt one are still dispatched, in order.
    pub fn on_readable(
        self: &Arc<Self>,
        dispatch: &dyn Dispatch,
    ) -> std::result::Result<ReadOutcome, StreamError> {
        let mut chunk = vec![0u8; CHUNK_SIZE];
        loop {
            let n = match self.receive.read(&mut chunk) {
                Ok(0) => {
                    tracing::debug!(stream = %self.name, "end of file");
                    return Ok(ReadOutcome::Eof);
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadOutcome::Open),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(StreamError::Io(e)),
            };

            let (messages, failure) = self.feed(&chunk[..n]);
            for msg in messages {
                dispatch.dispatch(self, msg);
            }
            if let Some(err) = failure {
                return Err(err);
            }
        }
    }

    /// Dispatch frames already sitting in the input buffer
    pub(crate) fn dispatch_buffered(
        self: &Arc<Self>,
        dispatch: &dyn Dispatch,
    ) -> std::result::Result<(), StreamError> {
        let (messages, failure) = self.feed(&[]);
        for msg in messages {
            dispatch.dispatch(self, msg);
        }
        failure.map_or(Ok(()), Err)
    }

    /// Append bytes to the input buffer and decode what is complete
    fn feed(&self, bytes: &[u8]) -> (Vec<Message>, Option<StreamError>) {
        let mut inner = lock(&self.inner);
        if inner.state == StreamState::Disconnected {
            return (Vec::new(), None);
        }
        inner.input.extend_from_slice(bytes);

        let mut messages = Vec::new();
        let mut consumed = 0;
        let mut failure = None;
        loop {
            match self.codec.decode(&inner.input[consumed..]) {
                Ok(Some((msg, used))) => {
                    consumed += used;
                    messages.push(msg);
                }
                Ok(None) => break,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        inner.input.drain(..consumed);
        (messages, failure)
    }

    /// Write buffered output until drained or the OS pushes back
    pub fn on_writable(&self) -> std::result::Result<WriteOutcome, StreamError> {
        let mut inner = lock(&self.inner);
        while !inner.output.is_empty() {
            match self.transmit.write(&inner.output) {
                Ok(0) => {
                    return Err(StreamError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "transmit side accepted no bytes",
                    )));
                }
                Ok(n) => {
                    inner.output.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(WriteOutcome::Pending),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(StreamError::Io(e)),
            }
        }
        Ok(WriteOutcome::Drained)
    }

    /// Tear the stream down
    ///
    /// Idempotent. Every remaining handler receives a dead message, then
    /// the disconnect hooks run, then the broker is asked to deregister and
    /// close the sides.
    pub fn disconnect(self: &Arc<Self>) {
        let (handlers, hooks) = {
            let mut inner = lock(&self.inner);
            if inner.state == StreamState::Disconnected {
                return;
            }
            inner.state = StreamState::Disconnected;
            inner.input.clear();
            inner.output.clear();
            (
                std::mem::take(&mut inner.handlers),
                std::mem::take(&mut inner.hooks),
            )
        };

        tracing::debug!(
            stream = %self.name,
            handlers = handlers.len(),
            "disconnecting"
        );

        for (handle, registration) in handlers {
            (registration.callback)(Message::dead(self.local_id, self.remote_id, handle));
        }
        for hook in hooks {
            hook();
        }

        if !self.broker.defer(Command::Close(Arc::clone(self))) {
            self.close_sides();
        }
    }

    /// Close both descriptors; only after they are deregistered
    pub(crate) fn close_sides(&self) {
        self.receive.close();
        self.transmit.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::codec::AuthKey;
    use crate::latch::Latch;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;

    /// Collects dispatched messages instead of routing them
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Message>>,
    }

    impl Dispatch for Recorder {
        fn dispatch(&self, stream: &Arc<Stream>, msg: Message) {
            if let Err(msg) = stream.deliver(msg) {
                lock(&self.seen).push(msg);
            }
        }
    }

    /// A stream over one end of a socket pair, plus the raw other end
    fn stream_pair(codec: Codec) -> (Arc<Stream>, UnixStream, Broker) {
        let broker = Broker::new().unwrap();
        let (ours, theirs) = UnixStream::pair().unwrap();
        let ours = OwnedFd::from(ours);
        let transmit = Side::new("tx", ours.try_clone().unwrap()).unwrap();
        let receive = Side::new("rx", ours).unwrap();
        let stream = Stream::new("test", 0, 1, codec, receive, transmit, broker.handle(), Vec::new());
        (stream, theirs, broker)
    }

    #[test]
    fn test_partial_frame_across_reads() {
        use std::io::Write;

        let codec = Codec::new(AuthKey::generate());
        let (stream, mut peer, _broker) = stream_pair(codec.clone());
        let recorder = Recorder::default();

        let msg = Message::new(0, 1, 2000, b"split me".to_vec());
        let frame = codec.encode(&msg).unwrap();
        let (head, tail) = frame.split_at(7);

        peer.write_all(head).unwrap();
        assert_eq!(stream.on_readable(&recorder).unwrap(), ReadOutcome::Open);
        assert!(lock(&recorder.seen).is_empty());

        peer.write_all(tail).unwrap();
        assert_eq!(stream.on_readable(&recorder).unwrap(), ReadOutcome::Open);
        assert_eq!(*lock(&recorder.seen), vec![msg]);
    }

    #[test]
    fn test_one_shot_handler_fires_once() {
        use std::io::Write;

        let codec = Codec::unauthenticated();
        let (stream, mut peer, _broker) = stream_pair(codec.clone());
        let recorder = Recorder::default();
        let hits = Arc::new(AtomicU64::new(0));

        let counter = Arc::clone(&hits);
        stream
            .add_handler(3000, false, Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        let msg = Message::new(0, 1, 3000, vec![1]);
        peer.write_all(&codec.encode(&msg).unwrap()).unwrap();
        peer.write_all(&codec.encode(&msg).unwrap()).unwrap();
        stream.on_readable(&recorder).unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // The second frame found no handler
        assert_eq!(lock(&recorder.seen).len(), 1);
        assert!(!stream.has_handler(3000));
    }

    #[test]
    fn test_persistent_handler_sees_all() {
        let (stream, _peer, _broker) = stream_pair(Codec::unauthenticated());
        let latch = Arc::new(Latch::new());
        let sink = Arc::clone(&latch);
        stream
            .add_handler(4000, true, Arc::new(move |msg| sink.put(msg)))
            .unwrap();

        for i in 0..3u8 {
            stream.deliver(Message::new(0, 1, 4000, vec![i])).unwrap();
        }
        assert_eq!(latch.len(), 3);
        assert!(stream.has_handler(4000));
    }

    #[test]
    fn test_corrupt_frame_is_reported() {
        use std::io::Write;

        let codec = Codec::new(AuthKey::generate());
        let (stream, mut peer, _broker) = stream_pair(codec.clone());
        let recorder = Recorder::default();

        let mut frame = codec.encode(&Message::new(0, 1, 2000, b"data".to_vec())).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        peer.write_all(&frame).unwrap();

        let result = stream.on_readable(&recorder);
        assert!(matches!(result, Err(StreamError::CorruptMessage(_))));
        assert!(lock(&recorder.seen).is_empty());
    }

    #[test]
    fn test_initial_input_is_dispatched() {
        let codec = Codec::unauthenticated();
        let broker = Broker::new().unwrap();
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let ours = OwnedFd::from(ours);
        let transmit = Side::new("tx", ours.try_clone().unwrap()).unwrap();
        let receive = Side::new("rx", ours).unwrap();
        let msg = Message::new(0, 1, 2000, b"early".to_vec());
        let stream = Stream::new(
            "test",
            0,
            1,
            codec.clone(),
            receive,
            transmit,
            broker.handle(),
            codec.encode(&msg).unwrap(),
        );

        let recorder = Recorder::default();
        stream.dispatch_buffered(&recorder).unwrap();
        assert_eq!(*lock(&recorder.seen), vec![msg]);
    }

    #[test]
    fn test_eof_detected() {
        let (stream, peer, _broker) = stream_pair(Codec::unauthenticated());
        drop(peer);
        assert_eq!(stream.on_readable(&Recorder::default()).unwrap(), ReadOutcome::Eof);
    }

    #[test]
    fn test_enqueue_then_flush() {
        use std::io::Read;

        let codec = Codec::unauthenticated();
        let (stream, mut peer, _broker) = stream_pair(codec.clone());
        let msg = Message::new(1, 0, 2000, b"outbound".to_vec());
        stream.enqueue(&msg).unwrap();
        assert!(stream.has_pending_output());

        assert_eq!(stream.on_writable().unwrap(), WriteOutcome::Drained);
        assert_eq!(stream.pending_output(), 0);

        let mut buf = vec![0u8; 256];
        let n = peer.read(&mut buf).unwrap();
        let (decoded, _) = codec.decode(&buf[..n]).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_disconnect_wakes_handlers_once() {
        let (stream, _peer, _broker) = stream_pair(Codec::unauthenticated());
        let latch = Arc::new(Latch::new());
        for handle in [5000, 5001] {
            let sink = Arc::clone(&latch);
            stream
                .add_handler(handle, false, Arc::new(move |msg| sink.put(msg)))
                .unwrap();
        }
        let hooked = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hooked);
        stream.on_disconnect(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        stream.disconnect();
        stream.disconnect();

        assert_eq!(latch.len(), 2);
        assert!(latch.try_get().unwrap().is_dead());
        assert_eq!(hooked.load(Ordering::SeqCst), 1);
        assert_eq!(stream.state(), StreamState::Disconnected);
        assert!(stream.enqueue(&Message::new(1, 0, 1, vec![])).is_err());
        assert!(stream.add_handler(6000, false, Arc::new(|_| {})).is_err());
    }
}
