//! The broker: one thread multiplexing every stream in the process
//!
//! The broker thread is the only caller of [`mio::Poll::poll()`] and the
//! only thread performing stream I/O. Other threads never touch the
//! registration set directly: they push a [`Command`] onto a queue and
//! wake the poll through a [`mio::Waker`]. Commands are applied strictly
//! between poll iterations.
//!
//! # Tokens
//!
//! | Token            | Source                          |
//! |------------------|---------------------------------|
//! | `0`              | the waker                       |
//! | `2 * id`         | receive side of stream `id`     |
//! | `2 * id + 1`     | transmit side of stream `id`    |
//!
//! Stream ids start at 1, so stream tokens never collide with the waker.
//! Read interest is always registered for live streams; write interest
//! only while a stream has buffered output.
//!
//! # Failure containment
//!
//! Any error or panic while servicing one stream disconnects that stream
//! alone. The loop itself only exits on shutdown or when the poll
//! instance fails.

use crate::latch::lock;
use crate::stream::{Dispatch, ReadOutcome, Stream, StreamId, WriteOutcome};
use crate::error::StreamError;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

/// Token reserved for the waker
const WAKER_TOKEN: Token = Token(0);

/// Capacity for the [`mio::Events`] buffer
const EVENTS_CAPACITY: usize = 256;

fn read_token(id: StreamId) -> Token {
    Token(id as usize * 2)
}

fn write_token(id: StreamId) -> Token {
    Token(id as usize * 2 + 1)
}

/// Split a token into stream id and "is transmit side"
fn decode_token(token: Token) -> (StreamId, bool) {
    ((token.0 / 2) as StreamId, token.0 % 2 == 1)
}

/// Registration change requested from any thread
pub enum Command {
    /// Start polling a new stream
    Register(Arc<Stream>),
    /// The stream has output; watch its transmit side
    StartWrite(StreamId),
    /// Deregister and close a disconnected stream
    Close(Arc<Stream>),
}

struct Shared {
    waker: Waker,
    pending: Mutex<VecDeque<Command>>,
    alive: AtomicBool,
    thread_id: Mutex<Option<ThreadId>>,
}

/// Cheap, cloneable reference to a broker
#[derive(Clone)]
pub struct BrokerHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for BrokerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerHandle")
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl BrokerHandle {
    /// Queue a command for the broker thread and wake it
    ///
    /// Returns `false` if the broker has stopped; the caller must then
    /// perform any cleanup itself.
    pub fn defer(&self, command: Command) -> bool {
        let mut pending = lock(&self.shared.pending);
        if !self.shared.alive.load(Ordering::SeqCst) {
            return false;
        }
        pending.push_back(command);
        drop(pending);
        self.wake();
        true
    }

    /// Start polling a stream
    pub fn register(&self, stream: Arc<Stream>) -> bool {
        self.defer(Command::Register(stream))
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    /// Whether the current thread is the broker thread
    pub fn on_broker_thread(&self) -> bool {
        *lock(&self.shared.thread_id) == Some(thread::current().id())
    }

    /// Ask the loop to disconnect everything and exit
    pub fn stop(&self) {
        {
            let _pending = lock(&self.shared.pending);
            self.shared.alive.store(false, Ordering::SeqCst);
        }
        self.wake();
    }

    fn wake(&self) {
        // If the poll is already gone the thread has exited; nothing to do.
        let _unused = self.shared.waker.wake();
    }
}

/// Owner of the broker thread
pub struct Broker {
    handle: BrokerHandle,
    poll: Mutex<Option<Poll>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker").field("handle", &self.handle).finish()
    }
}

impl Broker {
    /// Create the poll instance and waker without starting the thread
    ///
    /// Two-phase setup: the handle exists before the dispatcher that the
    /// thread will need, so the dispatcher can hold the handle.
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        Ok(Self {
            handle: BrokerHandle {
                shared: Arc::new(Shared {
                    waker,
                    pending: Mutex::new(VecDeque::new()),
                    alive: AtomicBool::new(true),
                    thread_id: Mutex::new(None),
                }),
            },
            poll: Mutex::new(Some(poll)),
            thread: Mutex::new(None),
        })
    }

    pub fn handle(&self) -> BrokerHandle {
        self.handle.clone()
    }

    /// Spawn the event loop thread
    pub fn start(&self, dispatch: Arc<dyn Dispatch>) -> io::Result<()> {
        let poll = lock(&self.poll).take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::AlreadyExists, "broker already started")
        })?;

        let event_loop = BrokerLoop {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            streams: HashMap::new(),
            writing: HashSet::new(),
            shared: Arc::clone(&self.handle.shared),
            dispatch,
        };

        let thread = thread::Builder::new()
            .name("tether-broker".to_string())
            .spawn(move || event_loop.run())?;
        *lock(&self.thread) = Some(thread);
        Ok(())
    }

    /// Stop the loop; every stream is disconnected
    pub fn shutdown(&self) {
        self.handle.stop();
    }

    /// Wait for the broker thread to exit
    ///
    /// A no-op on the broker thread itself.
    pub fn join(&self) {
        if self.handle.on_broker_thread() {
            return;
        }
        let thread = lock(&self.thread).take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                tracing::error!("broker thread panicked");
            }
        }
    }
}

/// Readiness flags copied out of a [`mio::event::Event`]
#[derive(Debug, Clone, Copy)]
struct Readiness {
    readable: bool,
    writable: bool,
    read_closed: bool,
    write_closed: bool,
    error: bool,
}

impl From<&mio::event::Event> for Readiness {
    fn from(event: &mio::event::Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            read_closed: event.is_read_closed(),
            write_closed: event.is_write_closed(),
            error: event.is_error(),
        }
    }
}

/// State owned exclusively by the broker thread
struct BrokerLoop {
    poll: Poll,
    events: Events,
    streams: HashMap<StreamId, Arc<Stream>>,
    writing: HashSet<StreamId>,
    shared: Arc<Shared>,
    dispatch: Arc<dyn Dispatch>,
}

impl BrokerLoop {
    fn run(mut self) {
        *lock(&self.shared.thread_id) = Some(thread::current().id());
        tracing::debug!("broker started");

        loop {
            self.apply_pending();
            if !self.shared.alive.load(Ordering::SeqCst) {
                break;
            }

            // Block until a stream is ready or someone wakes us.
            if let Err(err) = self.poll.poll(&mut self.events, None) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(error = %err, "poll failed; broker exiting");
                break;
            }

            // Copy out so dispatch can borrow `self` mutably.
            let ready: Vec<(Token, Readiness)> = self
                .events
                .iter()
                .map(|event| (event.token(), Readiness::from(event)))
                .collect();

            for (token, readiness) in ready {
                if token == WAKER_TOKEN {
                    continue;
                }
                self.handle_event(token, readiness);
            }
        }

        self.finalize();
        tracing::debug!("broker stopped");
    }

    /// Apply queued registration changes
    fn apply_pending(&mut self) {
        let commands: Vec<Command> = lock(&self.shared.pending).drain(..).collect();
        for command in commands {
            match command {
                Command::Register(stream) => self.register(stream),
                Command::StartWrite(id) => {
                    if let Some(stream) = self.streams.get(&id).cloned() {
                        self.start_writing(&stream);
                    }
                }
                Command::Close(stream) => self.retire(&stream),
            }
        }
    }

    fn register(&mut self, stream: Arc<Stream>) {
        if !stream.is_connected() {
            stream.close_sides();
            return;
        }

        let Some(fd) = stream.receive_side().raw_fd() else {
            stream.disconnect();
            return;
        };
        let id = stream.id();
        if let Err(err) =
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), read_token(id), Interest::READABLE)
        {
            tracing::warn!(stream = stream.name(), error = %err, "failed to register stream");
            stream.disconnect();
            stream.close_sides();
            return;
        }

        self.streams.insert(id, Arc::clone(&stream));
        stream.mark_connected();
        tracing::debug!(stream = stream.name(), id, "registered stream");

        // Frames that arrived alongside the bootstrap acknowledgement.
        if let Err(err) = self.guarded(&stream, |dispatch, s| s.dispatch_buffered(dispatch)) {
            self.fail(&stream, err);
            return;
        }
        if stream.has_pending_output() {
            self.start_writing(&stream);
        }
    }

    fn start_writing(&mut self, stream: &Arc<Stream>) {
        let id = stream.id();
        if self.writing.contains(&id) {
            return;
        }
        let Some(fd) = stream.transmit_side().raw_fd() else {
            return;
        };
        match self
            .poll
            .registry()
            .register(&mut SourceFd(&fd), write_token(id), Interest::WRITABLE)
        {
            Ok(()) => {
                self.writing.insert(id);
            }
            Err(err) => {
                tracing::warn!(stream = stream.name(), error = %err, "failed to watch for writability");
                self.fail(stream, StreamError::Io(err));
            }
        }
    }

    fn stop_writing(&mut self, stream: &Arc<Stream>) {
        if !self.writing.remove(&stream.id()) {
            return;
        }
        if let Some(fd) = stream.transmit_side().raw_fd() {
            let _unused = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
    }

    /// Deregister a stream and close its descriptors
    fn retire(&mut self, stream: &Arc<Stream>) {
        if self.streams.remove(&stream.id()).is_some() {
            if let Some(fd) = stream.receive_side().raw_fd() {
                let _unused = self.poll.registry().deregister(&mut SourceFd(&fd));
            }
            self.stop_writing(stream);
        }
        stream.close_sides();
    }

    /// Disconnect a stream that failed, logging why
    fn fail(&mut self, stream: &Arc<Stream>, err: StreamError) {
        match &err {
            StreamError::CorruptMessage(_) => {
                tracing::error!(stream = stream.name(), error = %err, "corrupt stream; disconnecting");
            }
            StreamError::Io(_) => {
                tracing::warn!(stream = stream.name(), error = %err, "stream I/O failed; disconnecting");
            }
        }
        self.disconnect(stream);
    }

    fn disconnect(&mut self, stream: &Arc<Stream>) {
        stream.disconnect();
        self.retire(stream);
    }

    /// Run a stream operation, converting panics into I/O errors
    fn guarded<T>(
        &self,
        stream: &Arc<Stream>,
        op: impl FnOnce(&dyn Dispatch, &Arc<Stream>) -> Result<T, StreamError>,
    ) -> Result<T, StreamError> {
        let dispatch = &*self.dispatch;
        match panic::catch_unwind(AssertUnwindSafe(|| op(dispatch, stream))) {
            Ok(result) => result,
            Err(_) => Err(StreamError::Io(io::Error::other(
                "panic while servicing stream",
            ))),
        }
    }

    fn handle_event(&mut self, token: Token, readiness: Readiness) {
        let (id, is_transmit) = decode_token(token);
        let Some(stream) = self.streams.get(&id).cloned() else {
            tracing::trace!(?token, "event for unknown stream");
            return;
        };

        if is_transmit {
            if readiness.error {
                self.fail(&stream, StreamError::Io(io::Error::other("transmit side error")));
                return;
            }
            if readiness.writable {
                match self.guarded(&stream, |_, s| s.on_writable()) {
                    Ok(WriteOutcome::Drained) => self.stop_writing(&stream),
                    Ok(WriteOutcome::Pending) => {}
                    Err(err) => self.fail(&stream, err),
                }
            } else if readiness.write_closed {
                self.fail(&stream, StreamError::Io(io::ErrorKind::BrokenPipe.into()));
            }
            return;
        }

        if readiness.readable || readiness.read_closed || readiness.error {
            match self.guarded(&stream, |dispatch, s| s.on_readable(dispatch)) {
                Ok(ReadOutcome::Open) => {}
                Ok(ReadOutcome::Eof) => self.disconnect(&stream),
                Err(err) => self.fail(&stream, err),
            }
        }
    }

    /// Disconnect everything that is left, then notify the dispatcher
    fn finalize(&mut self) {
        let leftovers: Vec<Command> = {
            let mut pending = lock(&self.shared.pending);
            self.shared.alive.store(false, Ordering::SeqCst);
            pending.drain(..).collect()
        };
        for command in leftovers {
            match command {
                Command::Register(stream) | Command::Close(stream) => {
                    self.retire(&stream);
                    stream.disconnect();
                }
                Command::StartWrite(_) => {}
            }
        }

        let streams: Vec<Arc<Stream>> = self.streams.values().cloned().collect();
        for stream in streams {
            self.retire(&stream);
            stream.disconnect();
        }

        self.dispatch.on_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;
    use crate::latch::Latch;
    use crate::protocol::Message;
    use crate::side::Side;
    use std::io::{Read, Write};
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    /// Forwards every message into a latch
    struct Collect(Arc<Latch<Message>>);

    impl Dispatch for Collect {
        fn dispatch(&self, _stream: &Arc<Stream>, msg: Message) {
            self.0.put(msg);
        }
    }

    fn started() -> (Broker, Arc<Latch<Message>>) {
        let broker = Broker::new().unwrap();
        let latch = Arc::new(Latch::new());
        broker.start(Arc::new(Collect(Arc::clone(&latch)))).unwrap();
        (broker, latch)
    }

    fn attach(broker: &Broker, codec: Codec) -> (Arc<Stream>, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let ours = OwnedFd::from(ours);
        let transmit = Side::new("tx", ours.try_clone().unwrap()).unwrap();
        let receive = Side::new("rx", ours).unwrap();
        let stream = Stream::new("peer", 0, 1, codec, receive, transmit, broker.handle(), Vec::new());
        assert!(broker.handle().register(Arc::clone(&stream)));
        (stream, theirs)
    }

    #[test]
    fn test_token_mapping() {
        assert_eq!(decode_token(read_token(5)), (5, false));
        assert_eq!(decode_token(write_token(5)), (5, true));
        assert_ne!(read_token(1), WAKER_TOKEN);
    }

    #[test]
    fn test_reads_are_dispatched() {
        let (broker, latch) = started();
        let codec = Codec::unauthenticated();
        let (_stream, mut peer) = attach(&broker, codec.clone());

        let msg = Message::new(0, 1, 2000, b"hello broker".to_vec());
        peer.write_all(&codec.encode(&msg).unwrap()).unwrap();

        let got = latch.get(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(got, msg);

        broker.shutdown();
        broker.join();
    }

    #[test]
    fn test_enqueue_is_flushed() {
        let (broker, _latch) = started();
        let codec = Codec::unauthenticated();
        let (stream, mut peer) = attach(&broker, codec.clone());

        let msg = Message::new(1, 0, 2000, vec![42; 1000]);
        stream.enqueue(&msg).unwrap();

        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        while codec.decode(&buf).unwrap().is_none() {
            let n = peer.read(&mut chunk).unwrap();
            buf.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(codec.decode(&buf).unwrap().unwrap().0, msg);

        broker.shutdown();
        broker.join();
    }

    #[test]
    fn test_peer_hangup_disconnects_stream() {
        let (broker, _latch) = started();
        let (stream, peer) = attach(&broker, Codec::unauthenticated());
        let dead = Arc::new(Latch::new());
        let sink = Arc::clone(&dead);
        stream
            .add_handler(3000, false, Arc::new(move |msg| sink.put(msg)))
            .unwrap();

        drop(peer);

        let msg = dead.get(Some(Duration::from_secs(5))).unwrap();
        assert!(msg.is_dead());
        assert!(!stream.is_connected());

        broker.shutdown();
        broker.join();
    }

    #[test]
    fn test_garbage_disconnects_only_that_stream() {
        let (broker, latch) = started();
        let codec = Codec::unauthenticated();
        let (bad, mut bad_peer) = attach(&broker, codec.clone());
        let (good, mut good_peer) = attach(&broker, codec.clone());

        // A frame length below the minimum is corrupt
        bad_peer.write_all(&[0, 0, 0, 1, 0xFF]).unwrap();
        for _ in 0..100 {
            if !bad.is_connected() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!bad.is_connected());
        assert!(good.is_connected());

        let msg = Message::new(0, 1, 2000, b"still here".to_vec());
        good_peer.write_all(&codec.encode(&msg).unwrap()).unwrap();
        assert_eq!(latch.get(Some(Duration::from_secs(5))).unwrap(), msg);

        broker.shutdown();
        broker.join();
    }

    #[test]
    fn test_shutdown_disconnects_everything() {
        let (broker, _latch) = started();
        let (a, _pa) = attach(&broker, Codec::unauthenticated());
        let (b, _pb) = attach(&broker, Codec::unauthenticated());

        // Let the registrations land before stopping
        std::thread::sleep(Duration::from_millis(50));
        broker.shutdown();
        broker.join();

        assert!(!a.is_connected());
        assert!(!b.is_connected());
        assert!(!broker.handle().is_alive());
        assert!(!broker.handle().defer(Command::StartWrite(a.id())));
    }

    #[test]
    fn test_start_twice_fails() {
        let (broker, latch) = started();
        let err = broker.start(Arc::new(Collect(latch))).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        broker.shutdown();
        broker.join();
    }
}
