//! Streams of values over one handle
//!
//! A [`Channel`] is the receiving end: a persistent handler on a
//! context's stream feeding a [`Latch`]. A [`Sender`] is the sending end
//! and may live in any process that can route to the channel's owner.
//! Closing a sender delivers the dead sentinel, which ends iteration on
//! the channel.

use crate::context::Context;
use crate::error::{ContextError, Result};
use crate::latch::Latch;
use crate::protocol::{ContextId, Handle, Message};
use crate::router::Router;
use crate::stream::Stream;
use crate::value::Value;
use std::sync::Arc;
use std::time::Duration;

/// Receiving end of a value stream
#[derive(Debug)]
pub struct Channel {
    handle: Handle,
    stream: Arc<Stream>,
    latch: Arc<Latch<Message>>,
}

impl Channel {
    /// Open a channel that receives values sent by `context`
    pub fn open(context: &Context) -> Result<Self> {
        let handle = context.router().allocate_handle();
        let latch = Arc::new(Latch::new());
        let sink = Arc::clone(&latch);
        context.stream().add_handler(
            handle,
            true,
            Arc::new(move |msg: Message| {
                if msg.is_dead() {
                    sink.close();
                } else {
                    sink.put(msg);
                }
            }),
        )?;
        Ok(Self {
            handle,
            stream: Arc::clone(context.stream()),
            latch,
        })
    }

    /// Handle to give to the sending side
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Wait for the next value
    ///
    /// Fails with [`ContextError::ChannelClosed`] once the sender closed
    /// the channel or the stream went away, and with
    /// [`ContextError::Timeout`] when the deadline passes first.
    pub fn receive(&self, timeout: Option<Duration>) -> Result<Value> {
        let msg = self.latch.get(timeout)?;
        msg.decode::<Value>()
    }

    /// Take a value if one is already queued
    pub fn try_receive(&self) -> Option<Result<Value>> {
        self.latch.try_get().map(|msg| msg.decode::<Value>())
    }

    /// Stop listening; later receives fail with `ChannelClosed`
    pub fn close(&self) {
        self.stream.remove_handler(self.handle);
        self.latch.close();
    }

    pub fn is_closed(&self) -> bool {
        self.latch.is_closed()
    }
}

impl Iterator for Channel {
    type Item = Value;

    /// Yields values until the channel closes
    fn next(&mut self) -> Option<Value> {
        match self.receive(None) {
            Ok(value) => Some(value),
            Err(ContextError::ChannelClosed) => None,
            Err(err) => {
                tracing::warn!(handle = self.handle, error = %err, "channel iteration stopped");
                None
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.stream.remove_handler(self.handle);
    }
}

/// Sending end of a value stream
#[derive(Debug, Clone)]
pub struct Sender {
    router: Router,
    dst_id: ContextId,
    handle: Handle,
}

impl Sender {
    pub fn new(router: Router, dst_id: ContextId, handle: Handle) -> Self {
        Self {
            router,
            dst_id,
            handle,
        }
    }

    /// Sender towards a handle owned by `context`
    pub fn to(context: &Context, handle: Handle) -> Self {
        Self::new(context.router().clone(), context.id(), handle)
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn send(&self, value: &Value) -> Result<()> {
        let msg = Message::encode(self.dst_id, self.router.id(), self.handle, value)?;
        self.router.route(msg)
    }

    /// Deliver the dead sentinel, ending the receiver's iteration
    pub fn close(&self) -> Result<()> {
        self.router
            .route(Message::dead(self.dst_id, self.router.id(), self.handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;
    use crate::config::RouterConfig;
    use crate::protocol::ROOT_ID;
    use crate::side::Side;
    use std::io::Write;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;

    fn scripted(router: &Router) -> (Arc<Context>, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let ours = OwnedFd::from(ours);
        let stream = Stream::new(
            "scripted",
            ROOT_ID,
            1,
            Codec::unauthenticated(),
            Side::new("rx", ours.try_clone().unwrap()).unwrap(),
            Side::new("tx", ours).unwrap(),
            router.broker_handle(),
            Vec::new(),
        );
        router.attach(&stream, 1, "scripted").unwrap();
        (Context::new(router.clone(), 1, "scripted", stream, None, false), theirs)
    }

    #[test]
    fn test_values_then_close() {
        let router = Router::with_config(RouterConfig::default()).unwrap();
        let (context, mut peer) = scripted(&router);
        let mut channel = Channel::open(&context).unwrap();
        let codec = Codec::unauthenticated();

        for i in 0..3 {
            let msg = Message::encode(ROOT_ID, 1, channel.handle(), &Value::Int(i)).unwrap();
            peer.write_all(&codec.encode(&msg).unwrap()).unwrap();
        }
        let dead = Message::dead(ROOT_ID, 1, channel.handle());
        peer.write_all(&codec.encode(&dead).unwrap()).unwrap();

        let values: Vec<Value> = channel.by_ref().collect();
        assert_eq!(values, vec![Value::Int(0), Value::Int(1), Value::Int(2)]);
        assert!(matches!(channel.receive(None), Err(ContextError::ChannelClosed)));

        router.shutdown();
        router.join();
    }

    #[test]
    fn test_receive_timeout_and_local_close() {
        let router = Router::with_config(RouterConfig::default()).unwrap();
        let (context, _peer) = scripted(&router);
        let channel = Channel::open(&context).unwrap();

        assert!(matches!(
            channel.receive(Some(Duration::from_millis(20))),
            Err(ContextError::Timeout(_))
        ));
        channel.close();
        assert!(channel.is_closed());
        assert!(!context.stream().has_handler(channel.handle()));
        assert!(matches!(channel.receive(None), Err(ContextError::ChannelClosed)));

        router.shutdown();
        router.join();
    }

    #[test]
    fn test_disconnect_closes_channel() {
        let router = Router::with_config(RouterConfig::default()).unwrap();
        let (context, _peer) = scripted(&router);
        let channel = Channel::open(&context).unwrap();

        context.disconnect();
        assert!(matches!(
            channel.receive(Some(Duration::from_secs(5))),
            Err(ContextError::ChannelClosed)
        ));

        router.shutdown();
        router.join();
    }

    #[test]
    fn test_sender_frames() {
        let router = Router::with_config(RouterConfig::default()).unwrap();
        let (context, mut peer) = scripted(&router);
        let sender = Sender::to(&context, 4321);
        sender.send(&Value::Str("hello".to_string())).unwrap();
        sender.close().unwrap();

        let codec = Codec::unauthenticated();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = Vec::new();
        let mut got = Vec::new();
        let mut chunk = [0u8; 1024];
        while got.len() < 2 {
            if let Some((msg, used)) = codec.decode(&buf).unwrap() {
                buf.drain(..used);
                got.push(msg);
                continue;
            }
            let n = std::io::Read::read(&mut peer, &mut chunk).unwrap();
            buf.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(got[0].decode::<Value>().unwrap(), Value::Str("hello".to_string()));
        assert_eq!(got[0].dst_id, 1);
        assert!(got[1].is_dead());
        assert_eq!(got[1].handle, 4321);

        router.shutdown();
        router.join();
    }
}
