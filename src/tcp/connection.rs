//! Event-dispatching connection over a byte stream.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::EventCodec;
use crate::emitter::{Event, EventEmitter, ListenerId};
use crate::types::{
    decode_json, is_reserved_event, ConnectionId, EventSockError, Packet, Payload, Result,
    DISCONNECT_EVENT,
};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// How long frames queued before a close may take to reach a peer that has
/// stopped reading. The transport is dropped afterwards.
pub const CLOSE_LINGER: Duration = Duration::from_secs(2);

/// A framed, event-emitting connection.
///
/// `Connection` is a cheap handle; clones share the same underlying
/// transport and listeners. Received packets are emitted under their event
/// type, and `"disconnect"` is emitted exactly once when the connection goes
/// away, whether through [`destroy`](Self::destroy), end of stream or a
/// transport error. Once started, every emission for a connection happens
/// on its read task, so no packet is delivered after `"disconnect"`.
///
/// The transport passed to [`Connection::new`] is owned by the connection
/// from then on. Reading from or writing to it by other means would corrupt
/// the frame stream.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    emitter: EventEmitter<Payload>,
    /// Frames waiting for the writer task. `None` once torn down.
    outbound: Mutex<Option<mpsc::UnboundedSender<Packet>>>,
    /// Reader half until [`Connection::start`] moves it into the read task.
    /// Whoever takes it owns the `"disconnect"` emission.
    reader: Mutex<Option<FramedRead<BoxedReader, EventCodec>>>,
    /// Stops the read task and starts the writer's linger period.
    cancel: CancellationToken,
    /// Cancelled once `"disconnect"` has been emitted.
    done: CancellationToken,
    closed: AtomicBool,
}

impl Connection {
    /// Wrap a byte stream.
    ///
    /// The writer task starts right away, so [`send`](Self::send) works
    /// immediately. No packet is read until [`start`](Self::start) is
    /// called, which leaves room to register listeners first.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<T>(io: T, peer_addr: Option<SocketAddr>) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let reader: BoxedReader = Box::new(read_half);
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let id = ConnectionId::next();

        let inner = Arc::new(Inner {
            id,
            peer_addr,
            emitter: EventEmitter::new(),
            outbound: Mutex::new(Some(tx)),
            reader: Mutex::new(Some(FramedRead::new(reader, EventCodec::new()))),
            cancel: cancel.clone(),
            done: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(write_loop(
            Arc::downgrade(&inner),
            id,
            FramedWrite::new(write_half, EventCodec::new()),
            rx,
            cancel,
        ));

        debug!(%id, ?peer_addr, "connection created");

        Self { inner }
    }

    /// Wrap an accepted or connected TCP stream.
    pub fn from_tcp(stream: TcpStream) -> Self {
        let peer_addr = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        Self::new(stream, peer_addr)
    }

    /// Open an outbound TCP connection.
    ///
    /// The returned connection is not started yet.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let conn = Self::from_tcp(stream);
        info!(id = %conn.id(), peer = ?conn.peer_addr(), "connected");
        Ok(conn)
    }

    /// Start delivering received packets. Calling it again has no effect.
    pub fn start(&self) {
        let Some(reader) = self.inner.reader.lock().take() else {
            return;
        };
        tokio::spawn(read_loop(Arc::clone(&self.inner), reader));
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Address of the remote peer, if the transport has one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Queue one packet for sending.
    ///
    /// Fails with [`EventSockError::ConnectionClosed`] once the connection has
    /// been torn down or its writer has stopped.
    pub fn send(&self, event_type: &str, payload: Option<&[u8]>) -> Result<()> {
        let outbound = self.inner.outbound.lock();
        let tx = outbound.as_ref().ok_or(EventSockError::ConnectionClosed)?;
        tx.send(Packet::new(event_type, payload.map(Bytes::copy_from_slice)))
            .map_err(|_| EventSockError::ConnectionClosed)
    }

    /// Send a packet without payload.
    pub fn signal(&self, event_type: &str) -> Result<()> {
        self.send(event_type, None)
    }

    /// Serialize `value` as JSON and send it as the payload.
    pub fn send_json<T: Serialize + ?Sized>(&self, event_type: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.send(event_type, Some(&payload))
    }

    /// Listen for `event`, or for every event with `"*"`.
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&Event<'_, Payload>) + Send + Sync + 'static,
    {
        self.inner.emitter.on(event, listener)
    }

    pub fn once<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&Event<'_, Payload>) + Send + Sync + 'static,
    {
        self.inner.emitter.once(event, listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.emitter.off(id)
    }

    /// Run `f` when the connection goes away.
    pub fn on_disconnect<F>(&self, f: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.emitter.once(DISCONNECT_EVENT, move |_| f())
    }

    /// Number of listeners registered for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.inner.emitter.listener_count(event)
    }

    /// Close the connection.
    ///
    /// Never blocks. On a started connection `"disconnect"` is emitted by the
    /// read task right after the listener it is currently running, if any,
    /// returns; use [`closed`](Self::closed) to wait for it. Frames already
    /// queued by [`send`](Self::send) get [`CLOSE_LINGER`] to drain before the
    /// transport is dropped. Safe to call any number of times, from any task
    /// or listener.
    pub fn destroy(&self) {
        self.inner.destroy();
    }

    /// Resolves once `"disconnect"` has been emitted.
    pub async fn closed(&self) {
        self.inner.done.cancelled().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<'a> Event<'a, Payload> {
    /// Deserialize the event payload as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<Option<T>> {
        decode_json(self.payload)
    }
}

impl Inner {
    fn dispatch(&self, packet: Packet) {
        if is_reserved_event(&packet.event_type) {
            warn!(id = %self.id, event = %packet.event_type, "peer sent a reserved event, dropping it");
            return;
        }
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        debug!(
            id = %self.id,
            event = %packet.event_type,
            len = packet.payload.as_ref().map_or(0, |p| p.len()),
            "received packet"
        );
        self.emitter.emit(&packet.event_type, &packet.payload);
    }

    /// Mark the connection closed. Returns false if it already was.
    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        // Dropping the sender lets the writer drain and shut down.
        self.outbound.lock().take();
        info!(id = %self.id, peer = ?self.peer_addr, "connection closed");
        true
    }

    fn destroy(&self) {
        if !self.close() {
            return;
        }
        // The reader is still here only if `start` was never called. A
        // running read task sees the cancellation and emits on its own.
        let unstarted = self.reader.lock().take();
        if let Some(reader) = unstarted {
            drop(reader);
            self.finish();
        }
    }

    /// Emit `"disconnect"`. Runs exactly once, on whichever side owns the
    /// reader.
    fn finish(&self) {
        self.emitter.emit(DISCONNECT_EVENT, &None);
        // Nothing is emitted after disconnect; drop listeners so handles
        // captured by them are released.
        self.emitter.remove_all_listeners();
        self.done.cancel();
    }
}

async fn read_loop(inner: Arc<Inner>, mut reader: FramedRead<BoxedReader, EventCodec>) {
    loop {
        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => {
                debug!(id = %inner.id, "read loop cancelled");
                break;
            }
            next = reader.next() => match next {
                Some(Ok(packet)) => inner.dispatch(packet),
                Some(Err(e)) => {
                    error!(id = %inner.id, "Read error: {}", e);
                    break;
                }
                None => {
                    debug!(id = %inner.id, "end of stream");
                    break;
                }
            }
        }
    }

    drop(reader);
    inner.close();
    inner.finish();
}

async fn write_loop<W>(
    inner: Weak<Inner>,
    id: ConnectionId,
    mut sink: FramedWrite<WriteHalf<W>, EventCodec>,
    mut rx: mpsc::UnboundedReceiver<Packet>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Send + 'static,
{
    match drain_outbound(&mut sink, &mut rx, &cancel).await {
        Ok(()) => {
            if let Err(e) = lingering(sink.close(), &cancel).await {
                debug!(%id, "Failed to shut down write half: {}", e);
            }
        }
        Err(e) if cancel.is_cancelled() => {
            warn!(%id, "Dropping unsent frames: {}", e);
        }
        Err(e) => {
            error!(%id, "Write error: {}", e);
            if let Some(inner) = inner.upgrade() {
                inner.destroy();
            }
        }
    }
}

/// Write queued packets in batches until every sender is gone.
async fn drain_outbound<W>(
    sink: &mut FramedWrite<WriteHalf<W>, EventCodec>,
    rx: &mut mpsc::UnboundedReceiver<Packet>,
    cancel: &CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Send + 'static,
{
    while let Some(packet) = rx.recv().await {
        let mut batch = vec![packet];
        while let Ok(more) = rx.try_recv() {
            batch.push(more);
        }

        for packet in batch {
            lingering(sink.feed(packet), cancel).await?;
        }
        lingering(sink.flush(), cancel).await?;
    }
    Ok(())
}

/// Run a write, giving up [`CLOSE_LINGER`] after the connection was closed.
async fn lingering<F>(write: F, cancel: &CancellationToken) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::select! {
        result = write => result,
        _ = async {
            cancel.cancelled().await;
            tokio::time::sleep(CLOSE_LINGER).await;
        } => Err(io::Error::new(io::ErrorKind::TimedOut, "peer stopped reading").into()),
    }
}
