use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::emitter::{Event, EventEmitter, ListenerId};
use crate::tcp::Connection;
use crate::types::{
    ConnectionId, EventSockError, Result, CONNECTION_EVENT, DESTROY_EVENT, DISCONNECTION_EVENT,
    DISCONNECT_EVENT,
};

/// Default length of the pending-connection queue.
pub const DEFAULT_BACKLOG: i32 = 511;

bitflags! {
    /// Socket options applied when binding the listener.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BindFlags: u8 {
        /// Accept IPv6 connections only (disables dual-stack on `::`).
        const IPV6_ONLY  = 0b0000_0001;
        /// Allow several listeners to share the port (`SO_REUSEPORT`).
        const REUSE_PORT = 0b0000_0010;
    }
}

/// Configuration for binding a server
#[derive(Debug, Clone)]
pub struct BindOptions {
    /// Maximum number of connections waiting to be accepted
    pub backlog: i32,
    pub flags: BindFlags,
}

impl Default for BindOptions {
    fn default() -> Self {
        Self {
            backlog: DEFAULT_BACKLOG,
            flags: BindFlags::empty(),
        }
    }
}

impl BindOptions {
    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_flag(mut self, flag: BindFlags) -> Self {
        self.flags |= flag;
        self
    }
}

/// Payload of every server event.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A client was accepted (`"connection"`).
    Connection(Connection),
    /// A client left the client set (`"disconnection"`).
    Disconnection(Connection),
    /// The server was destroyed (`"destroy"`).
    Destroy,
}

impl ServerEvent {
    /// The connection carried by the event, if any.
    pub fn connection(&self) -> Option<&Connection> {
        match self {
            ServerEvent::Connection(conn) | ServerEvent::Disconnection(conn) => Some(conn),
            ServerEvent::Destroy => None,
        }
    }
}

/// TCP server that wraps every accepted stream in a [`Connection`].
///
/// Accepted connections stay in the client set until their `"disconnect"`
/// fires, at which point the server removes them and emits
/// `"disconnection"`. [`destroy`](Self::destroy) tears everything down.
///
/// Server listeners run on client read tasks and on the accept task, so
/// they must not wait on [`destroy`](Self::destroy). Spawn it instead.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    local_addr: SocketAddr,
    /// Bound listener until [`Server::listen`] hands it to the accept loop.
    listener: Mutex<Option<TcpListener>>,
    clients: Mutex<Vec<Connection>>,
    emitter: EventEmitter<ServerEvent>,
    /// Stops the accept loop, which closes the listener.
    cancel: CancellationToken,
    /// Accept loop, awaited on destroy so the port is free afterwards.
    accept_task: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl Server {
    /// Bind to `address:port`. Port 0 picks an ephemeral port.
    pub async fn bind(address: &str, port: u16, options: BindOptions) -> Result<Self> {
        let addr = lookup_host((address, port))
            .await?
            .next()
            .ok_or_else(|| EventSockError::InvalidAddress(format!("{}:{}", address, port)))?;

        let listener = bind_listener(addr, &options)?;
        let local_addr = listener.local_addr()?;
        info!("eventsock server bound to {}", local_addr);

        Ok(Self {
            inner: Arc::new(ServerInner {
                local_addr,
                listener: Mutex::new(Some(listener)),
                clients: Mutex::new(Vec::new()),
                emitter: EventEmitter::new(),
                cancel: CancellationToken::new(),
                accept_task: Mutex::new(None),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    /// Get the local address this server is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn port(&self) -> u16 {
        self.inner.local_addr.port()
    }

    /// Start accepting connections in a background task.
    ///
    /// Register a `"connection"` listener first: accepted connections start
    /// reading right after that event is emitted.
    pub fn listen(&self) -> Result<()> {
        // Held across the check so `destroy` always finds the task it has to
        // wait for.
        let mut accept_task = self.inner.accept_task.lock();
        if self.is_destroyed() {
            return Err(EventSockError::ServerDestroyed);
        }
        let listener = self
            .inner
            .listener
            .lock()
            .take()
            .ok_or(EventSockError::AlreadyListening)?;

        info!("eventsock server listening on {}", self.inner.local_addr);
        *accept_task = Some(tokio::spawn(accept_loop(Arc::clone(&self.inner), listener)));
        Ok(())
    }

    /// Snapshot of the connected clients, in accept order.
    pub fn clients(&self) -> Vec<Connection> {
        self.inner.clients.lock().clone()
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&Event<'_, ServerEvent>) + Send + Sync + 'static,
    {
        self.inner.emitter.on(event, listener)
    }

    pub fn once<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&Event<'_, ServerEvent>) + Send + Sync + 'static,
    {
        self.inner.emitter.once(event, listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.emitter.off(id)
    }

    /// Run `f` for every accepted connection.
    pub fn on_connection<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.on(CONNECTION_EVENT, move |e| {
            if let Some(conn) = e.payload.connection() {
                f(conn)
            }
        })
    }

    /// Run `f` for every connection leaving the client set.
    pub fn on_disconnection<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.on(DISCONNECTION_EVENT, move |e| {
            if let Some(conn) = e.payload.connection() {
                f(conn)
            }
        })
    }

    /// Disconnect every client, close the listener and emit `"destroy"`.
    ///
    /// Returns once every client has emitted `"disconnect"` and the port is
    /// released, right after `"destroy"` was delivered. Only the first call
    /// has an effect. Listeners are removed after `"destroy"`.
    pub async fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        // The accept loop checks `destroyed` under this lock, so nothing
        // joins the set after the snapshot.
        let clients = inner.clients.lock().clone();
        info!(
            clients = clients.len(),
            "destroying eventsock server on {}", inner.local_addr
        );
        for conn in &clients {
            conn.destroy();
        }
        for conn in &clients {
            conn.closed().await;
        }

        inner.cancel.cancel();
        let accept_task = inner.accept_task.lock().take();
        if let Some(task) = accept_task {
            if let Err(e) = task.await {
                error!("Accept loop failed: {}", e);
            }
        }
        inner.listener.lock().take();

        inner.emitter.emit(DESTROY_EVENT, &ServerEvent::Destroy);
        inner.emitter.remove_all_listeners();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.inner.local_addr)
            .field("clients", &self.client_count())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl ServerInner {
    /// Track a freshly accepted stream.
    fn adopt(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let conn = Connection::from_tcp(stream);
        let id = conn.id();

        // Hooked before the connection is visible, so no disconnect is missed.
        let server: Weak<ServerInner> = Arc::downgrade(self);
        conn.once(DISCONNECT_EVENT, move |_| {
            if let Some(server) = server.upgrade() {
                server.release(id);
            }
        });

        {
            let mut clients = self.clients.lock();
            if self.destroyed.load(Ordering::Acquire) {
                drop(clients);
                debug!("server destroyed, dropping connection from {}", addr);
                conn.destroy();
                return;
            }
            clients.push(conn.clone());
        }

        info!(%id, "New connection from {}", addr);
        self.emitter
            .emit(CONNECTION_EVENT, &ServerEvent::Connection(conn.clone()));
        conn.start();
    }

    /// Remove a client and announce it. Runs from the client's disconnect hook.
    fn release(&self, id: ConnectionId) {
        let removed = {
            let mut clients = self.clients.lock();
            clients
                .iter()
                .position(|c| c.id() == id)
                .map(|idx| clients.remove(idx))
        };

        if let Some(conn) = removed {
            info!(%id, peer = ?conn.peer_addr(), "client disconnected");
            self.emitter
                .emit(DISCONNECTION_EVENT, &ServerEvent::Disconnection(conn));
        }
    }
}

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener) {
    loop {
        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => inner.adopt(socket, addr),
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    drop(listener);
    info!("eventsock server on {} closed", inner.local_addr);
}

fn bind_listener(addr: SocketAddr, options: &BindOptions) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;

    if options.flags.contains(BindFlags::REUSE_PORT) {
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket.set_reuse_port(true)?;
        #[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos")))))]
        warn!("SO_REUSEPORT is not supported on this platform, ignoring it");
    }
    if addr.is_ipv6() {
        socket.set_only_v6(options.flags.contains(BindFlags::IPV6_ONLY))?;
    } else if options.flags.contains(BindFlags::IPV6_ONLY) {
        warn!("IPV6_ONLY has no effect on IPv4 address {}", addr);
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(options.backlog)?;

    Ok(TcpListener::from_std(socket.into())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = Server::bind("127.0.0.1", 0, BindOptions::default()).await.unwrap();
        assert_ne!(server.port(), 0);
        assert_eq!(server.local_addr().ip().to_string(), "127.0.0.1");
        server.destroy().await;
    }

    #[tokio::test]
    async fn test_bind_options() {
        let options = BindOptions::default()
            .with_backlog(16)
            .with_flag(BindFlags::REUSE_PORT);
        assert_eq!(options.backlog, 16);
        assert!(options.flags.contains(BindFlags::REUSE_PORT));
        assert!(!options.flags.contains(BindFlags::IPV6_ONLY));

        let server = Server::bind("127.0.0.1", 0, options).await.unwrap();
        server.destroy().await;
    }

    #[tokio::test]
    async fn test_listen_twice() {
        let server = Server::bind("127.0.0.1", 0, BindOptions::default()).await.unwrap();
        server.listen().unwrap();
        assert!(matches!(server.listen(), Err(EventSockError::AlreadyListening)));
        server.destroy().await;
        assert!(matches!(server.listen(), Err(EventSockError::ServerDestroyed)));
    }

    #[tokio::test]
    async fn test_destroy_emits_once() {
        let server = Server::bind("127.0.0.1", 0, BindOptions::default()).await.unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        server.on(DESTROY_EVENT, move |e| {
            assert!(matches!(e.payload, ServerEvent::Destroy));
            c.fetch_add(1, Ordering::SeqCst);
        });

        server.destroy().await;
        server.destroy().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(server.is_destroyed());
    }

    #[tokio::test]
    async fn test_accept_and_track() {
        let server = Server::bind("127.0.0.1", 0, BindOptions::default()).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.on("*", move |e| {
            let _ = tx.send(e.name.to_string());
        });
        server.listen().unwrap();

        let client = Connection::connect(server.local_addr()).await.unwrap();
        assert_eq!(next(&mut rx).await, CONNECTION_EVENT);
        assert_eq!(server.client_count(), 1);

        client.destroy();
        assert_eq!(next(&mut rx).await, DISCONNECTION_EVENT);
        assert_eq!(server.client_count(), 0);

        server.destroy().await;
        assert_eq!(next(&mut rx).await, DESTROY_EVENT);
    }

    #[tokio::test]
    async fn test_port_released_before_destroy_event() {
        let server = Server::bind("127.0.0.1", 0, BindOptions::default()).await.unwrap();
        let addr = server.local_addr();
        let rebound = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&rebound);
        server.on(DESTROY_EVENT, move |_| {
            if std::net::TcpListener::bind(addr).is_ok() {
                r.fetch_add(1, Ordering::SeqCst);
            }
        });
        server.listen().unwrap();
        tokio::task::yield_now().await;

        server.destroy().await;
        assert_eq!(rebound.load(Ordering::SeqCst), 1);
        assert!(std::net::TcpListener::bind(addr).is_ok());
    }
}
