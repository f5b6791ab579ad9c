//! NetworkManager – connection lifecycle for both roles, the handler
//! registry, and the event queue that hands packets to the owning thread.
//!
//! ## Threading model
//!
//! ```text
//! Network tasks (Tokio)              │  Owning thread (tick loop)
//! ────────────────────────────────── │ ──────────────────────────────
//! accept loop (server mode)          │
//! connection task × N                │  process_events(&tree)
//!   read frame                       │    → try_recv() until empty
//!   → events.send(PacketEvent) ────▶ │    → handler(&tree, payload, peer)
//!                                    │        → peer.send_packet(...)
//! write loop ◀── outbox ◀─────────── │
//! ```
//!
//! Handlers are the only code allowed to mutate the instance tree in
//! response to network input, and they only ever run on the thread that
//! calls [`NetworkManager::process_events`].
//!
//! ## Backpressure
//!
//! The event queue is bounded. A receive loop that finds it full waits, so
//! a consumer that falls behind stalls *every* connection sharing the
//! manager, not only the busy one. Size `event_buffer` for the burst you
//! expect between two ticks.
//!
//! ## States
//!
//! `Idle → ClientConnected` via [`connect`](NetworkManager::connect),
//! `Idle → ServerListening` via [`serve`](NetworkManager::serve), and
//! `Closed` from anywhere via [`close`](NetworkManager::close).

use crate::connection::{wait_shutdown, Connection, LoopContext};
use crate::error::NetError;
use crate::manager::TreeManager;
use crate::protocol::{Packet, PacketKind};
use crate::types::{ConnectionId, NetworkConfig};
use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Called on the owning thread with the tree, the raw payload and, in
/// server mode, the connection the packet came from.
pub type PacketHandler = Arc<dyn Fn(&TreeManager, &[u8], Option<&Connection>) + Send + Sync>;

/// One received packet waiting for the owning thread.
#[derive(Debug, Clone)]
pub struct PacketEvent {
    pub kind: PacketKind,
    pub payload: Bytes,
    /// Originating connection (server mode only).
    pub origin: Option<Arc<Connection>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Idle,
    ClientConnected,
    ServerListening,
    Closed,
}

impl ManagerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagerState::Idle => "idle",
            ManagerState::ClientConnected => "client-connected",
            ManagerState::ServerListening => "server-listening",
            ManagerState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ManagerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Shared {
    config: NetworkConfig,
    handlers: RwLock<HashMap<u16, PacketHandler>>,
    events_tx: mpsc::Sender<PacketEvent>,
    events_rx: Mutex<mpsc::Receiver<PacketEvent>>,
    state: Mutex<ManagerState>,
    /// Client mode: the dialled connection.
    client: Mutex<Option<Arc<Connection>>>,
    /// Server mode: every live accepted connection.
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    next_connection: AtomicU64,
}

impl Shared {
    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Wrap an accepted socket, register it and spawn its task. The task
    /// removes the registration when it ends.
    fn start_accepted(self: &Arc<Self>, stream: TcpStream) -> Result<Arc<Connection>, NetError> {
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let (conn, io) = Connection::open(id, stream)?;
        self.connections.write().insert(id, Arc::clone(&conn));

        let ctx = LoopContext {
            events: self.events_tx.clone(),
            shutdown: self.shutdown.subscribe(),
            max_frame_len: self.config.max_frame_len,
            tag_origin: true,
        };

        let span = tracing::info_span!("connection", id = %id, peer = %conn.peer_addr(), role = "accepted");
        let shared = Arc::clone(self);
        let task_conn = Arc::clone(&conn);
        let task = tokio::spawn(
            async move {
                task_conn.run(io, ctx).await;
                shared.connections.write().remove(&id);
            }
            .instrument(span),
        );
        self.track(task);
        Ok(conn)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let accepted = tokio::select! {
                _ = wait_shutdown(&mut shutdown) => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => match self.start_accepted(stream) {
                    Ok(conn) => info!("Accepted {} from {}", conn.id(), addr),
                    Err(e) => warn!("Failed to set up connection from {}: {}", addr, e),
                },
                Err(e) => warn!("Accept error: {}", e),
            }
        }
        info!("Accept loop stopped");
    }
}

// ---------------------------------------------------------------------------
// NetworkManager
// ---------------------------------------------------------------------------

/// Cheap to clone; clones share the same connections, handlers and queue.
#[derive(Clone)]
pub struct NetworkManager {
    shared: Arc<Shared>,
}

impl NetworkManager {
    pub fn new(config: NetworkConfig) -> Self {
        let capacity = config.event_buffer.max(1);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (shutdown, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                config,
                handlers: RwLock::new(HashMap::new()),
                events_tx,
                events_rx: Mutex::new(events_rx),
                state: Mutex::new(ManagerState::Idle),
                client: Mutex::new(None),
                connections: RwLock::new(HashMap::new()),
                local_addr: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                shutdown,
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    pub fn with_event_buffer(event_buffer: usize) -> Self {
        Self::new(NetworkConfig::with_event_buffer(event_buffer))
    }

    pub fn state(&self) -> ManagerState {
        *self.shared.state.lock()
    }

    fn ensure_idle(&self, op: &'static str) -> Result<(), NetError> {
        let state = self.state();
        if state != ManagerState::Idle {
            return Err(NetError::InvalidState {
                state: state.as_str(),
                op,
            });
        }
        Ok(())
    }

    /// Move `Idle → next`, failing if another call got there first.
    fn transition(&self, next: ManagerState, op: &'static str) -> Result<(), NetError> {
        let mut state = self.shared.state.lock();
        if *state != ManagerState::Idle {
            return Err(NetError::InvalidState {
                state: state.as_str(),
                op,
            });
        }
        *state = next;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------------

    /// Bind `handler` to `kind`. Replaces any previous handler for it.
    pub fn register_handler<F>(&self, kind: PacketKind, handler: F)
    where
        F: Fn(&TreeManager, &[u8], Option<&Connection>) + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .write()
            .insert(kind.key(), Arc::new(handler));
    }

    pub fn unregister_handler(&self, kind: PacketKind) -> bool {
        self.shared.handlers.write().remove(&kind.key()).is_some()
    }

    // -----------------------------------------------------------------------
    // Client mode
    // -----------------------------------------------------------------------

    /// Dial `addr`, send the handshake carrying `session_key`, then start
    /// the receive loop.
    pub async fn connect(&self, addr: &str, session_key: impl Into<Bytes>) -> Result<(), NetError> {
        self.ensure_idle("connect")?;
        let target = resolve(addr).await?;

        let stream = TcpStream::connect(target)
            .await
            .map_err(|source| NetError::Connect {
                addr: addr.to_string(),
                source,
            })?;

        let id = ConnectionId(self.shared.next_connection.fetch_add(1, Ordering::Relaxed));
        let (conn, io) = Connection::open(id, stream)?;

        if let Err(e) = conn.write_packet(&Packet::handshake(session_key)).await {
            conn.close().await;
            return Err(e);
        }

        if let Err(e) = self.transition(ManagerState::ClientConnected, "connect") {
            conn.close().await;
            return Err(e);
        }
        *self.shared.client.lock() = Some(Arc::clone(&conn));

        let ctx = LoopContext {
            events: self.shared.events_tx.clone(),
            shutdown: self.shared.shutdown.subscribe(),
            max_frame_len: self.shared.config.max_frame_len,
            tag_origin: false,
        };
        let span = tracing::info_span!("connection", id = %id, peer = %target, role = "client");
        let task = tokio::spawn(conn.run(io, ctx).instrument(span));
        self.shared.track(task);

        info!("Connected to {} as {}", target, id);
        Ok(())
    }

    /// Send on the client connection.
    pub fn send_packet(&self, ptype: u8, subtype: u8, payload: impl Into<Bytes>) -> Result<(), NetError> {
        let client = self.shared.client.lock().clone();
        match client {
            Some(conn) => conn.send_packet(ptype, subtype, payload),
            None => Err(NetError::NotConnected),
        }
    }

    // -----------------------------------------------------------------------
    // Server mode
    // -----------------------------------------------------------------------

    /// Bind `addr` and start accepting. Returns the bound address (useful
    /// with port 0).
    pub async fn serve(&self, addr: &str) -> Result<SocketAddr, NetError> {
        self.ensure_idle("serve")?;
        let target = resolve(addr).await?;

        let listener = TcpListener::bind(target)
            .await
            .map_err(|source| NetError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local = listener.local_addr()?;

        self.transition(ManagerState::ServerListening, "serve")?;
        *self.shared.local_addr.lock() = Some(local);

        let task = tokio::spawn(
            Arc::clone(&self.shared)
                .accept_loop(listener)
                .instrument(tracing::info_span!("accept", addr = %local)),
        );
        self.shared.track(task);

        info!("Listening on {}", local);
        Ok(local)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared.connections.read().values().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.read().len()
    }

    /// Queue `packet` on every accepted connection. Returns how many
    /// connections accepted it.
    pub fn broadcast_packet(&self, packet: &Packet) -> usize {
        self.connections()
            .iter()
            .filter(|conn| conn.send(packet.clone()).is_ok())
            .count()
    }

    // -----------------------------------------------------------------------
    // Owning-thread side
    // -----------------------------------------------------------------------

    /// Next queued event, without waiting.
    pub fn try_next_event(&self) -> Option<PacketEvent> {
        self.shared.events_rx.lock().try_recv().ok()
    }

    /// Everything queued right now, without waiting.
    pub fn drain_events(&self) -> Vec<PacketEvent> {
        let mut rx = self.shared.events_rx.lock();
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    /// Run the handler registered for `event`. Returns `false` when none is
    /// registered; the event is then dropped.
    pub fn invoke_handler(&self, event: &PacketEvent, tree: &TreeManager) -> bool {
        let handler = self.shared.handlers.read().get(&event.kind.key()).cloned();
        match handler {
            Some(handler) => {
                handler(tree, &event.payload, event.origin.as_deref());
                true
            }
            None => {
                info!("No handler for packet {}", event.kind);
                false
            }
        }
    }

    /// Drain the queue and dispatch every event in arrival order. Call once
    /// per tick from the thread that owns `tree`. Returns the number of
    /// events taken off the queue.
    pub fn process_events(&self, tree: &TreeManager) -> usize {
        let events = self.drain_events();
        for event in &events {
            self.invoke_handler(event, tree);
        }
        if !events.is_empty() {
            debug!("Processed {} network events", events.len());
        }
        events.len()
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Stop every task and close the queue.
    ///
    /// Order: raise the shutdown flag, close the client socket, close every
    /// accepted socket, wait for every spawned task to finish (the accept
    /// loop drops the listener on exit), then close the event queue. Events
    /// already queued can still be drained afterwards.
    pub async fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            if *state == ManagerState::Closed {
                return;
            }
            *state = ManagerState::Closed;
        }
        info!("NetworkManager shutting down");

        self.shared.shutdown.send_replace(true);

        let client = self.shared.client.lock().take();
        if let Some(conn) = client {
            conn.close().await;
        }

        for conn in self.connections() {
            conn.close().await;
        }

        // A finished task is a producer that has stopped for good.
        loop {
            let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.shared.tasks.lock());
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                if let Err(e) = task.await {
                    warn!("Network task ended abnormally: {}", e);
                }
            }
        }

        self.shared.events_rx.lock().close();
        info!("NetworkManager closed");
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr, NetError> {
    let invalid = |source| NetError::InvalidAddress {
        addr: addr.to_string(),
        source,
    };
    tokio::net::lookup_host(addr)
        .await
        .map_err(invalid)?
        .next()
        .ok_or_else(|| {
            invalid(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "address resolved to nothing",
            ))
        })
}
