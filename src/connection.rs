//! One live byte-stream endpoint: the dialled socket in client mode, or one
//! accepted socket in server mode.
//!
//! ## Task layout
//!
//! ```text
//! connection task
//!   ├── receive loop   read frame → PacketEvent → event queue (blocks when full)
//!   └── write loop     outbox → frame → socket (under the send lock)
//! ```
//!
//! Both loops run inside one task; when either ends, the other is dropped
//! and the write half is shut down.

use crate::codec;
use crate::error::NetError;
use crate::network::PacketEvent;
use crate::protocol::{Packet, PacketKind};
use crate::types::ConnectionId;
use bytes::Bytes;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};

/// Socket halves and the outbox receiver, consumed by [`Connection::run`].
pub(crate) struct ConnectionIo {
    reader: OwnedReadHalf,
    outbox: mpsc::UnboundedReceiver<Packet>,
}

/// Everything a receive loop needs from its manager.
pub(crate) struct LoopContext {
    pub events: mpsc::Sender<PacketEvent>,
    pub shutdown: watch::Receiver<bool>,
    pub max_frame_len: u32,
    /// Server side: tag events with this connection so handlers can reply.
    pub tag_origin: bool,
}

#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    /// Send lock. `None` once the connection has been closed.
    writer: Mutex<Option<OwnedWriteHalf>>,
    outbox: mpsc::UnboundedSender<Packet>,
}

impl Connection {
    pub(crate) fn open(id: ConnectionId, stream: TcpStream) -> std::io::Result<(Arc<Self>, ConnectionIo)> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();

        let conn = Arc::new(Self {
            id,
            peer_addr,
            writer: Mutex::new(Some(writer)),
            outbox: outbox_tx,
        });
        Ok((
            conn,
            ConnectionIo {
                reader,
                outbox: outbox_rx,
            },
        ))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Queue a packet for this peer. Safe to call from synchronous handler
    /// code; frames leave in the order they were queued.
    pub fn send(&self, packet: Packet) -> Result<(), NetError> {
        self.outbox.send(packet).map_err(|_| NetError::Closed)
    }

    pub fn send_packet(&self, ptype: u8, subtype: u8, payload: impl Into<Bytes>) -> Result<(), NetError> {
        self.send(Packet::new(PacketKind::new(ptype, subtype), payload))
    }

    /// Write one frame directly, holding the send lock for the whole frame
    /// so concurrent senders never interleave partial frames.
    pub async fn write_packet(&self, packet: &Packet) -> Result<(), NetError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(NetError::Closed)?;
        codec::write_packet(writer, packet).await?;
        Ok(())
    }

    /// Shut down the write half. Further sends fail with [`NetError::Closed`].
    pub async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("{} shutdown: {}", self.id, e);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Task body
    // -----------------------------------------------------------------------

    pub(crate) async fn run(self: Arc<Self>, io: ConnectionIo, mut ctx: LoopContext) {
        let ConnectionIo { reader, outbox } = io;
        tokio::select! {
            _ = self.receive_loop(reader, &mut ctx) => {}
            _ = self.write_loop(outbox) => {}
        }
        self.close().await;
        debug!("{} task finished", self.id);
    }

    async fn receive_loop(self: &Arc<Self>, mut reader: OwnedReadHalf, ctx: &mut LoopContext) {
        loop {
            let packet = tokio::select! {
                _ = wait_shutdown(&mut ctx.shutdown) => return,
                read = codec::read_packet(&mut reader, ctx.max_frame_len) => match read {
                    Ok(Some(packet)) => packet,
                    Ok(None) => {
                        info!("{} closed by peer {}", self.id, self.peer_addr);
                        return;
                    }
                    Err(e) => {
                        warn!("{} dropped: {}", self.id, e);
                        return;
                    }
                },
            };

            debug!(
                "{} received {} ({} bytes)",
                self.id,
                packet.kind,
                packet.payload.len()
            );

            let event = PacketEvent {
                kind: packet.kind,
                payload: packet.payload,
                origin: ctx.tag_origin.then(|| Arc::clone(self)),
            };

            // Blocks while the queue is full; the owning thread sets the pace.
            tokio::select! {
                _ = wait_shutdown(&mut ctx.shutdown) => return,
                sent = ctx.events.send(event) => {
                    if sent.is_err() {
                        error!("{} event queue closed while still receiving", self.id);
                        return;
                    }
                }
            }
        }
    }

    async fn write_loop(&self, mut outbox: mpsc::UnboundedReceiver<Packet>) {
        while let Some(packet) = outbox.recv().await {
            if let Err(e) = self.write_packet(&packet).await {
                warn!("{} send of {} failed: {}", self.id, packet.kind, e);
                return;
            }
        }
    }
}

/// Resolves once the shutdown flag is raised (or its sender is gone).
/// Cancel-safe, so it can sit in a `select!` next to socket I/O.
pub(crate) async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
