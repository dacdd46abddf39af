//! Event-handler kinds and the events delivered to them.
//!
//! Every occupied slot of the socket handler table belongs to one of three
//! kinds. Each kind carries an [`EventHandler`] with its capabilities:
//! listener slots are reserved by `init` and turn accepted connections into
//! client slots; client slots handle inbound frames and own an outbound
//! backlog that the loop drains with the queued-event pass after every
//! dispatch.

use crate::context::ServerContext;
use crate::protocol::Frame;
use crate::socket_handler::{PeerAddress, SocketHandler};
use async_trait::async_trait;
use mx_core::{MxError, MxResult};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

/// What a socket handler slot serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventHandlerKind {
    /// TCP listener.
    TcpServer,
    /// Unix domain socket listener.
    UnixServer,
    /// An accepted client connection.
    Client,
}

impl EventHandlerKind {
    /// Name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            EventHandlerKind::TcpServer => "tcp_server",
            EventHandlerKind::UnixServer => "unix_server",
            EventHandlerKind::Client => "client",
        }
    }

    /// True for the listener kinds.
    pub fn is_listener(self) -> bool {
        matches!(self, EventHandlerKind::TcpServer | EventHandlerKind::UnixServer)
    }

    /// True if this kind has a queued-event step (an outbound backlog).
    pub fn has_queued_events(self) -> bool {
        self == EventHandlerKind::Client
    }

    /// The capabilities of this kind.
    pub fn handler(self) -> &'static dyn EventHandler {
        match self {
            EventHandlerKind::TcpServer => &TCP_SERVER,
            EventHandlerKind::UnixServer => &UNIX_SERVER,
            EventHandlerKind::Client => &CLIENT,
        }
    }
}

impl fmt::Display for EventHandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a connection's reader task observed.
#[derive(Debug)]
pub enum InboundKind {
    /// A complete frame.
    Frame(Frame),
    /// The peer closed the connection between frames.
    Closed,
    /// Reading failed or the peer broke the protocol.
    Failed(MxError),
}

/// An event addressed to one client slot.
///
/// `generation` identifies the connection that produced it, so an event
/// still in flight when its slot is reused is recognized and dropped.
#[derive(Debug)]
pub struct InboundEvent {
    /// Socket handler slot.
    pub slot: usize,
    /// Generation of the connection in that slot.
    pub generation: u64,
    /// What happened.
    pub kind: InboundKind,
}

/// Read half of an accepted connection.
pub type ConnectionReader = Box<dyn AsyncRead + Unpin + Send>;
/// Write half of an accepted connection.
pub type ConnectionWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// An event handed to the handler of one slot.
pub enum HandlerEvent {
    /// A listener accepted a connection.
    Connection {
        /// Who connected.
        peer: PeerAddress,
        /// Read half.
        reader: ConnectionReader,
        /// Write half.
        writer: ConnectionWriter,
    },
    /// A client's reader task observed something.
    Inbound(InboundKind),
}

impl fmt::Debug for HandlerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerEvent::Connection { peer, .. } => {
                f.debug_struct("Connection").field("peer", peer).finish()
            }
            HandlerEvent::Inbound(kind) => f.debug_tuple("Inbound").field(kind).finish(),
        }
    }
}

/// Capabilities of one event-handler kind.
///
/// The loop never branches on the kind itself: it looks up the slot's kind
/// and calls through this trait.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// The kind this handler serves.
    fn kind(&self) -> EventHandlerKind;

    /// Set the handler up at startup. Listeners reserve a slot and return
    /// it; kinds without startup work return `None`.
    fn init(&self, ctx: &mut ServerContext, address: &str) -> MxResult<Option<usize>>;

    /// Handle one event addressed to `slot`.
    async fn process_event(
        &self,
        ctx: &mut ServerContext,
        slot: usize,
        event: HandlerEvent,
    ) -> MxResult<()>;

    /// Queued-event step for `slot`. Only called when the kind
    /// [`has_queued_events`](EventHandlerKind::has_queued_events).
    fn process_queued_event(&self, _ctx: &mut ServerContext, _slot: usize) -> MxResult<()> {
        Ok(())
    }
}

/// TCP and Unix listeners.
#[derive(Debug)]
pub struct ListenerHandler {
    kind: EventHandlerKind,
}

/// Accepted client connections.
#[derive(Debug)]
pub struct ClientHandler;

static TCP_SERVER: ListenerHandler = ListenerHandler {
    kind: EventHandlerKind::TcpServer,
};
static UNIX_SERVER: ListenerHandler = ListenerHandler {
    kind: EventHandlerKind::UnixServer,
};
static CLIENT: ClientHandler = ClientHandler;

#[async_trait]
impl EventHandler for ListenerHandler {
    fn kind(&self) -> EventHandlerKind {
        self.kind
    }

    /// Running out of slots here is fatal to startup.
    fn init(&self, ctx: &mut ServerContext, address: &str) -> MxResult<Option<usize>> {
        let kind = self.kind;
        let handler = SocketHandler::listener(kind, address);
        let (slot, _) = ctx.sockets.insert(handler).map_err(|err| match err {
            MxError::WouldExceedLimit(_) => MxError::WouldExceedLimit(format!(
                "no socket handler slot left for the {} listener on {} (max_sockets = {})",
                kind,
                address,
                ctx.sockets.capacity()
            )),
            other => other,
        })?;
        info!(slot, kind = %kind, address = %address, "Listener ready");
        ctx.publish(ServerNotice::Listening { slot, kind });
        Ok(Some(slot))
    }

    async fn process_event(
        &self,
        ctx: &mut ServerContext,
        slot: usize,
        event: HandlerEvent,
    ) -> MxResult<()> {
        match event {
            HandlerEvent::Connection {
                peer,
                reader,
                writer,
            } => ctx.accept_client(peer, reader, writer).map(|_| ()),
            HandlerEvent::Inbound(kind) => Err(MxError::Unsupported(format!(
                "{} slot {} does not take client events ({:?})",
                self.kind, slot, kind
            ))),
        }
    }
}

#[async_trait]
impl EventHandler for ClientHandler {
    fn kind(&self) -> EventHandlerKind {
        EventHandlerKind::Client
    }

    fn init(&self, _ctx: &mut ServerContext, _address: &str) -> MxResult<Option<usize>> {
        Ok(None)
    }

    async fn process_event(
        &self,
        ctx: &mut ServerContext,
        slot: usize,
        event: HandlerEvent,
    ) -> MxResult<()> {
        match event {
            HandlerEvent::Inbound(InboundKind::Frame(frame)) => {
                if let Err(err) = ctx.handle_frame(slot, frame).await {
                    ctx.close_client(slot, &err.to_string());
                }
            }
            HandlerEvent::Inbound(InboundKind::Closed) => ctx.close_client(slot, "closed by peer"),
            HandlerEvent::Inbound(InboundKind::Failed(err)) => {
                warn!(slot, error = %err, "Connection failed");
                ctx.close_client(slot, &err.to_string());
            }
            HandlerEvent::Connection { peer, .. } => {
                return Err(MxError::Unsupported(format!(
                    "client slot {} cannot accept a connection from {}",
                    slot, peer
                )));
            }
        }
        Ok(())
    }

    /// Move the backlog to the writer; a client that cannot take it is
    /// disconnected.
    fn process_queued_event(&self, ctx: &mut ServerContext, slot: usize) -> MxResult<()> {
        let flushed = ctx.sockets.get_mut(slot).and_then(|handler| handler.flush());
        if let Err(err) = flushed {
            ctx.close_client(slot, &err.to_string());
        }
        Ok(())
    }
}

/// Lifecycle notices published by the server for observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerNotice {
    /// A listener slot was reserved at startup.
    Listening {
        /// Slot holding the listener.
        slot: usize,
        /// Listener kind.
        kind: EventHandlerKind,
    },
    /// A client connection took a slot.
    Accepted {
        /// Slot given to the connection.
        slot: usize,
        /// Peer description.
        peer: String,
    },
    /// A connection was refused before taking a slot.
    Refused {
        /// Peer description.
        peer: String,
        /// Why.
        reason: String,
    },
    /// A client slot was released.
    Closed {
        /// Released slot.
        slot: usize,
        /// Why.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_clients_have_a_backlog() {
        assert!(EventHandlerKind::Client.has_queued_events());
        assert!(!EventHandlerKind::TcpServer.has_queued_events());
        assert!(EventHandlerKind::UnixServer.is_listener());
        assert!(!EventHandlerKind::Client.is_listener());
    }

    #[test]
    fn each_kind_has_its_own_handler() {
        for kind in [
            EventHandlerKind::TcpServer,
            EventHandlerKind::UnixServer,
            EventHandlerKind::Client,
        ] {
            assert_eq!(kind.handler().kind(), kind);
        }
    }
}
