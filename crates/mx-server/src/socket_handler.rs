//! Socket handlers: one per listener or client connection.
//!
//! The table is a fixed-capacity [`HandleTable`] sized to `max_sockets`.
//! Listeners take their slots first, at startup; clients take the lowest
//! free slot on accept and give it back on disconnect.
//!
//! Each client handler owns the sending end of its writer task's channel.
//! Outgoing frames are appended to the handler's backlog and moved to the
//! writer with non-blocking sends by [`SocketHandler::flush`]; a client that
//! stops reading therefore fills its own backlog, never the event loop.

use crate::event_handler::EventHandlerKind;
use crate::protocol::{DataFormat, Frame, ValueCodec};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use mx_core::limits::MAX_CLIENT_NAME_LENGTH;
use mx_core::{HandleTable, MxError, MxResult};
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Frames a client may have waiting before it is considered stuck.
pub const MAX_BACKLOG_FRAMES: usize = 4096;

/// Where a connection comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddress {
    /// A listening socket's own address.
    Listener(String),
    /// A TCP peer.
    Tcp(std::net::SocketAddr),
    /// A Unix domain socket peer.
    Unix,
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddress::Listener(addr) => write!(f, "listener {}", addr),
            PeerAddress::Tcp(addr) => write!(f, "{}", addr),
            PeerAddress::Unix => f.write_str("unix"),
        }
    }
}

/// Who the client says it is (SET_CLIENT_INFO).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    /// User name. Set once; later announcements do not change it.
    pub user: String,
    /// Remote program name.
    pub program: String,
    /// Remote process id.
    pub pid: Option<u32>,
}

impl ClientInfo {
    /// Apply a `user program [pid]` announcement.
    pub fn update(&mut self, text: &str) -> MxResult<()> {
        let mut words = text.trim_end_matches('\0').split_whitespace();
        let user = words
            .next()
            .ok_or_else(|| MxError::NullArgument("client info is empty".to_string()))?;
        if self.user.is_empty() {
            self.user = clip(user);
        }
        if let Some(program) = words.next() {
            self.program = clip(program);
        }
        if let Some(pid) = words.next() {
            let pid = pid
                .parse()
                .map_err(|_| MxError::IllegalArgument(format!("'{}' is not a process id", pid)))?;
            self.pid = Some(pid);
        }
        Ok(())
    }
}

fn clip(word: &str) -> String {
    let mut end = word.len().min(MAX_CLIENT_NAME_LENGTH);
    while !word.is_char_boundary(end) {
        end -= 1;
    }
    word[..end].to_string()
}

/// One slot's state.
pub struct SocketHandler {
    /// Handler kind.
    pub kind: EventHandlerKind,
    /// Connection generation; unique for the lifetime of the server.
    pub generation: u64,
    /// Session id used in logs.
    pub session_id: Uuid,
    /// Peer.
    pub peer: PeerAddress,
    /// When the slot was taken.
    pub connected_at: DateTime<Utc>,
    /// Announced client identity.
    pub client: ClientInfo,
    /// Negotiated value format.
    pub data_format: DataFormat,
    /// Send longs as 32-bit values.
    pub truncate_64bit_longs: bool,
    backlog: VecDeque<Bytes>,
    writer: Option<mpsc::Sender<Bytes>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SocketHandler {
    /// A listener slot.
    pub fn listener(kind: EventHandlerKind, address: impl Into<String>) -> Self {
        Self::new(kind, PeerAddress::Listener(address.into()), DataFormat::default(), None)
    }

    /// A client slot whose frames go to `writer`.
    pub fn client(peer: PeerAddress, data_format: DataFormat, writer: mpsc::Sender<Bytes>) -> Self {
        Self::new(EventHandlerKind::Client, peer, data_format, Some(writer))
    }

    fn new(
        kind: EventHandlerKind,
        peer: PeerAddress,
        data_format: DataFormat,
        writer: Option<mpsc::Sender<Bytes>>,
    ) -> Self {
        Self {
            kind,
            generation: 0,
            session_id: Uuid::new_v4(),
            peer,
            connected_at: Utc::now(),
            client: ClientInfo::default(),
            data_format,
            truncate_64bit_longs: false,
            backlog: VecDeque::new(),
            writer,
            tasks: Vec::new(),
        }
    }

    /// Value codec for this connection's current options.
    pub fn codec(&self) -> ValueCodec {
        ValueCodec {
            format: self.data_format,
            long_64: !self.truncate_64bit_longs,
        }
    }

    /// Attach one of the connection's reader or writer tasks; it is aborted
    /// when the handler is dropped.
    pub fn attach_task(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// Queue a frame for sending.
    pub fn enqueue(&mut self, frame: &Frame) -> MxResult<()> {
        if self.backlog.len() >= MAX_BACKLOG_FRAMES {
            return Err(MxError::WouldExceedLimit(format!(
                "{} frames already queued for {}",
                self.backlog.len(),
                self.peer
            )));
        }
        self.backlog.push_back(frame.encode());
        Ok(())
    }

    /// Frames waiting in the backlog.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Move as much of the backlog to the writer as it accepts without
    /// waiting. Returns the number of frames moved.
    ///
    /// A writer that has gone away (the peer reset the connection) is an
    /// `OperatingSystem` error.
    pub fn flush(&mut self) -> MxResult<usize> {
        let Some(writer) = &self.writer else {
            self.backlog.clear();
            return Ok(0);
        };
        let mut sent = 0;
        while let Some(bytes) = self.backlog.pop_front() {
            match writer.try_send(bytes) {
                Ok(()) => sent += 1,
                Err(TrySendError::Full(bytes)) => {
                    self.backlog.push_front(bytes);
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    self.backlog.clear();
                    return Err(MxError::OperatingSystem(format!(
                        "connection to {} is no longer writable",
                        self.peer
                    )));
                }
            }
        }
        Ok(sent)
    }
}

impl Drop for SocketHandler {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl fmt::Debug for SocketHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketHandler")
            .field("kind", &self.kind)
            .field("generation", &self.generation)
            .field("peer", &self.peer)
            .field("client", &self.client)
            .field("data_format", &self.data_format)
            .field("backlog", &self.backlog.len())
            .finish()
    }
}

/// Fixed-capacity table of socket handlers.
#[derive(Debug)]
pub struct SocketHandlerTable {
    handlers: HandleTable<SocketHandler>,
    next_generation: u64,
}

impl SocketHandlerTable {
    /// Preallocate `max_sockets` slots.
    pub fn new(max_sockets: usize) -> MxResult<Self> {
        Ok(Self {
            handlers: HandleTable::fixed(max_sockets)?,
            next_generation: 1,
        })
    }

    /// Store `handler` in the lowest free slot, stamping a fresh generation.
    ///
    /// A full table is `WouldExceedLimit` and the handler is dropped.
    pub fn insert(&mut self, mut handler: SocketHandler) -> MxResult<(usize, u64)> {
        let generation = self.next_generation;
        handler.generation = generation;
        let slot = self.handlers.alloc(handler)?;
        self.next_generation += 1;
        Ok((slot, generation))
    }

    /// Handler in `slot`, regardless of generation.
    pub fn get(&self, slot: usize) -> MxResult<&SocketHandler> {
        self.handlers.get(slot)
    }

    /// Mutable handler in `slot`, regardless of generation.
    pub fn get_mut(&mut self, slot: usize) -> MxResult<&mut SocketHandler> {
        self.handlers.get_mut(slot)
    }

    /// Handler in `slot` only if it is still the connection of `generation`.
    pub fn current(&mut self, slot: usize, generation: u64) -> Option<&mut SocketHandler> {
        self.handlers
            .get_mut(slot)
            .ok()
            .filter(|handler| handler.generation == generation)
    }

    /// Free `slot` and return its handler.
    pub fn release(&mut self, slot: usize) -> MxResult<SocketHandler> {
        self.handlers.release(slot)
    }

    /// Slots of client handlers that have frames waiting.
    pub fn slots_with_backlog(&self) -> Vec<usize> {
        self.handlers
            .iter()
            .filter(|(_, handler)| handler.kind.has_queued_events() && handler.backlog_len() > 0)
            .map(|(slot, _)| slot)
            .collect()
    }

    /// Slots of every client handler.
    pub fn client_slots(&self) -> Vec<usize> {
        self.handlers
            .iter()
            .filter(|(_, handler)| !handler.kind.is_listener())
            .map(|(slot, _)| slot)
            .collect()
    }

    /// Occupied slots.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True if no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.handlers.capacity()
    }
}
