//! `mx-server`
//!
//! Network side of rust-mx: the wire protocol, the socket handler table,
//! server-side callbacks and the event loop tying them together.
//!
//! ## Architecture
//!
//! ```text
//!  TCP / Unix listeners ─┐
//!  client reader tasks ──┼──> event loop (owns ServerContext) ──> client writer tasks
//!  callback channel ─────┘          │
//!        ^                          └─ queued-event pass after every dispatch
//!        └── poll timer, drivers (CallbackSender)
//! ```
//!
//! A single task owns every record, handle table and socket handler, so
//! request handling never locks. Connections are split into a reader task
//! that only frames bytes and a writer task that only drains its channel.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mx_server::{ConnectionAcl, MxServer, ServerOptions};
//!
//! let server = MxServer::bind(options, registry, records, ConnectionAcl::allow_all(), callbacks).await?;
//! let stop = server.shutdown_handle();
//! tokio::spawn(server.run());
//! // ...
//! stop.shutdown();
//! ```

pub mod acl;
pub mod callback;
pub mod client;
mod connection;
pub mod context;
pub mod event_handler;
pub mod protocol;
mod request;
pub mod server;
pub mod socket_handler;

pub use acl::ConnectionAcl;
pub use callback::{Callback, CallbackClass, CallbackTable, CallbackType};
pub use client::{CallbackNotice, FieldHandle, MxClient};
pub use context::ServerContext;
pub use event_handler::{EventHandler, EventHandlerKind, HandlerEvent, ServerNotice};
pub use protocol::{DataFormat, Frame, MessageType, NetworkOption, ValueCodec};
pub use server::{MxServer, ServerOptions, ShutdownHandle, DEFAULT_MAX_SOCKETS, DEFAULT_PORT};
pub use socket_handler::{ClientInfo, PeerAddress, SocketHandler, SocketHandlerTable};
