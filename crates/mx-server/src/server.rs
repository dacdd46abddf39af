//! The server event loop.
//!
//! One task owns the [`ServerContext`] and waits on every event source at
//! once: the TCP listener, the optional Unix listener, frames from client
//! reader tasks, the callback channel and the shutdown signal. After each
//! dispatched event the queued-event pass pushes client backlogs out.

use crate::acl::ConnectionAcl;
use crate::context::ServerContext;
use crate::event_handler::{EventHandlerKind, HandlerEvent, InboundEvent, ServerNotice};
use crate::protocol::DataFormat;
use crate::socket_handler::PeerAddress;
use mx_core::limits::{CALLBACK_POLL_INTERVAL, CALLBACK_QUEUE_CAPACITY};
use mx_core::{CallbackMessage, CallbackSender, DriverRegistry, MxError, MxResult, RecordList};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[cfg(unix)]
type LocalListener = tokio::net::UnixListener;
#[cfg(not(unix))]
type LocalListener = std::convert::Infallible;

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 9727;

/// Default size of the socket handler table, listeners included.
pub const DEFAULT_MAX_SOCKETS: usize = 100;

/// Inbound events buffered between reader tasks and the loop.
const INBOUND_QUEUE_DEPTH: usize = 1024;

/// Network-facing server settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerOptions {
    /// Address the TCP listener binds.
    pub bind_address: IpAddr,
    /// TCP port; 0 picks a free port.
    pub port: u16,
    /// Path of the Unix domain socket, if one is wanted.
    pub unix_path: Option<PathBuf>,
    /// Size of the socket handler table.
    pub max_sockets: usize,
    /// Value format new clients start with.
    pub data_format: DataFormat,
    /// Callback poll timer period.
    pub poll_interval: Duration,
    /// Capacity of the callback channel.
    pub callback_queue_capacity: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            unix_path: None,
            max_sockets: DEFAULT_MAX_SOCKETS,
            data_format: DataFormat::default(),
            poll_interval: CALLBACK_POLL_INTERVAL,
            callback_queue_capacity: CALLBACK_QUEUE_CAPACITY,
        }
    }
}

/// Stops a running server from any task.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Ask the event loop to stop.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

enum Accepted {
    Tcp(TcpStream, SocketAddr),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream, usize),
}

/// A bound server, ready to [`run`](MxServer::run).
pub struct MxServer {
    ctx: ServerContext,
    tcp: TcpListener,
    tcp_slot: usize,
    local: Option<(LocalListener, usize)>,
    local_addr: SocketAddr,
    events_rx: mpsc::Receiver<InboundEvent>,
    callbacks_rx: mpsc::Receiver<CallbackMessage>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl MxServer {
    /// Bind the listeners and reserve their socket handler slots.
    ///
    /// `callbacks` is the channel the database's drivers were constructed
    /// with; the server becomes its only consumer.
    pub async fn bind(
        options: ServerOptions,
        registry: Arc<DriverRegistry>,
        records: RecordList,
        acl: ConnectionAcl,
        callbacks: (CallbackSender, mpsc::Receiver<CallbackMessage>),
    ) -> MxResult<MxServer> {
        let (callback_sender, callbacks_rx) = callbacks;
        let (events_tx, events_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let mut ctx = ServerContext::new(
            options.clone(),
            registry,
            records,
            acl,
            callback_sender,
            events_tx,
        )?;

        let tcp = TcpListener::bind((options.bind_address, options.port))
            .await
            .map_err(|err| {
                MxError::OperatingSystem(format!(
                    "cannot bind {}:{}: {}",
                    options.bind_address, options.port, err
                ))
            })?;
        let local_addr = tcp.local_addr()?;
        let tcp_slot = ctx.init_listener(EventHandlerKind::TcpServer, local_addr.to_string())?;

        let local = match &options.unix_path {
            Some(path) => {
                let listener = bind_local(path)?;
                let slot =
                    ctx.init_listener(EventHandlerKind::UnixServer, path.display().to_string())?;
                Some((listener, slot))
            }
            None => None,
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(MxServer {
            ctx,
            tcp,
            tcp_slot,
            local,
            local_addr,
            events_rx,
            callbacks_rx,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }

    /// Address the TCP listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Subscribe to connection lifecycle notices.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerNotice> {
        self.ctx.notices.subscribe()
    }

    /// A handle that stops [`run`](MxServer::run).
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// The state owned by the loop.
    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }

    /// Run until shut down, then disconnect clients and close all records.
    pub async fn run(mut self) -> MxResult<()> {
        info!(
            address = %self.local_addr,
            records = self.ctx.records.len(),
            max_sockets = self.ctx.sockets.capacity(),
            "Server running"
        );
        let poll_task = spawn_poll_timer(
            self.ctx.callback_sender.clone(),
            self.ctx.options.poll_interval,
        );

        loop {
            tokio::select! {
                accepted = self.tcp.accept() => match accepted {
                    Ok((stream, peer)) => self.accept(Accepted::Tcp(stream, peer)).await,
                    Err(err) => warn!(error = %err, "TCP accept failed"),
                },
                accepted = accept_local(&self.local) => match accepted {
                    Ok(accepted) => self.accept(accepted).await,
                    Err(err) => warn!(error = %err, "Unix accept failed"),
                },
                Some(event) = self.events_rx.recv() => {
                    self.ctx.process_event(event).await;
                }
                Some(message) = self.callbacks_rx.recv() => {
                    self.ctx.process_callback_message(message).await;
                }
                _ = self.shutdown_rx.changed() => {
                    info!("Shutdown requested");
                    break;
                }
            }
            self.ctx.process_queued_events();
        }

        poll_task.abort();
        self.ctx.shutdown().await;
        if let Some(path) = &self.ctx.options.unix_path {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }

    /// Hand an accepted connection to the listener slot it arrived on.
    async fn accept(&mut self, accepted: Accepted) {
        let (slot, event) = match accepted {
            Accepted::Tcp(stream, peer) => {
                let _ = stream.set_nodelay(true);
                let (reader, writer) = stream.into_split();
                (
                    self.tcp_slot,
                    HandlerEvent::Connection {
                        peer: PeerAddress::Tcp(peer),
                        reader: Box::new(reader),
                        writer: Box::new(writer),
                    },
                )
            }
            #[cfg(unix)]
            Accepted::Unix(stream, slot) => {
                let (reader, writer) = stream.into_split();
                (
                    slot,
                    HandlerEvent::Connection {
                        peer: PeerAddress::Unix,
                        reader: Box::new(reader),
                        writer: Box::new(writer),
                    },
                )
            }
        };
        if let Err(err) = self.ctx.dispatch_event(slot, event).await {
            debug!(error = %err, "Connection not accepted");
        }
    }
}

/// Post a poll message every `period`. A full channel skips the tick.
fn spawn_poll_timer(sender: CallbackSender, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval.tick().await;
        loop {
            interval.tick().await;
            match sender.post(CallbackMessage::Poll) {
                Ok(()) => {}
                Err(MxError::WouldExceedLimit(_)) => debug!("Callback channel full, skipping poll"),
                Err(err) => {
                    debug!(error = %err, "Poll timer stopping");
                    break;
                }
            }
        }
    })
}

#[cfg(unix)]
fn bind_local(path: &std::path::Path) -> MxResult<LocalListener> {
    use std::os::unix::fs::FileTypeExt;

    if let Ok(metadata) = std::fs::symlink_metadata(path) {
        if !metadata.file_type().is_socket() {
            return Err(MxError::IllegalArgument(format!(
                "{} exists and is not a socket",
                path.display()
            )));
        }
        warn!(path = %path.display(), "Removing stale Unix socket");
        std::fs::remove_file(path)?;
    }
    tokio::net::UnixListener::bind(path).map_err(|err| {
        error!(path = %path.display(), error = %err, "Cannot bind Unix socket");
        MxError::OperatingSystem(format!("cannot bind {}: {}", path.display(), err))
    })
}

#[cfg(not(unix))]
fn bind_local(path: &std::path::Path) -> MxResult<LocalListener> {
    Err(MxError::Unsupported(format!(
        "Unix domain sockets are not available here ({})",
        path.display()
    )))
}

#[cfg(unix)]
async fn accept_local(listener: &Option<(LocalListener, usize)>) -> std::io::Result<Accepted> {
    match listener {
        Some((listener, slot)) => {
            let (stream, _) = listener.accept().await?;
            Ok(Accepted::Unix(stream, *slot))
        }
        None => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn accept_local(listener: &Option<(LocalListener, usize)>) -> std::io::Result<Accepted> {
    match listener {
        Some((never, _)) => match *never {},
        None => std::future::pending().await,
    }
}
