//! State owned by the event loop.
//!
//! [`ServerContext`] holds everything a request may touch: the driver
//! registry, the record list, the record handle table, socket handlers and
//! callbacks. Only the event-loop task has it, so none of it is locked;
//! producers elsewhere reach the loop through the callback channel.

use crate::acl::ConnectionAcl;
use crate::callback::CallbackTable;
use crate::connection::{read_loop, write_loop, WRITER_QUEUE_DEPTH};
use crate::event_handler::{EventHandlerKind, HandlerEvent, InboundEvent, ServerNotice};
use crate::protocol::Frame;
use crate::server::ServerOptions;
use crate::socket_handler::{PeerAddress, SocketHandler, SocketHandlerTable};
use mx_core::field::FieldFlags;
use mx_core::limits::{handle_blocks_for_records, RECORD_HANDLE_BLOCK_SIZE};
use mx_core::{
    get_field_value, CallbackMessage, CallbackSender, DriverRegistry, FieldAddress, FieldValue,
    HandleTable, MxError, MxResult, RecordId, RecordList,
};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

const NOTICE_CAPACITY: usize = 256;

/// Everything the event loop owns.
pub struct ServerContext {
    pub(crate) registry: Arc<DriverRegistry>,
    pub(crate) records: RecordList,
    pub(crate) record_handles: HandleTable<RecordId>,
    pub(crate) sockets: SocketHandlerTable,
    pub(crate) callbacks: CallbackTable,
    pub(crate) acl: ConnectionAcl,
    pub(crate) options: ServerOptions,
    pub(crate) callback_sender: CallbackSender,
    pub(crate) events: mpsc::Sender<InboundEvent>,
    pub(crate) notices: broadcast::Sender<ServerNotice>,
}

impl ServerContext {
    /// Build the context and register the poll timer callback.
    pub fn new(
        options: ServerOptions,
        registry: Arc<DriverRegistry>,
        records: RecordList,
        acl: ConnectionAcl,
        callback_sender: CallbackSender,
        events: mpsc::Sender<InboundEvent>,
    ) -> MxResult<Self> {
        let record_handles = HandleTable::new(
            RECORD_HANDLE_BLOCK_SIZE,
            handle_blocks_for_records(records.len()),
        )?;
        let sockets = SocketHandlerTable::new(options.max_sockets)?;
        let mut callbacks = CallbackTable::new()?;
        callbacks.add_poll_timer(options.poll_interval)?;
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        Ok(Self {
            registry,
            records,
            record_handles,
            sockets,
            callbacks,
            acl,
            options,
            callback_sender,
            events,
            notices,
        })
    }

    /// The driver registry the database was built from.
    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    /// The record list.
    pub fn records(&self) -> &RecordList {
        &self.records
    }

    /// The socket handler table.
    pub fn sockets(&self) -> &SocketHandlerTable {
        &self.sockets
    }

    /// The callback table.
    pub fn callbacks(&self) -> &CallbackTable {
        &self.callbacks
    }

    pub(crate) fn publish(&self, notice: ServerNotice) {
        // Nobody listening is fine.
        let _ = self.notices.send(notice);
    }

    // =========================================================================
    // Listener handlers
    // =========================================================================

    /// Run the `init` step of a listener kind, which reserves its slot.
    ///
    /// Running out of slots here is fatal to startup.
    pub fn init_listener(&mut self, kind: EventHandlerKind, address: String) -> MxResult<usize> {
        if !kind.is_listener() {
            return Err(MxError::IllegalArgument(format!("{} is not a listener kind", kind)));
        }
        kind.handler().init(self, &address)?.ok_or_else(|| {
            MxError::CorruptDataStructure(format!("{} listener init reserved no slot", kind))
        })
    }

    /// Listener event: give an accepted connection a client slot and start
    /// its reader and writer tasks.
    ///
    /// Refused connections (ACL, full table) are dropped, which closes them;
    /// existing connections are not affected.
    pub fn accept_client<R, W>(&mut self, peer: PeerAddress, reader: R, writer: W) -> MxResult<usize>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        if let PeerAddress::Tcp(addr) = &peer {
            if !self.acl.permits(addr.ip()) {
                warn!(peer = %peer, "Connection refused by ACL");
                self.publish(ServerNotice::Refused {
                    peer: peer.to_string(),
                    reason: "not in ACL".to_string(),
                });
                return Err(MxError::PermissionDenied(format!("{} is not in the ACL", peer)));
            }
        } else {
            debug!(peer = %peer, "Local connection, ACL not checked");
        }

        let (tx, rx) = mpsc::channel(WRITER_QUEUE_DEPTH);
        let handler = SocketHandler::client(peer.clone(), self.options.data_format, tx);
        let (slot, generation) = match self.sockets.insert(handler) {
            Ok(inserted) => inserted,
            Err(err) => {
                warn!(peer = %peer, error = %err, "Connection refused, socket handler table is full");
                self.publish(ServerNotice::Refused {
                    peer: peer.to_string(),
                    reason: err.to_string(),
                });
                return Err(err);
            }
        };

        let reader_task = tokio::spawn(read_loop(reader, slot, generation, self.events.clone()));
        let writer_task = tokio::spawn(write_loop(writer, rx));
        let handler = self.sockets.get_mut(slot)?;
        handler.attach_task(reader_task);
        handler.attach_task(writer_task);

        info!(
            slot,
            peer = %peer,
            session = %handler.session_id,
            "Client connected"
        );
        self.publish(ServerNotice::Accepted {
            slot,
            peer: peer.to_string(),
        });
        Ok(slot)
    }

    // =========================================================================
    // Client handlers
    // =========================================================================

    /// Hand `event` to the handler of the kind occupying `slot`.
    pub async fn dispatch_event(&mut self, slot: usize, event: HandlerEvent) -> MxResult<()> {
        let kind = self.sockets.get(slot)?.kind;
        kind.handler().process_event(self, slot, event).await
    }

    /// Client event: a frame, a close, or a read failure.
    pub async fn process_event(&mut self, event: InboundEvent) {
        let InboundEvent {
            slot,
            generation,
            kind,
        } = event;
        if self.sockets.current(slot, generation).is_none() {
            debug!(slot, generation, "Dropping event for a connection that is gone");
            return;
        }
        if let Err(err) = self.dispatch_event(slot, HandlerEvent::Inbound(kind)).await {
            warn!(slot, error = %err, "Event not handled");
        }
    }

    /// Queue a frame for a client. A client whose backlog is full is
    /// disconnected.
    pub(crate) fn send_to(&mut self, slot: usize, frame: &Frame) -> MxResult<()> {
        let result = self.sockets.get_mut(slot)?.enqueue(frame);
        if let Err(err) = &result {
            self.close_client(slot, &err.to_string());
        }
        result
    }

    /// Queued-event pass: run the queued-event step of every slot with
    /// work waiting.
    pub fn process_queued_events(&mut self) {
        for slot in self.sockets.slots_with_backlog() {
            let Ok(kind) = self.sockets.get(slot).map(|handler| handler.kind) else {
                continue;
            };
            if let Err(err) = kind.handler().process_queued_event(self, slot) {
                warn!(slot, error = %err, "Queued event not handled");
            }
        }
    }

    /// Release a client slot and take the client off every callback.
    pub fn close_client(&mut self, slot: usize, reason: &str) {
        let handler = match self.sockets.release(slot) {
            Ok(handler) => handler,
            Err(_) => {
                debug!(slot, "Slot already released");
                return;
            }
        };
        let deleted = self.callbacks.remove_handler(slot);
        info!(
            slot,
            peer = %handler.peer,
            session = %handler.session_id,
            user = %handler.client.user,
            program = %handler.client.program,
            deleted_callbacks = deleted,
            reason,
            "Client disconnected"
        );
        drop(handler);
        self.publish(ServerNotice::Closed {
            slot,
            reason: reason.to_string(),
        });
    }

    // =========================================================================
    // Callbacks
    // =========================================================================

    /// Handle one message from the callback channel.
    pub async fn process_callback_message(&mut self, message: CallbackMessage) {
        match message {
            CallbackMessage::Poll => self.poll_callbacks().await,
            CallbackMessage::ValueChanged(field) => {
                if self.callbacks.for_field(field).is_none() {
                    debug!(record = %field.record, ordinal = field.ordinal, "No callback for changed field");
                    return;
                }
                self.run_field_callback(field, true).await;
            }
        }
    }

    /// Re-read every POLL-flagged field that has a callback and notify on
    /// change.
    async fn poll_callbacks(&mut self) {
        for field in self.callbacks.watched_fields() {
            let polled = self
                .records
                .get(field.record)
                .and_then(|record| record.field(field.ordinal))
                .map(|f| f.flags.contains(FieldFlags::POLL))
                .unwrap_or(false);
            if polled {
                self.run_field_callback(field, false).await;
            }
        }
    }

    async fn run_field_callback(&mut self, field: FieldAddress, always_notify: bool) {
        match self.callbacks.for_field_mut(field) {
            Some(callback) => {
                if !callback.enter() {
                    debug!(record = %field.record, ordinal = field.ordinal, "Callback already running");
                    return;
                }
            }
            None => return,
        }

        let read = match self.records.get_mut(field.record) {
            Ok(record) => get_field_value(record, field.ordinal).await,
            Err(err) => Err(err),
        };

        let Some(callback) = self.callbacks.for_field_mut(field) else {
            return;
        };
        callback.leave();
        let value = match read {
            Ok(value) => value,
            Err(err) => {
                debug!(record = %field.record, ordinal = field.ordinal, error = %err, "Callback read failed");
                return;
            }
        };
        if callback.update(&value) || always_notify {
            self.notify(field, &value);
        }
    }

    /// A client wrote `field`; its callback fires with the stored value.
    pub(crate) fn field_written(&mut self, field: FieldAddress, value: &FieldValue) {
        if let Some(callback) = self.callbacks.for_field_mut(field) {
            callback.update(value);
            self.notify(field, value);
        }
    }

    /// A client read `field`. A process function that moved the value
    /// fires its callback, as a write would.
    pub(crate) fn field_read(&mut self, field: FieldAddress, value: &FieldValue) {
        if let Some(callback) = self.callbacks.for_field_mut(field) {
            if callback.update(value) {
                self.notify(field, value);
            }
        }
    }

    /// Queue a notification for every client on the field's interested list.
    pub(crate) fn notify(&mut self, field: FieldAddress, value: &FieldValue) {
        let Some(callback) = self.callbacks.for_field(field) else {
            return;
        };
        let id = callback.id;
        let slots: Vec<usize> = callback.interested().collect();

        for slot in slots {
            let codec = match self.sockets.get(slot) {
                Ok(handler) => handler.codec(),
                Err(_) => continue,
            };
            let frame = match codec.encode(value) {
                Ok(body) => Frame::callback(id, body),
                Err(err) => {
                    debug!(slot, error = %err, "Cannot encode callback value for this connection");
                    continue;
                }
            };
            if self.send_to(slot, &frame).is_ok() {
                debug!(slot, callback_id = %format!("{:#x}", id), "Queued callback");
            }
        }
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Disconnect every client and close every record.
    pub async fn shutdown(&mut self) {
        for slot in self.sockets.client_slots() {
            self.close_client(slot, "server shutting down");
        }
        self.records.close_all().await;
        info!("Server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_handler::InboundKind;
    use mx_driver_soft::{register_all, LIST_HEAD_RECORD_NAME};

    fn context() -> ServerContext {
        let mut registry = DriverRegistry::new();
        register_all(&mut registry).unwrap();
        let head = registry.list_head().unwrap().clone();
        let records = RecordList::new(head, LIST_HEAD_RECORD_NAME).unwrap();
        let (sender, _) = CallbackSender::channel(8);
        let (events, _) = mpsc::channel(8);
        ServerContext::new(
            ServerOptions::default(),
            Arc::new(registry),
            records,
            ConnectionAcl::allow_all(),
            sender,
            events,
        )
        .unwrap()
    }

    fn connection(peer: PeerAddress) -> HandlerEvent {
        let (server_end, _) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(server_end);
        HandlerEvent::Connection {
            peer,
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    #[test]
    fn only_listener_kinds_reserve_slots() {
        let mut ctx = context();
        assert_eq!(ctx.init_listener(EventHandlerKind::TcpServer, "127.0.0.1:0".into()).unwrap(), 0);
        assert!(matches!(
            ctx.init_listener(EventHandlerKind::Client, "nowhere".into()),
            Err(MxError::IllegalArgument(_))
        ));
        assert_eq!(EventHandlerKind::Client.handler().init(&mut ctx, "nowhere").unwrap(), None);
        assert_eq!(ctx.sockets().len(), 1);
    }

    #[tokio::test]
    async fn events_go_to_the_handler_of_the_slot_kind() {
        let mut ctx = context();
        let listener = ctx.init_listener(EventHandlerKind::UnixServer, "/tmp/mx.sock".into()).unwrap();

        ctx.dispatch_event(listener, connection(PeerAddress::Unix))
            .await
            .unwrap();
        assert_eq!(ctx.sockets().client_slots(), vec![1]);

        assert!(matches!(
            ctx.dispatch_event(listener, HandlerEvent::Inbound(InboundKind::Closed)).await,
            Err(MxError::Unsupported(_))
        ));
        assert!(matches!(
            ctx.dispatch_event(1, connection(PeerAddress::Unix)).await,
            Err(MxError::Unsupported(_))
        ));

        ctx.dispatch_event(1, HandlerEvent::Inbound(InboundKind::Closed))
            .await
            .unwrap();
        assert!(ctx.sockets().client_slots().is_empty());
        assert!(matches!(
            ctx.dispatch_event(1, HandlerEvent::Inbound(InboundKind::Closed)).await,
            Err(MxError::NotFound(_))
        ));
    }
}
