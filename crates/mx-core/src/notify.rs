//! Producer side of the callback channel.
//!
//! Anything that notices a field change outside a client request (the poll
//! timer, a device's background task) posts a [`CallbackMessage`] through a
//! [`CallbackSender`]. The server's event loop owns the only receiver and
//! turns messages into per-connection notifications.

use crate::error::{MxError, MxResult};
use crate::record::RecordId;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// A field identified by record id and field ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldAddress {
    /// Owning record.
    pub record: RecordId,
    /// Index in the record's field array.
    pub ordinal: usize,
}

impl FieldAddress {
    /// Build an address.
    pub fn new(record: RecordId, ordinal: usize) -> Self {
        Self { record, ordinal }
    }
}

/// Message carried by the callback channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackMessage {
    /// Poll every field flagged for change detection.
    Poll,
    /// A producer knows this field changed.
    ValueChanged(FieldAddress),
}

/// Cloneable, thread-safe producer handle for the callback channel.
#[derive(Debug, Clone)]
pub struct CallbackSender {
    tx: mpsc::Sender<CallbackMessage>,
}

impl CallbackSender {
    /// Create a bounded channel and return both ends.
    pub fn channel(capacity: usize) -> (CallbackSender, mpsc::Receiver<CallbackMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (CallbackSender { tx }, rx)
    }

    /// Post without waiting.
    ///
    /// A full channel returns `WouldExceedLimit`; a closed one (server gone)
    /// returns `NotFound`.
    pub fn post(&self, message: CallbackMessage) -> MxResult<()> {
        self.tx.try_send(message).map_err(|err| match err {
            TrySendError::Full(_) => {
                MxError::WouldExceedLimit("callback channel is full".to_string())
            }
            TrySendError::Closed(_) => {
                MxError::NotFound("callback channel receiver is gone".to_string())
            }
        })
    }

    /// Post, waiting for room in the channel.
    pub async fn send(&self, message: CallbackMessage) -> MxResult<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| MxError::NotFound("callback channel receiver is gone".to_string()))
    }

    /// Shorthand for posting a value-changed message.
    pub fn value_changed(&self, field: FieldAddress) -> MxResult<()> {
        self.post(CallbackMessage::ValueChanged(field))
    }

    /// True once the receiver has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
