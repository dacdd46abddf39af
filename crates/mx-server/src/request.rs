//! Client request dispatch.
//!
//! Every request gets exactly one reply carrying the request's message id.
//! Failures become error replies with the error's status code; only a
//! failure to queue the reply itself costs the client its connection.

use crate::context::ServerContext;
use crate::protocol::{
    field_type_body, read_words, split_field_name, split_name, words, DataFormat, Frame,
    MessageType, NetworkOption, CALLBACK_TYPE_VALUE_CHANGED,
};
use bytes::Bytes;
use mx_core::field::FieldFlags;
use mx_core::{get_field_value, put_field_value, FieldAddress, MxError, MxResult};
use tracing::{debug, trace};

impl ServerContext {
    /// Answer one frame from the client in `slot`.
    ///
    /// Returns an error only when the reply could not be queued, in which
    /// case the client has already been disconnected.
    pub async fn handle_frame(&mut self, slot: usize, frame: Frame) -> MxResult<()> {
        let header = frame.header;
        let reply = match frame.message_type() {
            Some(kind) if !header.is_reply() => {
                trace!(slot, message_id = header.message_id, kind = %kind, "Request");
                match self.dispatch(slot, kind, &frame.body).await {
                    Ok(body) => Frame::reply(&header, body),
                    Err(err) => {
                        debug!(
                            slot,
                            message_id = header.message_id,
                            kind = %kind,
                            error = %err,
                            "Request failed"
                        );
                        Frame::error_reply(&header, &err)
                    }
                }
            }
            _ => {
                let err = MxError::Unsupported(format!(
                    "message type {:#x} is not a request this server handles",
                    header.message_type
                ));
                debug!(slot, error = %err, "Unexpected message");
                Frame::error_reply(&header, &err)
            }
        };
        self.send_to(slot, &reply)
    }

    /// Run one request and produce the reply body.
    pub(crate) async fn dispatch(
        &mut self,
        slot: usize,
        kind: MessageType,
        body: &[u8],
    ) -> MxResult<Bytes> {
        match kind {
            MessageType::GetArrayByName => {
                let (name, _) = split_name(body)?;
                let field = self.resolve_name(name)?;
                self.get_value(slot, field).await
            }
            MessageType::PutArrayByName => {
                let (name, data) = split_name(body)?;
                let field = self.resolve_name(name)?;
                self.put_value(slot, field, data).await
            }
            MessageType::GetArrayByHandle => {
                let ([record_handle, ordinal], _) = read_words::<2>(body)?;
                let field = self.resolve_handle(record_handle, ordinal)?;
                self.get_value(slot, field).await
            }
            MessageType::PutArrayByHandle => {
                let ([record_handle, ordinal], data) = read_words::<2>(body)?;
                let field = self.resolve_handle(record_handle, ordinal)?;
                self.put_value(slot, field, data).await
            }
            MessageType::GetNetworkHandle => {
                let (name, _) = split_name(body)?;
                let field = self.resolve_name(name)?;
                let handle = self.network_handle(field)?;
                Ok(words(&[handle, field.ordinal as u32]))
            }
            MessageType::GetFieldType => {
                let (name, _) = split_name(body)?;
                let field = self.resolve_name(name)?;
                let record_field = self.records.get(field.record)?.field(field.ordinal)?;
                Ok(field_type_body(record_field.field_type, record_field.shape))
            }
            MessageType::SetClientInfo => {
                let text = std::str::from_utf8(body).map_err(|_| {
                    MxError::IllegalArgument("client info is not valid UTF-8".to_string())
                })?;
                let handler = self.sockets.get_mut(slot)?;
                handler.client.update(text.trim_end_matches('\0'))?;
                debug!(
                    slot,
                    user = %handler.client.user,
                    program = %handler.client.program,
                    pid = ?handler.client.pid,
                    "Client identified"
                );
                Ok(Bytes::new())
            }
            MessageType::GetOption => {
                let ([option], _) = read_words::<1>(body)?;
                let handler = self.sockets.get(slot)?;
                let value = match network_option(option)? {
                    NetworkOption::DataFormat => handler.data_format.code(),
                    NetworkOption::NativeDataFormat => DataFormat::Raw.code(),
                    NetworkOption::Long64 => u32::from(!handler.truncate_64bit_longs),
                };
                Ok(words(&[value]))
            }
            MessageType::SetOption => {
                let ([option, value], _) = read_words::<2>(body)?;
                let handler = self.sockets.get_mut(slot)?;
                match network_option(option)? {
                    NetworkOption::DataFormat => {
                        let format = DataFormat::from_u32(value).ok_or_else(|| {
                            MxError::IllegalArgument(format!("unknown data format {}", value))
                        })?;
                        debug!(slot, format = %format, "Data format changed");
                        handler.data_format = format;
                    }
                    NetworkOption::NativeDataFormat => {
                        return Err(MxError::IllegalArgument(
                            "the native data format cannot be set".to_string(),
                        ));
                    }
                    NetworkOption::Long64 => handler.truncate_64bit_longs = value == 0,
                }
                Ok(Bytes::new())
            }
            MessageType::AddCallback => {
                let ([record_handle, ordinal, callback_type], _) = read_words::<3>(body)?;
                if callback_type != CALLBACK_TYPE_VALUE_CHANGED {
                    return Err(MxError::Unsupported(format!(
                        "callback type {}",
                        callback_type
                    )));
                }
                let field = self.resolve_handle(record_handle, ordinal)?;
                let current = {
                    let record = self.records.get(field.record)?;
                    let record_field = record.field(field.ordinal)?;
                    if record_field.flags.contains(FieldFlags::NO_ACCESS) {
                        return Err(MxError::PermissionDenied(format!(
                            "field '{}.{}' is not accessible",
                            record.name, record_field.name
                        )));
                    }
                    record_field.value.clone()
                };
                let id = self.callbacks.add_field_callback(field, slot, current)?;
                debug!(
                    slot,
                    callback_id = %format!("{:#x}", id),
                    record = %field.record,
                    ordinal = field.ordinal,
                    "Callback added"
                );
                Ok(words(&[id]))
            }
            MessageType::DeleteCallback => {
                let ([id], _) = read_words::<1>(body)?;
                let deleted = self.callbacks.delete(id, slot)?;
                debug!(slot, callback_id = %format!("{:#x}", id), deleted, "Callback deleted for client");
                Ok(Bytes::new())
            }
            MessageType::Callback | MessageType::UnexpectedError => Err(MxError::Unsupported(
                format!("{} is not a request", kind),
            )),
        }
    }

    /// Look up `record.field`.
    fn resolve_name(&self, name: &str) -> MxResult<FieldAddress> {
        let (record_name, field_name) = split_field_name(name)?;
        let id = self
            .records
            .find(record_name)
            .ok_or_else(|| MxError::NotFound(format!("record '{}'", record_name)))?;
        let ordinal = self.records.get(id)?.field_index(field_name).ok_or_else(|| {
            MxError::NotFound(format!("field '{}' of record '{}'", field_name, record_name))
        })?;
        Ok(FieldAddress::new(id, ordinal))
    }

    /// Look up a (record handle, field ordinal) pair.
    fn resolve_handle(&self, record_handle: u32, ordinal: u32) -> MxResult<FieldAddress> {
        let id = *self
            .record_handles
            .get(record_handle as usize)
            .map_err(|_| MxError::NotFound(format!("record handle {}", record_handle)))?;
        let record = self.records.get(id)?;
        let ordinal = ordinal as usize;
        record.field(ordinal).map_err(|_| {
            MxError::NotFound(format!("field {} of record '{}'", ordinal, record.name))
        })?;
        Ok(FieldAddress::new(id, ordinal))
    }

    /// The record's network handle, assigned on first use.
    fn network_handle(&mut self, field: FieldAddress) -> MxResult<u32> {
        let record = self.records.get_mut(field.record)?;
        let handle = match record.handle {
            Some(handle) => handle,
            None => {
                let handle = self.record_handles.alloc(field.record)?;
                record.handle = Some(handle);
                debug!(record = %record.name, handle, "Assigned network handle");
                handle
            }
        };
        u32::try_from(handle)
            .map_err(|_| MxError::WouldExceedLimit(format!("record handle {}", handle)))
    }

    async fn get_value(&mut self, slot: usize, field: FieldAddress) -> MxResult<Bytes> {
        let codec = self.sockets.get(slot)?.codec();
        let record = self.records.get_mut(field.record)?;
        let value = get_field_value(record, field.ordinal).await?;
        self.field_read(field, &value);
        codec.encode(&value)
    }

    async fn put_value(&mut self, slot: usize, field: FieldAddress, data: &[u8]) -> MxResult<Bytes> {
        let codec = self.sockets.get(slot)?.codec();
        let record = self.records.get_mut(field.record)?;
        let (field_type, shape) = {
            let record_field = record.field(field.ordinal)?;
            (record_field.field_type, record_field.shape)
        };
        let value = codec.decode(data, field_type, shape)?;
        put_field_value(record, field.ordinal, value).await?;
        let stored = record.value(field.ordinal)?.clone();
        self.field_written(field, &stored);
        Ok(Bytes::new())
    }
}

fn network_option(option: u32) -> MxResult<NetworkOption> {
    NetworkOption::from_u32(option)
        .ok_or_else(|| MxError::NotFound(format!("network option {}", option)))
}

