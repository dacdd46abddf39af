//! A small async client for the server protocol.
//!
//! Used by the integration tests and by tools that need to poke a running
//! server. Requests are strictly sequential; callback frames that arrive
//! while waiting for a reply are kept and handed out by
//! [`MxClient::wait_callback`].

use crate::protocol::{
    name_body, parse_field_type_body, read_frame, read_words, words, write_frame,
    DataFormat, Frame, MessageType, NetworkOption, ValueCodec, CALLBACK_BIT,
    CALLBACK_TYPE_VALUE_CHANGED,
};
use bytes::Bytes;
use mx_core::{FieldShape, FieldType, FieldValue, MxError, MxResult};
use std::collections::{HashMap, VecDeque};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, ToSocketAddrs};

/// Everything needed to address a field by handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldHandle {
    /// Record handle.
    pub record_handle: u32,
    /// Field ordinal.
    pub field_ordinal: u32,
    /// Element type.
    pub field_type: FieldType,
    /// Shape.
    pub shape: FieldShape,
}

/// A callback frame received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackNotice {
    /// Callback id, as returned by [`MxClient::add_callback`].
    pub id: u32,
    /// Encoded value, in the connection's data format.
    pub body: Bytes,
}

/// Client end of one connection.
pub struct MxClient<S> {
    stream: BufReader<S>,
    next_id: u32,
    codec: ValueCodec,
    types: HashMap<String, (FieldType, FieldShape)>,
    pending: VecDeque<CallbackNotice>,
}

impl MxClient<TcpStream> {
    /// Connect over TCP.
    pub async fn connect(addr: impl ToSocketAddrs) -> MxResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

impl<S> MxClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already connected stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
            next_id: 1,
            codec: ValueCodec::default(),
            types: HashMap::new(),
            pending: VecDeque::new(),
        }
    }

    /// The format values are encoded in on this connection.
    pub fn data_format(&self) -> DataFormat {
        self.codec.format
    }

    /// Send one request and wait for its reply. Error replies come back as
    /// the error they carry.
    pub async fn request(&mut self, kind: MessageType, body: impl Into<Bytes>) -> MxResult<Bytes> {
        let id = self.next_id;
        self.next_id = (self.next_id + 1) & !CALLBACK_BIT;
        self.send_frame(&Frame::request(kind, id, body)).await?;

        loop {
            let frame = self.read_raw().await?;
            if frame.header.is_callback() {
                self.stash(frame);
                continue;
            }
            if frame.header.message_id != id {
                return Err(MxError::Protocol(format!(
                    "reply for message {} while waiting for {}",
                    frame.header.message_id, id
                )));
            }
            return frame.into_result();
        }
    }

    /// Send a frame as is.
    pub async fn send_frame(&mut self, frame: &Frame) -> MxResult<()> {
        write_frame(self.stream.get_mut(), frame).await
    }

    /// Send raw bytes, for exercising malformed input.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> MxResult<()> {
        let stream = self.stream.get_mut();
        stream.write_all(bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Read the next frame of any kind. A closed connection is
    /// `OperatingSystem`.
    pub async fn read_raw(&mut self) -> MxResult<Frame> {
        read_frame(&mut self.stream).await?.ok_or_else(|| {
            MxError::OperatingSystem("connection closed by server".to_string())
        })
    }

    fn stash(&mut self, frame: Frame) {
        self.pending.push_back(CallbackNotice {
            id: frame.header.message_id,
            body: frame.body,
        });
    }

    // =========================================================================
    // Fields
    // =========================================================================

    /// Type and shape of `record.field`.
    pub async fn get_field_type(&mut self, name: &str) -> MxResult<(FieldType, FieldShape)> {
        if let Some(known) = self.types.get(name) {
            return Ok(*known);
        }
        let body = self.request(MessageType::GetFieldType, name_body(name, &[])).await?;
        let known = parse_field_type_body(&body)?;
        self.types.insert(name.to_string(), known);
        Ok(known)
    }

    /// Record handle and field ordinal of `record.field`.
    pub async fn get_network_handle(&mut self, name: &str) -> MxResult<(u32, u32)> {
        let body = self
            .request(MessageType::GetNetworkHandle, name_body(name, &[]))
            .await?;
        let ([record_handle, field_ordinal], _) = read_words::<2>(&body)?;
        Ok((record_handle, field_ordinal))
    }

    /// Handle, type and shape of `record.field`.
    pub async fn network_handle(&mut self, name: &str) -> MxResult<FieldHandle> {
        let (record_handle, field_ordinal) = self.get_network_handle(name).await?;
        let (field_type, shape) = self.get_field_type(name).await?;
        Ok(FieldHandle {
            record_handle,
            field_ordinal,
            field_type,
            shape,
        })
    }

    /// Read `record.field`.
    pub async fn get(&mut self, name: &str) -> MxResult<FieldValue> {
        let (field_type, shape) = self.get_field_type(name).await?;
        let body = self
            .request(MessageType::GetArrayByName, name_body(name, &[]))
            .await?;
        self.codec.decode(&body, field_type, shape)
    }

    /// Write `record.field`.
    pub async fn put(&mut self, name: &str, value: FieldValue) -> MxResult<()> {
        let (field_type, shape) = self.get_field_type(name).await?;
        let data = self.codec.encode(&value.coerce(field_type, shape)?)?;
        self.request(MessageType::PutArrayByName, name_body(name, &data))
            .await?;
        Ok(())
    }

    /// Read a field by handle.
    pub async fn get_by_handle(&mut self, handle: &FieldHandle) -> MxResult<FieldValue> {
        let body = self
            .request(
                MessageType::GetArrayByHandle,
                words(&[handle.record_handle, handle.field_ordinal]),
            )
            .await?;
        self.codec.decode(&body, handle.field_type, handle.shape)
    }

    /// Write a field by handle.
    pub async fn put_by_handle(&mut self, handle: &FieldHandle, value: FieldValue) -> MxResult<()> {
        let data = self
            .codec
            .encode(&value.coerce(handle.field_type, handle.shape)?)?;
        let mut body = words(&[handle.record_handle, handle.field_ordinal]).to_vec();
        body.extend_from_slice(&data);
        self.request(MessageType::PutArrayByHandle, body).await?;
        Ok(())
    }

    // =========================================================================
    // Session
    // =========================================================================

    /// Announce user, program and pid.
    pub async fn set_client_info(&mut self, user: &str, program: &str, pid: u32) -> MxResult<()> {
        let text = format!("{} {} {}", user, program, pid);
        self.request(MessageType::SetClientInfo, Bytes::from(text)).await?;
        Ok(())
    }

    /// Read a connection option.
    pub async fn get_option(&mut self, option: NetworkOption) -> MxResult<u32> {
        let body = self
            .request(MessageType::GetOption, words(&[option as u32]))
            .await?;
        let ([value], _) = read_words::<1>(&body)?;
        Ok(value)
    }

    /// Set a connection option. Options that change value encoding are
    /// mirrored locally once the server accepts them.
    pub async fn set_option(&mut self, option: NetworkOption, value: u32) -> MxResult<()> {
        self.request(MessageType::SetOption, words(&[option as u32, value]))
            .await?;
        match option {
            NetworkOption::DataFormat => {
                if let Some(format) = DataFormat::from_u32(value) {
                    self.codec.format = format;
                }
            }
            NetworkOption::Long64 => self.codec.long_64 = value != 0,
            NetworkOption::NativeDataFormat => {}
        }
        Ok(())
    }

    /// Switch this connection's value format.
    pub async fn set_data_format(&mut self, format: DataFormat) -> MxResult<()> {
        self.set_option(NetworkOption::DataFormat, format.code()).await
    }

    // =========================================================================
    // Callbacks
    // =========================================================================

    /// Ask for value-changed notifications on a field. Returns the callback
    /// id.
    pub async fn add_callback(&mut self, handle: &FieldHandle) -> MxResult<u32> {
        let body = self
            .request(
                MessageType::AddCallback,
                words(&[
                    handle.record_handle,
                    handle.field_ordinal,
                    CALLBACK_TYPE_VALUE_CHANGED,
                ]),
            )
            .await?;
        let ([id], _) = read_words::<1>(&body)?;
        Ok(id)
    }

    /// Stop receiving notifications for callback `id`.
    pub async fn delete_callback(&mut self, id: u32) -> MxResult<()> {
        self.request(MessageType::DeleteCallback, words(&[id])).await?;
        Ok(())
    }

    /// The next callback notice, waiting for one if none is stashed.
    pub async fn wait_callback(&mut self) -> MxResult<CallbackNotice> {
        if let Some(notice) = self.pending.pop_front() {
            return Ok(notice);
        }
        loop {
            let frame = self.read_raw().await?;
            if frame.header.is_callback() {
                return Ok(CallbackNotice {
                    id: frame.header.message_id,
                    body: frame.body,
                });
            }
        }
    }

    /// Decode a callback body with this connection's codec.
    pub fn decode_callback(
        &self,
        notice: &CallbackNotice,
        handle: &FieldHandle,
    ) -> MxResult<FieldValue> {
        self.codec.decode(&notice.body, handle.field_type, handle.shape)
    }

    /// Callback notices received but not yet taken.
    pub fn pending_callbacks(&self) -> usize {
        self.pending.len()
    }
}
