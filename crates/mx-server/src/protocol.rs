//! Wire protocol for rust-mx clients.
//!
//! Every message is a frame: a fixed big-endian header followed by a body.
//!
//! ```text
//! 0        4              8               12             16            20           24
//! | magic  | header_length | message_length | message_type | status_code | message_id | body...
//! ```
//!
//! `header_length` is the size of the header in bytes (24 for this version;
//! larger values are accepted and the extra words skipped). `message_length`
//! is the size of the body. Replies echo the request's `message_id` and set
//! [`RETURN_BIT`] in `message_type`. Callback notifications carry the
//! callback id, which always has [`CALLBACK_BIT`] set, as their message id.
//!
//! Field values inside a body use the connection's negotiated
//! [`DataFormat`]; see [`ValueCodec`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use mx_core::limits::MAX_MESSAGE_LENGTH;
use mx_core::{FieldShape, FieldType, FieldValue, MxError, MxResult};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame magic, "MXSR".
pub const MAGIC: u32 = 0x4d58_5352;

/// Header size written by this version.
pub const HEADER_LENGTH: u32 = 24;

/// Set in `message_type` of every server reply.
pub const RETURN_BIT: u32 = 0x8000_0000;

/// Set in every callback id, and therefore in the message id of every
/// callback notification.
pub const CALLBACK_BIT: u32 = 0x8000_0000;

// =============================================================================
// Message types
// =============================================================================

/// Request kinds understood by the server.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Read a field addressed as `record.field`.
    GetArrayByName = 0x1001,
    /// Write a field addressed as `record.field`.
    PutArrayByName = 0x1002,
    /// Read a field addressed by network handle.
    GetArrayByHandle = 0x1003,
    /// Write a field addressed by network handle.
    PutArrayByHandle = 0x1004,
    /// Resolve `record.field` to a `(record handle, field ordinal)` pair.
    GetNetworkHandle = 0x1005,
    /// Describe a field's type and dimensions.
    GetFieldType = 0x1006,
    /// Announce the client's user, program and process id.
    SetClientInfo = 0x1007,
    /// Read a connection option.
    GetOption = 0x1008,
    /// Change a connection option.
    SetOption = 0x1009,
    /// Ask to be notified when a field changes.
    AddCallback = 0x100a,
    /// Stop being notified.
    DeleteCallback = 0x100b,
    /// Server-initiated value notification.
    Callback = 0x100c,
    /// Reply type used when the request type itself was not understood.
    UnexpectedError = 0x1fff,
}

impl MessageType {
    /// Decode a request type, ignoring [`RETURN_BIT`].
    pub fn from_u32(value: u32) -> Option<Self> {
        match value & !RETURN_BIT {
            0x1001 => Some(MessageType::GetArrayByName),
            0x1002 => Some(MessageType::PutArrayByName),
            0x1003 => Some(MessageType::GetArrayByHandle),
            0x1004 => Some(MessageType::PutArrayByHandle),
            0x1005 => Some(MessageType::GetNetworkHandle),
            0x1006 => Some(MessageType::GetFieldType),
            0x1007 => Some(MessageType::SetClientInfo),
            0x1008 => Some(MessageType::GetOption),
            0x1009 => Some(MessageType::SetOption),
            0x100a => Some(MessageType::AddCallback),
            0x100b => Some(MessageType::DeleteCallback),
            0x100c => Some(MessageType::Callback),
            0x1fff => Some(MessageType::UnexpectedError),
            _ => None,
        }
    }

    /// Numeric value without the return bit.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Message type of the matching reply.
    pub fn reply(self) -> u32 {
        self.code() | RETURN_BIT
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::GetArrayByName => "GET_ARRAY_BY_NAME",
            MessageType::PutArrayByName => "PUT_ARRAY_BY_NAME",
            MessageType::GetArrayByHandle => "GET_ARRAY_BY_HANDLE",
            MessageType::PutArrayByHandle => "PUT_ARRAY_BY_HANDLE",
            MessageType::GetNetworkHandle => "GET_NETWORK_HANDLE",
            MessageType::GetFieldType => "GET_FIELD_TYPE",
            MessageType::SetClientInfo => "SET_CLIENT_INFO",
            MessageType::GetOption => "GET_OPTION",
            MessageType::SetOption => "SET_OPTION",
            MessageType::AddCallback => "ADD_CALLBACK",
            MessageType::DeleteCallback => "DELETE_CALLBACK",
            MessageType::Callback => "CALLBACK",
            MessageType::UnexpectedError => "UNEXPECTED_ERROR",
        };
        f.write_str(name)
    }
}

/// Connection options readable with GET_OPTION.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkOption {
    /// Data format used for field values on this connection.
    DataFormat = 1,
    /// The server's native binary format (read-only).
    NativeDataFormat = 2,
    /// Nonzero when longs travel as 64-bit values.
    Long64 = 3,
}

impl NetworkOption {
    /// Decode an option number.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(NetworkOption::DataFormat),
            2 => Some(NetworkOption::NativeDataFormat),
            3 => Some(NetworkOption::Long64),
            _ => None,
        }
    }
}

/// Callback kinds a client may request with ADD_CALLBACK.
pub const CALLBACK_TYPE_VALUE_CHANGED: u32 = 1;

// =============================================================================
// Data formats
// =============================================================================

/// Encoding of field values inside message bodies.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataFormat {
    /// Whitespace-separated text.
    #[default]
    Ascii = 1,
    /// Little-endian binary, the server's native layout.
    Raw = 2,
    /// Big-endian binary.
    Xdr = 3,
}

impl DataFormat {
    /// Decode an option value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(DataFormat::Ascii),
            2 => Some(DataFormat::Raw),
            3 => Some(DataFormat::Xdr),
            _ => None,
        }
    }

    /// Parse a configuration name (`ascii`, `raw`, `xdr`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "ascii" => Some(DataFormat::Ascii),
            "raw" => Some(DataFormat::Raw),
            "xdr" => Some(DataFormat::Xdr),
            _ => None,
        }
    }

    /// Numeric option value.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Lowercase configuration name.
    pub fn name(self) -> &'static str {
        match self {
            DataFormat::Ascii => "ascii",
            DataFormat::Raw => "raw",
            DataFormat::Xdr => "xdr",
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Frames
// =============================================================================

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Header size in bytes as sent by the peer.
    pub header_length: u32,
    /// Body size in bytes.
    pub message_length: u32,
    /// Message type, possibly with [`RETURN_BIT`].
    pub message_type: u32,
    /// `0` on success, otherwise an `MxError` code.
    pub status_code: u32,
    /// Request id, or callback id for notifications.
    pub message_id: u32,
}

impl FrameHeader {
    /// True for server replies and notifications.
    pub fn is_reply(&self) -> bool {
        self.message_type & RETURN_BIT != 0
    }

    /// True for callback notifications.
    pub fn is_callback(&self) -> bool {
        self.is_reply()
            && MessageType::from_u32(self.message_type) == Some(MessageType::Callback)
    }

    fn check_lengths(&self) -> MxResult<()> {
        if self.header_length < HEADER_LENGTH {
            return Err(MxError::Protocol(format!(
                "header length {} is shorter than {}",
                self.header_length, HEADER_LENGTH
            )));
        }
        let total = self.header_length as usize + self.message_length as usize;
        if total > MAX_MESSAGE_LENGTH {
            return Err(MxError::Protocol(format!(
                "message of {} bytes exceeds the {} byte limit",
                total, MAX_MESSAGE_LENGTH
            )));
        }
        Ok(())
    }
}

/// A complete message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Header fields.
    pub header: FrameHeader,
    /// Body bytes.
    pub body: Bytes,
}

impl Frame {
    fn new(message_type: u32, status_code: u32, message_id: u32, body: Bytes) -> Self {
        Self {
            header: FrameHeader {
                header_length: HEADER_LENGTH,
                message_length: body.len() as u32,
                message_type,
                status_code,
                message_id,
            },
            body,
        }
    }

    /// A client request.
    pub fn request(message_type: MessageType, message_id: u32, body: impl Into<Bytes>) -> Self {
        Self::new(message_type.code(), 0, message_id, body.into())
    }

    /// A successful reply to `request`.
    pub fn reply(request: &FrameHeader, body: impl Into<Bytes>) -> Self {
        Self::new(request.message_type | RETURN_BIT, 0, request.message_id, body.into())
    }

    /// An error reply to `request`. The body carries the error text.
    pub fn error_reply(request: &FrameHeader, err: &MxError) -> Self {
        let message_type = match MessageType::from_u32(request.message_type) {
            Some(kind) => kind.reply(),
            None => MessageType::UnexpectedError.reply(),
        };
        Self::new(
            message_type,
            err.code(),
            request.message_id,
            Bytes::from(err.to_string()),
        )
    }

    /// A value notification for `callback_id`.
    pub fn callback(callback_id: u32, body: impl Into<Bytes>) -> Self {
        Self::new(
            MessageType::Callback.reply(),
            0,
            callback_id | CALLBACK_BIT,
            body.into(),
        )
    }

    /// The decoded message type, if known.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u32(self.header.message_type)
    }

    /// Turn an error reply back into the error it carries.
    pub fn into_result(self) -> MxResult<Bytes> {
        let text = String::from_utf8_lossy(&self.body).into_owned();
        match MxError::from_code(self.header.status_code, text) {
            Some(err) => Err(err),
            None => Ok(self.body),
        }
    }

    /// Serialize header and body.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LENGTH as usize + self.body.len());
        buf.put_u32(MAGIC);
        buf.put_u32(HEADER_LENGTH);
        buf.put_u32(self.body.len() as u32);
        buf.put_u32(self.header.message_type);
        buf.put_u32(self.header.status_code);
        buf.put_u32(self.header.message_id);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Parse one complete frame from `data`.
    pub fn decode(data: &[u8]) -> MxResult<Frame> {
        let header = decode_header(data)?;
        let start = header.header_length as usize;
        let end = start + header.message_length as usize;
        if data.len() < end {
            return Err(MxError::Protocol(format!(
                "frame truncated: {} of {} bytes",
                data.len(),
                end
            )));
        }
        Ok(Frame {
            header,
            body: Bytes::copy_from_slice(&data[start..end]),
        })
    }
}

fn decode_header(data: &[u8]) -> MxResult<FrameHeader> {
    if data.len() < HEADER_LENGTH as usize {
        return Err(MxError::Protocol("insufficient data for frame header".to_string()));
    }
    let mut buf = &data[..HEADER_LENGTH as usize];
    let magic = buf.get_u32();
    if magic != MAGIC {
        return Err(MxError::Protocol(format!("wrong magic number {:#x}", magic)));
    }
    let header = FrameHeader {
        header_length: buf.get_u32(),
        message_length: buf.get_u32(),
        message_type: buf.get_u32(),
        status_code: buf.get_u32(),
        message_id: buf.get_u32(),
    };
    header.check_lengths()?;
    Ok(header)
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream between frames.
///
/// A bad magic number or an oversized frame is a `Protocol` error; the caller
/// is expected to drop the connection.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> MxResult<Option<Frame>> {
    let mut head = [0u8; HEADER_LENGTH as usize];
    let mut filled = 0;
    while filled < head.len() {
        let n = reader.read(&mut head[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(MxError::Protocol("connection closed inside a frame header".to_string()));
        }
        filled += n;
    }

    let header = decode_header(&head)?;

    let extra = (header.header_length - HEADER_LENGTH) as usize;
    let mut rest = vec![0u8; extra + header.message_length as usize];
    reader.read_exact(&mut rest).await?;

    let body = Bytes::from(rest).slice(extra..);
    Ok(Some(Frame { header, body }))
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> MxResult<()> {
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}

// =============================================================================
// Body helpers
// =============================================================================

/// Build a by-name body: the name, a NUL, then the encoded value (if any).
pub fn name_body(name: &str, value: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(name.len() + 1 + value.len());
    buf.put_slice(name.as_bytes());
    buf.put_u8(0);
    buf.put_slice(value);
    buf.freeze()
}

/// Split a by-name body into the field name and the value bytes after it.
pub fn split_name(body: &[u8]) -> MxResult<(&str, &[u8])> {
    let (name, rest) = match body.iter().position(|b| *b == 0) {
        Some(nul) => (&body[..nul], &body[nul + 1..]),
        None => (body, &body[body.len()..]),
    };
    let name = std::str::from_utf8(name)
        .map_err(|_| MxError::IllegalArgument("field name is not valid UTF-8".to_string()))?
        .trim();
    if name.is_empty() {
        return Err(MxError::NullArgument("empty field name".to_string()));
    }
    Ok((name, rest))
}

/// Split `record.field` at the first dot.
pub fn split_field_name(name: &str) -> MxResult<(&str, &str)> {
    match name.split_once('.') {
        Some((record, field)) if !record.is_empty() && !field.is_empty() => Ok((record, field)),
        _ => Err(MxError::IllegalArgument(format!(
            "'{}' is not of the form record.field",
            name
        ))),
    }
}

/// Encode a list of big-endian words.
pub fn words(values: &[u32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(values.len() * 4);
    for value in values {
        buf.put_u32(*value);
    }
    buf.freeze()
}

/// Read `N` big-endian words from the start of `body`, returning the rest.
pub fn read_words<const N: usize>(body: &[u8]) -> MxResult<([u32; N], &[u8])> {
    if body.len() < N * 4 {
        return Err(MxError::IllegalArgument(format!(
            "expected {} word(s), got {} byte(s)",
            N,
            body.len()
        )));
    }
    let mut buf = body;
    let mut out = [0u32; N];
    for word in out.iter_mut() {
        *word = buf.get_u32();
    }
    Ok((out, buf))
}

/// Wire description of a field type and shape: type code, number of
/// dimensions, then each dimension.
pub fn field_type_body(field_type: FieldType, shape: FieldShape) -> Bytes {
    let mut values = vec![field_type.code(), shape.num_dimensions()];
    if shape.num_dimensions() > 0 {
        values.push(shape.dimension() as u32);
    }
    words(&values)
}

/// Inverse of [`field_type_body`].
pub fn parse_field_type_body(body: &[u8]) -> MxResult<(FieldType, FieldShape)> {
    let ([code, dims], rest) = read_words::<2>(body)?;
    let field_type = FieldType::from_code(code)
        .ok_or_else(|| MxError::Protocol(format!("unknown field type code {}", code)))?;
    let shape = match dims {
        0 => FieldShape::Scalar,
        1 => {
            let ([max_len], _) = read_words::<1>(rest)?;
            if field_type == FieldType::String {
                FieldShape::String { max_len: max_len as usize }
            } else {
                FieldShape::Array { max_len: max_len as usize }
            }
        }
        other => {
            return Err(MxError::Unsupported(format!("{} dimensional fields", other)));
        }
    };
    Ok((field_type, shape))
}

// =============================================================================
// Value codec
// =============================================================================

#[derive(Clone, Copy)]
enum Endian {
    Little,
    Big,
}

/// Encodes and decodes field values for one connection.
///
/// Binary layouts (RAW little-endian, XDR big-endian):
///
/// | value            | layout                                    |
/// |------------------|-------------------------------------------|
/// | bool             | u32, 0 or 1                               |
/// | long, recordtype | i64, or i32 when 64-bit longs are off     |
/// | ulong            | u64, or u32 when 64-bit longs are off     |
/// | double           | f64                                       |
/// | string           | UTF-8 bytes, no terminator                |
/// | arrays           | u32 element count, then the elements      |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueCodec {
    /// Negotiated format.
    pub format: DataFormat,
    /// Longs travel as 64-bit values.
    pub long_64: bool,
}

impl ValueCodec {
    /// Codec for `format` with 64-bit longs.
    pub fn new(format: DataFormat) -> Self {
        Self {
            format,
            long_64: true,
        }
    }

    /// Encode `value`.
    pub fn encode(&self, value: &FieldValue) -> MxResult<Bytes> {
        let endian = match self.format {
            DataFormat::Ascii => return Ok(Bytes::from(value.to_ascii())),
            DataFormat::Raw => Endian::Little,
            DataFormat::Xdr => Endian::Big,
        };
        let mut buf = BytesMut::new();
        match value {
            FieldValue::Bool(v) => put_u32(&mut buf, endian, u32::from(*v)),
            FieldValue::Long(v) => self.put_long(&mut buf, endian, *v)?,
            FieldValue::ULong(v) => self.put_ulong(&mut buf, endian, *v)?,
            FieldValue::Double(v) => put_f64(&mut buf, endian, *v),
            FieldValue::String(s) => buf.put_slice(s.as_bytes()),
            FieldValue::LongArray(values) => {
                put_u32(&mut buf, endian, values.len() as u32);
                for v in values {
                    self.put_long(&mut buf, endian, *v)?;
                }
            }
            FieldValue::ULongArray(values) => {
                put_u32(&mut buf, endian, values.len() as u32);
                for v in values {
                    self.put_ulong(&mut buf, endian, *v)?;
                }
            }
            FieldValue::DoubleArray(values) => {
                put_u32(&mut buf, endian, values.len() as u32);
                for v in values {
                    put_f64(&mut buf, endian, *v);
                }
            }
        }
        Ok(buf.freeze())
    }

    /// Decode a value for a field of the given type and shape.
    ///
    /// The result is already coerced to the field's representation, so
    /// oversized strings and arrays are rejected here.
    pub fn decode(&self, data: &[u8], field_type: FieldType, shape: FieldShape) -> MxResult<FieldValue> {
        let endian = match self.format {
            DataFormat::Ascii => {
                let text = std::str::from_utf8(data)
                    .map_err(|_| MxError::IllegalArgument("value is not valid UTF-8".to_string()))?;
                return FieldValue::parse_ascii(text.trim_end_matches('\0'), field_type, shape);
            }
            DataFormat::Raw => Endian::Little,
            DataFormat::Xdr => Endian::Big,
        };

        if field_type == FieldType::String {
            let text = std::str::from_utf8(data)
                .map_err(|_| MxError::IllegalArgument("string is not valid UTF-8".to_string()))?;
            return FieldValue::String(text.trim_end_matches('\0').to_string()).coerce(field_type, shape);
        }

        let mut buf = data;
        let value = match shape {
            FieldShape::Scalar => self.get_scalar(&mut buf, endian, field_type)?,
            FieldShape::Array { max_len } => {
                let count = get_u32(&mut buf, endian)? as usize;
                if count > max_len {
                    return Err(MxError::WouldExceedLimit(format!(
                        "array of {} elements exceeds field length {}",
                        count, max_len
                    )));
                }
                match field_type {
                    FieldType::Double => FieldValue::DoubleArray(
                        (0..count)
                            .map(|_| get_f64(&mut buf, endian))
                            .collect::<MxResult<_>>()?,
                    ),
                    FieldType::Long | FieldType::RecordType => FieldValue::LongArray(
                        (0..count)
                            .map(|_| self.get_long(&mut buf, endian))
                            .collect::<MxResult<_>>()?,
                    ),
                    FieldType::ULong | FieldType::Bool => FieldValue::ULongArray(
                        (0..count)
                            .map(|_| self.get_ulong(&mut buf, endian))
                            .collect::<MxResult<_>>()?,
                    ),
                    FieldType::String => return Err(string_in_binary()),
                }
            }
            FieldShape::String { .. } => {
                return Err(MxError::IllegalArgument(format!(
                    "{} field cannot have a string shape",
                    field_type.name()
                )))
            }
        };
        if buf.has_remaining() {
            return Err(MxError::IllegalArgument(format!(
                "{} trailing byte(s) after value",
                buf.remaining()
            )));
        }
        value.coerce(field_type, shape)
    }

    fn get_scalar(&self, buf: &mut &[u8], endian: Endian, field_type: FieldType) -> MxResult<FieldValue> {
        Ok(match field_type {
            FieldType::Bool => FieldValue::Bool(get_u32(buf, endian)? != 0),
            FieldType::Long | FieldType::RecordType => FieldValue::Long(self.get_long(buf, endian)?),
            FieldType::ULong => FieldValue::ULong(self.get_ulong(buf, endian)?),
            FieldType::Double => FieldValue::Double(get_f64(buf, endian)?),
            FieldType::String => return Err(string_in_binary()),
        })
    }

    fn put_long(&self, buf: &mut BytesMut, endian: Endian, value: i64) -> MxResult<()> {
        if self.long_64 {
            match endian {
                Endian::Little => buf.put_i64_le(value),
                Endian::Big => buf.put_i64(value),
            }
            return Ok(());
        }
        let narrow = i32::try_from(value).map_err(|_| {
            MxError::WouldExceedLimit(format!("{} does not fit in a 32-bit long", value))
        })?;
        match endian {
            Endian::Little => buf.put_i32_le(narrow),
            Endian::Big => buf.put_i32(narrow),
        }
        Ok(())
    }

    fn put_ulong(&self, buf: &mut BytesMut, endian: Endian, value: u64) -> MxResult<()> {
        if self.long_64 {
            match endian {
                Endian::Little => buf.put_u64_le(value),
                Endian::Big => buf.put_u64(value),
            }
            return Ok(());
        }
        let narrow = u32::try_from(value).map_err(|_| {
            MxError::WouldExceedLimit(format!("{} does not fit in a 32-bit long", value))
        })?;
        put_u32(buf, endian, narrow);
        Ok(())
    }

    fn get_long(&self, buf: &mut &[u8], endian: Endian) -> MxResult<i64> {
        if self.long_64 {
            need(buf, 8)?;
            return Ok(match endian {
                Endian::Little => buf.get_i64_le(),
                Endian::Big => buf.get_i64(),
            });
        }
        need(buf, 4)?;
        Ok(i64::from(match endian {
            Endian::Little => buf.get_i32_le(),
            Endian::Big => buf.get_i32(),
        }))
    }

    fn get_ulong(&self, buf: &mut &[u8], endian: Endian) -> MxResult<u64> {
        if self.long_64 {
            need(buf, 8)?;
            return Ok(match endian {
                Endian::Little => buf.get_u64_le(),
                Endian::Big => buf.get_u64(),
            });
        }
        Ok(u64::from(get_u32(buf, endian)?))
    }
}

impl Default for ValueCodec {
    fn default() -> Self {
        Self::new(DataFormat::default())
    }
}

fn string_in_binary() -> MxError {
    MxError::IllegalArgument("string elements cannot be decoded as numbers".to_string())
}

fn need(buf: &[u8], n: usize) -> MxResult<()> {
    if buf.remaining() < n {
        return Err(MxError::IllegalArgument(format!(
            "value truncated: needed {} byte(s), {} left",
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

fn put_u32(buf: &mut BytesMut, endian: Endian, value: u32) {
    match endian {
        Endian::Little => buf.put_u32_le(value),
        Endian::Big => buf.put_u32(value),
    }
}

fn put_f64(buf: &mut BytesMut, endian: Endian, value: f64) {
    match endian {
        Endian::Little => buf.put_f64_le(value),
        Endian::Big => buf.put_f64(value),
    }
}

fn get_u32(buf: &mut &[u8], endian: Endian) -> MxResult<u32> {
    need(buf, 4)?;
    Ok(match endian {
        Endian::Little => buf.get_u32_le(),
        Endian::Big => buf.get_u32(),
    })
}

fn get_f64(buf: &mut &[u8], endian: Endian) -> MxResult<f64> {
    need(buf, 8)?;
    Ok(match endian {
        Endian::Little => buf.get_f64_le(),
        Endian::Big => buf.get_f64(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_big_endian_with_magic_first() {
        let frame = Frame::request(MessageType::GetOption, 7, words(&[1]));
        let bytes = frame.encode();
        assert_eq!(&bytes[..4], b"MXSR");
        assert_eq!(&bytes[4..8], &[0, 0, 0, 24]);
        assert_eq!(&bytes[8..12], &[0, 0, 0, 4]);
        assert_eq!(&bytes[12..16], &[0, 0, 0x10, 0x08]);
        assert_eq!(&bytes[20..24], &[0, 0, 0, 7]);
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn replies_set_the_return_bit() {
        let request = Frame::request(MessageType::SetOption, 3, Bytes::new());
        let reply = Frame::reply(&request.header, Bytes::new());
        assert!(reply.header.is_reply());
        assert!(!reply.header.is_callback());
        assert_eq!(reply.message_type(), Some(MessageType::SetOption));
        assert_eq!(reply.header.message_id, 3);

        let notice = Frame::callback(5, Bytes::new());
        assert!(notice.header.is_callback());
        assert_eq!(notice.header.message_id, 5 | CALLBACK_BIT);
    }

    #[test]
    fn error_reply_carries_code_and_text() {
        let request = Frame::request(MessageType::GetArrayByHandle, 9, Bytes::new());
        let reply = Frame::error_reply(&request.header, &MxError::NotFound("handle 4".into()));
        assert_eq!(reply.header.status_code, 3);
        let err = reply.into_result().unwrap_err();
        assert!(matches!(err, MxError::NotFound(text) if text.contains("handle 4")));
    }

    #[test]
    fn unknown_request_type_gets_unexpected_error_reply() {
        let header = FrameHeader {
            header_length: HEADER_LENGTH,
            message_length: 0,
            message_type: 0x4242,
            status_code: 0,
            message_id: 1,
        };
        let reply = Frame::error_reply(&header, &MxError::Unsupported("0x4242".into()));
        assert_eq!(reply.header.message_type, MessageType::UnexpectedError.reply());
    }

    #[test]
    fn wrong_magic_is_a_protocol_error() {
        let mut bytes = Frame::request(MessageType::GetOption, 1, Bytes::new())
            .encode()
            .to_vec();
        bytes[0] = b'X';
        assert!(matches!(Frame::decode(&bytes), Err(MxError::Protocol(_))));
    }

    #[test]
    fn oversized_frame_is_a_protocol_error() {
        let mut bytes = BytesMut::new();
        bytes.put_u32(MAGIC);
        bytes.put_u32(HEADER_LENGTH);
        bytes.put_u32(MAX_MESSAGE_LENGTH as u32);
        bytes.put_u32(MessageType::GetOption.code());
        bytes.put_u32(0);
        bytes.put_u32(1);
        let err = Frame::decode(&bytes).unwrap_err();
        assert!(matches!(err, MxError::Protocol(text) if text.contains("exceeds")));
    }

    #[tokio::test]
    async fn read_frame_skips_extended_header_words() {
        let mut bytes = BytesMut::new();
        bytes.put_u32(MAGIC);
        bytes.put_u32(HEADER_LENGTH + 4);
        bytes.put_u32(2);
        bytes.put_u32(MessageType::GetArrayByName.code());
        bytes.put_u32(0);
        bytes.put_u32(11);
        bytes.put_u32(0xdead_beef);
        bytes.put_slice(b"ab");
        let mut reader = &bytes[..];
        let frame = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(&frame.body[..], b"ab");
        assert_eq!(frame.header.message_id, 11);
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_inside_header_is_an_error() {
        let bytes = Frame::request(MessageType::GetOption, 1, Bytes::new()).encode();
        let mut reader = &bytes[..10];
        assert!(matches!(read_frame(&mut reader).await, Err(MxError::Protocol(_))));
    }

    #[test]
    fn name_bodies_split_at_the_nul() {
        let body = name_body("m1.position", b"12.5");
        let (name, value) = split_name(&body).unwrap();
        assert_eq!(name, "m1.position");
        assert_eq!(value, b"12.5");
        assert_eq!(split_field_name(name).unwrap(), ("m1", "position"));
        assert!(split_field_name("m1").is_err());
        assert!(split_name(b"\0").is_err());
    }

    #[test]
    fn raw_and_xdr_differ_only_in_byte_order() {
        let value = FieldValue::Long(0x0102);
        let raw = ValueCodec::new(DataFormat::Raw).encode(&value).unwrap();
        let xdr = ValueCodec::new(DataFormat::Xdr).encode(&value).unwrap();
        assert_eq!(&raw[..], &[2, 1, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&xdr[..], &[0, 0, 0, 0, 0, 0, 1, 2]);
    }

    #[test]
    fn arrays_carry_an_element_count() {
        let codec = ValueCodec::new(DataFormat::Xdr);
        let shape = FieldShape::Array { max_len: 4 };
        let bytes = codec.encode(&FieldValue::DoubleArray(vec![1.5, -2.0])).unwrap();
        assert_eq!(bytes.len(), 4 + 16);
        assert_eq!(
            codec.decode(&bytes, FieldType::Double, shape).unwrap(),
            FieldValue::DoubleArray(vec![1.5, -2.0])
        );
        let too_long = codec
            .encode(&FieldValue::DoubleArray(vec![0.0; 5]))
            .unwrap();
        assert!(matches!(
            codec.decode(&too_long, FieldType::Double, shape),
            Err(MxError::WouldExceedLimit(_))
        ));
    }

    #[test]
    fn truncated_longs_refuse_wide_values() {
        let codec = ValueCodec {
            format: DataFormat::Raw,
            long_64: false,
        };
        assert_eq!(codec.encode(&FieldValue::Long(-3)).unwrap().len(), 4);
        assert!(matches!(
            codec.encode(&FieldValue::Long(i64::MAX)),
            Err(MxError::WouldExceedLimit(_))
        ));
        let bytes = codec.encode(&FieldValue::Long(-3)).unwrap();
        assert_eq!(
            codec.decode(&bytes, FieldType::Long, FieldShape::Scalar).unwrap(),
            FieldValue::Long(-3)
        );
    }

    #[test]
    fn ascii_values_are_text() {
        let codec = ValueCodec::new(DataFormat::Ascii);
        let bytes = codec.encode(&FieldValue::LongArray(vec![1, 2, 3])).unwrap();
        assert_eq!(&bytes[..], b"1 2 3");
        assert_eq!(
            codec
                .decode(b"4 5\0", FieldType::Long, FieldShape::Array { max_len: 8 })
                .unwrap(),
            FieldValue::LongArray(vec![4, 5])
        );
    }

    #[test]
    fn binary_decode_rejects_short_and_long_input() {
        let codec = ValueCodec::new(DataFormat::Raw);
        assert!(codec.decode(&[1, 2], FieldType::Double, FieldShape::Scalar).is_err());
        assert!(codec.decode(&[0; 12], FieldType::Double, FieldShape::Scalar).is_err());
    }

    #[test]
    fn field_type_body_round_trips_shapes() {
        for (field_type, shape) in [
            (FieldType::Double, FieldShape::Scalar),
            (FieldType::String, FieldShape::String { max_len: 40 }),
            (FieldType::Long, FieldShape::Array { max_len: 1024 }),
        ] {
            let body = field_type_body(field_type, shape);
            assert_eq!(parse_field_type_body(&body).unwrap(), (field_type, shape));
        }
    }
}
