//! Wire format for message frames.
//!
//! Frame format: `[length:4][checksum:4][body:N]`
//!
//! - **length**: Total frame size including header (little-endian u32)
//! - **checksum**: CRC32C of the body
//! - **body**: the encoded [`Message`]
//!
//! Body layout, all integers little-endian:
//!
//! ```text
//! qualifier       u16 len + utf8
//! correlation id  u8 flag (0 = none, 1 = some) [+ u16 len + utf8]
//! headers         u16 count, then per header: u16 len + utf8 key, u32 len + utf8 value
//! payload         u8 flag (0 = none, 1 = some) [+ u32 len + bytes]
//! ```
//!
//! Frames are self-delimiting, so a reader can pull complete messages out of a
//! byte stream with [`try_deserialize_frame`] and wait for more data otherwise.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use meshwire_core::Message;

/// Header size: 4 (length) + 4 (checksum) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Maximum frame size (16MB).
///
/// Frames larger than this are rejected on both ends.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Wire format error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Not enough data to parse the frame.
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData {
        /// Minimum bytes required to parse.
        needed: usize,
        /// Actual bytes available.
        have: usize,
    },

    /// Checksum verification failed - data was corrupted.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Expected checksum from header.
        expected: u32,
        /// Computed checksum from data.
        actual: u32,
    },

    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Frame size in bytes.
        size: usize,
        /// Limit in effect.
        max: usize,
    },

    /// Length field has an invalid value.
    #[error("invalid frame length: {length}")]
    InvalidLength {
        /// The invalid length value from the header.
        length: u32,
    },

    /// A string or header field does not fit its length prefix.
    #[error("field {field} too long: {len} bytes")]
    FieldTooLong {
        /// Which field overflowed.
        field: &'static str,
        /// Its length in bytes.
        len: usize,
    },

    /// The body does not follow the layout.
    #[error("malformed body: {message}")]
    Malformed {
        /// What was wrong.
        message: String,
    },
}

/// Frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame size including header.
    pub length: u32,
    /// CRC32C checksum of the body.
    pub checksum: u32,
}

impl FrameHeader {
    /// Deserialize header from buffer.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientData` if buffer is smaller than HEADER_SIZE.
    pub fn deserialize(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::InsufficientData {
                needed: HEADER_SIZE,
                have: buf.len(),
            });
        }
        let mut header = &buf[..HEADER_SIZE];
        Ok(Self {
            length: header.get_u32_le(),
            checksum: header.get_u32_le(),
        })
    }
}

fn put_str16(buf: &mut BytesMut, field: &'static str, s: &str) -> Result<(), WireError> {
    let len = u16::try_from(s.len()).map_err(|_| WireError::FieldTooLong {
        field,
        len: s.len(),
    })?;
    buf.put_u16_le(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_bytes32(buf: &mut BytesMut, field: &'static str, b: &[u8]) -> Result<(), WireError> {
    let len = u32::try_from(b.len()).map_err(|_| WireError::FieldTooLong {
        field,
        len: b.len(),
    })?;
    buf.put_u32_le(len);
    buf.put_slice(b);
    Ok(())
}

fn encode_body(message: &Message) -> Result<BytesMut, WireError> {
    let mut buf = BytesMut::with_capacity(64 + message.payload().map_or(0, |p| p.len()));

    put_str16(&mut buf, "qualifier", message.qualifier())?;

    match message.correlation_id() {
        Some(cid) => {
            buf.put_u8(1);
            put_str16(&mut buf, "correlation id", cid)?;
        }
        None => buf.put_u8(0),
    }

    let count = u16::try_from(message.headers().len()).map_err(|_| WireError::FieldTooLong {
        field: "headers",
        len: message.headers().len(),
    })?;
    buf.put_u16_le(count);
    for (key, value) in message.headers() {
        put_str16(&mut buf, "header key", key)?;
        put_bytes32(&mut buf, "header value", value.as_bytes())?;
    }

    match message.payload() {
        Some(payload) => {
            buf.put_u8(1);
            put_bytes32(&mut buf, "payload", payload)?;
        }
        None => buf.put_u8(0),
    }

    Ok(buf)
}

/// Checked reads over a frame body.
struct BodyReader {
    buf: Bytes,
}

impl BodyReader {
    fn need(&self, n: usize, what: &str) -> Result<(), WireError> {
        if self.buf.remaining() < n {
            return Err(WireError::Malformed {
                message: format!(
                    "truncated {what}: need {n} bytes, have {}",
                    self.buf.remaining()
                ),
            });
        }
        Ok(())
    }

    fn u8(&mut self, what: &str) -> Result<u8, WireError> {
        self.need(1, what)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self, what: &str) -> Result<u16, WireError> {
        self.need(2, what)?;
        Ok(self.buf.get_u16_le())
    }

    fn u32(&mut self, what: &str) -> Result<u32, WireError> {
        self.need(4, what)?;
        Ok(self.buf.get_u32_le())
    }

    fn bytes(&mut self, len: usize, what: &str) -> Result<Bytes, WireError> {
        self.need(len, what)?;
        Ok(self.buf.split_to(len))
    }

    fn string(&mut self, len: usize, what: &str) -> Result<String, WireError> {
        let raw = self.bytes(len, what)?;
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::Malformed {
            message: format!("{what} is not valid utf-8"),
        })
    }

    fn str16(&mut self, what: &str) -> Result<String, WireError> {
        let len = self.u16(what)? as usize;
        self.string(len, what)
    }

    fn flag(&mut self, what: &str) -> Result<bool, WireError> {
        match self.u8(what)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::Malformed {
                message: format!("invalid {what} flag {other}"),
            }),
        }
    }
}

fn decode_body(body: Bytes) -> Result<Message, WireError> {
    let mut reader = BodyReader { buf: body };

    let mut builder = Message::with_qualifier(reader.str16("qualifier")?);

    if reader.flag("correlation id")? {
        builder = builder.correlation_id(reader.str16("correlation id")?);
    }

    let count = reader.u16("header count")?;
    for _ in 0..count {
        let key = reader.str16("header key")?;
        let len = reader.u32("header value")? as usize;
        let value = reader.string(len, "header value")?;
        builder = builder.header(key, value);
    }

    if reader.flag("payload")? {
        let len = reader.u32("payload")? as usize;
        builder = builder.payload(reader.bytes(len, "payload")?);
    }

    if reader.buf.has_remaining() {
        return Err(WireError::Malformed {
            message: format!("{} trailing bytes", reader.buf.remaining()),
        });
    }

    Ok(builder.build())
}

/// Serialize a message into a frame.
///
/// Returns: `[length:4][checksum:4][body:N]`
///
/// # Errors
///
/// Returns `FrameTooLarge` if the frame exceeds MAX_FRAME_SIZE, or
/// `FieldTooLong` if a field does not fit its length prefix.
///
/// # Examples
///
/// ```
/// use meshwire_transport::{Message, deserialize_frame, serialize_frame};
///
/// let message = Message::with_qualifier("q/echo").correlation_id("7").build();
/// let frame = serialize_frame(&message).expect("serialize");
/// let decoded = deserialize_frame(&frame).expect("deserialize");
/// assert_eq!(message, decoded);
/// ```
pub fn serialize_frame(message: &Message) -> Result<Vec<u8>, WireError> {
    serialize_frame_with_limit(message, MAX_FRAME_SIZE)
}

/// Serialize a message, rejecting frames above `max_frame_size`.
///
/// # Errors
///
/// Same as [`serialize_frame`].
pub fn serialize_frame_with_limit(
    message: &Message,
    max_frame_size: usize,
) -> Result<Vec<u8>, WireError> {
    let body = encode_body(message)?;
    let total_length = frame_length(body.len(), max_frame_size)?;

    let mut data = Vec::with_capacity(HEADER_SIZE + body.len());
    data.put_u32_le(total_length);
    data.put_u32_le(crc32c::crc32c(&body));
    data.extend_from_slice(&body);
    Ok(data)
}

/// Length field for a frame carrying `body_len` bytes of body.
///
/// The length field is a `u32`, so a limit above `u32::MAX` never admits a
/// frame the field cannot describe.
fn frame_length(body_len: usize, max_frame_size: usize) -> Result<u32, WireError> {
    let total_length = HEADER_SIZE.saturating_add(body_len);
    let too_large = WireError::FrameTooLarge {
        size: total_length,
        max: max_frame_size,
    };
    if total_length > max_frame_size {
        return Err(too_large);
    }
    u32::try_from(total_length).map_err(|_| too_large)
}

/// Deserialize exactly one frame, validating checksum.
///
/// # Errors
///
/// - `InsufficientData`: Not enough bytes to parse header or full frame
/// - `ChecksumMismatch`: Data was corrupted
/// - `InvalidLength`: Length field is malformed
/// - `Malformed`: Body does not follow the layout
pub fn deserialize_frame(data: &[u8]) -> Result<Message, WireError> {
    match try_deserialize_frame(data)? {
        Some((message, _)) => Ok(message),
        None => {
            let needed = FrameHeader::deserialize(data)?.length as usize;
            Err(WireError::InsufficientData {
                needed,
                have: data.len(),
            })
        }
    }
}

/// Try to deserialize from a buffer that may contain partial data.
///
/// # Returns
///
/// - `Ok(Some((message, consumed)))` if a complete frame was parsed
/// - `Ok(None)` if more data is needed (not an error condition)
/// - `Err` if data is malformed
///
/// # Examples
///
/// ```
/// use meshwire_transport::{Message, serialize_frame, try_deserialize_frame};
///
/// let frame = serialize_frame(&Message::from_qualifier("q")).expect("serialize");
///
/// // Partial data returns None
/// assert!(try_deserialize_frame(&frame[..5]).expect("partial").is_none());
///
/// // Complete frame returns Some
/// let (_, consumed) = try_deserialize_frame(&frame).expect("complete").expect("frame");
/// assert_eq!(consumed, frame.len());
/// ```
pub fn try_deserialize_frame(data: &[u8]) -> Result<Option<(Message, usize)>, WireError> {
    try_deserialize_frame_with_limit(data, MAX_FRAME_SIZE)
}

/// [`try_deserialize_frame`] with an explicit frame size limit.
///
/// # Errors
///
/// Same as [`try_deserialize_frame`], plus `FrameTooLarge` as soon as a
/// header announces a frame above `max_frame_size`.
pub fn try_deserialize_frame_with_limit(
    data: &[u8],
    max_frame_size: usize,
) -> Result<Option<(Message, usize)>, WireError> {
    if data.len() < HEADER_SIZE {
        return Ok(None); // Need more data for header
    }

    let header = FrameHeader::deserialize(data)?;

    if header.length < HEADER_SIZE as u32 {
        return Err(WireError::InvalidLength {
            length: header.length,
        });
    }

    let expected_len = header.length as usize;
    if expected_len > max_frame_size {
        return Err(WireError::FrameTooLarge {
            size: expected_len,
            max: max_frame_size,
        });
    }
    if data.len() < expected_len {
        return Ok(None); // Need more data for body
    }

    let body = &data[HEADER_SIZE..expected_len];
    let computed = crc32c::crc32c(body);
    if computed != header.checksum {
        return Err(WireError::ChecksumMismatch {
            expected: header.checksum,
            actual: computed,
        });
    }

    let message = decode_body(Bytes::copy_from_slice(body))?;
    Ok(Some((message, expected_len)))
}
