//! XDR-style binary codec for virtd protocol frames and payloads.
//!
//! Frame format:
//! ```text
//! [len:4][program:4][version:4][procedure:4][type:4][serial:4][status:4][payload:N]
//! ```
//! `len` counts the whole frame including itself. The header is 24 bytes.
//! All integers are big-endian.
//!
//! Payload primitives follow XDR: 4-byte integers, 8-byte hypers, booleans as
//! a 4-byte 0/1, variable-length opaques and strings as a u32 length followed
//! by the bytes padded to a 4-byte boundary, optionals as a boolean
//! discriminant followed by the value.
//!
//! Every variable-length read is checked against the bytes actually present
//! and against a caller-supplied ceiling *before* anything is allocated.

use thiserror::Error;

use crate::protocol::limits::{MESSAGE_MAX, STRING_MAX};
use crate::protocol::messages::{MessageHeader, MessageStatus, MessageType, HEADER_SIZE, LEN_PREFIX_SIZE};

/// Errors produced while encoding or decoding frames and payloads.
#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    /// The byte slice is shorter than the data it claims to hold.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// A peer-supplied count or size is above its compiled-in ceiling.
    #[error("{what} count {count} exceeds limit {limit}")]
    LimitExceeded {
        what: &'static str,
        count: usize,
        limit: usize,
    },

    /// A typed parameter field name does not fit its fixed buffer.
    #[error("parameter '{field}' too big for destination (max {max} bytes)")]
    FieldTooLong { field: String, max: usize },

    /// A typed parameter carries a tag this codec does not know.
    #[error("unknown parameter type {tag} for '{field}'")]
    UnknownTag { field: String, tag: i32 },

    /// The payload could not be parsed (bad discriminant, UTF-8 error, ...).
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// Bytes were left over after the declared record was decoded.
    #[error("{0} trailing bytes after payload")]
    TrailingData(usize),
}

// ── Encode / decode traits ────────────────────────────────────────────────────

/// A record that can be written in wire form.
pub trait WireEncode {
    /// Appends the wire form of `self` to `w`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] when the value violates a wire invariant (for
    /// example a typed parameter name longer than its buffer).
    fn encode(&self, w: &mut WireWriter) -> Result<(), CodecError>;
}

/// A record that can be read back from wire form.
pub trait WireDecode: Sized {
    /// Reads one value from `r`, advancing its cursor.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] for truncated, malformed or over-limit input.
    fn decode(r: &mut WireReader<'_>) -> Result<Self, CodecError>;
}

impl WireEncode for () {
    fn encode(&self, _w: &mut WireWriter) -> Result<(), CodecError> {
        Ok(())
    }
}

impl WireDecode for () {
    fn decode(_r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        Ok(())
    }
}

/// Encodes `value` into a fresh byte vector.
///
/// # Errors
///
/// Propagates any [`CodecError`] from the record's [`WireEncode`] impl.
pub fn to_bytes<T: WireEncode>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut w = WireWriter::new();
    value.encode(&mut w)?;
    Ok(w.into_bytes())
}

/// Decodes exactly one `T` from `bytes`; leftover bytes are an error.
///
/// # Errors
///
/// Returns [`CodecError::TrailingData`] if the record does not consume the
/// whole slice, or any error from the record's [`WireDecode`] impl.
pub fn from_bytes<T: WireDecode>(bytes: &[u8]) -> Result<T, CodecError> {
    let mut r = WireReader::new(bytes);
    let value = T::decode(&mut r)?;
    r.finish()?;
    Ok(value)
}

// ── Frames ────────────────────────────────────────────────────────────────────

/// Encodes a complete frame: length prefix, header, payload.
///
/// # Errors
///
/// Returns [`CodecError::LimitExceeded`] when the frame would exceed
/// [`MESSAGE_MAX`].
///
/// # Examples
///
/// ```rust
/// use virtd_core::protocol::codec::{decode_frame, encode_frame};
/// use virtd_core::protocol::messages::{MessageHeader, MessageType, MessageStatus, REMOTE_PROGRAM, REMOTE_PROTOCOL_VERSION};
///
/// let header = MessageHeader {
///     program: REMOTE_PROGRAM,
///     version: REMOTE_PROTOCOL_VERSION,
///     procedure: 1,
///     msg_type: MessageType::Call,
///     serial: 7,
///     status: MessageStatus::Ok,
/// };
/// let bytes = encode_frame(&header, &[0, 0, 0, 1]).unwrap();
/// let (decoded, payload, consumed) = decode_frame(&bytes).unwrap();
/// assert_eq!(decoded, header);
/// assert_eq!(payload, &[0, 0, 0, 1]);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_frame(header: &MessageHeader, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let total = LEN_PREFIX_SIZE + HEADER_SIZE + payload.len();
    if total > MESSAGE_MAX {
        return Err(CodecError::LimitExceeded {
            what: "message bytes",
            count: total,
            limit: MESSAGE_MAX,
        });
    }

    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&(total as u32).to_be_bytes());
    buf.extend_from_slice(&header.program.to_be_bytes());
    buf.extend_from_slice(&header.version.to_be_bytes());
    buf.extend_from_slice(&header.procedure.to_be_bytes());
    buf.extend_from_slice(&(header.msg_type as i32).to_be_bytes());
    buf.extend_from_slice(&header.serial.to_be_bytes());
    buf.extend_from_slice(&(header.status as i32).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Validates a frame length prefix and returns the number of bytes that
/// follow it (header plus payload).
///
/// The stream reader calls this before it allocates the frame body.
///
/// # Errors
///
/// Returns [`CodecError::LimitExceeded`] above [`MESSAGE_MAX`] and
/// [`CodecError::Malformed`] when the frame cannot even hold a header.
pub fn frame_body_len(prefix: [u8; LEN_PREFIX_SIZE]) -> Result<usize, CodecError> {
    let total = u32::from_be_bytes(prefix) as usize;
    if total > MESSAGE_MAX {
        return Err(CodecError::LimitExceeded {
            what: "message bytes",
            count: total,
            limit: MESSAGE_MAX,
        });
    }
    if total < LEN_PREFIX_SIZE + HEADER_SIZE {
        return Err(CodecError::Malformed(format!(
            "frame length {total} is shorter than the {} byte header",
            LEN_PREFIX_SIZE + HEADER_SIZE
        )));
    }
    Ok(total - LEN_PREFIX_SIZE)
}

/// Decodes one frame from the beginning of `bytes`.
///
/// Returns the header, a borrowed payload slice and the total number of bytes
/// consumed so the caller can advance their read cursor.
///
/// # Errors
///
/// Returns [`CodecError`] if the bytes are truncated or the header is invalid.
pub fn decode_frame(bytes: &[u8]) -> Result<(MessageHeader, &[u8], usize), CodecError> {
    if bytes.len() < LEN_PREFIX_SIZE {
        return Err(CodecError::InsufficientData {
            needed: LEN_PREFIX_SIZE,
            available: bytes.len(),
        });
    }
    let body_len = frame_body_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    let total = LEN_PREFIX_SIZE + body_len;
    if bytes.len() < total {
        return Err(CodecError::InsufficientData {
            needed: total,
            available: bytes.len(),
        });
    }
    let header = decode_header(&bytes[LEN_PREFIX_SIZE..LEN_PREFIX_SIZE + HEADER_SIZE])?;
    Ok((header, &bytes[LEN_PREFIX_SIZE + HEADER_SIZE..total], total))
}

/// Decodes the 24-byte header that follows the length prefix.
///
/// # Errors
///
/// Returns [`CodecError`] for a short slice or an unknown type/status value.
pub fn decode_header(bytes: &[u8]) -> Result<MessageHeader, CodecError> {
    let mut r = WireReader::new(bytes);
    let program = r.get_u32()?;
    let version = r.get_u32()?;
    let procedure = r.get_i32()?;
    let raw_type = r.get_i32()?;
    let serial = r.get_u32()?;
    let raw_status = r.get_i32()?;

    let msg_type = MessageType::try_from(raw_type)
        .map_err(|_| CodecError::Malformed(format!("unknown message type {raw_type}")))?;
    let status = MessageStatus::try_from(raw_status)
        .map_err(|_| CodecError::Malformed(format!("unknown message status {raw_status}")))?;

    Ok(MessageHeader {
        program,
        version,
        procedure,
        msg_type,
        serial,
        status,
    })
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// Append-only buffer for XDR primitives.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Appends the already-encoded contents of another writer.
    pub fn append(&mut self, other: WireWriter) {
        self.buf.extend_from_slice(&other.buf);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_bits().to_be_bytes());
    }

    pub fn put_bool(&mut self, v: bool) {
        self.put_i32(i32::from(v));
    }

    /// Writes a u32 element count, rejecting counts above `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::LimitExceeded`] when `count > limit`.
    pub fn put_count(&mut self, what: &'static str, count: usize, limit: usize) -> Result<(), CodecError> {
        if count > limit {
            return Err(CodecError::LimitExceeded { what, count, limit });
        }
        self.put_u32(count as u32);
        Ok(())
    }

    /// Writes a variable-length opaque blob bounded by `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::LimitExceeded`] when the blob is over `limit`.
    pub fn put_opaque(&mut self, what: &'static str, data: &[u8], limit: usize) -> Result<(), CodecError> {
        self.put_count(what, data.len(), limit)?;
        self.put_fixed_opaque(data);
        Ok(())
    }

    /// Writes raw bytes followed by XDR padding, without a length prefix.
    pub fn put_fixed_opaque(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        self.buf.extend(std::iter::repeat(0u8).take(padding(data.len())));
    }

    /// Writes a string bounded by [`STRING_MAX`].
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::LimitExceeded`] for an oversized string.
    pub fn put_string(&mut self, s: &str) -> Result<(), CodecError> {
        self.put_opaque("string bytes", s.as_bytes(), STRING_MAX)
    }

    /// Writes an optional string as a discriminant plus the value.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::LimitExceeded`] for an oversized string.
    pub fn put_opt_string(&mut self, s: Option<&str>) -> Result<(), CodecError> {
        match s {
            Some(s) => {
                self.put_bool(true);
                self.put_string(s)
            }
            None => {
                self.put_bool(false);
                Ok(())
            }
        }
    }

    /// Writes an optional record as a discriminant plus the value.
    ///
    /// # Errors
    ///
    /// Propagates the record's encode error.
    pub fn put_opt<T: WireEncode>(&mut self, v: Option<&T>) -> Result<(), CodecError> {
        match v {
            Some(v) => {
                self.put_bool(true);
                v.encode(self)
            }
            None => {
                self.put_bool(false);
                Ok(())
            }
        }
    }
}

// ── Reader ────────────────────────────────────────────────────────────────────

/// Cursor over a borrowed payload.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Fails if any bytes are left unread.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TrailingData`] with the leftover count.
    pub fn finish(&self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingData(n)),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::InsufficientData {
                needed: self.pos + n,
                available: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn get_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn get_i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    pub fn get_u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    pub fn get_f64(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_bits(self.get_u64()?))
    }

    pub fn get_bool(&mut self) -> Result<bool, CodecError> {
        match self.get_i32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::Malformed(format!("invalid boolean {other}"))),
        }
    }

    /// Reads a u32 element count and checks it against `limit`.
    ///
    /// The check happens before the caller allocates anything for the
    /// elements, so an oversized count costs nothing.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::LimitExceeded`] when the count is over `limit`.
    pub fn get_count(&mut self, what: &'static str, limit: usize) -> Result<usize, CodecError> {
        let count = self.get_u32()? as usize;
        if count > limit {
            return Err(CodecError::LimitExceeded { what, count, limit });
        }
        Ok(count)
    }

    /// Capacity hint for a vector of `count` elements each at least
    /// `min_elem_size` bytes wide, clamped to what the input can still hold.
    pub fn capacity_hint(&self, count: usize, min_elem_size: usize) -> usize {
        count.min(self.remaining() / min_elem_size.max(1))
    }

    /// Reads a variable-length opaque blob bounded by `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::LimitExceeded`] or [`CodecError::InsufficientData`].
    pub fn get_opaque(&mut self, what: &'static str, limit: usize) -> Result<Vec<u8>, CodecError> {
        let len = self.get_count(what, limit)?;
        self.get_fixed_opaque(len)
    }

    /// Reads `len` raw bytes plus XDR padding.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InsufficientData`] if the input is too short.
    pub fn get_fixed_opaque(&mut self, len: usize) -> Result<Vec<u8>, CodecError> {
        let data = self.take(len)?.to_vec();
        self.take(padding(len))?;
        Ok(data)
    }

    /// Reads a UTF-8 string of at most `limit` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Malformed`] for invalid UTF-8.
    pub fn get_string_bounded(&mut self, what: &'static str, limit: usize) -> Result<String, CodecError> {
        let bytes = self.get_opaque(what, limit)?;
        String::from_utf8(bytes).map_err(|e| CodecError::Malformed(format!("invalid UTF-8: {e}")))
    }

    /// Reads a string bounded by [`STRING_MAX`].
    ///
    /// # Errors
    ///
    /// See [`WireReader::get_string_bounded`].
    pub fn get_string(&mut self) -> Result<String, CodecError> {
        self.get_string_bounded("string bytes", STRING_MAX)
    }

    /// Reads an optional string.
    ///
    /// # Errors
    ///
    /// See [`WireReader::get_string`].
    pub fn get_opt_string(&mut self) -> Result<Option<String>, CodecError> {
        if self.get_bool()? {
            Ok(Some(self.get_string()?))
        } else {
            Ok(None)
        }
    }

    /// Reads an optional record.
    ///
    /// # Errors
    ///
    /// Propagates the record's decode error.
    pub fn get_opt<T: WireDecode>(&mut self) -> Result<Option<T>, CodecError> {
        if self.get_bool()? {
            Ok(Some(T::decode(self)?))
        } else {
            Ok(None)
        }
    }
}

/// XDR pads every opaque to a multiple of four bytes.
fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

// ── Tests ─────────────────────────────────────────────────────────────────────
