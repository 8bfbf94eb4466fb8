// CQL native protocol codec - separates the wire format from the transport
// machinery.
//
// Every frame is an 8-byte header followed by `length` body bytes. The
// writer buffers the whole body so the length prefix can be back-filled
// before a single contiguous socket write; the reader wraps a fully
// received body so user decoders can never disturb frame alignment.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;
use std::io::Cursor;
use thiserror::Error;
use uuid::Uuid;

/// Upper bound on the body length of a single frame.
pub const MAX_FRAME_LENGTH: u32 = 256 * 1024 * 1024;

/// Direction bit of the version byte; set on responses.
pub const DIRECTION_RESPONSE: u8 = 0x80;

/// Header flag reserved for body compression. Never set by this crate.
pub const FLAG_COMPRESSION: u8 = 0x01;

/// Header flag asking the server to trace the request; on responses it
/// announces a tracing id ahead of the body.
pub const FLAG_TRACING: u8 = 0x02;

/// Native protocol versions this transport can announce.
#[derive(TryFromPrimitive)]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    V1 = 0x01,
    V2 = 0x02,
}

/// Frame opcodes of the native protocol.
///
/// The transport treats almost all of these as opaque values declared by
/// the caller's writer capability; it only inspects `Error` (to pre-parse
/// the failure payload) and the handshake set (`Startup`, `Ready`,
/// `Authenticate`, `Credentials`).
#[derive(TryFromPrimitive)]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    Error = 0x00,
    Startup = 0x01,
    Ready = 0x02,
    Authenticate = 0x03,
    Credentials = 0x04,
    Options = 0x05,
    Supported = 0x06,
    Query = 0x07,
    Result = 0x08,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Event = 0x0C,
}

/// Codec errors with enough context to tell framing faults from decoder
/// misuse.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame body exhausted: needed {needed} more bytes, {remaining} left")]
    ShortBody { needed: usize, remaining: usize },

    #[error("negative length {0} for {1}")]
    NegativeLength(i32, &'static str),

    #[error("invalid opcode: {0:#04x}")]
    InvalidOpcode(u8),

    #[error("invalid response version byte: {0:#04x}")]
    InvalidVersion(u8),

    #[error("frame length {length} exceeds the {max} byte limit")]
    OversizedFrame { length: u32, max: u32 },

    #[error("unexpected opcode: expected {expected:?}, got {actual:?}")]
    UnexpectedOpcode { expected: Opcode, actual: Opcode },

    #[error("frame writer finished without declaring an opcode")]
    MissingOpcode,

    #[error("malformed UTF-8 in {field}")]
    Utf8 {
        field: &'static str,
        #[source]
        source: std::string::FromUtf8Error,
    },
}

/// Fixed frame header (8 bytes, network byte order).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub flags: u8,
    pub stream: i8,
    pub opcode: Opcode,
    pub length: u32,
}

impl FrameHeader {
    pub const SIZE: usize = 8;

    /// Decode and validate a response header.
    ///
    /// Any failure here is a framing fault: the next frame boundary is
    /// unknowable and the connection must come down.
    pub fn decode(raw: &[u8; Self::SIZE]) -> Result<Self, CodecError> {
        let version = raw[0];
        if version & DIRECTION_RESPONSE == 0 {
            return Err(CodecError::InvalidVersion(version));
        }
        let opcode = Opcode::try_from(raw[3]).map_err(|_| CodecError::InvalidOpcode(raw[3]))?;
        let length = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        if length > MAX_FRAME_LENGTH {
            return Err(CodecError::OversizedFrame {
                length,
                max: MAX_FRAME_LENGTH,
            });
        }
        Ok(FrameHeader {
            version,
            flags: raw[1],
            stream: raw[2] as i8,
            opcode,
            length,
        })
    }

    pub fn tracing(&self) -> bool {
        self.flags & FLAG_TRACING != 0
    }
}

/// Buffers one request frame so the 32-bit length prefix can be
/// back-filled before a single contiguous write to the socket.
///
/// The writer capability declares the opcode (and optionally the tracing
/// flag); the write pump assigns the stream id when it seals the frame.
#[derive(Debug)]
pub struct FrameWriter {
    version: ProtocolVersion,
    opcode: Option<Opcode>,
    tracing: bool,
    buf: BytesMut,
}

impl FrameWriter {
    pub fn new(version: ProtocolVersion) -> Self {
        let mut buf = BytesMut::with_capacity(256);
        buf.resize(FrameHeader::SIZE, 0);
        FrameWriter {
            version,
            opcode: None,
            tracing: false,
            buf,
        }
    }

    /// Declare the request opcode carried in the header.
    pub fn set_opcode(&mut self, opcode: Opcode) {
        self.opcode = Some(opcode);
    }

    /// Ask the server to trace this request (sets the tracing header bit).
    pub fn enable_tracing(&mut self) {
        self.tracing = true;
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.put_u16(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    /// `[string]`: u16 length followed by UTF-8 bytes.
    pub fn write_string(&mut self, value: &str) {
        self.buf.put_u16(value.len() as u16);
        self.buf.put_slice(value.as_bytes());
    }

    /// `[long string]`: i32 length followed by UTF-8 bytes.
    pub fn write_long_string(&mut self, value: &str) {
        self.buf.put_i32(value.len() as i32);
        self.buf.put_slice(value.as_bytes());
    }

    /// `[string map]`: u16 pair count, then alternating key/value strings.
    pub fn write_string_map(&mut self, pairs: &[(&str, &str)]) {
        self.buf.put_u16(pairs.len() as u16);
        for (key, value) in pairs {
            self.write_string(key);
            self.write_string(value);
        }
    }

    /// `[bytes]`: i32 length then raw bytes; `None` encodes as -1.
    pub fn write_bytes(&mut self, value: Option<&[u8]>) {
        match value {
            Some(raw) => {
                self.buf.put_i32(raw.len() as i32);
                self.buf.put_slice(raw);
            }
            None => self.buf.put_i32(-1),
        }
    }

    /// `[short bytes]`: u16 length then raw bytes.
    pub fn write_short_bytes(&mut self, value: &[u8]) {
        self.buf.put_u16(value.len() as u16);
        self.buf.put_slice(value);
    }

    /// Append raw bytes with no length prefix.
    pub fn write_raw(&mut self, value: &[u8]) {
        self.buf.put_slice(value);
    }

    pub fn body_len(&self) -> usize {
        self.buf.len() - FrameHeader::SIZE
    }

    /// Seal the frame under the given stream id: back-fill the header and
    /// hand back one contiguous buffer for a single socket write.
    pub fn finish(mut self, stream: i8) -> Result<Bytes, CodecError> {
        let opcode = self.opcode.ok_or(CodecError::MissingOpcode)?;
        let length = (self.buf.len() - FrameHeader::SIZE) as u32;
        self.buf[0] = self.version as u8;
        self.buf[1] = if self.tracing { FLAG_TRACING } else { 0 };
        self.buf[2] = stream as u8;
        self.buf[3] = opcode as u8;
        self.buf[4..FrameHeader::SIZE].copy_from_slice(&length.to_be_bytes());
        Ok(self.buf.freeze())
    }
}

/// Read side of one response frame.
///
/// The body is fully buffered before the caller's decoder runs, so an
/// under- or over-reading decoder can never desynchronize the socket: the
/// unconsumed tail is simply dropped with the reader, and a read past the
/// end yields `ShortBody` instead of touching the next frame.
#[derive(Debug)]
pub struct FrameReader {
    header: FrameHeader,
    tracing_id: Option<Uuid>,
    server_error: Option<(i32, String)>,
    body: Cursor<Bytes>,
}

impl FrameReader {
    /// Bind a reader to a decoded header and its complete body.
    ///
    /// The tracing id (when the tracing flag is set) and the failure
    /// payload (when the opcode is `Error`) are parsed eagerly, before any
    /// user decoding runs.
    pub fn new(header: FrameHeader, body: Bytes) -> Result<Self, CodecError> {
        let mut reader = FrameReader {
            header,
            tracing_id: None,
            server_error: None,
            body: Cursor::new(body),
        };
        if header.tracing() {
            let mut raw = [0u8; 16];
            reader.read_slice(&mut raw)?;
            reader.tracing_id = Some(Uuid::from_bytes(raw));
        }
        if header.opcode == Opcode::Error {
            let code = reader.read_i32()?;
            let message = reader.read_string()?;
            reader.server_error = Some((code, message));
        }
        Ok(reader)
    }

    pub fn stream(&self) -> i8 {
        self.header.stream
    }

    pub fn opcode(&self) -> Opcode {
        self.header.opcode
    }

    pub fn flags(&self) -> u8 {
        self.header.flags
    }

    /// The server's tracing session id, when the response carries one.
    pub fn tracing_id(&self) -> Option<Uuid> {
        self.tracing_id
    }

    /// The pre-parsed failure payload of an error-opcode frame.
    pub fn server_error(&self) -> Option<&(i32, String)> {
        self.server_error.as_ref()
    }

    pub fn remaining(&self) -> usize {
        self.body.remaining()
    }

    fn check(&self, needed: usize) -> Result<(), CodecError> {
        let remaining = self.body.remaining();
        if remaining < needed {
            return Err(CodecError::ShortBody {
                needed: needed - remaining,
                remaining,
            });
        }
        Ok(())
    }

    fn read_slice(&mut self, dst: &mut [u8]) -> Result<(), CodecError> {
        self.check(dst.len())?;
        self.body.copy_to_slice(dst);
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        self.check(1)?;
        Ok(self.body.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        self.check(2)?;
        Ok(self.body.get_u16())
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        self.check(4)?;
        Ok(self.body.get_i32())
    }

    /// `[string]`: u16 length followed by UTF-8 bytes.
    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_u16()? as usize;
        self.read_utf8(len, "string")
    }

    /// `[long string]`: i32 length followed by UTF-8 bytes.
    pub fn read_long_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(CodecError::NegativeLength(len, "long string"));
        }
        self.read_utf8(len as usize, "long string")
    }

    /// `[bytes]`: i32 length then raw bytes; a negative length is null.
    pub fn read_bytes(&mut self) -> Result<Option<Bytes>, CodecError> {
        let len = self.read_i32()?;
        if len < 0 {
            return Ok(None);
        }
        let len = len as usize;
        self.check(len)?;
        Ok(Some(self.body.copy_to_bytes(len)))
    }

    /// `[short bytes]`: u16 length then raw bytes.
    pub fn read_short_bytes(&mut self) -> Result<Bytes, CodecError> {
        let len = self.read_u16()? as usize;
        self.check(len)?;
        Ok(self.body.copy_to_bytes(len))
    }

    /// `[string list]`: u16 count, then that many strings.
    pub fn read_string_list(&mut self) -> Result<Vec<String>, CodecError> {
        let count = self.read_u16()? as usize;
        let mut items = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            items.push(self.read_string()?);
        }
        Ok(items)
    }

    /// `[string map]`: u16 pair count, then alternating key/value strings.
    pub fn read_string_map(&mut self) -> Result<Vec<(String, String)>, CodecError> {
        let count = self.read_u16()? as usize;
        let mut pairs = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let key = self.read_string()?;
            let value = self.read_string()?;
            pairs.push((key, value));
        }
        Ok(pairs)
    }

    /// `[string multimap]`: u16 entry count, then string keys each followed
    /// by a string list. Carried by the `Supported` response.
    pub fn read_string_multimap(&mut self) -> Result<Vec<(String, Vec<String>)>, CodecError> {
        let count = self.read_u16()? as usize;
        let mut entries = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let key = self.read_string()?;
            let values = self.read_string_list()?;
            entries.push((key, values));
        }
        Ok(entries)
    }

    /// Everything left in the body, without a length prefix.
    pub fn read_remaining(&mut self) -> Bytes {
        let len = self.body.remaining();
        self.body.copy_to_bytes(len)
    }

    fn read_utf8(&mut self, len: usize, field: &'static str) -> Result<String, CodecError> {
        self.check(len)?;
        let raw = self.body.copy_to_bytes(len);
        String::from_utf8(raw.to_vec()).map_err(|source| CodecError::Utf8 { field, source })
    }
}
