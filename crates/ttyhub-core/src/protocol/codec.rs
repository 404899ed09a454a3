//! Binary codec for device link frames.
//!
//! Wire format:
//! ```text
//! [version:1][msg_type:1][body_len:2][body:N]
//! ```
//! Control bodies are TLV attributes `[tag:1][len:2][value]`; string values
//! are NUL-terminated inside their declared length.  All multi-byte integers
//! are big-endian.
//!
//! Decoding never panics on short or hostile input.  Every failure is a
//! typed [`ProtocolError`]; the connection layer decides which ones are
//! fatal (see [`ProtocolError::is_fatal`]).

use bytes::Bytes;
use thiserror::Error;
use tracing::trace;

use crate::domain::addr::ADDR_DESCRIPTOR_LEN;
use crate::domain::{AddrDescriptor, SessionId};
use crate::protocol::messages::{
    AnnounceCode, AnnounceMessage, AttrTag, CommandMessage, DataKind, FileMessage, FileOp, Frame,
    HeartbeatMessage, LoginAckMessage, LoginMessage, LogoutMessage, MessageType, RegisterAckMessage,
    RegisterCode, RegisterMessage, TermDataMessage, WebDataMessage, WindowSizeMessage,
    ATTR_HEADER_SIZE, HEADER_SIZE, MAX_BODY_LEN, PROTOCOL_VERSION,
};

/// Errors that can occur during frame encoding or decoding.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the minimum required length.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The message type byte in the header is not a recognized value.
    #[error("unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    /// The protocol version in the header is not supported.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The body could not be parsed (value out of range, UTF-8 error, etc.).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The header's body length is larger than the bytes available.
    #[error("payload length mismatch: header says {declared}, available is {available}")]
    PayloadLengthMismatch { declared: usize, available: usize },

    /// An attribute's declared length runs past the end of the body.
    #[error("truncated attribute 0x{tag:02X}: declared {declared} bytes, {available} available")]
    TruncatedAttribute {
        tag: u8,
        declared: usize,
        available: usize,
    },

    /// A control message is missing an attribute it cannot do without.
    #[error("missing required attribute {0:?}")]
    MissingAttribute(AttrTag),

    /// The encoded body would not fit the 2-byte length field.
    #[error("frame body of {0} bytes exceeds the 65535-byte limit")]
    BodyTooLarge(usize),

    /// A single attribute value would not fit its 2-byte length field.
    #[error("attribute {tag:?} of {len} bytes exceeds the 65535-byte limit")]
    AttributeTooLarge { tag: AttrTag, len: usize },
}

impl ProtocolError {
    /// Whether the byte stream itself can no longer be trusted.
    ///
    /// Only an unreadable header is fatal.  Anything else concerns a single
    /// frame whose length is known, so the reader can skip it and carry on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::UnsupportedVersion(_))
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`Frame`] into a byte vector including the 4-byte header.
///
/// # Errors
///
/// Returns [`ProtocolError::BodyTooLarge`] or
/// [`ProtocolError::AttributeTooLarge`] if the frame cannot be represented
/// with 16-bit lengths.
///
/// # Examples
///
/// ```rust
/// use ttyhub_core::protocol::{decode_frame, encode_frame};
/// use ttyhub_core::protocol::messages::{Frame, HeartbeatMessage};
///
/// let frame = Frame::Heartbeat(HeartbeatMessage { uptime: Some(42) });
/// let bytes = encode_frame(&frame).unwrap();
/// let (decoded, consumed) = decode_frame(&bytes).unwrap();
/// assert_eq!(decoded, frame);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + 32);
    buf.push(PROTOCOL_VERSION);
    buf.push(frame.message_type() as u8);
    // Body length placeholder, patched once the body is written.
    buf.extend_from_slice(&[0x00, 0x00]);

    encode_body(&mut buf, frame)?;

    let body_len = buf.len() - HEADER_SIZE;
    if body_len > MAX_BODY_LEN {
        return Err(ProtocolError::BodyTooLarge(body_len));
    }
    buf[2..4].copy_from_slice(&(body_len as u16).to_be_bytes());
    Ok(buf)
}

/// Reports how long the frame at the start of `bytes` is, once its header
/// has arrived.
///
/// Returns `Ok(None)` while fewer bytes than a full frame are buffered.  The
/// message type is deliberately not validated here so a stream reader can
/// skip frames it does not understand.
///
/// # Errors
///
/// Returns [`ProtocolError::UnsupportedVersion`] when the header's version
/// byte is wrong; the stream cannot be resynchronised after that.
pub fn frame_len(bytes: &[u8]) -> Result<Option<usize>, ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Ok(None);
    }
    if bytes[0] != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(bytes[0]));
    }
    let total = HEADER_SIZE + u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    Ok((bytes.len() >= total).then_some(total))
}

/// Decodes one [`Frame`] from the beginning of `bytes`.
///
/// Returns the decoded frame and the total number of bytes consumed
/// (header + body), so the caller can advance their read cursor.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the bytes are malformed.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let version = bytes[0];
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let type_byte = bytes[1];
    let msg_type =
        MessageType::try_from(type_byte).map_err(|_| ProtocolError::UnknownMessageType(type_byte))?;

    let body_len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    let total = HEADER_SIZE + body_len;
    if bytes.len() < total {
        return Err(ProtocolError::PayloadLengthMismatch {
            declared: body_len,
            available: bytes.len() - HEADER_SIZE,
        });
    }

    let frame = decode_body(msg_type, &bytes[HEADER_SIZE..total])?;
    Ok((frame, total))
}

// ── Body encoding ─────────────────────────────────────────────────────────────

fn encode_body(buf: &mut Vec<u8>, frame: &Frame) -> Result<(), ProtocolError> {
    match frame {
        Frame::Register(m) => {
            put_str_attr(buf, AttrTag::DeviceId, &m.device_id)?;
            if !m.group.is_empty() {
                put_str_attr(buf, AttrTag::Group, &m.group)?;
            }
            if let Some(token) = &m.token {
                put_str_attr(buf, AttrTag::Token, token)?;
            }
            put_str_attr(buf, AttrTag::Description, &m.description)?;
            put_attr(buf, AttrTag::ProtoVersion, &[m.proto_version])?;
            if let Some(keepalive) = m.keepalive {
                put_attr(buf, AttrTag::Keepalive, &keepalive.to_be_bytes())?;
            }
        }
        Frame::RegisterAck(m) => {
            put_attr(buf, AttrTag::Code, &[m.code as u8])?;
            put_str_attr(buf, AttrTag::Reason, &m.reason)?;
        }
        Frame::Login(m) => put_sid_attr(buf, &m.sid)?,
        Frame::LoginAck(m) => {
            put_sid_attr(buf, &m.sid)?;
            put_attr(buf, AttrTag::Code, &[m.code])?;
        }
        Frame::Logout(m) => put_sid_attr(buf, &m.sid)?,
        Frame::TermData(m) => {
            buf.push(m.kind as u8);
            buf.extend_from_slice(m.sid.to_wire().as_bytes());
            buf.push(0x00);
            buf.extend_from_slice(&m.data);
        }
        Frame::WindowSize(m) => {
            put_sid_attr(buf, &m.sid)?;
            put_attr(buf, AttrTag::Cols, &m.cols.to_be_bytes())?;
            put_attr(buf, AttrTag::Rows, &m.rows.to_be_bytes())?;
        }
        Frame::Announce(m) => {
            put_attr(buf, AttrTag::Code, &[m.code as u8])?;
            put_str_attr(buf, AttrTag::Reason, &m.reason)?;
        }
        Frame::File(m) => {
            put_sid_attr(buf, &m.sid)?;
            put_attr(buf, AttrTag::FileOp, &[m.op as u8])?;
            if let Some(name) = &m.name {
                put_str_attr(buf, AttrTag::FileName, name)?;
            }
            if let Some(size) = m.size {
                put_attr(buf, AttrTag::FileSize, &size.to_be_bytes())?;
            }
        }
        Frame::CommandRequest(m) | Frame::CommandResponse(m) => {
            put_str_attr(buf, AttrTag::CommandToken, &m.token)?;
            put_attr(buf, AttrTag::Payload, &m.payload)?;
        }
        Frame::WebData(m) => {
            buf.extend_from_slice(&m.src.to_bytes());
            buf.extend_from_slice(&m.dst.to_bytes());
            buf.extend_from_slice(&m.payload);
        }
        Frame::Heartbeat(m) => {
            if let Some(uptime) = m.uptime {
                put_attr(buf, AttrTag::Uptime, &uptime.to_be_bytes())?;
            }
        }
    }
    Ok(())
}

// ── Body decoding ─────────────────────────────────────────────────────────────

fn decode_body(msg_type: MessageType, body: &[u8]) -> Result<Frame, ProtocolError> {
    match msg_type {
        MessageType::TermData => decode_term_data(body).map(Frame::TermData),
        MessageType::WebData => decode_web_data(body).map(Frame::WebData),
        _ => {
            let attrs = Attributes::parse(body)?;
            decode_tlv(msg_type, &attrs)
        }
    }
}

fn decode_tlv(msg_type: MessageType, attrs: &Attributes<'_>) -> Result<Frame, ProtocolError> {
    let frame = match msg_type {
        MessageType::Register => Frame::Register(RegisterMessage {
            device_id: attrs.require_string(AttrTag::DeviceId)?,
            group: attrs.string(AttrTag::Group)?.unwrap_or_default(),
            token: attrs.string(AttrTag::Token)?,
            description: attrs.string(AttrTag::Description)?.unwrap_or_default(),
            proto_version: attrs.u8(AttrTag::ProtoVersion)?.unwrap_or(PROTOCOL_VERSION),
            keepalive: attrs.u16(AttrTag::Keepalive)?,
        }),
        MessageType::RegisterAck => {
            let code = attrs.require_u8(AttrTag::Code)?;
            Frame::RegisterAck(RegisterAckMessage {
                code: RegisterCode::try_from(code).map_err(|_| {
                    ProtocolError::MalformedPayload(format!("unknown register code: {code}"))
                })?,
                reason: attrs.string(AttrTag::Reason)?.unwrap_or_default(),
            })
        }
        MessageType::Login => Frame::Login(LoginMessage {
            sid: attrs.session_id()?,
        }),
        MessageType::LoginAck => Frame::LoginAck(LoginAckMessage {
            sid: attrs.session_id()?,
            code: attrs.u8(AttrTag::Code)?.unwrap_or(0),
        }),
        MessageType::Logout => Frame::Logout(LogoutMessage {
            sid: attrs.session_id()?,
        }),
        MessageType::WindowSize => Frame::WindowSize(WindowSizeMessage {
            sid: attrs.session_id()?,
            cols: attrs.require_u16(AttrTag::Cols)?,
            rows: attrs.require_u16(AttrTag::Rows)?,
        }),
        MessageType::Announce => {
            let code = attrs.require_u8(AttrTag::Code)?;
            Frame::Announce(AnnounceMessage {
                code: AnnounceCode::try_from(code).map_err(|_| {
                    ProtocolError::MalformedPayload(format!("unknown announce code: {code}"))
                })?,
                reason: attrs.string(AttrTag::Reason)?.unwrap_or_default(),
            })
        }
        MessageType::File => {
            let op = attrs.require_u8(AttrTag::FileOp)?;
            Frame::File(FileMessage {
                sid: attrs.session_id()?,
                op: FileOp::try_from(op)
                    .map_err(|_| ProtocolError::MalformedPayload(format!("unknown file op: {op}")))?,
                name: attrs.string(AttrTag::FileName)?,
                size: attrs.u32(AttrTag::FileSize)?,
            })
        }
        MessageType::CommandRequest => Frame::CommandRequest(decode_command(attrs)?),
        MessageType::CommandResponse => Frame::CommandResponse(decode_command(attrs)?),
        MessageType::Heartbeat => Frame::Heartbeat(HeartbeatMessage {
            uptime: attrs.u32(AttrTag::Uptime)?,
        }),
        MessageType::TermData | MessageType::WebData => {
            return Err(ProtocolError::MalformedPayload(format!(
                "{msg_type:?} does not use a TLV body"
            )))
        }
    };
    Ok(frame)
}

fn decode_command(attrs: &Attributes<'_>) -> Result<CommandMessage, ProtocolError> {
    Ok(CommandMessage {
        token: attrs.require_string(AttrTag::CommandToken)?,
        payload: Bytes::copy_from_slice(attrs.get(AttrTag::Payload).unwrap_or_default()),
    })
}

fn decode_term_data(body: &[u8]) -> Result<TermDataMessage, ProtocolError> {
    require_len(body, 1, "TermData")?;
    let kind = DataKind::try_from(body[0]).map_err(|_| {
        ProtocolError::MalformedPayload(format!("unknown data kind: {}", body[0]))
    })?;

    let rest = &body[1..];
    let nul = rest.iter().position(|b| *b == 0).ok_or_else(|| {
        ProtocolError::MalformedPayload("TermData: session id is not NUL-terminated".to_string())
    })?;
    let sid = parse_session_id(&rest[..nul])?;

    Ok(TermDataMessage {
        sid,
        kind,
        data: Bytes::copy_from_slice(&rest[nul + 1..]),
    })
}

fn decode_web_data(body: &[u8]) -> Result<WebDataMessage, ProtocolError> {
    require_len(body, 2 * ADDR_DESCRIPTOR_LEN, "WebData")?;
    Ok(WebDataMessage {
        src: read_descriptor(body, 0)?,
        dst: read_descriptor(body, ADDR_DESCRIPTOR_LEN)?,
        payload: Bytes::copy_from_slice(&body[2 * ADDR_DESCRIPTOR_LEN..]),
    })
}

// ── Attribute scanning ────────────────────────────────────────────────────────

/// The known attributes of one TLV body, in wire order.
///
/// Unknown tags are skipped by their declared length.  When a tag repeats,
/// the first occurrence wins.
struct Attributes<'a> {
    entries: Vec<(AttrTag, &'a [u8])>,
}

impl<'a> Attributes<'a> {
    fn parse(body: &'a [u8]) -> Result<Self, ProtocolError> {
        let mut entries = Vec::new();
        let mut offset = 0;

        while offset < body.len() {
            let remaining = body.len() - offset;
            let raw_tag = body[offset];
            if remaining < ATTR_HEADER_SIZE {
                return Err(ProtocolError::TruncatedAttribute {
                    tag: raw_tag,
                    declared: ATTR_HEADER_SIZE,
                    available: remaining,
                });
            }

            let len = u16::from_be_bytes([body[offset + 1], body[offset + 2]]) as usize;
            let start = offset + ATTR_HEADER_SIZE;
            let available = body.len() - start;
            if len > available {
                return Err(ProtocolError::TruncatedAttribute {
                    tag: raw_tag,
                    declared: len,
                    available,
                });
            }

            let value = &body[start..start + len];
            match AttrTag::try_from(raw_tag) {
                Ok(tag) if !entries.iter().any(|(t, _)| *t == tag) => entries.push((tag, value)),
                Ok(_) => {}
                Err(()) => trace!("skipping unknown attribute 0x{raw_tag:02X} ({len} bytes)"),
            }
            offset = start + len;
        }

        Ok(Self { entries })
    }

    fn get(&self, tag: AttrTag) -> Option<&'a [u8]> {
        self.entries
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, value)| *value)
    }

    fn string(&self, tag: AttrTag) -> Result<Option<String>, ProtocolError> {
        self.get(tag).map(read_nul_string).transpose()
    }

    fn require_string(&self, tag: AttrTag) -> Result<String, ProtocolError> {
        self.string(tag)?.ok_or(ProtocolError::MissingAttribute(tag))
    }

    fn u8(&self, tag: AttrTag) -> Result<Option<u8>, ProtocolError> {
        self.fixed::<1>(tag).map(|v| v.map(|[b]| b))
    }

    fn require_u8(&self, tag: AttrTag) -> Result<u8, ProtocolError> {
        self.u8(tag)?.ok_or(ProtocolError::MissingAttribute(tag))
    }

    fn u16(&self, tag: AttrTag) -> Result<Option<u16>, ProtocolError> {
        self.fixed::<2>(tag).map(|v| v.map(u16::from_be_bytes))
    }

    fn require_u16(&self, tag: AttrTag) -> Result<u16, ProtocolError> {
        self.u16(tag)?.ok_or(ProtocolError::MissingAttribute(tag))
    }

    fn u32(&self, tag: AttrTag) -> Result<Option<u32>, ProtocolError> {
        self.fixed::<4>(tag).map(|v| v.map(u32::from_be_bytes))
    }

    fn session_id(&self) -> Result<SessionId, ProtocolError> {
        let value = self
            .get(AttrTag::SessionId)
            .ok_or(ProtocolError::MissingAttribute(AttrTag::SessionId))?;
        parse_session_id(strip_nul(value))
    }

    fn fixed<const N: usize>(&self, tag: AttrTag) -> Result<Option<[u8; N]>, ProtocolError> {
        self.get(tag)
            .map(|value| {
                <[u8; N]>::try_from(value).map_err(|_| {
                    ProtocolError::MalformedPayload(format!(
                        "{tag:?}: expected {N} bytes, got {}",
                        value.len()
                    ))
                })
            })
            .transpose()
    }
}

// ── Utility helpers ───────────────────────────────────────────────────────────

fn require_len(buf: &[u8], needed: usize, context: &str) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        Err(ProtocolError::MalformedPayload(format!(
            "{context}: need {needed} bytes, got {}",
            buf.len()
        )))
    } else {
        Ok(())
    }
}

fn read_descriptor(buf: &[u8], offset: usize) -> Result<AddrDescriptor, ProtocolError> {
    let raw: [u8; ADDR_DESCRIPTOR_LEN] = buf
        .get(offset..offset + ADDR_DESCRIPTOR_LEN)
        .and_then(|s| s.try_into().ok())
        .ok_or(ProtocolError::InsufficientData {
            needed: offset + ADDR_DESCRIPTOR_LEN,
            available: buf.len(),
        })?;
    Ok(AddrDescriptor::from_bytes(raw))
}

fn strip_nul(value: &[u8]) -> &[u8] {
    value.strip_suffix(&[0]).unwrap_or(value)
}

/// Reads a string value, accepting it with or without the trailing NUL.
fn read_nul_string(value: &[u8]) -> Result<String, ProtocolError> {
    std::str::from_utf8(strip_nul(value))
        .map(str::to_string)
        .map_err(|e| ProtocolError::MalformedPayload(format!("invalid UTF-8: {e}")))
}

fn parse_session_id(raw: &[u8]) -> Result<SessionId, ProtocolError> {
    let wire = std::str::from_utf8(raw)
        .map_err(|e| ProtocolError::MalformedPayload(format!("session id is not UTF-8: {e}")))?;
    SessionId::parse(wire).map_err(|e| ProtocolError::MalformedPayload(e.to_string()))
}

fn put_attr(buf: &mut Vec<u8>, tag: AttrTag, value: &[u8]) -> Result<(), ProtocolError> {
    let len = u16::try_from(value.len()).map_err(|_| ProtocolError::AttributeTooLarge {
        tag,
        len: value.len(),
    })?;
    buf.push(tag as u8);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(value);
    Ok(())
}

/// Writes a string attribute whose value carries a trailing NUL.
fn put_str_attr(buf: &mut Vec<u8>, tag: AttrTag, s: &str) -> Result<(), ProtocolError> {
    let len = u16::try_from(s.len() + 1).map_err(|_| ProtocolError::AttributeTooLarge {
        tag,
        len: s.len() + 1,
    })?;
    buf.push(tag as u8);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    buf.push(0x00);
    Ok(())
}

fn put_sid_attr(buf: &mut Vec<u8>, sid: &SessionId) -> Result<(), ProtocolError> {
    put_str_attr(buf, AttrTag::SessionId, &sid.to_wire())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Slot;
    use std::net::Ipv4Addr;

    fn round_trip(frame: &Frame) -> Frame {
        let encoded = encode_frame(frame).expect("encode failed");
        let (decoded, consumed) = decode_frame(&encoded).expect("decode failed");
        assert_eq!(consumed, encoded.len(), "consumed bytes should equal total encoded size");
        decoded
    }

    fn sid(wire: &str) -> SessionId {
        SessionId::parse(wire).unwrap()
    }

    /// Builds a frame by hand from a type byte and a raw body.
    fn raw_frame(msg_type: u8, body: &[u8]) -> Vec<u8> {
        let mut bytes = vec![PROTOCOL_VERSION, msg_type];
        bytes.extend_from_slice(&(body.len() as u16).to_be_bytes());
        bytes.extend_from_slice(body);
        bytes
    }

    // ── Register ─────────────────────────────────────────────────────────────

    #[test]
    fn test_register_round_trip_with_all_attributes() {
        let frame = Frame::Register(RegisterMessage {
            device_id: "gw-01".to_string(),
            group: "lab".to_string(),
            token: Some("s3cret".to_string()),
            description: "bench router".to_string(),
            proto_version: 1,
            keepalive: Some(10),
        });
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn test_register_minimal_body_uses_defaults() {
        // Arrange: a C agent that only sends its id.
        let body = [AttrTag::DeviceId as u8, 0x00, 0x04, b'a', b'b', b'c', 0x00];

        // Act
        let (frame, _) = decode_frame(&raw_frame(MessageType::Register as u8, &body)).unwrap();

        // Assert
        assert_eq!(
            frame,
            Frame::Register(RegisterMessage {
                device_id: "abc".to_string(),
                group: String::new(),
                token: None,
                description: String::new(),
                proto_version: PROTOCOL_VERSION,
                keepalive: None,
            })
        );
    }

    #[test]
    fn test_register_without_device_id_is_missing_attribute() {
        let body = [AttrTag::Description as u8, 0x00, 0x01, 0x00];
        let result = decode_frame(&raw_frame(MessageType::Register as u8, &body));
        assert_eq!(result, Err(ProtocolError::MissingAttribute(AttrTag::DeviceId)));
    }

    // ── TLV edge cases ────────────────────────────────────────────────────────

    #[test]
    fn test_strings_are_written_nul_terminated() {
        let frame = Frame::Logout(LogoutMessage { sid: sid("d1") });
        let bytes = encode_frame(&frame).unwrap();
        // header(4) + tag(1) + len(2) + "d1\0"
        assert_eq!(&bytes[4..], &[AttrTag::SessionId as u8, 0x00, 0x03, b'd', b'1', 0x00]);
    }

    #[test]
    fn test_strings_without_nul_are_accepted() {
        let body = [AttrTag::SessionId as u8, 0x00, 0x02, b'd', b'1'];
        let (frame, _) = decode_frame(&raw_frame(MessageType::Logout as u8, &body)).unwrap();
        assert_eq!(frame, Frame::Logout(LogoutMessage { sid: sid("d1") }));
    }

    #[test]
    fn test_unknown_attribute_is_skipped() {
        // Arrange: an unknown tag 0x7F sits between two known ones.
        let mut body = vec![0x7F, 0x00, 0x03, 0xAA, 0xBB, 0xCC];
        body.extend_from_slice(&[AttrTag::SessionId as u8, 0x00, 0x03, b'x', b'4', 0x00]);

        // Act
        let (frame, consumed) = decode_frame(&raw_frame(MessageType::Logout as u8, &body)).unwrap();

        // Assert
        assert_eq!(frame, Frame::Logout(LogoutMessage { sid: sid("x4") }));
        assert_eq!(consumed, HEADER_SIZE + body.len());
    }

    #[test]
    fn test_truncated_attribute_value_is_an_error() {
        // Declares 10 bytes of value but only 2 follow.
        let body = [AttrTag::Reason as u8, 0x00, 0x0A, b'h', b'i'];
        let result = decode_frame(&raw_frame(MessageType::Announce as u8, &body));
        assert_eq!(
            result,
            Err(ProtocolError::TruncatedAttribute {
                tag: AttrTag::Reason as u8,
                declared: 10,
                available: 2,
            })
        );
    }

    #[test]
    fn test_truncated_attribute_header_is_an_error() {
        let body = [AttrTag::Code as u8, 0x00];
        let result = decode_frame(&raw_frame(MessageType::Announce as u8, &body));
        assert!(matches!(result, Err(ProtocolError::TruncatedAttribute { .. })));
    }

    #[test]
    fn test_wrong_width_integer_attribute_is_malformed() {
        let mut body = vec![AttrTag::SessionId as u8, 0x00, 0x03, b'x', b'1', 0x00];
        body.extend_from_slice(&[AttrTag::Cols as u8, 0x00, 0x01, 80]);
        body.extend_from_slice(&[AttrTag::Rows as u8, 0x00, 0x02, 0x00, 24]);
        let result = decode_frame(&raw_frame(MessageType::WindowSize as u8, &body));
        assert!(matches!(result, Err(ProtocolError::MalformedPayload(_))));
    }

    #[test]
    fn test_session_id_without_slot_digit_is_malformed() {
        let body = [AttrTag::SessionId as u8, 0x00, 0x04, b'a', b'b', b'c', 0x00];
        let result = decode_frame(&raw_frame(MessageType::Login as u8, &body));
        assert!(matches!(result, Err(ProtocolError::MalformedPayload(_))));
    }

    #[test]
    fn test_attribute_over_u16_is_rejected_on_encode() {
        let frame = Frame::Announce(AnnounceMessage {
            code: AnnounceCode::Evicted,
            reason: "x".repeat(u16::MAX as usize),
        });
        assert!(matches!(
            encode_frame(&frame),
            Err(ProtocolError::AttributeTooLarge { tag: AttrTag::Reason, .. })
        ));
    }

    // ── Raw hot-path frames ───────────────────────────────────────────────────

    #[test]
    fn test_term_data_layout_is_kind_sid_nul_data() {
        let frame = Frame::TermData(TermDataMessage {
            sid: sid("dev2"),
            kind: DataKind::Terminal,
            data: Bytes::from_static(b"ls\r"),
        });
        let bytes = encode_frame(&frame).unwrap();
        assert_eq!(&bytes[4..], b"\x00dev2\x00ls\r");
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn test_term_data_with_empty_data() {
        let frame = Frame::TermData(TermDataMessage {
            sid: sid("dev9"),
            kind: DataKind::File,
            data: Bytes::new(),
        });
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn test_term_data_without_terminator_is_malformed() {
        let result = decode_frame(&raw_frame(MessageType::TermData as u8, b"\x00dev1"));
        assert!(matches!(result, Err(ProtocolError::MalformedPayload(_))));
    }

    #[test]
    fn test_term_data_unknown_kind_is_malformed() {
        let result = decode_frame(&raw_frame(MessageType::TermData as u8, b"\x07dev1\x00x"));
        assert!(matches!(result, Err(ProtocolError::MalformedPayload(_))));
    }

    #[test]
    fn test_web_data_layout_is_src_dst_payload() {
        let frame = Frame::WebData(WebDataMessage {
            src: AddrDescriptor::new(Ipv4Addr::new(1, 2, 3, 4), 0x1234),
            dst: AddrDescriptor::new(Ipv4Addr::new(10, 0, 0, 1), 80),
            payload: Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n"),
        });
        let bytes = encode_frame(&frame).unwrap();
        assert_eq!(&bytes[4..10], &[1, 2, 3, 4, 0x12, 0x34]);
        assert_eq!(&bytes[10..16], &[10, 0, 0, 1, 0x00, 80]);
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn test_web_data_close_has_empty_payload() {
        let src = AddrDescriptor::new(Ipv4Addr::LOCALHOST, 40000);
        let dst = AddrDescriptor::new(Ipv4Addr::new(192, 168, 1, 1), 80);
        match round_trip(&Frame::WebData(WebDataMessage::close(src, dst))) {
            Frame::WebData(m) => assert!(m.is_close()),
            other => panic!("expected WebData, got {other:?}"),
        }
    }

    #[test]
    fn test_web_data_shorter_than_descriptors_is_malformed() {
        let result = decode_frame(&raw_frame(MessageType::WebData as u8, &[0u8; 11]));
        assert!(matches!(result, Err(ProtocolError::MalformedPayload(_))));
    }

    #[test]
    fn test_web_data_body_over_limit_is_rejected() {
        let frame = Frame::WebData(WebDataMessage {
            src: AddrDescriptor::new(Ipv4Addr::LOCALHOST, 1),
            dst: AddrDescriptor::new(Ipv4Addr::LOCALHOST, 2),
            payload: Bytes::from(vec![0u8; MAX_BODY_LEN]),
        });
        assert!(matches!(encode_frame(&frame), Err(ProtocolError::BodyTooLarge(_))));
    }

    // ── Control frames ────────────────────────────────────────────────────────

    #[test]
    fn test_command_request_keeps_binary_payload() {
        let frame = Frame::CommandRequest(CommandMessage {
            token: "0f3e2d1c".to_string(),
            payload: Bytes::from_static(&[0x00, 0xFF, 0x10]),
        });
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn test_file_control_optional_fields() {
        let start = Frame::File(FileMessage {
            sid: sid("box1"),
            op: FileOp::Start,
            name: Some("fw.bin".to_string()),
            size: Some(1_048_576),
        });
        let abort = Frame::File(FileMessage {
            sid: sid("box1"),
            op: FileOp::Abort,
            name: None,
            size: None,
        });
        assert_eq!(round_trip(&start), start);
        assert_eq!(round_trip(&abort), abort);
    }

    #[test]
    fn test_register_ack_unknown_code_is_malformed() {
        let body = [AttrTag::Code as u8, 0x00, 0x01, 0x09];
        let result = decode_frame(&raw_frame(MessageType::RegisterAck as u8, &body));
        assert!(matches!(result, Err(ProtocolError::MalformedPayload(_))));
    }

    #[test]
    fn test_heartbeat_from_server_has_empty_body() {
        let bytes = encode_frame(&Frame::Heartbeat(HeartbeatMessage { uptime: None })).unwrap();
        assert_eq!(bytes, vec![PROTOCOL_VERSION, MessageType::Heartbeat as u8, 0x00, 0x00]);
    }

    // ── Header handling ───────────────────────────────────────────────────────

    #[test]
    fn test_decode_empty_bytes_returns_insufficient_data() {
        let result = decode_frame(&[]);
        assert!(matches!(result, Err(ProtocolError::InsufficientData { .. })));
    }

    #[test]
    fn test_decode_unknown_message_type_returns_error() {
        let result = decode_frame(&raw_frame(0xEE, &[]));
        assert_eq!(result, Err(ProtocolError::UnknownMessageType(0xEE)));
    }

    #[test]
    fn test_decode_wrong_version_returns_error() {
        let mut bytes = raw_frame(MessageType::Heartbeat as u8, &[]);
        bytes[0] = 0x99;
        assert_eq!(decode_frame(&bytes), Err(ProtocolError::UnsupportedVersion(0x99)));
    }

    #[test]
    fn test_decode_body_length_exceeds_available_returns_error() {
        let mut bytes = raw_frame(MessageType::Heartbeat as u8, &[]);
        bytes[2..4].copy_from_slice(&100u16.to_be_bytes());
        assert!(matches!(
            decode_frame(&bytes),
            Err(ProtocolError::PayloadLengthMismatch { declared: 100, available: 0 })
        ));
    }

    #[test]
    fn test_frame_len_waits_for_complete_frame() {
        let bytes = encode_frame(&Frame::Logout(LogoutMessage { sid: sid("a1") })).unwrap();
        assert_eq!(frame_len(&bytes[..3]), Ok(None));
        assert_eq!(frame_len(&bytes[..bytes.len() - 1]), Ok(None));
        assert_eq!(frame_len(&bytes), Ok(Some(bytes.len())));
    }

    #[test]
    fn test_frame_len_ignores_message_type() {
        // Unknown types still report a length so the reader can skip them.
        let bytes = raw_frame(0xEE, &[1, 2, 3]);
        assert_eq!(frame_len(&bytes), Ok(Some(7)));
    }

    #[test]
    fn test_only_version_errors_are_fatal() {
        assert!(ProtocolError::UnsupportedVersion(2).is_fatal());
        assert!(!ProtocolError::UnknownMessageType(0xEE).is_fatal());
        assert!(!ProtocolError::MissingAttribute(AttrTag::DeviceId).is_fatal());
    }

    #[test]
    fn test_slot_digit_survives_every_session_frame() {
        for slot in 0..10u8 {
            let s = SessionId::new("node", Slot::new(slot).unwrap());
            let frame = Frame::Login(LoginMessage { sid: s.clone() });
            match round_trip(&frame) {
                Frame::Login(m) => assert_eq!(m.sid.slot(), s.slot()),
                other => panic!("expected Login, got {other:?}"),
            }
        }
    }
}
