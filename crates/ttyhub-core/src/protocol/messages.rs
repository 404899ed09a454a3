//! All device link message types.
//!
//! Two body layouts share one 4-byte header:
//!
//! - **TLV** control messages (register, login, commands, ...): the body is a
//!   sequence of `[tag:1][len:2 BE][value]` attributes.  Unknown tags are
//!   skipped so either side can add attributes without breaking the other.
//! - **Raw** hot-path messages ([`TermDataMessage`], [`WebDataMessage`]): a
//!   tiny fixed prefix and then the payload bytes, with no per-attribute
//!   overhead.

use bytes::Bytes;

use crate::domain::{AddrDescriptor, SessionId};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Current protocol version byte.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// `[version:1][type:1][body_len:2 BE]`
pub const HEADER_SIZE: usize = 4;

/// Largest body a single frame can carry.
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

/// `[tag:1][len:2 BE]`
pub const ATTR_HEADER_SIZE: usize = 3;

/// Largest tunnel payload that fits in one WebData frame after the two
/// address descriptors.
pub const MAX_WEB_PAYLOAD: usize = MAX_BODY_LEN - 12;

// ── Message type codes ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Register = 0x01,
    RegisterAck = 0x02,
    Login = 0x03,
    LoginAck = 0x04,
    Logout = 0x05,
    TermData = 0x06,
    WindowSize = 0x07,
    Announce = 0x08,
    File = 0x09,
    CommandRequest = 0x0A,
    CommandResponse = 0x0B,
    WebData = 0x0C,
    Heartbeat = 0x0D,
}

impl MessageType {
    /// Raw message types skip TLV encoding entirely.
    pub fn is_raw(self) -> bool {
        matches!(self, MessageType::TermData | MessageType::WebData)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(MessageType::Register),
            0x02 => Ok(MessageType::RegisterAck),
            0x03 => Ok(MessageType::Login),
            0x04 => Ok(MessageType::LoginAck),
            0x05 => Ok(MessageType::Logout),
            0x06 => Ok(MessageType::TermData),
            0x07 => Ok(MessageType::WindowSize),
            0x08 => Ok(MessageType::Announce),
            0x09 => Ok(MessageType::File),
            0x0A => Ok(MessageType::CommandRequest),
            0x0B => Ok(MessageType::CommandResponse),
            0x0C => Ok(MessageType::WebData),
            0x0D => Ok(MessageType::Heartbeat),
            _ => Err(()),
        }
    }
}

// ── Attribute tags ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AttrTag {
    DeviceId = 0x01,
    Token = 0x02,
    Description = 0x03,
    ProtoVersion = 0x04,
    Code = 0x05,
    Reason = 0x06,
    SessionId = 0x07,
    Cols = 0x08,
    Rows = 0x09,
    CommandToken = 0x0A,
    Payload = 0x0B,
    Group = 0x0C,
    Keepalive = 0x0D,
    Uptime = 0x0E,
    FileOp = 0x0F,
    FileName = 0x10,
    FileSize = 0x11,
}

impl TryFrom<u8> for AttrTag {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(AttrTag::DeviceId),
            0x02 => Ok(AttrTag::Token),
            0x03 => Ok(AttrTag::Description),
            0x04 => Ok(AttrTag::ProtoVersion),
            0x05 => Ok(AttrTag::Code),
            0x06 => Ok(AttrTag::Reason),
            0x07 => Ok(AttrTag::SessionId),
            0x08 => Ok(AttrTag::Cols),
            0x09 => Ok(AttrTag::Rows),
            0x0A => Ok(AttrTag::CommandToken),
            0x0B => Ok(AttrTag::Payload),
            0x0C => Ok(AttrTag::Group),
            0x0D => Ok(AttrTag::Keepalive),
            0x0E => Ok(AttrTag::Uptime),
            0x0F => Ok(AttrTag::FileOp),
            0x10 => Ok(AttrTag::FileName),
            0x11 => Ok(AttrTag::FileSize),
            _ => Err(()),
        }
    }
}

// ── Coded enums ───────────────────────────────────────────────────────────────

/// Result code carried by [`RegisterAckMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegisterCode {
    Accepted = 0,
    IdConflict = 1,
    InvalidToken = 2,
    InvalidId = 3,
}

impl TryFrom<u8> for RegisterCode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0 => Ok(RegisterCode::Accepted),
            1 => Ok(RegisterCode::IdConflict),
            2 => Ok(RegisterCode::InvalidToken),
            3 => Ok(RegisterCode::InvalidId),
            _ => Err(()),
        }
    }
}

/// Reason code carried by [`AnnounceMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AnnounceCode {
    IdConflict = 1,
    Evicted = 2,
    Shutdown = 3,
}

impl TryFrom<u8> for AnnounceCode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            1 => Ok(AnnounceCode::IdConflict),
            2 => Ok(AnnounceCode::Evicted),
            3 => Ok(AnnounceCode::Shutdown),
            _ => Err(()),
        }
    }
}

/// In-band discriminator: the first byte of a terminal data body, and of a
/// binary browser frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataKind {
    Terminal = 0,
    File = 1,
}

impl TryFrom<u8> for DataKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0 => Ok(DataKind::Terminal),
            1 => Ok(DataKind::File),
            _ => Err(()),
        }
    }
}

/// File-transfer control operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileOp {
    Start = 0,
    Ack = 1,
    Abort = 2,
    End = 3,
}

impl TryFrom<u8> for FileOp {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0 => Ok(FileOp::Start),
            1 => Ok(FileOp::Ack),
            2 => Ok(FileOp::Abort),
            3 => Ok(FileOp::End),
            _ => Err(()),
        }
    }
}

// ── Per-message payload structs ───────────────────────────────────────────────

/// First frame on every device link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterMessage {
    pub device_id: String,
    /// Namespace the device lives in; empty for the default group.
    pub group: String,
    /// Shared secret, if the device was provisioned with one.
    pub token: Option<String>,
    pub description: String,
    pub proto_version: u8,
    /// Requested keepalive interval in seconds.
    pub keepalive: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterAckMessage {
    pub code: RegisterCode,
    pub reason: String,
}

/// Server → device: open a terminal in this slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginMessage {
    pub sid: SessionId,
}

/// Device → server: the terminal for `sid` opened (`code == 0`) or could not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginAckMessage {
    pub sid: SessionId,
    pub code: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutMessage {
    pub sid: SessionId,
}

/// Raw body: `[kind:1][sid bytes][0x00][data...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermDataMessage {
    pub sid: SessionId,
    pub kind: DataKind,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSizeMessage {
    pub sid: SessionId,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceMessage {
    pub code: AnnounceCode,
    pub reason: String,
}

/// File-transfer control.  The file bytes themselves travel as
/// [`DataKind::File`] terminal data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMessage {
    pub sid: SessionId,
    pub op: FileOp,
    pub name: Option<String>,
    pub size: Option<u32>,
}

/// Used for both command requests and command responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMessage {
    pub token: String,
    pub payload: Bytes,
}

/// Raw body: `[src:6][dst:6][payload...]`.  An empty payload closes the
/// circuit identified by `(src, dst)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebDataMessage {
    pub src: AddrDescriptor,
    pub dst: AddrDescriptor,
    pub payload: Bytes,
}

impl WebDataMessage {
    pub fn close(src: AddrDescriptor, dst: AddrDescriptor) -> Self {
        Self {
            src,
            dst,
            payload: Bytes::new(),
        }
    }

    pub fn is_close(&self) -> bool {
        self.payload.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatMessage {
    /// Device uptime in seconds; absent in server replies.
    pub uptime: Option<u32>,
}

// ── Top-level frame enum ──────────────────────────────────────────────────────

/// Every message that can travel over a device link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Register(RegisterMessage),
    RegisterAck(RegisterAckMessage),
    Login(LoginMessage),
    LoginAck(LoginAckMessage),
    Logout(LogoutMessage),
    TermData(TermDataMessage),
    WindowSize(WindowSizeMessage),
    Announce(AnnounceMessage),
    File(FileMessage),
    CommandRequest(CommandMessage),
    CommandResponse(CommandMessage),
    WebData(WebDataMessage),
    Heartbeat(HeartbeatMessage),
}

impl Frame {
    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Register(_) => MessageType::Register,
            Frame::RegisterAck(_) => MessageType::RegisterAck,
            Frame::Login(_) => MessageType::Login,
            Frame::LoginAck(_) => MessageType::LoginAck,
            Frame::Logout(_) => MessageType::Logout,
            Frame::TermData(_) => MessageType::TermData,
            Frame::WindowSize(_) => MessageType::WindowSize,
            Frame::Announce(_) => MessageType::Announce,
            Frame::File(_) => MessageType::File,
            Frame::CommandRequest(_) => MessageType::CommandRequest,
            Frame::CommandResponse(_) => MessageType::CommandResponse,
            Frame::WebData(_) => MessageType::WebData,
            Frame::Heartbeat(_) => MessageType::Heartbeat,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
