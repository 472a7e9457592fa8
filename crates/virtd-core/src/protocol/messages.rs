//! Message header, program identifiers, procedure numbers and the structured
//! error payload.
//!
//! Each call on the wire is identified by a `(program, version, procedure)`
//! triple. Replies reuse the call's header with `msg_type = Reply` and the
//! serial unchanged so the peer can correlate out-of-order completions.

use serde::{Deserialize, Serialize};

use crate::protocol::codec::{CodecError, WireDecode, WireEncode, WireReader, WireWriter};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Program id of the remote management protocol.
pub const REMOTE_PROGRAM: u32 = 0x2000_8086;

/// Version of the remote management protocol.
pub const REMOTE_PROTOCOL_VERSION: u32 = 1;

/// Program id of the keep-alive side protocol.
pub const KEEPALIVE_PROGRAM: u32 = 0x6b65_6570;

/// Version of the keep-alive side protocol.
pub const KEEPALIVE_PROTOCOL_VERSION: u32 = 1;

/// Size of the frame length prefix in bytes.
pub const LEN_PREFIX_SIZE: usize = 4;

/// Size of the message header that follows the length prefix.
pub const HEADER_SIZE: usize = 24;

/// Serial carried by every asynchronous event message.
pub const EVENT_SERIAL: u32 = 1;

// ── Header enums ──────────────────────────────────────────────────────────────

/// What kind of message a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum MessageType {
    Call = 0,
    Reply = 1,
    /// Asynchronous server-to-client message (events, keep-alive).
    Message = 2,
    Stream = 3,
}

impl TryFrom<i32> for MessageType {
    type Error = ();

    fn try_from(value: i32) -> Result<Self, ()> {
        match value {
            0 => Ok(MessageType::Call),
            1 => Ok(MessageType::Reply),
            2 => Ok(MessageType::Message),
            3 => Ok(MessageType::Stream),
            _ => Err(()),
        }
    }
}

/// Outcome carried in a reply header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum MessageStatus {
    Ok = 0,
    /// The payload is an [`ErrorPayload`].
    Error = 1,
    Continue = 2,
}

impl TryFrom<i32> for MessageStatus {
    type Error = ();

    fn try_from(value: i32) -> Result<Self, ()> {
        match value {
            0 => Ok(MessageStatus::Ok),
            1 => Ok(MessageStatus::Error),
            2 => Ok(MessageStatus::Continue),
            _ => Err(()),
        }
    }
}

// ── Header ────────────────────────────────────────────────────────────────────

/// 24-byte header that follows the length prefix of every frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub program: u32,
    pub version: u32,
    /// Procedure number within `program`.
    pub procedure: i32,
    pub msg_type: MessageType,
    /// Correlation id chosen by the caller.
    pub serial: u32,
    pub status: MessageStatus,
}

impl MessageHeader {
    /// Builds the reply header for this call.
    pub fn reply(&self, status: MessageStatus) -> Self {
        Self {
            msg_type: MessageType::Reply,
            status,
            ..self.clone()
        }
    }

    /// Header of an asynchronous remote-program event message.
    pub fn event(procedure: Procedure) -> Self {
        Self {
            program: REMOTE_PROGRAM,
            version: REMOTE_PROTOCOL_VERSION,
            procedure: procedure as i32,
            msg_type: MessageType::Message,
            serial: EVENT_SERIAL,
            status: MessageStatus::Ok,
        }
    }

    /// Header of a keep-alive message.
    pub fn keepalive(procedure: KeepaliveProcedure) -> Self {
        Self {
            program: KEEPALIVE_PROGRAM,
            version: KEEPALIVE_PROTOCOL_VERSION,
            procedure: procedure as i32,
            msg_type: MessageType::Message,
            serial: 0,
            status: MessageStatus::Ok,
        }
    }
}

/// Procedures of the keep-alive program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum KeepaliveProcedure {
    Ping = 1,
    Pong = 2,
}

impl TryFrom<i32> for KeepaliveProcedure {
    type Error = ();

    fn try_from(value: i32) -> Result<Self, ()> {
        match value {
            1 => Ok(KeepaliveProcedure::Ping),
            2 => Ok(KeepaliveProcedure::Pong),
            _ => Err(()),
        }
    }
}

// ── Procedures ────────────────────────────────────────────────────────────────

macro_rules! procedures {
    ($($(#[$meta:meta])* $name:ident = $num:literal,)+) => {
        /// Procedure numbers of the remote program.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(i32)]
        pub enum Procedure {
            $($(#[$meta])* $name = $num,)+
        }

        impl TryFrom<i32> for Procedure {
            type Error = ();

            fn try_from(value: i32) -> Result<Self, ()> {
                match value {
                    $($num => Ok(Procedure::$name),)+
                    _ => Err(()),
                }
            }
        }
    };
}

procedures! {
    ConnectOpen = 1,
    ConnectClose = 2,
    ConnectGetVersion = 3,
    ConnectSupportsFeature = 4,
    ConnectListDomains = 5,
    DomainLookupByName = 6,

    AuthList = 10,
    AuthSaslInit = 11,
    AuthSaslStart = 12,
    AuthSaslStep = 13,
    AuthPolkit = 14,

    DomainGetSchedulerParameters = 20,
    DomainSetSchedulerParameters = 21,
    DomainGetCpuStats = 22,
    DomainBlockPeek = 23,
    DomainMemoryPeek = 24,

    DomainEventRegisterAny = 30,
    DomainEventDeregisterAny = 31,
    ConnectDomainEventCallbackRegisterAny = 32,
    ConnectDomainEventCallbackDeregisterAny = 33,
    ConnectNetworkEventRegisterAny = 34,
    ConnectNetworkEventDeregisterAny = 35,
    /// Lifecycle-only registration predating the `*Any` forms.
    ConnectDomainEventRegister = 36,
    ConnectDomainEventDeregister = 37,

    DomainMigrateBegin3 = 40,
    DomainMigratePrepare3 = 41,
    DomainMigratePerform3 = 42,
    DomainMigrateFinish3 = 43,
    DomainMigrateConfirm3 = 44,
    DomainMigrateBegin3Params = 45,
    DomainMigratePrepare3Params = 46,
    DomainMigratePerform3Params = 47,
    DomainMigrateFinish3Params = 48,
    DomainMigrateConfirm3Params = 49,

    // Legacy per-class event messages (server to client).
    DomainEventLifecycle = 100,
    DomainEventReboot = 101,
    DomainEventRtcChange = 102,
    DomainEventWatchdog = 103,
    DomainEventIoError = 104,
    DomainEventGraphics = 105,
    DomainEventIoErrorReason = 106,
    DomainEventControlError = 107,
    DomainEventBlockJob = 108,
    DomainEventDiskChange = 109,
    DomainEventTrayChange = 110,
    DomainEventPmWakeup = 111,
    DomainEventPmSuspend = 112,
    DomainEventBalloonChange = 113,
    DomainEventPmSuspendDisk = 114,
    DomainEventDeviceRemoved = 115,

    /// Envelope carrying a callback id and any domain event class.
    DomainEventCallback = 120,
    /// Envelope carrying a callback id and any network event class.
    NetworkEventCallback = 121,
}

// ── Error payload ─────────────────────────────────────────────────────────────

/// Structured error returned in place of a reply payload when the header
/// status is [`MessageStatus::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Numeric error code (see [`crate::error::ErrorCode`]).
    pub code: i32,
    /// Subsystem that raised the error.
    pub domain: i32,
    /// Human-readable message.
    pub message: Option<String>,
    /// 1 = warning, 2 = error.
    pub level: i32,
    /// Optional extended information.
    pub str1: Option<String>,
}

impl WireEncode for ErrorPayload {
    fn encode(&self, w: &mut WireWriter) -> Result<(), CodecError> {
        w.put_i32(self.code);
        w.put_i32(self.domain);
        w.put_opt_string(self.message.as_deref())?;
        w.put_i32(self.level);
        w.put_opt_string(self.str1.as_deref())
    }
}

impl WireDecode for ErrorPayload {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            code: r.get_i32()?,
            domain: r.get_i32()?,
            message: r.get_opt_string()?,
            level: r.get_i32()?,
            str1: r.get_opt_string()?,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
