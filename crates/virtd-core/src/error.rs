//! Error taxonomy shared by every dispatch entry point.
//!
//! Each variant maps onto one wire [`ErrorCode`]. The dispatcher turns the
//! most specific failure into an [`ErrorPayload`] and never swallows it.

use thiserror::Error;

use crate::protocol::codec::CodecError;
use crate::protocol::messages::ErrorPayload;

/// Numeric error codes carried in [`ErrorPayload::code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Internal = 1,
    ConnectionNotOpen = 2,
    AlreadyOpen = 3,
    LimitExceeded = 4,
    Serialization = 5,
    AuthenticationFailed = 6,
    AuthenticationDenied = 7,
    NotRegistered = 8,
    UpstreamFailure = 9,
    OperationFailed = 10,
    OperationDenied = 11,
    OperationInvalid = 12,
}

/// Subsystem that raised an error, carried in [`ErrorPayload::domain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorDomain {
    Rpc = 1,
    Remote = 2,
    Auth = 3,
    Events = 4,
    Management = 5,
}

/// Severity carried in [`ErrorPayload::level`].
pub const ERROR_LEVEL_ERROR: i32 = 2;

/// A failure reported by the internal management API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct UpstreamError {
    /// Code assigned by the management API, or 0 when it gave none.
    pub code: i32,
    pub message: String,
}

impl UpstreamError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: 0,
            message: message.into(),
        }
    }

    pub fn with_code(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Every way an RPC call can fail.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RpcError {
    /// A call needing an open management connection arrived before `open`.
    #[error("connection not open")]
    ConnectionNotOpen,

    /// `open` was called a second time on the same connection.
    #[error("connection already open")]
    AlreadyOpen,

    /// A peer-supplied count or size is above its compiled-in ceiling.
    #[error("too many {what} '{count}' for limit '{limit}'")]
    LimitExceeded {
        what: String,
        count: usize,
        limit: usize,
    },

    /// An internal wire invariant was violated (unknown tag, field too long,
    /// undecodable payload).
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The credential exchange failed. The reason is logged, never sent.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The caller authenticated but policy rejected them.
    #[error("authentication denied: {0}")]
    AuthenticationDenied(String),

    /// Deregistration named a callback that is not registered.
    #[error("{0} not registered")]
    NotRegistered(String),

    /// The management API returned an error; its message is passed through.
    #[error("{0}")]
    Upstream(UpstreamError),

    #[error("operation failed: {0}")]
    OperationFailed(String),

    /// The connection is read-only or otherwise lacks permission.
    #[error("operation forbidden: {0}")]
    OperationDenied(String),

    /// The procedure is unknown or unsupported by this daemon.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl RpcError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RpcError::ConnectionNotOpen => ErrorCode::ConnectionNotOpen,
            RpcError::AlreadyOpen => ErrorCode::AlreadyOpen,
            RpcError::LimitExceeded { .. } => ErrorCode::LimitExceeded,
            RpcError::Serialization(_) => ErrorCode::Serialization,
            RpcError::AuthenticationFailed(_) => ErrorCode::AuthenticationFailed,
            RpcError::AuthenticationDenied(_) => ErrorCode::AuthenticationDenied,
            RpcError::NotRegistered(_) => ErrorCode::NotRegistered,
            RpcError::Upstream(_) => ErrorCode::UpstreamFailure,
            RpcError::OperationFailed(_) => ErrorCode::OperationFailed,
            RpcError::OperationDenied(_) => ErrorCode::OperationDenied,
            RpcError::Unsupported(_) => ErrorCode::OperationInvalid,
        }
    }

    pub fn domain(&self) -> ErrorDomain {
        match self {
            RpcError::AuthenticationFailed(_) | RpcError::AuthenticationDenied(_) => ErrorDomain::Auth,
            RpcError::NotRegistered(_) => ErrorDomain::Events,
            RpcError::Upstream(_) => ErrorDomain::Management,
            RpcError::LimitExceeded { .. } | RpcError::Serialization(_) => ErrorDomain::Rpc,
            _ => ErrorDomain::Remote,
        }
    }

    /// Builds the structured wire error for this failure.
    ///
    /// Authentication failures carry a fixed message so the peer cannot tell
    /// which check rejected it.
    pub fn to_payload(&self) -> ErrorPayload {
        let message = match self {
            RpcError::AuthenticationFailed(_) => "authentication failed".to_string(),
            other => other.to_string(),
        };
        let str1 = match self {
            RpcError::Upstream(e) if e.code != 0 => Some(format!("upstream code {}", e.code)),
            _ => None,
        };
        ErrorPayload {
            code: self.code() as i32,
            domain: self.domain() as i32,
            message: Some(message),
            level: ERROR_LEVEL_ERROR,
            str1,
        }
    }
}

impl From<UpstreamError> for RpcError {
    fn from(e: UpstreamError) -> Self {
        RpcError::Upstream(e)
    }
}

impl From<CodecError> for RpcError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::LimitExceeded { what, count, limit } => RpcError::LimitExceeded {
                what: what.to_string(),
                count,
                limit,
            },
            other => RpcError::Serialization(other.to_string()),
        }
    }
}
