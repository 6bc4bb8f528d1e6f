//! Error types for the link client.
//!
//! This module defines `VxiError`, the single error type returned by every
//! public operation, and `DeviceErrorCode`, the numeric error codes the
//! instrument gateway reports on the wire.
//!
//! ## Error Hierarchy
//!
//! - **`Device`**: A protocol error reported by the gateway, carried verbatim so the
//!   caller can interpret or format it (e.g. device locked, invalid address).
//! - **`LocalTimeout`**: The client gave up waiting for a reply. Kept apart from the
//!   gateway's own `IoTimeout` and `DeviceLocked` codes so callers can tell which
//!   side's clock expired.
//! - **`Transport`** / **`Rpc`**: The cached connection could not be established or
//!   used, or the RPC layer rejected the call.
//! - **Local preconditions** (`NotOpen`, `AlreadyOpen`, `WriteTooLarge`,
//!   `InvalidAddress`): rejected before anything is sent.
//! - **Status polling** (`StatusFatal`, `StatusRetriesExhausted`): outcomes of the
//!   optional status-byte classifier.
//!
//! Every variant maps to a stable numeric code through [`VxiError::code`].

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::io::Operation;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, VxiError>;

/// Internal code for a local transport failure.
pub const CODE_TRANSPORT: i32 = -1;
/// Internal code for a failure to reach the abort channel.
pub const CODE_ABORT_PORT: i32 = -2;
/// Internal code for a write larger than [`crate::VXI_MAX_READWRITE`].
pub const CODE_WRITE_TOO_LARGE: i32 = -3;
/// Internal code for a reply that breaks the protocol contract.
pub const CODE_PROTOCOL: i32 = -4;
/// Internal code for a fatal status-byte classification.
pub const CODE_STATUS_FATAL: i32 = -5;
/// Internal code for a status poll that ran out of retries.
pub const CODE_STATUS_EXHAUSTED: i32 = -6;

/// Numeric error codes reported by the instrument gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceErrorCode {
    /// 0
    NoError,
    /// 1
    SyntaxError,
    /// 3
    DeviceNotAccessible,
    /// 4
    InvalidLinkIdentifier,
    /// 5
    ParameterError,
    /// 6
    ChannelNotEstablished,
    /// 8
    OperationNotSupported,
    /// 9
    OutOfResources,
    /// 11
    DeviceLocked,
    /// 12
    NoLockHeld,
    /// 15
    IoTimeout,
    /// 17
    IoError,
    /// 21
    InvalidAddress,
    /// 23
    Abort,
    /// 29
    ChannelAlreadyEstablished,
    /// Any code the protocol does not define.
    Reserved(u32),
}

impl DeviceErrorCode {
    /// Decode a wire value.
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::NoError,
            1 => Self::SyntaxError,
            3 => Self::DeviceNotAccessible,
            4 => Self::InvalidLinkIdentifier,
            5 => Self::ParameterError,
            6 => Self::ChannelNotEstablished,
            8 => Self::OperationNotSupported,
            9 => Self::OutOfResources,
            11 => Self::DeviceLocked,
            12 => Self::NoLockHeld,
            15 => Self::IoTimeout,
            17 => Self::IoError,
            21 => Self::InvalidAddress,
            23 => Self::Abort,
            29 => Self::ChannelAlreadyEstablished,
            other => Self::Reserved(other),
        }
    }

    /// The wire value.
    pub fn code(self) -> u32 {
        match self {
            Self::NoError => 0,
            Self::SyntaxError => 1,
            Self::DeviceNotAccessible => 3,
            Self::InvalidLinkIdentifier => 4,
            Self::ParameterError => 5,
            Self::ChannelNotEstablished => 6,
            Self::OperationNotSupported => 8,
            Self::OutOfResources => 9,
            Self::DeviceLocked => 11,
            Self::NoLockHeld => 12,
            Self::IoTimeout => 15,
            Self::IoError => 17,
            Self::InvalidAddress => 21,
            Self::Abort => 23,
            Self::ChannelAlreadyEstablished => 29,
            Self::Reserved(code) => code,
        }
    }

    /// Short human-readable description.
    pub fn description(self) -> &'static str {
        match self {
            Self::NoError => "no error",
            Self::SyntaxError => "syntax error",
            Self::DeviceNotAccessible => "device not accessible",
            Self::InvalidLinkIdentifier => "invalid link identifier",
            Self::ParameterError => "parameter error",
            Self::ChannelNotEstablished => "channel not established",
            Self::OperationNotSupported => "operation not supported",
            Self::OutOfResources => "out of resources",
            Self::DeviceLocked => "device locked by another link",
            Self::NoLockHeld => "no lock held by this link",
            Self::IoTimeout => "I/O timeout",
            Self::IoError => "I/O error",
            Self::InvalidAddress => "invalid address",
            Self::Abort => "abort",
            Self::ChannelAlreadyEstablished => "channel already established",
            Self::Reserved(_) => "unknown error",
        }
    }
}

impl fmt::Display for DeviceErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}

/// Every failure a link operation can report.
#[derive(Error, Debug)]
pub enum VxiError {
    #[error("Device error: {0}")]
    Device(DeviceErrorCode),

    #[error("I/O timed out locally after {0:?}")]
    LocalTimeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Abort channel unavailable: {0}")]
    AbortPort(String),

    #[error("Write of {len} bytes exceeds the {max} byte transfer limit")]
    WriteTooLarge { len: usize, max: usize },

    #[error("Invalid instrument address '{0}'")]
    InvalidAddress(String),

    #[error("Link is not open")]
    NotOpen,

    #[error("Link is already open")]
    AlreadyOpen,

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Status byte {stb:#04x} after {op} classified fatal: {reason}")]
    StatusFatal {
        op: Operation,
        stb: u8,
        reason: String,
    },

    #[error("Status poll after {op} still not ready after {retries} retries")]
    StatusRetriesExhausted { op: Operation, retries: u32 },
}

impl VxiError {
    /// Stable numeric code for this failure.
    ///
    /// Protocol errors keep their wire value; local preconditions reuse the
    /// matching protocol code; everything else gets a negative internal code.
    pub fn code(&self) -> i32 {
        match self {
            VxiError::Device(code) => code.code() as i32,
            VxiError::LocalTimeout(_) => DeviceErrorCode::IoTimeout.code() as i32,
            VxiError::Transport(_) | VxiError::Io(_) | VxiError::Rpc(_) => CODE_TRANSPORT,
            VxiError::AbortPort(_) => CODE_ABORT_PORT,
            VxiError::WriteTooLarge { .. } => CODE_WRITE_TOO_LARGE,
            VxiError::InvalidAddress(_) => DeviceErrorCode::InvalidAddress.code() as i32,
            VxiError::NotOpen => DeviceErrorCode::ChannelNotEstablished.code() as i32,
            VxiError::AlreadyOpen => DeviceErrorCode::ChannelAlreadyEstablished.code() as i32,
            VxiError::Protocol(_) => CODE_PROTOCOL,
            VxiError::StatusFatal { .. } => CODE_STATUS_FATAL,
            VxiError::StatusRetriesExhausted { .. } => CODE_STATUS_EXHAUSTED,
        }
    }

    /// The gateway's error code, if this is a protocol error.
    pub fn device_code(&self) -> Option<DeviceErrorCode> {
        match self {
            VxiError::Device(code) => Some(*code),
            _ => None,
        }
    }

    /// True for either a local or a gateway-reported I/O timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            VxiError::LocalTimeout(_) | VxiError::Device(DeviceErrorCode::IoTimeout)
        )
    }

    /// True when the gateway refused because another link holds the lock.
    pub fn is_locked(&self) -> bool {
        matches!(self, VxiError::Device(DeviceErrorCode::DeviceLocked))
    }

    /// True when the operation was cancelled through the abort channel.
    pub fn is_abort(&self) -> bool {
        matches!(self, VxiError::Device(DeviceErrorCode::Abort))
    }

    /// True for failures that leave the underlying connection unusable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            VxiError::Transport(_) | VxiError::Io(_) | VxiError::Rpc(_)
        )
    }

    /// Map a non-zero wire error to `Err`.
    pub(crate) fn check(code: u32) -> AppResult<()> {
        match DeviceErrorCode::from_code(code) {
            DeviceErrorCode::NoError => Ok(()),
            other => Err(VxiError::Device(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VxiError::Device(DeviceErrorCode::DeviceLocked);
        assert_eq!(
            err.to_string(),
            "Device error: device locked by another link (11)"
        );
    }

    #[test]
    fn test_stable_codes() {
        let expected = [
            (0, DeviceErrorCode::NoError),
            (1, DeviceErrorCode::SyntaxError),
            (3, DeviceErrorCode::DeviceNotAccessible),
            (4, DeviceErrorCode::InvalidLinkIdentifier),
            (5, DeviceErrorCode::ParameterError),
            (6, DeviceErrorCode::ChannelNotEstablished),
            (8, DeviceErrorCode::OperationNotSupported),
            (9, DeviceErrorCode::OutOfResources),
            (11, DeviceErrorCode::DeviceLocked),
            (12, DeviceErrorCode::NoLockHeld),
            (15, DeviceErrorCode::IoTimeout),
            (17, DeviceErrorCode::IoError),
            (21, DeviceErrorCode::InvalidAddress),
            (23, DeviceErrorCode::Abort),
            (29, DeviceErrorCode::ChannelAlreadyEstablished),
        ];
        for (code, variant) in expected {
            assert_eq!(DeviceErrorCode::from_code(code), variant);
            assert_eq!(variant.code(), code);
        }
        assert_eq!(DeviceErrorCode::from_code(42), DeviceErrorCode::Reserved(42));
    }

    #[test]
    fn test_local_errors_map_to_protocol_codes() {
        assert_eq!(VxiError::NotOpen.code(), 6);
        assert_eq!(VxiError::AlreadyOpen.code(), 29);
        assert_eq!(VxiError::InvalidAddress("x".into()).code(), 21);
        assert_eq!(
            VxiError::WriteTooLarge { len: 10, max: 5 }.code(),
            CODE_WRITE_TOO_LARGE
        );
        assert_eq!(VxiError::Transport("refused".into()).code(), CODE_TRANSPORT);
    }

    #[test]
    fn test_timeouts_are_distinguishable() {
        let local = VxiError::LocalTimeout(Duration::from_secs(3));
        let remote = VxiError::Device(DeviceErrorCode::IoTimeout);
        let locked = VxiError::Device(DeviceErrorCode::DeviceLocked);

        assert!(local.is_timeout() && remote.is_timeout());
        assert!(!locked.is_timeout());
        assert!(locked.is_locked());
        assert!(matches!(local, VxiError::LocalTimeout(_)));
        assert_eq!(remote.device_code(), Some(DeviceErrorCode::IoTimeout));
        assert_eq!(local.device_code(), None);
    }

    #[test]
    fn test_check() {
        assert!(VxiError::check(0).is_ok());
        assert!(VxiError::check(23).unwrap_err().is_abort());
    }
}
