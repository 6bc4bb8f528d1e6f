//! Instrument I/O contract shared by every backend.
//!
//! [`InstrumentIo`] is the operation surface the status poller and
//! applications program against. [`crate::DeviceLink`] implements it over the
//! network; [`crate::mock::MockInstrument`] implements it in memory.

use async_trait::async_trait;
use std::fmt;

use crate::error::AppResult;

/// Operation tag handed to status classifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Device read
    Read,
    /// Device write
    Write,
    /// Group execute trigger
    Trigger,
    /// Device clear
    Clear,
    /// Return to local control
    Local,
    /// Enter remote control
    Remote,
    /// Explicit lock request
    Lock,
    /// Lock release
    Unlock,
    /// Status byte poll
    ReadStatusByte,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Trigger => "trigger",
            Operation::Clear => "clear",
            Operation::Local => "local",
            Operation::Remote => "remote",
            Operation::Lock => "lock",
            Operation::Unlock => "unlock",
            Operation::ReadStatusByte => "read_status_byte",
        };
        f.write_str(name)
    }
}

/// Why a logical read ended. More than one condition can hold at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadReason {
    /// The requested length was delivered.
    pub request_count: bool,
    /// The termination character was seen.
    pub term_char: bool,
    /// The remote signalled end (bus EOI).
    pub end: bool,
}

impl ReadReason {
    pub(crate) const REQCNT: u32 = 0x01;
    pub(crate) const CHR: u32 = 0x02;
    pub(crate) const END: u32 = 0x04;

    /// Decode the wire reason bits.
    pub fn from_bits(bits: u32) -> Self {
        Self {
            request_count: bits & Self::REQCNT != 0,
            term_char: bits & Self::CHR != 0,
            end: bits & Self::END != 0,
        }
    }

    /// Encode as wire reason bits.
    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.request_count {
            bits |= Self::REQCNT;
        }
        if self.term_char {
            bits |= Self::CHR;
        }
        if self.end {
            bits |= Self::END;
        }
        bits
    }

    /// True when any terminating condition is set.
    pub fn is_terminated(&self) -> bool {
        self.request_count || self.term_char || self.end
    }
}

/// Bytes delivered by a logical read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult {
    /// Payload, unmodified.
    pub data: Vec<u8>,
    /// Condition that ended the read.
    pub reason: ReadReason,
}

/// One polled status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusByte {
    /// Raw byte; bit meanings belong to the instrument.
    pub value: u8,
    /// The gateway still has queued status events.
    pub more_pending: bool,
}

impl StatusByte {
    /// IEEE 488.2 request-service bit.
    pub const RQS: u8 = 0x40;

    /// Build from a raw byte, deriving `more_pending` from RQS.
    pub fn from_raw(value: u8) -> Self {
        Self {
            value,
            more_pending: value & Self::RQS != 0,
        }
    }
}

/// Operation contract every instrument backend provides.
///
/// Calls on one implementor are sequential (`&mut self`); cancellation from
/// another task goes through the backend's own abort handle.
#[async_trait]
pub trait InstrumentIo: Send + Sync {
    /// Read up to `max_len` bytes.
    async fn read(&mut self, max_len: usize) -> AppResult<ReadResult>;

    /// Write the whole buffer.
    async fn write(&mut self, data: &[u8]) -> AppResult<()>;

    /// Send a group execute trigger.
    async fn trigger(&mut self) -> AppResult<()>;

    /// Send a device clear.
    async fn clear(&mut self) -> AppResult<()>;

    /// Return the instrument to local control.
    async fn local(&mut self) -> AppResult<()>;

    /// Poll the status byte.
    async fn read_status_byte(&mut self) -> AppResult<StatusByte>;

    /// Cancel whatever is in flight. A no-op when idle.
    async fn abort(&self) -> AppResult<()>;

    /// Release the instrument. Idempotent.
    async fn close(&mut self);
}
