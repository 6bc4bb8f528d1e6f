//! Instrument link protocol messages (VXI-11 core and abort channels).
//!
//! Program numbers, procedure numbers, operation flags and the XDR argument
//! and result structures exchanged with the gateway.

use bytes::{Bytes, BytesMut};

use crate::error::AppResult;
use crate::rpc::xdr::{XdrDecode, XdrEncode};

/// Core channel program number.
pub const DEVICE_CORE: u32 = 0x0607AF;
/// Core channel program version.
pub const DEVICE_CORE_VERSION: u32 = 1;
/// Abort channel program number.
pub const DEVICE_ASYNC: u32 = 0x0607B0;
/// Abort channel program version.
pub const DEVICE_ASYNC_VERSION: u32 = 1;

/// Core channel procedures.
pub mod procedure {
    /// create_link
    pub const CREATE_LINK: u32 = 10;
    /// device_write
    pub const DEVICE_WRITE: u32 = 11;
    /// device_read
    pub const DEVICE_READ: u32 = 12;
    /// device_readstb
    pub const DEVICE_READSTB: u32 = 13;
    /// device_trigger
    pub const DEVICE_TRIGGER: u32 = 14;
    /// device_clear
    pub const DEVICE_CLEAR: u32 = 15;
    /// device_remote
    pub const DEVICE_REMOTE: u32 = 16;
    /// device_local
    pub const DEVICE_LOCAL: u32 = 17;
    /// device_lock
    pub const DEVICE_LOCK: u32 = 18;
    /// device_unlock
    pub const DEVICE_UNLOCK: u32 = 19;
    /// destroy_link
    pub const DESTROY_LINK: u32 = 23;
    /// device_abort (abort channel)
    pub const DEVICE_ABORT: u32 = 1;
}

/// Operation flag bits.
pub mod flags {
    /// Wait for a competing lock to clear, up to lock_timeout.
    pub const WAITLOCK: u32 = 0x01;
    /// Last chunk of a write (assert END/EOI).
    pub const END: u32 = 0x08;
    /// Stop reads on the term_char field.
    pub const TERMCHRSET: u32 = 0x80;
}

macro_rules! xdr_struct {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $( $(#[$fmeta:meta])* pub $field:ident : $ty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        pub struct $name {
            $( $(#[$fmeta])* pub $field: $ty ),*
        }

        impl XdrEncode for $name {
            fn encode(&self, buf: &mut BytesMut) {
                $( self.$field.encode(buf); )*
            }
        }

        impl XdrDecode for $name {
            fn decode(buf: &mut Bytes) -> AppResult<Self> {
                Ok(Self {
                    $( $field: <$ty as XdrDecode>::decode(buf)? ),*
                })
            }
        }
    };
}

xdr_struct! {
    /// Bare link id, the argument of destroy_link, device_unlock and device_abort.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceLinkArg {
        /// Link id.
        pub lid: i32,
    }
}

xdr_struct! {
    /// Result carrying only an error code.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceErrorResp {
        /// Error code.
        pub error: u32,
    }
}

xdr_struct! {
    /// create_link arguments.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct CreateLinkParms {
        /// Caller-chosen id, informational.
        pub client_id: i32,
        /// Request the exclusive lock at creation.
        pub lock_device: bool,
        /// Lock wait in milliseconds.
        pub lock_timeout: u32,
        /// Logical device name.
        pub device: String,
    }
}

xdr_struct! {
    /// create_link result.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CreateLinkResp {
        /// Error code.
        pub error: u32,
        /// Assigned link id.
        pub lid: i32,
        /// Abort channel TCP port.
        pub abort_port: u32,
        /// Largest transfer the gateway accepts in one call.
        pub max_recv_size: u32,
    }
}

xdr_struct! {
    /// device_write arguments.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct DeviceWriteParms {
        /// Link id.
        pub lid: i32,
        /// Server-side I/O timeout in milliseconds.
        pub io_timeout: u32,
        /// Lock wait in milliseconds.
        pub lock_timeout: u32,
        /// Operation flags.
        pub flags: u32,
        /// Payload.
        pub data: Bytes,
    }
}

xdr_struct! {
    /// device_write result.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceWriteResp {
        /// Error code.
        pub error: u32,
        /// Bytes accepted.
        pub size: u32,
    }
}

xdr_struct! {
    /// device_read arguments.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceReadParms {
        /// Link id.
        pub lid: i32,
        /// Most bytes to return.
        pub request_size: u32,
        /// Server-side I/O timeout in milliseconds.
        pub io_timeout: u32,
        /// Lock wait in milliseconds.
        pub lock_timeout: u32,
        /// Operation flags.
        pub flags: u32,
        /// Termination character, honoured with `TERMCHRSET`.
        pub term_char: u32,
    }
}

xdr_struct! {
    /// device_read result.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct DeviceReadResp {
        /// Error code.
        pub error: u32,
        /// Reason bits (request count, term char, end).
        pub reason: u32,
        /// Payload.
        pub data: Bytes,
    }
}

xdr_struct! {
    /// Arguments of trigger, clear, remote, local and readstb.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceGenericParms {
        /// Link id.
        pub lid: i32,
        /// Operation flags.
        pub flags: u32,
        /// Lock wait in milliseconds.
        pub lock_timeout: u32,
        /// Server-side I/O timeout in milliseconds.
        pub io_timeout: u32,
    }
}

xdr_struct! {
    /// device_readstb result.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceReadStbResp {
        /// Error code.
        pub error: u32,
        /// Status byte, carried in a full XDR word.
        pub stb: u32,
    }
}

xdr_struct! {
    /// device_lock arguments.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceLockParms {
        /// Link id.
        pub lid: i32,
        /// Operation flags.
        pub flags: u32,
        /// Lock wait in milliseconds.
        pub lock_timeout: u32,
    }
}
