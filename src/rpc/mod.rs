//! Minimal ONC-RPC v2 over TCP.
//!
//! Just enough of RFC 5531 to speak the instrument link protocol: XDR
//! encoding, record marking, call/reply envelopes with AUTH_NONE, a
//! multiplexing client, and portmapper lookups.

pub mod client;
pub mod message;
pub mod portmap;
pub mod record;
pub mod xdr;

pub use client::RpcClient;
pub use xdr::{XdrDecode, XdrEncode};
