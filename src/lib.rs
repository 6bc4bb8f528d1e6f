//! Client library for network instrument gateways (VXI-11).
//!
//! This crate opens logical links to instruments behind a gateway and drives
//! them over ONC-RPC:
//! - Device links with exclusive locking and a bounded lock wait
//! - Synchronous read/write/trigger/clear/local/remote and status polls
//! - Cross-channel abort of in-flight operations
//! - A process-wide, reference-counted transport connection cache
//! - An optional status-byte polling wrapper with linear backoff
//!
//! # Example
//!
//! ```no_run
//! use rust_vxi11::{ConnectionCache, DeviceLink, LinkConfig};
//!
//! #[tokio::main]
//! async fn main() -> rust_vxi11::AppResult<()> {
//!     let cache = ConnectionCache::new();
//!     let mut link = DeviceLink::new(cache, LinkConfig::default());
//!     link.open("gateway.lab:gpib0,5", false).await?;
//!     link.write(b"*IDN?\n").await?;
//!     let reply = link.read(256).await?;
//!     println!("{}", String::from_utf8_lossy(&reply.data));
//!     link.close().await;
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod cache;
pub mod config;
pub mod directory;
pub mod error;
pub mod io;
pub mod link;
pub mod mock;
pub mod poll;
pub mod rpc;
pub mod sim;
pub mod vxi11;

/// Largest payload accepted by a single logical write.
pub const VXI_MAX_READWRITE: usize = 1 << 20;

// Re-exports for convenience
pub use address::InstrumentAddress;
pub use cache::{ConnectionCache, ConnectionKey, ConnectionRef, Endpoint};
pub use config::{ConfigError, LinkConfig, LockPolicy, PollConfig, TermConfig};
pub use directory::InstrumentDirectory;
pub use error::{AppResult, DeviceErrorCode, VxiError};
pub use io::{InstrumentIo, Operation, ReadReason, ReadResult, StatusByte};
pub use link::{AbortHandle, DeviceLink};
pub use poll::{PollVerdict, StatusClassifier, StatusPoller};
