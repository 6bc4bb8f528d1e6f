//! Portmapper (program 100000 v2) port lookup.

use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::debug;

use super::client::RpcClient;
use super::xdr::{XdrDecode, XdrEncode};
use crate::error::{AppResult, VxiError};

/// Portmapper program number.
pub const PMAP_PROGRAM: u32 = 100_000;
/// Portmapper version.
pub const PMAP_VERSION: u32 = 2;
/// GETPORT procedure.
pub const PMAPPROC_GETPORT: u32 = 3;
/// Protocol number for TCP.
pub const IPPROTO_TCP: u32 = 6;
/// Protocol number for UDP.
pub const IPPROTO_UDP: u32 = 17;

/// GETPORT argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// Program number.
    pub program: u32,
    /// Program version.
    pub version: u32,
    /// `IPPROTO_TCP` or `IPPROTO_UDP`.
    pub protocol: u32,
    /// Ignored on lookup.
    pub port: u32,
}

impl XdrEncode for Mapping {
    fn encode(&self, buf: &mut BytesMut) {
        self.program.encode(buf);
        self.version.encode(buf);
        self.protocol.encode(buf);
        self.port.encode(buf);
    }
}

impl XdrDecode for Mapping {
    fn decode(buf: &mut Bytes) -> AppResult<Self> {
        Ok(Self {
            program: u32::decode(buf)?,
            version: u32::decode(buf)?,
            protocol: u32::decode(buf)?,
            port: u32::decode(buf)?,
        })
    }
}

/// Ask the portmapper at `portmapper` where `program`/`version` listens.
///
/// # Errors
/// `Transport` when the portmapper is unreachable, `Rpc` when the program
/// is not registered.
pub async fn get_port(
    portmapper: SocketAddr,
    program: u32,
    version: u32,
    protocol: u32,
    call_timeout: Duration,
) -> AppResult<u16> {
    let client = RpcClient::connect(portmapper, PMAP_PROGRAM, PMAP_VERSION, call_timeout).await?;
    let mapping = Mapping {
        program,
        version,
        protocol,
        port: 0,
    };
    let port: u32 = client.call(PMAPPROC_GETPORT, &mapping, call_timeout).await?;
    debug!(%portmapper, program = format_args!("{:#x}", program), version, port, "portmapper lookup");

    match u16::try_from(port) {
        Ok(0) => Err(VxiError::Rpc(format!(
            "program {:#x} v{} not registered with portmapper at {}",
            program, version, portmapper
        ))),
        Ok(port) => Ok(port),
        Err(_) => Err(VxiError::Protocol(format!("portmapper returned port {}", port))),
    }
}
