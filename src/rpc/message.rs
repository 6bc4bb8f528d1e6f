//! ONC-RPC v2 call and reply envelopes (RFC 5531), AUTH_NONE only.

use bytes::{BufMut, Bytes, BytesMut};

use super::xdr::{XdrDecode, XdrEncode};
use crate::error::{AppResult, VxiError};

const RPC_VERSION: u32 = 2;
const MSG_CALL: u32 = 0;
const MSG_REPLY: u32 = 1;
const MSG_ACCEPTED: u32 = 0;
const MSG_DENIED: u32 = 1;
const AUTH_NONE: u32 = 0;

/// Outcome of an accepted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptStat {
    /// Executed; results follow.
    Success,
    /// Program not served here.
    ProgUnavail,
    /// Version not served here.
    ProgMismatch {
        /// Lowest version served.
        low: u32,
        /// Highest version served.
        high: u32,
    },
    /// Procedure not served.
    ProcUnavail,
    /// Arguments could not be decoded.
    GarbageArgs,
    /// Server-side failure.
    SystemErr,
}

impl AcceptStat {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            AcceptStat::Success => buf.put_u32(0),
            AcceptStat::ProgUnavail => buf.put_u32(1),
            AcceptStat::ProgMismatch { low, high } => {
                buf.put_u32(2);
                buf.put_u32(*low);
                buf.put_u32(*high);
            }
            AcceptStat::ProcUnavail => buf.put_u32(3),
            AcceptStat::GarbageArgs => buf.put_u32(4),
            AcceptStat::SystemErr => buf.put_u32(5),
        }
    }
}

/// Header of an incoming call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallHeader {
    /// Transaction id echoed in the reply.
    pub xid: u32,
    /// Program number.
    pub program: u32,
    /// Program version.
    pub version: u32,
    /// Procedure number.
    pub procedure: u32,
}

fn skip_auth(buf: &mut Bytes) -> AppResult<()> {
    let _flavor = u32::decode(buf)?;
    let _body = Bytes::decode(buf)?;
    Ok(())
}

fn put_null_auth(buf: &mut BytesMut) {
    buf.put_u32(AUTH_NONE);
    buf.put_u32(0);
}

/// Build a complete call message.
pub fn encode_call(header: &CallHeader, args: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(40 + args.len());
    buf.put_u32(header.xid);
    buf.put_u32(MSG_CALL);
    buf.put_u32(RPC_VERSION);
    buf.put_u32(header.program);
    buf.put_u32(header.version);
    buf.put_u32(header.procedure);
    put_null_auth(&mut buf);
    put_null_auth(&mut buf);
    buf.put_slice(args);
    buf.freeze()
}

/// Split a call message into header and argument bytes.
pub fn decode_call(mut msg: Bytes) -> AppResult<(CallHeader, Bytes)> {
    let xid = u32::decode(&mut msg)?;
    let msg_type = u32::decode(&mut msg)?;
    if msg_type != MSG_CALL {
        return Err(VxiError::Rpc(format!("expected call, got message type {}", msg_type)));
    }
    let rpcvers = u32::decode(&mut msg)?;
    if rpcvers != RPC_VERSION {
        return Err(VxiError::Rpc(format!("unsupported RPC version {}", rpcvers)));
    }
    let program = u32::decode(&mut msg)?;
    let version = u32::decode(&mut msg)?;
    let procedure = u32::decode(&mut msg)?;
    skip_auth(&mut msg)?;
    skip_auth(&mut msg)?;
    Ok((
        CallHeader {
            xid,
            program,
            version,
            procedure,
        },
        msg,
    ))
}

/// Build an accepted reply.
pub fn encode_reply(xid: u32, stat: AcceptStat, results: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(24 + results.len());
    buf.put_u32(xid);
    buf.put_u32(MSG_REPLY);
    buf.put_u32(MSG_ACCEPTED);
    put_null_auth(&mut buf);
    stat.encode(&mut buf);
    if stat == AcceptStat::Success {
        buf.put_slice(results);
    }
    buf.freeze()
}

/// Transaction id of any message, without consuming it.
pub fn peek_xid(msg: &[u8]) -> Option<u32> {
    msg.get(..4)
        .map(|word| u32::from_be_bytes([word[0], word[1], word[2], word[3]]))
}

/// Check a reply envelope and return the result bytes.
pub fn decode_reply(mut msg: Bytes) -> AppResult<Bytes> {
    let _xid = u32::decode(&mut msg)?;
    let msg_type = u32::decode(&mut msg)?;
    if msg_type != MSG_REPLY {
        return Err(VxiError::Rpc(format!("expected reply, got message type {}", msg_type)));
    }
    match u32::decode(&mut msg)? {
        MSG_ACCEPTED => {}
        MSG_DENIED => return Err(VxiError::Rpc("call denied by server".to_string())),
        other => return Err(VxiError::Rpc(format!("invalid reply status {}", other))),
    }
    skip_auth(&mut msg)?;
    match u32::decode(&mut msg)? {
        0 => Ok(msg),
        1 => Err(VxiError::Rpc("program unavailable".to_string())),
        2 => {
            let low = u32::decode(&mut msg)?;
            let high = u32::decode(&mut msg)?;
            Err(VxiError::Rpc(format!(
                "program version mismatch (server supports {}..={})",
                low, high
            )))
        }
        3 => Err(VxiError::Rpc("procedure unavailable".to_string())),
        4 => Err(VxiError::Rpc("server could not decode arguments".to_string())),
        other => Err(VxiError::Rpc(format!("server error (accept status {})", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_round_trip() {
        let header = CallHeader {
            xid: 41,
            program: 0x0607AF,
            version: 1,
            procedure: 10,
        };
        let msg = encode_call(&header, &[0, 0, 0, 9]);
        assert_eq!(peek_xid(&msg), Some(41));

        let (decoded, args) = decode_call(msg).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(&args[..], &[0, 0, 0, 9]);
    }

    #[test]
    fn test_success_reply_yields_results() {
        let reply = encode_reply(7, AcceptStat::Success, &[0, 0, 0, 1]);
        let results = decode_reply(reply).unwrap();
        assert_eq!(&results[..], &[0, 0, 0, 1]);
    }

    #[test]
    fn test_rejections_surface_as_rpc_errors() {
        let reply = encode_reply(7, AcceptStat::ProcUnavail, &[]);
        assert!(matches!(decode_reply(reply), Err(VxiError::Rpc(_))));

        let reply = encode_reply(7, AcceptStat::ProgMismatch { low: 2, high: 3 }, &[]);
        let err = decode_reply(reply).unwrap_err();
        assert!(err.to_string().contains("2..=3"));
    }
}
