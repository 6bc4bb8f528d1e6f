//! XDR encoding (RFC 4506) for the handful of types the link protocol uses.
//!
//! Every item is a multiple of four bytes, big-endian; variable-length
//! opaque data and strings carry a length word and are zero-padded.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{AppResult, VxiError};

/// Types that can be written as XDR.
pub trait XdrEncode {
    /// Append the XDR form of `self` to `buf`.
    fn encode(&self, buf: &mut BytesMut);
}

/// Types that can be read from XDR.
pub trait XdrDecode: Sized {
    /// Consume one value from the front of `buf`.
    fn decode(buf: &mut Bytes) -> AppResult<Self>;
}

fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

fn need(buf: &Bytes, len: usize, what: &str) -> AppResult<()> {
    if buf.remaining() < len {
        return Err(VxiError::Protocol(format!(
            "truncated XDR {}: need {} bytes, have {}",
            what,
            len,
            buf.remaining()
        )));
    }
    Ok(())
}

impl XdrEncode for u32 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(*self);
    }
}

impl XdrDecode for u32 {
    fn decode(buf: &mut Bytes) -> AppResult<Self> {
        need(buf, 4, "u32")?;
        Ok(buf.get_u32())
    }
}

impl XdrEncode for i32 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(*self);
    }
}

impl XdrDecode for i32 {
    fn decode(buf: &mut Bytes) -> AppResult<Self> {
        need(buf, 4, "i32")?;
        Ok(buf.get_i32())
    }
}

impl XdrEncode for bool {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(u32::from(*self));
    }
}

impl XdrDecode for bool {
    fn decode(buf: &mut Bytes) -> AppResult<Self> {
        match u32::decode(buf)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(VxiError::Protocol(format!("invalid XDR bool {}", other))),
        }
    }
}

impl XdrEncode for [u8] {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.len() as u32);
        buf.put_slice(self);
        buf.put_bytes(0, padding(self.len()));
    }
}

impl XdrEncode for Vec<u8> {
    fn encode(&self, buf: &mut BytesMut) {
        self.as_slice().encode(buf);
    }
}

impl XdrEncode for Bytes {
    fn encode(&self, buf: &mut BytesMut) {
        self.as_ref().encode(buf);
    }
}

impl XdrDecode for Bytes {
    fn decode(buf: &mut Bytes) -> AppResult<Self> {
        let len = u32::decode(buf)? as usize;
        let padded = len + padding(len);
        need(buf, padded, "opaque")?;
        let data = buf.split_to(len);
        buf.advance(padding(len));
        Ok(data)
    }
}

impl XdrEncode for str {
    fn encode(&self, buf: &mut BytesMut) {
        self.as_bytes().encode(buf);
    }
}

impl XdrEncode for String {
    fn encode(&self, buf: &mut BytesMut) {
        self.as_str().encode(buf);
    }
}

impl XdrDecode for String {
    fn decode(buf: &mut Bytes) -> AppResult<Self> {
        let raw = Bytes::decode(buf)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| VxiError::Protocol(format!("XDR string is not UTF-8: {}", e)))
    }
}

impl XdrEncode for () {
    fn encode(&self, _buf: &mut BytesMut) {}
}

impl XdrDecode for () {
    fn decode(_buf: &mut Bytes) -> AppResult<Self> {
        Ok(())
    }
}

/// Encode a single value into a fresh buffer.
pub fn to_bytes<T: XdrEncode + ?Sized>(value: &T) -> Bytes {
    let mut buf = BytesMut::new();
    value.encode(&mut buf);
    buf.freeze()
}
