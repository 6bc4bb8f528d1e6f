//! Record marking for RPC over TCP (RFC 5531 §11).
//!
//! Each record is one or more fragments; a fragment is a 4-byte header
//! (top bit set on the last fragment, low 31 bits the length) followed by
//! the payload.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Last-fragment flag in the header word.
pub const LAST_FRAGMENT: u32 = 0x8000_0000;

/// Largest record accepted from the wire.
pub const MAX_RECORD: usize = 16 * 1024 * 1024;

/// Frame `payload` as a single-fragment record.
pub fn frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 4);
    buf.put_u32(LAST_FRAGMENT | payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Write one record and flush.
pub async fn write_record<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame(payload)).await?;
    writer.flush().await
}

/// Read one complete record, reassembling fragments.
///
/// Returns `Ok(None)` on a clean end of stream between records.
pub async fn read_record<R>(reader: &mut R) -> io::Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut record = BytesMut::new();
    loop {
        let mut header = [0u8; 4];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && record.is_empty() => {
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
        let header = u32::from_be_bytes(header);
        let len = (header & !LAST_FRAGMENT) as usize;
        if record.len() + len > MAX_RECORD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("RPC record exceeds {} bytes", MAX_RECORD),
            ));
        }

        let start = record.len();
        record.resize(start + len, 0);
        reader.read_exact(&mut record[start..]).await?;

        if header & LAST_FRAGMENT != 0 {
            return Ok(Some(record.freeze()));
        }
    }
}
