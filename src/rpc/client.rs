//! RPC client over one TCP connection.
//!
//! # Design
//!
//! A connection may be shared by many links, and a caller may give up on a
//! call before its reply arrives. The client therefore:
//!
//! - Writes each call as one complete record under a writer lock
//! - Runs a dedicated reader task that reads replies FIFO off the socket
//! - Routes each reply to its caller by transaction id via oneshot channels
//! - Discards replies whose caller already timed out
//!
//! A call that times out locally never leaves the stream misaligned.

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, trace, warn};

use super::message::{decode_reply, encode_call, peek_xid, CallHeader};
use super::record::{read_record, write_record};
use super::xdr::{XdrDecode, XdrEncode};
use crate::cache::PooledConnection;
use crate::error::{AppResult, VxiError};

type ReplySender = oneshot::Sender<AppResult<Bytes>>;

/// Calls waiting for replies, plus the reason the connection died, if it did.
#[derive(Default)]
struct Pending {
    waiters: HashMap<u32, ReplySender>,
    closed: Option<String>,
}

fn lock(pending: &Mutex<Pending>) -> MutexGuard<'_, Pending> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a call's waiter if the call is dropped before its reply.
struct WaiterGuard<'a> {
    pending: &'a Mutex<Pending>,
    xid: u32,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).waiters.remove(&self.xid);
    }
}

/// Client for one RPC program/version on one TCP connection.
pub struct RpcClient {
    peer: SocketAddr,
    program: u32,
    version: u32,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Arc<Mutex<Pending>>,
    next_xid: AtomicU32,
    reader: JoinHandle<()>,
}

impl RpcClient {
    /// Open a TCP connection to `peer` for `program`/`version`.
    ///
    /// # Errors
    /// `Transport` if the connection cannot be made within `connect_timeout`.
    pub async fn connect(
        peer: SocketAddr,
        program: u32,
        version: u32,
        connect_timeout: Duration,
    ) -> AppResult<Self> {
        let stream = match timeout(connect_timeout, TcpStream::connect(peer)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(VxiError::Transport(format!("connect to {} failed: {}", peer, e)))
            }
            Err(_) => {
                return Err(VxiError::Transport(format!(
                    "connect to {} timed out after {:?}",
                    peer, connect_timeout
                )))
            }
        };
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let pending = Arc::new(Mutex::new(Pending::default()));
        let reader = tokio::spawn(Self::run_reader(peer, read_half, pending.clone()));

        debug!(%peer, program = format_args!("{:#x}", program), version, "RPC connection established");

        // Seed xids from the clock so a reconnect does not replay old ids.
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(1);

        Ok(Self {
            peer,
            program,
            version,
            writer: tokio::sync::Mutex::new(write_half),
            pending,
            next_xid: AtomicU32::new(seed),
            reader,
        })
    }

    /// Remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Program number this client calls.
    pub fn program(&self) -> u32 {
        self.program
    }

    /// Call `procedure` and decode the typed result.
    ///
    /// # Errors
    /// `LocalTimeout` if no reply arrives within `call_timeout`; `Transport`
    /// or `Rpc` if the connection fails or the server rejects the call.
    pub async fn call<A, R>(&self, procedure: u32, args: &A, call_timeout: Duration) -> AppResult<R>
    where
        A: XdrEncode + ?Sized,
        R: XdrDecode,
    {
        let mut buf = BytesMut::new();
        args.encode(&mut buf);
        let mut results = self.call_raw(procedure, &buf, call_timeout).await?;
        R::decode(&mut results)
    }

    /// Call `procedure` with pre-encoded arguments.
    pub async fn call_raw(
        &self,
        procedure: u32,
        args: &[u8],
        call_timeout: Duration,
    ) -> AppResult<Bytes> {
        let deadline = Instant::now() + call_timeout;
        let xid = self.next_xid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if let Some(reason) = &pending.closed {
                return Err(VxiError::Transport(reason.clone()));
            }
            pending.waiters.insert(xid, tx);
        }
        let _guard = WaiterGuard {
            pending: &self.pending,
            xid,
        };

        let message = encode_call(
            &CallHeader {
                xid,
                program: self.program,
                version: self.version,
                procedure,
            },
            args,
        );

        trace!(peer = %self.peer, xid, procedure, len = args.len(), "RPC call");

        match timeout_at(deadline, self.send(&message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.mark_closed(format!("write to {} failed: {}", self.peer, e));
                return Err(VxiError::Transport(e.to_string()));
            }
            Err(_) => {
                // A partially written record would misalign every later call.
                self.mark_closed(format!("write to {} stalled", self.peer));
                return Err(VxiError::LocalTimeout(call_timeout));
            }
        }

        match timeout_at(deadline, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(VxiError::Transport(format!(
                "connection to {} closed before reply",
                self.peer
            ))),
            Err(_) => {
                debug!(peer = %self.peer, xid, procedure, "RPC call timed out locally");
                Err(VxiError::LocalTimeout(call_timeout))
            }
        }
    }

    async fn send(&self, message: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        write_record(&mut *writer, message).await
    }

    fn mark_closed(&self, reason: String) {
        let mut pending = lock(&self.pending);
        if pending.closed.is_none() {
            warn!(peer = %self.peer, %reason, "RPC connection unusable");
            pending.closed = Some(reason);
        }
    }

    /// Reader task: routes replies to waiting calls until the socket fails.
    async fn run_reader(peer: SocketAddr, mut reader: OwnedReadHalf, pending: Arc<Mutex<Pending>>) {
        let reason = loop {
            match read_record(&mut reader).await {
                Ok(Some(record)) => {
                    let Some(xid) = peek_xid(&record) else {
                        debug!(%peer, "ignoring runt RPC record");
                        continue;
                    };
                    let waiter = lock(&pending).waiters.remove(&xid);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(decode_reply(record));
                        }
                        None => debug!(%peer, xid, "discarding reply with no waiting call"),
                    }
                }
                Ok(None) => break format!("connection to {} closed by peer", peer),
                Err(e) => break format!("read from {} failed: {}", peer, e),
            }
        };

        debug!(%peer, %reason, "RPC reader task ended");
        let mut pending = lock(&pending);
        pending.closed.get_or_insert_with(|| reason.clone());
        for (_, tx) in pending.waiters.drain() {
            let _ = tx.send(Err(VxiError::Transport(reason.clone())));
        }
    }
}

impl PooledConnection for RpcClient {
    fn is_alive(&self) -> bool {
        lock(&self.pending).closed.is_none()
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader.abort();
        debug!(peer = %self.peer, "RPC connection closed");
    }
}
