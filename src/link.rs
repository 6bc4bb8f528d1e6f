//! Device link: one client's logical connection to one instrument.
//!
//! # Design
//!
//! A link is either closed (no link id, no connections) or open (link id plus
//! a core-channel and an abort-channel reference from the
//! [`ConnectionCache`]). `open` either reaches the open state completely or
//! releases everything it acquired; `close` is idempotent.
//!
//! All ordinary operations travel on the core channel and are bounded by the
//! link's I/O timeout (plus the lock wait when the call waits for a lock).
//! [`AbortHandle`] reaches the gateway over the abort channel, a separate
//! connection, so it can cancel a call that is still blocked on the core
//! channel from another task.
//!
//! # Local timeouts
//!
//! When a call gives up locally the gateway may still be working on it. The
//! link then fires a best-effort abort over the abort channel from a detached
//! task and returns [`VxiError::LocalTimeout`] straight away, so the gateway
//! does not keep an orphaned operation outstanding and the caller never waits
//! for the abort round trip.
//!
//! # Example
//!
//! ```no_run
//! use rust_vxi11::{ConnectionCache, DeviceLink, LinkConfig};
//!
//! # async fn example() -> rust_vxi11::AppResult<()> {
//! let cache = ConnectionCache::new();
//! let mut link = DeviceLink::new(cache, LinkConfig::default());
//! link.open("192.168.1.20:gpib0,5", false).await?;
//! link.write(b"*IDN?\n").await?;
//! let reply = link.read(256).await?;
//! println!("{}", String::from_utf8_lossy(&reply.data));
//! link.close().await;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::address::InstrumentAddress;
use crate::cache::{ConnectionCache, ConnectionKey, ConnectionRef, Endpoint};
use crate::config::{LinkConfig, LockPolicy, TermConfig};
use crate::error::{AppResult, VxiError};
use crate::io::{InstrumentIo, Operation, ReadReason, ReadResult, StatusByte};
use crate::rpc::portmap::IPPROTO_TCP;
use crate::rpc::xdr::{XdrDecode, XdrEncode};
use crate::rpc::RpcClient;
use crate::vxi11::{
    flags, procedure, CreateLinkParms, CreateLinkResp, DeviceErrorResp, DeviceGenericParms,
    DeviceLinkArg, DeviceLockParms, DeviceReadParms, DeviceReadResp, DeviceReadStbResp,
    DeviceWriteParms, DeviceWriteResp, DEVICE_ASYNC, DEVICE_ASYNC_VERSION, DEVICE_CORE,
    DEVICE_CORE_VERSION,
};
use crate::VXI_MAX_READWRITE;

/// State held only while the link is open.
struct OpenLink {
    lid: i32,
    address: InstrumentAddress,
    max_recv_size: u32,
    abort_addr: SocketAddr,
    core: ConnectionRef<RpcClient>,
}

/// What an abort needs; cleared when the link closes.
struct AbortTarget {
    lid: i32,
    conn: ConnectionRef<RpcClient>,
    timeout: Duration,
}

type SharedAbortTarget = Arc<Mutex<Option<AbortTarget>>>;

fn lock_target(target: &Mutex<Option<AbortTarget>>) -> MutexGuard<'_, Option<AbortTarget>> {
    target.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cancels in-flight operations on a link from any task.
///
/// Cloneable and `Send`. A handle covers the open link it was taken from:
/// once that link closes the handle is inert for good, even if the
/// [`DeviceLink`] is opened again, and `abort` returns [`VxiError::NotOpen`].
#[derive(Clone)]
pub struct AbortHandle {
    target: SharedAbortTarget,
}

impl AbortHandle {
    /// Ask the gateway to terminate the link's in-flight operation.
    ///
    /// Travels on the abort channel only; never waits for the core channel.
    /// Accepted (and harmless) when nothing is in flight.
    ///
    /// # Errors
    /// `NotOpen` after close; transport or device errors from the abort call.
    pub async fn abort(&self) -> AppResult<()> {
        let (lid, conn, timeout) = {
            let target = lock_target(&self.target);
            let target = target.as_ref().ok_or(VxiError::NotOpen)?;
            (target.lid, target.conn.shared(), target.timeout)
        };
        debug!(lid, peer = %conn.peer_addr(), "Sending abort");
        let resp: DeviceErrorResp = conn
            .call(procedure::DEVICE_ABORT, &DeviceLinkArg { lid }, timeout)
            .await?;
        VxiError::check(resp.error)
    }

    /// True while the link is open.
    pub fn is_armed(&self) -> bool {
        lock_target(&self.target).is_some()
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortHandle")
            .field("armed", &self.is_armed())
            .finish()
    }
}

/// Handle to one instrument behind a gateway.
pub struct DeviceLink {
    cache: ConnectionCache,
    config: LinkConfig,
    state: Option<OpenLink>,
    abort: SharedAbortTarget,
}

impl DeviceLink {
    /// Closed link that will pool its connections in `cache`.
    pub fn new(cache: ConnectionCache, config: LinkConfig) -> Self {
        Self {
            cache,
            config,
            state: None,
            abort: Arc::new(Mutex::new(None)),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Open the link to `address` (`host:logical-name`).
    ///
    /// With `want_lock` the gateway grants the exclusive lock, waiting up to
    /// the lock policy's wait timeout for another holder to release it.
    ///
    /// # Errors
    /// - `AlreadyOpen` if the link is open
    /// - `InvalidAddress` if `address` does not parse
    /// - `Transport` if the gateway cannot be reached
    /// - `Device(DeviceLocked)` if the lock was not granted in time
    /// - `Device(InvalidAddress)` if the gateway has no such device
    /// - `AbortPort` if the abort channel cannot be established
    pub async fn open(&mut self, address: &str, want_lock: bool) -> AppResult<()> {
        if self.state.is_some() {
            return Err(VxiError::AlreadyOpen);
        }
        let address = InstrumentAddress::parse(address)?;

        let endpoint = match self.config.core_port {
            Some(port) => Endpoint::Direct(port),
            None => Endpoint::Portmapper(self.config.portmapper_port),
        };
        let core = self
            .cache
            .acquire(ConnectionKey::Host {
                host: address.host().to_string(),
                endpoint,
                program: DEVICE_CORE,
                version: DEVICE_CORE_VERSION,
                protocol: IPPROTO_TCP,
            })
            .await?;

        let parms = CreateLinkParms {
            client_id: self.config.client_id,
            lock_device: want_lock,
            lock_timeout: self.config.lock.wait_timeout_ms,
            device: address.device().to_string(),
        };
        // A failure from here on drops `core`, releasing the reference.
        let resp: CreateLinkResp = core
            .call(procedure::CREATE_LINK, &parms, self.call_budget(true))
            .await?;
        VxiError::check(resp.error)?;

        let abort_addr = match u16::try_from(resp.abort_port) {
            Ok(port) if port != 0 => SocketAddr::new(core.peer_addr().ip(), port),
            _ => {
                Self::destroy_remote(&core, resp.lid, self.call_budget(false)).await;
                return Err(VxiError::AbortPort(format!(
                    "gateway advertised invalid abort port {}",
                    resp.abort_port
                )));
            }
        };
        let abort_conn = match self
            .cache
            .acquire(ConnectionKey::Address {
                addr: abort_addr,
                program: DEVICE_ASYNC,
                version: DEVICE_ASYNC_VERSION,
                send_size: 0,
                recv_size: 0,
            })
            .await
        {
            Ok(conn) => conn,
            Err(e) => {
                warn!(%address, %abort_addr, error = %e, "Abort channel unavailable, rolling back link");
                Self::destroy_remote(&core, resp.lid, self.call_budget(false)).await;
                return Err(VxiError::AbortPort(e.to_string()));
            }
        };

        info!(
            client = %self.config.client_name,
            %address,
            lid = resp.lid,
            max_recv_size = resp.max_recv_size,
            abort_port = abort_addr.port(),
            locked = want_lock,
            "Link open"
        );

        // Fresh target per open; handles from an earlier open stay inert.
        self.abort = Arc::new(Mutex::new(Some(AbortTarget {
            lid: resp.lid,
            conn: abort_conn,
            timeout: self.config.abort_timeout(),
        })));
        self.state = Some(OpenLink {
            lid: resp.lid,
            address,
            max_recv_size: resp.max_recv_size,
            abort_addr,
            core,
        });
        Ok(())
    }

    /// Destroy the link and release its connections. A no-op when closed.
    ///
    /// Failing to reach the gateway is logged; local resources are released
    /// regardless.
    pub async fn close(&mut self) {
        let Some(open) = self.state.take() else {
            return;
        };
        let abort_target = lock_target(&self.abort).take();

        Self::destroy_remote(&open.core, open.lid, self.call_budget(false)).await;
        info!(client = %self.config.client_name, address = %open.address, lid = open.lid, "Link closed");

        drop(abort_target);
        drop(open);
    }

    async fn destroy_remote(core: &RpcClient, lid: i32, budget: Duration) {
        let result: AppResult<DeviceErrorResp> = core
            .call(procedure::DESTROY_LINK, &DeviceLinkArg { lid }, budget)
            .await;
        match result.and_then(|resp| VxiError::check(resp.error)) {
            Ok(()) => debug!(lid, "destroy_link acknowledged"),
            Err(e) => warn!(lid, error = %e, "destroy_link failed; releasing local resources anyway"),
        }
    }

    /// Drop all state without talking to the gateway.
    fn teardown(&mut self, reason: &VxiError) {
        if let Some(open) = self.state.take() {
            warn!(address = %open.address, lid = open.lid, error = %reason, "Tearing down link");
            lock_target(&self.abort).take();
        }
    }

    // ------------------------------------------------------------------
    // Accessors and policy
    // ------------------------------------------------------------------

    /// True while open.
    pub fn is_open(&self) -> bool {
        self.state.is_some()
    }

    /// Gateway-assigned link id, while open.
    pub fn link_id(&self) -> Option<i32> {
        self.state.as_ref().map(|s| s.lid)
    }

    /// Largest transfer the gateway accepts per call, while open.
    pub fn max_recv_size(&self) -> Option<u32> {
        self.state.as_ref().map(|s| s.max_recv_size)
    }

    /// Abort channel address, while open.
    pub fn abort_port(&self) -> Option<SocketAddr> {
        self.state.as_ref().map(|s| s.abort_addr)
    }

    /// Instrument address, while open.
    pub fn address(&self) -> Option<&InstrumentAddress> {
        self.state.as_ref().map(|s| &s.address)
    }

    /// Current configuration.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Current lock policy.
    pub fn lock_policy(&self) -> LockPolicy {
        self.config.lock
    }

    /// Change the lock policy for future calls. A lock granted at open is
    /// unaffected.
    pub fn set_lock_policy(&mut self, exclusive: bool, wait_timeout_ms: u32) {
        self.config.lock = LockPolicy {
            exclusive,
            wait_timeout_ms,
        };
    }

    /// Change the I/O timeout for future calls.
    pub fn set_io_timeout(&mut self, io_timeout_ms: u32) {
        self.config.io_timeout_ms = io_timeout_ms;
    }

    /// Change end-of-string handling.
    pub fn set_term_config(&mut self, term: TermConfig) {
        self.config.term = term;
    }

    /// Toggle per-transfer echo at info level.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.config.verbose = verbose;
    }

    /// Handle for cancelling in-flight calls from another task.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            target: self.abort.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Core channel plumbing
    // ------------------------------------------------------------------

    fn open_link(&self) -> AppResult<&OpenLink> {
        self.state.as_ref().ok_or(VxiError::NotOpen)
    }

    fn lock_flags(&self, wait_lock: bool) -> u32 {
        if wait_lock || self.config.lock.exclusive {
            flags::WAITLOCK
        } else {
            0
        }
    }

    /// Local deadline for one core call.
    fn call_budget(&self, waits_for_lock: bool) -> Duration {
        let lock_wait = if waits_for_lock {
            self.config.lock.wait_timeout()
        } else {
            Duration::ZERO
        };
        self.config.io_timeout() + lock_wait + self.config.rpc_grace()
    }

    async fn core_call<A, R>(&mut self, procedure: u32, args: &A, waits_for_lock: bool) -> AppResult<R>
    where
        A: XdrEncode + Sync + ?Sized,
        R: XdrDecode,
    {
        let budget = self.call_budget(waits_for_lock);
        let result = self.open_link()?.core.call(procedure, args, budget).await;
        match result {
            Err(VxiError::LocalTimeout(_)) => {
                warn!(procedure, ?budget, "No reply in time, aborting the outstanding operation");
                let handle = self.abort_handle();
                tokio::spawn(async move {
                    if let Err(e) = handle.abort().await {
                        debug!(error = %e, "Abort after local timeout failed");
                    }
                });
                Err(VxiError::LocalTimeout(budget))
            }
            Err(e @ (VxiError::Transport(_) | VxiError::Io(_))) => {
                self.teardown(&e);
                Err(e)
            }
            other => other,
        }
    }

    async fn generic(&mut self, procedure: u32, op: Operation, wait_lock: bool) -> AppResult<()> {
        let op_flags = self.lock_flags(wait_lock);
        let parms = DeviceGenericParms {
            lid: self.open_link()?.lid,
            flags: op_flags,
            lock_timeout: self.config.lock.wait_timeout_ms,
            io_timeout: self.config.io_timeout_ms,
        };
        let resp: DeviceErrorResp = self
            .core_call(procedure, &parms, op_flags & flags::WAITLOCK != 0)
            .await?;
        VxiError::check(resp.error)?;
        self.echo(op, "ok");
        Ok(())
    }

    fn echo(&self, op: Operation, detail: &str) {
        let lid = self.link_id().unwrap_or(-1);
        if self.config.verbose {
            info!(client = %self.config.client_name, lid, %op, detail, "I/O");
        } else {
            debug!(client = %self.config.client_name, lid, %op, detail, "I/O");
        }
    }

    // ------------------------------------------------------------------
    // Synchronous I/O
    // ------------------------------------------------------------------

    /// Read up to `max_len` bytes; see [`DeviceLink::read_with`].
    pub async fn read(&mut self, max_len: usize) -> AppResult<ReadResult> {
        self.read_with(max_len, false).await
    }

    /// Read up to `max_len` bytes, optionally waiting for the lock.
    ///
    /// Issues as many device reads as needed, each no larger than the
    /// gateway's `max_recv_size`, until the length is satisfied, the gateway
    /// signals END, or the configured termination character arrives.
    ///
    /// # Errors
    /// `Protocol` if the gateway returns more than was requested.
    pub async fn read_with(&mut self, max_len: usize, wait_lock: bool) -> AppResult<ReadResult> {
        let open = self.open_link()?;
        let lid = open.lid;
        let chunk_limit = match open.max_recv_size as usize {
            0 => VXI_MAX_READWRITE,
            n => n.min(VXI_MAX_READWRITE),
        };
        if max_len == 0 {
            return Ok(ReadResult {
                data: Vec::new(),
                reason: ReadReason {
                    request_count: true,
                    ..Default::default()
                },
            });
        }

        let termchar = self.config.term.active_termchar();
        let mut op_flags = self.lock_flags(wait_lock);
        if termchar.is_some() {
            op_flags |= flags::TERMCHRSET;
        }

        let mut data = Vec::new();
        let reason = loop {
            let request = (max_len - data.len()).min(chunk_limit);
            let parms = DeviceReadParms {
                lid,
                request_size: request as u32,
                io_timeout: self.config.io_timeout_ms,
                lock_timeout: self.config.lock.wait_timeout_ms,
                flags: op_flags,
                term_char: u32::from(termchar.unwrap_or(0)),
            };
            let resp: DeviceReadResp = self
                .core_call(procedure::DEVICE_READ, &parms, op_flags & flags::WAITLOCK != 0)
                .await?;
            VxiError::check(resp.error)?;

            if resp.data.len() > request {
                return Err(VxiError::Protocol(format!(
                    "gateway returned {} bytes for a {} byte read",
                    resp.data.len(),
                    request
                )));
            }
            if resp.data.is_empty() && resp.reason == 0 {
                return Err(VxiError::Protocol(
                    "gateway returned an empty unterminated read".to_string(),
                ));
            }
            data.extend_from_slice(&resp.data);

            let mut reason = ReadReason::from_bits(resp.reason);
            if let Some(tc) = termchar {
                reason.term_char |= resp.data.contains(&tc);
            }
            reason.request_count = data.len() >= max_len;
            if reason.is_terminated() {
                break reason;
            }
        };

        self.echo(
            Operation::Read,
            &format!("{} bytes {:?}", data.len(), String::from_utf8_lossy(&data)),
        );
        Ok(ReadResult { data, reason })
    }

    /// Write the whole buffer; see [`DeviceLink::write_with`].
    pub async fn write(&mut self, data: &[u8]) -> AppResult<()> {
        self.write_with(data, false).await
    }

    /// Write the whole buffer, optionally waiting for the lock.
    ///
    /// Splits the data into chunks no larger than the gateway's
    /// `max_recv_size`; the last chunk carries END when the term config asks
    /// for it.
    ///
    /// # Errors
    /// `WriteTooLarge` before any network traffic if `data` exceeds
    /// [`VXI_MAX_READWRITE`].
    pub async fn write_with(&mut self, data: &[u8], wait_lock: bool) -> AppResult<()> {
        if data.len() > VXI_MAX_READWRITE {
            return Err(VxiError::WriteTooLarge {
                len: data.len(),
                max: VXI_MAX_READWRITE,
            });
        }
        let open = self.open_link()?;
        let lid = open.lid;
        let chunk_limit = match open.max_recv_size as usize {
            0 => VXI_MAX_READWRITE,
            n => n,
        };
        let lock_flags = self.lock_flags(wait_lock);

        let mut offset = 0;
        loop {
            let end = (offset + chunk_limit).min(data.len());
            let last = end == data.len();
            let mut op_flags = lock_flags;
            if last && self.config.term.send_eoi_on_write {
                op_flags |= flags::END;
            }
            let parms = DeviceWriteParms {
                lid,
                io_timeout: self.config.io_timeout_ms,
                lock_timeout: self.config.lock.wait_timeout_ms,
                flags: op_flags,
                data: Bytes::copy_from_slice(&data[offset..end]),
            };
            let resp: DeviceWriteResp = self
                .core_call(procedure::DEVICE_WRITE, &parms, op_flags & flags::WAITLOCK != 0)
                .await?;
            VxiError::check(resp.error)?;

            let accepted = resp.size as usize;
            if accepted > end - offset || (accepted == 0 && end > offset) {
                return Err(VxiError::Protocol(format!(
                    "gateway accepted {} of {} bytes",
                    accepted,
                    end - offset
                )));
            }
            offset += accepted;
            if offset >= data.len() {
                break;
            }
        }

        self.echo(
            Operation::Write,
            &format!("{} bytes {:?}", data.len(), String::from_utf8_lossy(data)),
        );
        Ok(())
    }

    /// Group execute trigger.
    pub async fn trigger(&mut self) -> AppResult<()> {
        self.trigger_with(false).await
    }

    /// Group execute trigger, optionally waiting for the lock.
    pub async fn trigger_with(&mut self, wait_lock: bool) -> AppResult<()> {
        self.generic(procedure::DEVICE_TRIGGER, Operation::Trigger, wait_lock)
            .await
    }

    /// Device clear.
    pub async fn clear(&mut self) -> AppResult<()> {
        self.generic(procedure::DEVICE_CLEAR, Operation::Clear, false)
            .await
    }

    /// Return the instrument to local control.
    pub async fn local(&mut self) -> AppResult<()> {
        self.generic(procedure::DEVICE_LOCAL, Operation::Local, false)
            .await
    }

    /// Put the instrument under remote control.
    pub async fn remote(&mut self) -> AppResult<()> {
        self.generic(procedure::DEVICE_REMOTE, Operation::Remote, false)
            .await
    }

    /// Poll the status byte.
    pub async fn read_status_byte(&mut self) -> AppResult<StatusByte> {
        let op_flags = self.lock_flags(false);
        let parms = DeviceGenericParms {
            lid: self.open_link()?.lid,
            flags: op_flags,
            lock_timeout: self.config.lock.wait_timeout_ms,
            io_timeout: self.config.io_timeout_ms,
        };
        let resp: DeviceReadStbResp = self
            .core_call(procedure::DEVICE_READSTB, &parms, op_flags & flags::WAITLOCK != 0)
            .await?;
        VxiError::check(resp.error)?;
        let stb = StatusByte::from_raw((resp.stb & 0xff) as u8);
        self.echo(Operation::ReadStatusByte, &format!("{:#04x}", stb.value));
        Ok(stb)
    }

    /// Take the exclusive lock, waiting up to the policy's wait timeout.
    ///
    /// # Errors
    /// `Device(DeviceLocked)` if another link keeps the lock past the wait.
    pub async fn lock(&mut self) -> AppResult<()> {
        let parms = DeviceLockParms {
            lid: self.open_link()?.lid,
            flags: flags::WAITLOCK,
            lock_timeout: self.config.lock.wait_timeout_ms,
        };
        let resp: DeviceErrorResp = self
            .core_call(procedure::DEVICE_LOCK, &parms, true)
            .await?;
        VxiError::check(resp.error)?;
        self.echo(Operation::Lock, "granted");
        Ok(())
    }

    /// Release the exclusive lock.
    ///
    /// # Errors
    /// `Device(NoLockHeld)` if this link holds no lock.
    pub async fn unlock(&mut self) -> AppResult<()> {
        let arg = DeviceLinkArg {
            lid: self.open_link()?.lid,
        };
        let resp: DeviceErrorResp = self
            .core_call(procedure::DEVICE_UNLOCK, &arg, false)
            .await?;
        VxiError::check(resp.error)?;
        self.echo(Operation::Unlock, "released");
        Ok(())
    }

    /// Abort whatever is in flight; see [`AbortHandle::abort`].
    pub async fn abort(&self) -> AppResult<()> {
        self.abort_handle().abort().await
    }
}

impl fmt::Debug for DeviceLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceLink")
            .field("address", &self.address())
            .field("link_id", &self.link_id())
            .field("max_recv_size", &self.max_recv_size())
            .finish()
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        let Some(open) = self.state.take() else {
            return;
        };
        lock_target(&self.abort).take();
        // Best effort: tell the gateway if a runtime is still around.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let core = open.core.shared();
            let lid = open.lid;
            let budget = self.call_budget(false);
            handle.spawn(async move {
                DeviceLink::destroy_remote(&core, lid, budget).await;
            });
        } else {
            debug!(lid = open.lid, "Link dropped without a runtime; gateway link left to expire");
        }
    }
}

#[async_trait]
impl InstrumentIo for DeviceLink {
    async fn read(&mut self, max_len: usize) -> AppResult<ReadResult> {
        DeviceLink::read(self, max_len).await
    }

    async fn write(&mut self, data: &[u8]) -> AppResult<()> {
        DeviceLink::write(self, data).await
    }

    async fn trigger(&mut self) -> AppResult<()> {
        DeviceLink::trigger(self).await
    }

    async fn clear(&mut self) -> AppResult<()> {
        DeviceLink::clear(self).await
    }

    async fn local(&mut self) -> AppResult<()> {
        DeviceLink::local(self).await
    }

    async fn read_status_byte(&mut self) -> AppResult<StatusByte> {
        DeviceLink::read_status_byte(self).await
    }

    async fn abort(&self) -> AppResult<()> {
        DeviceLink::abort(self).await
    }

    async fn close(&mut self) {
        DeviceLink::close(self).await
    }
}
