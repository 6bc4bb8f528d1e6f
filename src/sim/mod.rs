//! In-process instrument gateway for tests and demos.
//!
//! [`SimulatedGateway`] speaks the same ONC-RPC programs a real gateway does,
//! on localhost:
//!
//! - one listener serves the portmapper (program 100000) and the core
//!   program; the portmapper maps the core program to that same port
//! - a second listener serves the abort program, advertised by create_link
//!
//! Each named [`SimInstrument`] supports exclusive locks with server-side
//! wait, blocking reads bounded by the request's I/O timeout, abort delivery
//! to in-flight reads, `max_recv_size` enforcement and queued status bytes.
//!
//! ```no_run
//! use rust_vxi11::sim::{SimInstrument, SimulatedGateway};
//! use rust_vxi11::{ConnectionCache, DeviceLink};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let gateway = SimulatedGateway::builder()
//!     .instrument("inst0", SimInstrument::Identify("ACME,MODEL1,123,1.0".into()))
//!     .start()
//!     .await?;
//! let mut link = DeviceLink::new(ConnectionCache::new(), gateway.link_config());
//! link.open(&gateway.address("inst0"), false).await?;
//! # Ok(())
//! # }
//! ```

mod device;

pub use device::SimInstrument;

use anyhow::{Context, Result};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::error::DeviceErrorCode;
use crate::rpc::message::{decode_call, encode_reply, AcceptStat, CallHeader};
use crate::rpc::portmap::{Mapping, IPPROTO_TCP, PMAPPROC_GETPORT, PMAP_PROGRAM, PMAP_VERSION};
use crate::rpc::record::{read_record, write_record};
use crate::rpc::xdr::{to_bytes, XdrDecode, XdrEncode};
use crate::vxi11::{
    flags, procedure, CreateLinkParms, CreateLinkResp, DeviceErrorResp, DeviceGenericParms,
    DeviceLinkArg, DeviceLockParms, DeviceReadParms, DeviceReadResp, DeviceReadStbResp,
    DeviceWriteParms, DeviceWriteResp, DEVICE_ASYNC, DEVICE_ASYNC_VERSION, DEVICE_CORE,
    DEVICE_CORE_VERSION,
};
use device::SimDevice;

const DEFAULT_MAX_RECV_SIZE: u32 = 16 * 1024;

/// Collects instruments before the gateway starts listening.
#[derive(Debug, Clone)]
pub struct GatewayBuilder {
    instruments: Vec<(String, SimInstrument)>,
    max_recv_size: u32,
}

impl GatewayBuilder {
    /// Host `kind` under `name`.
    pub fn instrument(mut self, name: &str, kind: SimInstrument) -> Self {
        self.instruments.push((name.to_string(), kind));
        self
    }

    /// Largest transfer accepted per call.
    pub fn max_recv_size(mut self, size: u32) -> Self {
        self.max_recv_size = size;
        self
    }

    /// Bind both listeners on 127.0.0.1 and start serving.
    pub async fn start(self) -> Result<SimulatedGateway> {
        let core_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("binding core listener")?;
        let abort_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("binding abort listener")?;
        let core_addr = core_listener.local_addr()?;
        let abort_addr = abort_listener.local_addr()?;

        let state = Arc::new(GatewayState {
            devices: self
                .instruments
                .into_iter()
                .map(|(name, kind)| (name, Arc::new(SimDevice::new(kind))))
                .collect(),
            links: Mutex::new(HashMap::new()),
            next_lid: AtomicI32::new(1),
            core_connections: AtomicUsize::new(0),
            core_port: core_addr.port(),
            abort_port: abort_addr.port(),
            max_recv_size: self.max_recv_size,
            tasks: Mutex::new(Vec::new()),
        });

        let core_task = tokio::spawn(accept_loop(core_listener, state.clone(), Role::Core));
        let abort_task = tokio::spawn(accept_loop(abort_listener, state.clone(), Role::Abort));
        state.track(core_task.abort_handle());
        state.track(abort_task.abort_handle());

        info!(%core_addr, %abort_addr, devices = state.devices.len(), "Simulated gateway listening");
        Ok(SimulatedGateway {
            core_addr,
            abort_addr,
            state,
        })
    }
}

/// Localhost instrument gateway. Stops serving when dropped.
pub struct SimulatedGateway {
    core_addr: SocketAddr,
    abort_addr: SocketAddr,
    state: Arc<GatewayState>,
}

impl SimulatedGateway {
    /// Start describing a gateway.
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder {
            instruments: Vec::new(),
            max_recv_size: DEFAULT_MAX_RECV_SIZE,
        }
    }

    /// Portmapper and core program port.
    pub fn port(&self) -> u16 {
        self.core_addr.port()
    }

    /// Abort program port.
    pub fn abort_port(&self) -> u16 {
        self.abort_addr.port()
    }

    /// `host:device` address for a hosted instrument.
    pub fn address(&self, device: &str) -> String {
        format!("{}:{}", self.core_addr.ip(), device)
    }

    /// Link defaults pointing at this gateway's portmapper.
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            portmapper_port: self.port(),
            ..LinkConfig::default()
        }
    }

    /// Connections that carried at least one core program call.
    pub fn core_connections(&self) -> usize {
        self.state.core_connections.load(Ordering::SeqCst)
    }

    /// Links currently established.
    pub fn active_links(&self) -> usize {
        self.state.links().len()
    }

    /// Queue status bytes for `device`. Returns false for unknown names.
    pub fn push_status(&self, device: &str, bytes: &[u8]) -> bool {
        match self.state.devices.get(device) {
            Some(dev) => {
                dev.push_status(bytes);
                true
            }
            None => false,
        }
    }

    /// Status byte reported once the queue for `device` is empty.
    pub fn set_idle_status(&self, device: &str, stb: u8) -> bool {
        match self.state.devices.get(device) {
            Some(dev) => {
                dev.set_idle_status(stb);
                true
            }
            None => false,
        }
    }
}

impl Drop for SimulatedGateway {
    fn drop(&mut self) {
        let tasks = std::mem::take(&mut *self.state.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Core,
    Abort,
}

#[derive(Clone)]
struct SimLink {
    device: Arc<SimDevice>,
    abort: Arc<Notify>,
}

struct GatewayState {
    devices: HashMap<String, Arc<SimDevice>>,
    links: Mutex<HashMap<i32, SimLink>>,
    next_lid: AtomicI32,
    core_connections: AtomicUsize,
    core_port: u16,
    abort_port: u16,
    max_recv_size: u32,
    tasks: Mutex<Vec<AbortHandle>>,
}

/// Per-connection bookkeeping.
#[derive(Default)]
struct ConnState {
    lids: Mutex<HashSet<i32>>,
    counted: AtomicBool,
}

type Reply = (AcceptStat, Bytes);

fn success<T: XdrEncode + ?Sized>(value: &T) -> Reply {
    (AcceptStat::Success, to_bytes(value))
}

fn garbage() -> Reply {
    (AcceptStat::GarbageArgs, Bytes::new())
}

fn error_resp(code: DeviceErrorCode) -> Reply {
    success(&DeviceErrorResp { error: code.code() })
}

fn result_code(result: Result<(), DeviceErrorCode>) -> u32 {
    match result {
        Ok(()) => 0,
        Err(code) => code.code(),
    }
}

fn lock_set<T>(set: &Mutex<T>) -> MutexGuard<'_, T> {
    set.lock().unwrap_or_else(PoisonError::into_inner)
}

fn millis(ms: u32) -> Duration {
    Duration::from_millis(u64::from(ms))
}

async fn accept_loop(listener: TcpListener, state: Arc<GatewayState>, role: Role) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(?role, error = %e, "Accept failed");
                continue;
            }
        };
        debug!(?role, %peer, "Connection accepted");
        let task = tokio::spawn({
            let state = state.clone();
            async move {
                if let Err(e) = serve_connection(stream, state, role).await {
                    debug!(?role, %peer, error = %e, "Connection ended with error");
                }
            }
        });
        state.track(task.abort_handle());
    }
}

async fn serve_connection(stream: TcpStream, state: Arc<GatewayState>, role: Role) -> Result<()> {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(writer));
    let conn = Arc::new(ConnState::default());

    let result = async {
        while let Some(record) = read_record(&mut reader).await.context("reading call")? {
            let (header, args) = decode_call(record).context("decoding call")?;
            let state = state.clone();
            let conn = conn.clone();
            let writer = writer.clone();
            tokio::spawn(async move {
                let (stat, results) = state.dispatch(role, &conn, &header, args).await;
                let reply = encode_reply(header.xid, stat, &results);
                let mut writer = writer.lock().await;
                if let Err(e) = write_record(&mut *writer, &reply).await {
                    debug!(xid = header.xid, error = %e, "Reply not delivered");
                }
            });
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    // Links die with the connection that created them.
    let lids: Vec<i32> = lock_set(&conn.lids).drain().collect();
    for lid in lids {
        state.destroy(lid);
    }
    result
}

impl GatewayState {
    fn track(&self, task: AbortHandle) {
        let mut tasks = lock_set(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn links(&self) -> MutexGuard<'_, HashMap<i32, SimLink>> {
        lock_set(&self.links)
    }

    fn link(&self, lid: i32) -> Result<SimLink, DeviceErrorCode> {
        self.links()
            .get(&lid)
            .cloned()
            .ok_or(DeviceErrorCode::InvalidLinkIdentifier)
    }

    fn destroy(&self, lid: i32) -> bool {
        let Some(link) = self.links().remove(&lid) else {
            return false;
        };
        link.device.release_lock(lid);
        link.abort.notify_waiters();
        debug!(lid, "Link destroyed");
        true
    }

    async fn dispatch(&self, role: Role, conn: &ConnState, header: &CallHeader, args: Bytes) -> Reply {
        match (role, header.program) {
            (Role::Core, PMAP_PROGRAM) if header.version == PMAP_VERSION => {
                self.portmap(header.procedure, args)
            }
            (Role::Core, DEVICE_CORE) if header.version == DEVICE_CORE_VERSION => {
                if !conn.counted.swap(true, Ordering::SeqCst) {
                    self.core_connections.fetch_add(1, Ordering::SeqCst);
                }
                self.core(conn, header.procedure, args).await
            }
            (Role::Abort, DEVICE_ASYNC) if header.version == DEVICE_ASYNC_VERSION => {
                self.abort_program(header.procedure, args)
            }
            (Role::Core, PMAP_PROGRAM) => mismatch(PMAP_VERSION),
            (Role::Core, DEVICE_CORE) => mismatch(DEVICE_CORE_VERSION),
            (Role::Abort, DEVICE_ASYNC) => mismatch(DEVICE_ASYNC_VERSION),
            _ => (AcceptStat::ProgUnavail, Bytes::new()),
        }
    }

    fn portmap(&self, proc_num: u32, mut args: Bytes) -> Reply {
        match proc_num {
            0 => success(&()),
            PMAPPROC_GETPORT => {
                let Ok(mapping) = Mapping::decode(&mut args) else {
                    return garbage();
                };
                let port = match (mapping.program, mapping.version, mapping.protocol) {
                    (DEVICE_CORE, DEVICE_CORE_VERSION, IPPROTO_TCP) => u32::from(self.core_port),
                    (DEVICE_ASYNC, DEVICE_ASYNC_VERSION, IPPROTO_TCP) => u32::from(self.abort_port),
                    _ => 0,
                };
                success(&port)
            }
            _ => (AcceptStat::ProcUnavail, Bytes::new()),
        }
    }

    fn abort_program(&self, proc_num: u32, mut args: Bytes) -> Reply {
        if proc_num != procedure::DEVICE_ABORT {
            return (AcceptStat::ProcUnavail, Bytes::new());
        }
        let Ok(arg) = DeviceLinkArg::decode(&mut args) else {
            return garbage();
        };
        match self.link(arg.lid) {
            Ok(link) => {
                debug!(lid = arg.lid, "Abort delivered");
                link.abort.notify_waiters();
                error_resp(DeviceErrorCode::NoError)
            }
            Err(code) => error_resp(code),
        }
    }

    async fn core(&self, conn: &ConnState, proc_num: u32, mut args: Bytes) -> Reply {
        match proc_num {
            procedure::CREATE_LINK => match CreateLinkParms::decode(&mut args) {
                Ok(parms) => self.create_link(conn, parms).await,
                Err(_) => garbage(),
            },
            procedure::DESTROY_LINK => match DeviceLinkArg::decode(&mut args) {
                Ok(arg) => {
                    lock_set(&conn.lids).remove(&arg.lid);
                    if self.destroy(arg.lid) {
                        error_resp(DeviceErrorCode::NoError)
                    } else {
                        error_resp(DeviceErrorCode::InvalidLinkIdentifier)
                    }
                }
                Err(_) => garbage(),
            },
            procedure::DEVICE_WRITE => match DeviceWriteParms::decode(&mut args) {
                Ok(parms) => self.device_write(parms).await,
                Err(_) => garbage(),
            },
            procedure::DEVICE_READ => match DeviceReadParms::decode(&mut args) {
                Ok(parms) => self.device_read(parms).await,
                Err(_) => garbage(),
            },
            procedure::DEVICE_READSTB => match DeviceGenericParms::decode(&mut args) {
                Ok(parms) => {
                    let stb = match self.checked_link(parms.lid, parms.flags, parms.lock_timeout).await {
                        Ok(link) => Ok(u32::from(link.device.status_byte())),
                        Err(code) => Err(code),
                    };
                    match stb {
                        Ok(stb) => success(&DeviceReadStbResp { error: 0, stb }),
                        Err(code) => success(&DeviceReadStbResp {
                            error: code.code(),
                            stb: 0,
                        }),
                    }
                }
                Err(_) => garbage(),
            },
            procedure::DEVICE_TRIGGER
            | procedure::DEVICE_CLEAR
            | procedure::DEVICE_REMOTE
            | procedure::DEVICE_LOCAL => match DeviceGenericParms::decode(&mut args) {
                Ok(parms) => {
                    let result = self
                        .checked_link(parms.lid, parms.flags, parms.lock_timeout)
                        .await
                        .map(|link| {
                            if proc_num == procedure::DEVICE_CLEAR {
                                link.device.clear();
                            }
                        });
                    success(&DeviceErrorResp {
                        error: result_code(result),
                    })
                }
                Err(_) => garbage(),
            },
            procedure::DEVICE_LOCK => match DeviceLockParms::decode(&mut args) {
                Ok(parms) => {
                    let wait = if parms.flags & flags::WAITLOCK != 0 {
                        millis(parms.lock_timeout)
                    } else {
                        Duration::ZERO
                    };
                    let result = match self.link(parms.lid) {
                        Ok(link) => link.device.acquire_lock(parms.lid, wait).await,
                        Err(code) => Err(code),
                    };
                    success(&DeviceErrorResp {
                        error: result_code(result),
                    })
                }
                Err(_) => garbage(),
            },
            procedure::DEVICE_UNLOCK => match DeviceLinkArg::decode(&mut args) {
                Ok(arg) => {
                    let result = self.link(arg.lid).and_then(|link| {
                        if link.device.release_lock(arg.lid) {
                            Ok(())
                        } else {
                            Err(DeviceErrorCode::NoLockHeld)
                        }
                    });
                    success(&DeviceErrorResp {
                        error: result_code(result),
                    })
                }
                Err(_) => garbage(),
            },
            _ => (AcceptStat::ProcUnavail, Bytes::new()),
        }
    }

    /// Look up `lid` and wait for any foreign lock per `op_flags`.
    async fn checked_link(&self, lid: i32, op_flags: u32, lock_timeout: u32) -> Result<SimLink, DeviceErrorCode> {
        let link = self.link(lid)?;
        link.device
            .check_lock(lid, op_flags & flags::WAITLOCK != 0, millis(lock_timeout))
            .await?;
        Ok(link)
    }

    async fn create_link(&self, conn: &ConnState, parms: CreateLinkParms) -> Reply {
        let failed = |code: DeviceErrorCode| {
            success(&CreateLinkResp {
                error: code.code(),
                lid: 0,
                abort_port: 0,
                max_recv_size: 0,
            })
        };
        let Some(device) = self.devices.get(&parms.device).cloned() else {
            debug!(device = %parms.device, "create_link for unknown device");
            return failed(DeviceErrorCode::InvalidAddress);
        };
        let lid = self.next_lid.fetch_add(1, Ordering::SeqCst);
        if parms.lock_device {
            if let Err(code) = device.acquire_lock(lid, millis(parms.lock_timeout)).await {
                debug!(device = %parms.device, lid, "create_link lock wait expired");
                return failed(code);
            }
        }
        self.links().insert(
            lid,
            SimLink {
                device,
                abort: Arc::new(Notify::new()),
            },
        );
        lock_set(&conn.lids).insert(lid);
        debug!(device = %parms.device, lid, client_id = parms.client_id, locked = parms.lock_device, "Link created");
        success(&CreateLinkResp {
            error: 0,
            lid,
            abort_port: u32::from(self.abort_port),
            max_recv_size: self.max_recv_size,
        })
    }

    async fn device_write(&self, parms: DeviceWriteParms) -> Reply {
        let link = match self.checked_link(parms.lid, parms.flags, parms.lock_timeout).await {
            Ok(link) => link,
            Err(code) => return success(&DeviceWriteResp { error: code.code(), size: 0 }),
        };
        let accepted = parms.data.len().min(self.max_recv_size as usize);
        let end = accepted == parms.data.len() && parms.flags & flags::END != 0;
        link.device.write(&parms.data[..accepted], end);
        success(&DeviceWriteResp {
            error: 0,
            size: accepted as u32,
        })
    }

    async fn device_read(&self, parms: DeviceReadParms) -> Reply {
        let failed = |code: DeviceErrorCode| {
            success(&DeviceReadResp {
                error: code.code(),
                reason: 0,
                data: Bytes::new(),
            })
        };
        let link = match self.checked_link(parms.lid, parms.flags, parms.lock_timeout).await {
            Ok(link) => link,
            Err(code) => return failed(code),
        };
        let termchar = (parms.flags & flags::TERMCHRSET != 0).then_some(parms.term_char as u8);
        let request = parms.request_size.min(self.max_recv_size) as usize;
        match link
            .device
            .read(request, termchar, millis(parms.io_timeout), &link.abort)
            .await
        {
            Ok((data, reason)) => success(&DeviceReadResp {
                error: 0,
                reason: reason.bits(),
                data: Bytes::from(data),
            }),
            Err(code) => failed(code),
        }
    }
}

fn mismatch(version: u32) -> Reply {
    (
        AcceptStat::ProgMismatch {
            low: version,
            high: version,
        },
        Bytes::new(),
    )
}
