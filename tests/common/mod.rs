//! Common test utilities for gateway integration tests
//!
//! This module provides reusable test helpers for:
//! - Timing-window assertions with environment-aware slop
//! - A simulated gateway hosting the standard test instruments
//! - A scripted gateway that misbehaves in controlled ways

#![allow(dead_code)] // Not every test binary uses every helper

use rust_vxi11::rpc::message::{decode_call, encode_reply, AcceptStat};
use rust_vxi11::rpc::record::{read_record, write_record};
use rust_vxi11::rpc::xdr::to_bytes;
use rust_vxi11::sim::{SimInstrument, SimulatedGateway};
use rust_vxi11::vxi11::{procedure, CreateLinkResp, DeviceErrorResp};
use rust_vxi11::{ConnectionCache, DeviceLink, LinkConfig};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Identification string of the `inst0` test instrument.
pub const IDN: &str = "ACME,MODEL1,123,1.0";

/// Slack allowed on top of a timing bound.
///
/// Returns:
/// - 1500ms if running in CI (CI env var is set)
/// - 250ms if TIMING_STRICT env var is set
/// - 750ms otherwise
pub fn timing_slop() -> Duration {
    if std::env::var("CI").is_ok() {
        Duration::from_millis(1500)
    } else if std::env::var("TIMING_STRICT").is_ok() {
        Duration::from_millis(250)
    } else {
        Duration::from_millis(750)
    }
}

/// Assert that `actual` lies in `[min, max]`.
///
/// # Panics
/// Panics with `context` and the window if the duration is outside it.
pub fn assert_duration_within(actual: Duration, min: Duration, max: Duration, context: &str) {
    assert!(
        actual >= min && actual <= max,
        "{}: got {:?} (acceptable range: {:?} to {:?})",
        context,
        actual,
        min,
        max
    );
}

/// Assert that `actual` is at least `bound` and at most `bound + timing_slop()`.
pub fn assert_bounded_by(actual: Duration, bound: Duration, context: &str) {
    assert_duration_within(actual, bound, bound + timing_slop(), context);
}

/// Gateway hosting:
/// - `inst0`: identification responder
/// - `echo0`: echoes writes
/// - `silent0`: never answers
pub async fn start_gateway() -> SimulatedGateway {
    SimulatedGateway::builder()
        .instrument("inst0", SimInstrument::Identify(IDN.to_string()))
        .instrument("echo0", SimInstrument::Echo)
        .instrument("silent0", SimInstrument::Silent)
        .start()
        .await
        .expect("simulated gateway should start")
}

/// Closed link to `gateway` with a short I/O timeout.
pub fn new_link(gateway: &SimulatedGateway, cache: &ConnectionCache) -> DeviceLink {
    DeviceLink::new(cache.clone(), link_config(gateway, 2000))
}

/// Gateway link config with the given I/O timeout.
pub fn link_config(gateway: &SimulatedGateway, io_timeout_ms: u32) -> LinkConfig {
    LinkConfig {
        io_timeout_ms,
        ..gateway.link_config()
    }
}

/// How the scripted core program treats calls other than create/destroy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreScript {
    /// Read the call and never answer it.
    NeverReply,
    /// Close the connection as soon as such a call arrives.
    HangUp,
}

/// What the scripted gateway advertises as its abort channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortScript {
    /// A port with nothing listening.
    Refused,
    /// A listener that accepts calls and never answers them.
    NeverReply,
}

/// Gateway that answers create_link and destroy_link and misbehaves on
/// everything else. Dial it with [`ScriptedGateway::link_config`].
pub struct ScriptedGateway {
    core_port: u16,
    destroyed: Arc<AtomicBool>,
    aborts_received: Arc<AtomicUsize>,
    tasks: Vec<JoinHandle<()>>,
}

impl ScriptedGateway {
    /// Start listening on localhost.
    pub async fn start(core: CoreScript, abort: AbortScript) -> Self {
        let destroyed = Arc::new(AtomicBool::new(false));
        let aborts_received = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();

        let abort_port = match abort {
            AbortScript::Refused => {
                let vacant = TcpListener::bind("127.0.0.1:0").await.unwrap();
                vacant.local_addr().unwrap().port()
            }
            AbortScript::NeverReply => {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let port = listener.local_addr().unwrap().port();
                let received = aborts_received.clone();
                tasks.push(tokio::spawn(async move {
                    while let Ok((stream, _)) = listener.accept().await {
                        tokio::spawn(swallow_calls(stream, received.clone()));
                    }
                }));
                port
            }
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let core_port = listener.local_addr().unwrap().port();
        let flag = destroyed.clone();
        tasks.push(tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_scripted_core(stream, core, abort_port, flag.clone()));
            }
        }));

        Self {
            core_port,
            destroyed,
            aborts_received,
            tasks,
        }
    }

    /// `host:device` address on this gateway.
    pub fn address(&self) -> String {
        "127.0.0.1:inst0".to_string()
    }

    /// Link config dialing the core program directly.
    pub fn link_config(&self, io_timeout_ms: u32) -> LinkConfig {
        LinkConfig {
            core_port: Some(self.core_port),
            io_timeout_ms,
            ..LinkConfig::default()
        }
    }

    /// True once a destroy_link call arrived.
    pub fn link_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Calls received on the abort channel.
    pub fn aborts_received(&self) -> usize {
        self.aborts_received.load(Ordering::SeqCst)
    }
}

impl Drop for ScriptedGateway {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn serve_scripted_core(
    stream: TcpStream,
    script: CoreScript,
    abort_port: u16,
    destroyed: Arc<AtomicBool>,
) {
    let (mut reader, mut writer) = stream.into_split();
    while let Ok(Some(record)) = read_record(&mut reader).await {
        let Ok((header, _args)) = decode_call(record) else {
            return;
        };
        let results = match header.procedure {
            procedure::CREATE_LINK => to_bytes(&CreateLinkResp {
                error: 0,
                lid: 7,
                abort_port: u32::from(abort_port),
                max_recv_size: 1024,
            }),
            procedure::DESTROY_LINK => {
                destroyed.store(true, Ordering::SeqCst);
                to_bytes(&DeviceErrorResp { error: 0 })
            }
            _ => match script {
                CoreScript::NeverReply => continue,
                CoreScript::HangUp => return,
            },
        };
        let reply = encode_reply(header.xid, AcceptStat::Success, &results);
        if write_record(&mut writer, &reply).await.is_err() {
            return;
        }
    }
}

async fn swallow_calls(mut stream: TcpStream, received: Arc<AtomicUsize>) {
    while let Ok(Some(record)) = read_record(&mut stream).await {
        if decode_call(record).is_ok_and(|(header, _)| header.procedure == procedure::DEVICE_ABORT) {
            received.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_within_passes() {
        assert_duration_within(
            Duration::from_millis(110),
            Duration::from_millis(100),
            Duration::from_millis(150),
            "inside window",
        );
    }

    #[test]
    #[should_panic(expected = "outside window")]
    fn test_duration_within_fails() {
        assert_duration_within(
            Duration::from_millis(90),
            Duration::from_millis(100),
            Duration::from_millis(150),
            "outside window",
        );
    }
}
