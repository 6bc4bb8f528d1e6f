//! Synchronous I/O, locking and status polling against the simulated gateway

mod common;

use common::{link_config, new_link, start_gateway, IDN};
use rust_vxi11::sim::{SimInstrument, SimulatedGateway};
use rust_vxi11::{
    ConnectionCache, DeviceErrorCode, DeviceLink, InstrumentIo, Operation, PollConfig,
    PollVerdict, StatusPoller, TermConfig, VxiError, VXI_MAX_READWRITE,
};

#[tokio::test]
async fn test_identification_round_trip() {
    let gateway = start_gateway().await;
    let cache = ConnectionCache::new();
    let mut link = new_link(&gateway, &cache);
    link.open(&gateway.address("inst0"), false).await.unwrap();

    link.write(b"ID?\n").await.unwrap();
    let reply = link.read(1024).await.unwrap();
    assert_eq!(reply.data, format!("{IDN}\n").as_bytes());
    assert!(reply.reason.end);
    assert!(!reply.reason.request_count);

    link.write(b"*IDN?\n").await.unwrap();
    let reply = link.read(1024).await.unwrap();
    assert_eq!(String::from_utf8(reply.data).unwrap(), format!("{IDN}\n"));

    link.close().await;
}

#[tokio::test]
async fn test_transfers_are_chunked_by_max_recv_size() {
    let gateway = SimulatedGateway::builder()
        .instrument("echo0", SimInstrument::Echo)
        .max_recv_size(8)
        .start()
        .await
        .unwrap();
    let cache = ConnectionCache::new();
    let mut link = DeviceLink::new(cache, link_config(&gateway, 2000));
    link.open(&gateway.address("echo0"), false).await.unwrap();
    assert_eq!(link.max_recv_size(), Some(8));

    let payload: Vec<u8> = (0..30u8).map(|b| b'A' + b % 26).collect();
    link.write(&payload).await.unwrap();

    let reply = link.read(30).await.unwrap();
    assert_eq!(reply.data, payload);
    assert!(reply.reason.request_count);
    assert!(reply.reason.end);
    link.close().await;
}

#[tokio::test]
async fn test_short_read_stops_at_requested_length() {
    let gateway = start_gateway().await;
    let cache = ConnectionCache::new();
    let mut link = new_link(&gateway, &cache);
    link.open(&gateway.address("echo0"), false).await.unwrap();

    link.write(b"0123456789").await.unwrap();
    let head = link.read(4).await.unwrap();
    assert_eq!(head.data, b"0123");
    assert!(head.reason.request_count && !head.reason.end);
    let tail = link.read(64).await.unwrap();
    assert_eq!(tail.data, b"456789");
    assert!(tail.reason.end);
    link.close().await;
}

#[tokio::test]
async fn test_termchar_ends_read() {
    let gateway = start_gateway().await;
    let cache = ConnectionCache::new();
    let mut link = new_link(&gateway, &cache);
    link.set_term_config(TermConfig {
        termchar: Some(b'\n'),
        terminate_on_char: true,
        send_eoi_on_write: true,
    });
    link.open(&gateway.address("echo0"), false).await.unwrap();

    link.write(b"first\nsecond\n").await.unwrap();
    let first = link.read(100).await.unwrap();
    assert_eq!(first.data, b"first\n");
    assert!(first.reason.term_char);
    let second = link.read(100).await.unwrap();
    assert_eq!(second.data, b"second\n");
    link.close().await;
}

#[tokio::test]
async fn test_oversized_write_fails_locally_and_link_survives() {
    let gateway = start_gateway().await;
    let cache = ConnectionCache::new();
    let mut link = new_link(&gateway, &cache);
    link.open(&gateway.address("inst0"), false).await.unwrap();

    let huge = vec![b'x'; VXI_MAX_READWRITE + 1];
    let err = link.write(&huge).await.unwrap_err();
    assert!(matches!(err, VxiError::WriteTooLarge { .. }));
    assert_eq!(err.code(), rust_vxi11::error::CODE_WRITE_TOO_LARGE);

    link.write(b"*IDN?\n").await.unwrap();
    assert_eq!(link.read(256).await.unwrap().data, format!("{IDN}\n").as_bytes());
    link.close().await;
}

#[tokio::test]
async fn test_generic_operations_succeed() {
    let gateway = start_gateway().await;
    let cache = ConnectionCache::new();
    let mut link = new_link(&gateway, &cache);
    link.open(&gateway.address("echo0"), false).await.unwrap();

    link.write(b"pending").await.unwrap();
    link.trigger().await.unwrap();
    link.remote().await.unwrap();
    link.local().await.unwrap();
    link.clear().await.unwrap();
    // Clear discarded the pending output.
    let err = {
        link.set_io_timeout(200);
        link.read(16).await.unwrap_err()
    };
    assert_eq!(err.device_code(), Some(DeviceErrorCode::IoTimeout));
    link.close().await;
}

#[tokio::test]
async fn test_foreign_lock_blocks_other_links() {
    let gateway = start_gateway().await;
    let cache = ConnectionCache::new();
    let mut owner = new_link(&gateway, &cache);
    let mut other = new_link(&gateway, &cache);
    owner.open(&gateway.address("echo0"), true).await.unwrap();
    other.open(&gateway.address("echo0"), false).await.unwrap();

    // Without waiting for the lock a foreign lock fails at once.
    let err = other.write(b"x").await.unwrap_err();
    assert!(err.is_locked());
    assert_eq!(err.code(), 11);
    owner.write(b"mine").await.unwrap();

    owner.unlock().await.unwrap();
    other.write(b"x").await.unwrap();

    other.lock().await.unwrap();
    assert!(owner.trigger().await.unwrap_err().is_locked());
    let err = owner.unlock().await.unwrap_err();
    assert_eq!(err.device_code(), Some(DeviceErrorCode::NoLockHeld));

    // Closing the holder releases its lock.
    other.close().await;
    owner.trigger().await.unwrap();
    owner.close().await;
}

#[tokio::test]
async fn test_status_byte_reports_pending_events() {
    let gateway = start_gateway().await;
    let cache = ConnectionCache::new();
    let mut link = new_link(&gateway, &cache);
    link.open(&gateway.address("inst0"), false).await.unwrap();

    assert!(gateway.push_status("inst0", &[0x41, 0x10]));
    let first = link.read_status_byte().await.unwrap();
    assert_eq!(first.value, 0x41);
    assert!(first.more_pending);
    let second = link.read_status_byte().await.unwrap();
    assert_eq!(second.value, 0x10);
    assert!(!second.more_pending);
    assert_eq!(link.read_status_byte().await.unwrap().value, 0);
    link.close().await;
}

#[tokio::test]
async fn test_status_poller_over_device_link() {
    let gateway = start_gateway().await;
    let cache = ConnectionCache::new();
    let mut link = new_link(&gateway, &cache);
    link.open(&gateway.address("inst0"), false).await.unwrap();

    let classify = |_: Operation, stb: u8| {
        if stb & 0x20 != 0 {
            PollVerdict::Fatal("execution error".to_string())
        } else {
            PollVerdict::Ok
        }
    };
    let mut poller = StatusPoller::new(link, classify, PollConfig::default());

    gateway.push_status("inst0", &[0x41, 0x00]);
    poller.write(b"*IDN?\n").await.unwrap();
    let reply = poller.read(256).await.unwrap();
    assert_eq!(reply.data, format!("{IDN}\n").as_bytes());

    gateway.set_idle_status("inst0", 0x20);
    let err = poller.trigger().await.unwrap_err();
    assert!(matches!(err, VxiError::StatusFatal { op: Operation::Trigger, stb: 0x20, .. }));
    assert!(!poller.inner().is_open());
    assert!(cache.is_empty());
    assert_eq!(gateway.active_links(), 0);
}
