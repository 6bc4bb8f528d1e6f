//! In-memory instrument for testing
//!
//! [`MockInstrument`] implements [`InstrumentIo`] without a gateway. It
//! provides:
//! - Canned replies keyed by command
//! - A scripted status byte sequence
//! - Failure injection for the next operation
//! - A call log for test verification
//!
//! # Example
//!
//! ```
//! use rust_vxi11::mock::MockInstrument;
//! use rust_vxi11::InstrumentIo;
//!
//! # async fn example() -> rust_vxi11::AppResult<()> {
//! let mut dev = MockInstrument::new().with_response("*IDN?", "ACME,MODEL1,123,1.0\n");
//! dev.write(b"*IDN?\n").await?;
//! let reply = dev.read(64).await?;
//! assert_eq!(reply.data, b"ACME,MODEL1,123,1.0\n");
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{AppResult, DeviceErrorCode, VxiError};
use crate::io::{InstrumentIo, ReadReason, ReadResult, StatusByte};

#[derive(Default)]
struct MockState {
    closed: bool,
    responses: HashMap<String, Vec<u8>>,
    output: VecDeque<u8>,
    status_script: VecDeque<u8>,
    idle_status: u8,
    fail_next: Option<DeviceErrorCode>,
    call_log: Vec<String>,
}

/// Scriptable in-memory instrument.
///
/// Clones share state, so a test can keep one handle for inspection while a
/// poller owns another.
#[derive(Clone, Default)]
pub struct MockInstrument {
    state: Arc<Mutex<MockState>>,
}

impl MockInstrument {
    /// Open instrument with no canned replies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `reply` whenever `command` (trailing whitespace ignored) is
    /// written.
    pub fn with_response(self, command: &str, reply: impl Into<Vec<u8>>) -> Self {
        self.lock()
            .responses
            .insert(command.trim_end().to_string(), reply.into());
        self
    }

    /// Status byte returned once the script runs dry.
    pub fn with_idle_status(self, stb: u8) -> Self {
        self.lock().idle_status = stb;
        self
    }

    /// Append status bytes returned by successive polls.
    pub fn push_status(&self, bytes: &[u8]) {
        self.lock().status_script.extend(bytes.iter().copied());
    }

    /// Fail the next operation with `code`.
    pub fn inject_next_failure(&self, code: DeviceErrorCode) {
        self.lock().fail_next = Some(code);
    }

    /// True once `close` was called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Every operation seen so far.
    pub fn call_log(&self) -> Vec<String> {
        self.lock().call_log.clone()
    }

    /// Number of status polls seen so far.
    pub fn status_polls(&self) -> usize {
        self.lock()
            .call_log
            .iter()
            .filter(|c| c.as_str() == "read_status_byte")
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Log `call` and apply closed/injected-failure checks.
    fn begin(&self, call: String) -> AppResult<MutexGuard<'_, MockState>> {
        let mut state = self.lock();
        state.call_log.push(call);
        if state.closed {
            return Err(VxiError::NotOpen);
        }
        if let Some(code) = state.fail_next.take() {
            return Err(VxiError::Device(code));
        }
        Ok(state)
    }
}

#[async_trait]
impl InstrumentIo for MockInstrument {
    async fn read(&mut self, max_len: usize) -> AppResult<ReadResult> {
        let mut state = self.begin(format!("read {}", max_len))?;
        if state.output.is_empty() {
            return Err(VxiError::Device(DeviceErrorCode::IoTimeout));
        }
        let n = max_len.min(state.output.len());
        let data: Vec<u8> = state.output.drain(..n).collect();
        Ok(ReadResult {
            data,
            reason: ReadReason {
                request_count: n == max_len,
                term_char: false,
                end: state.output.is_empty(),
            },
        })
    }

    async fn write(&mut self, data: &[u8]) -> AppResult<()> {
        let text = String::from_utf8_lossy(data).into_owned();
        let mut state = self.begin(format!("write {}", text.trim_end()))?;
        if let Some(reply) = state.responses.get(text.trim_end()).cloned() {
            state.output.extend(reply);
        }
        Ok(())
    }

    async fn trigger(&mut self) -> AppResult<()> {
        self.begin("trigger".to_string()).map(drop)
    }

    async fn clear(&mut self) -> AppResult<()> {
        let mut state = self.begin("clear".to_string())?;
        state.output.clear();
        Ok(())
    }

    async fn local(&mut self) -> AppResult<()> {
        self.begin("local".to_string()).map(drop)
    }

    async fn read_status_byte(&mut self) -> AppResult<StatusByte> {
        let mut state = self.begin("read_status_byte".to_string())?;
        let value = match state.status_script.pop_front() {
            Some(stb) => stb,
            None => state.idle_status,
        };
        Ok(StatusByte::from_raw(value))
    }

    async fn abort(&self) -> AppResult<()> {
        self.lock().call_log.push("abort".to_string());
        Ok(())
    }

    async fn close(&mut self) {
        let mut state = self.lock();
        state.call_log.push("close".to_string());
        state.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_canned_reply_round_trip() {
        let mut dev = MockInstrument::new().with_response("ID?", "ACME\n");
        dev.write(b"ID?\r\n").await.unwrap();
        let first = dev.read(2).await.unwrap();
        assert_eq!(first.data, b"AC");
        assert!(first.reason.request_count && !first.reason.end);
        let rest = dev.read(64).await.unwrap();
        assert_eq!(rest.data, b"ME\n");
        assert!(rest.reason.end);
    }

    #[tokio::test]
    async fn test_read_without_reply_times_out() {
        let mut dev = MockInstrument::new();
        let err = dev.read(16).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_status_script_then_idle() {
        let mut dev = MockInstrument::new().with_idle_status(0x10);
        dev.push_status(&[0x41, 0x01]);
        assert_eq!(dev.read_status_byte().await.unwrap().value, 0x41);
        assert_eq!(dev.read_status_byte().await.unwrap().value, 0x01);
        assert_eq!(dev.read_status_byte().await.unwrap().value, 0x10);
        assert_eq!(dev.status_polls(), 3);
    }

    #[tokio::test]
    async fn test_injected_failure_and_close() {
        let mut dev = MockInstrument::new();
        let observer = dev.clone();
        dev.inject_next_failure(DeviceErrorCode::DeviceLocked);
        assert!(dev.trigger().await.unwrap_err().is_locked());
        dev.trigger().await.unwrap();

        dev.close().await;
        assert!(observer.is_closed());
        assert!(matches!(dev.trigger().await, Err(VxiError::NotOpen)));
        assert_eq!(observer.call_log(), vec!["trigger", "trigger", "close", "trigger"]);
    }
}
