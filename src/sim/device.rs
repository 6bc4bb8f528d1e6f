//! Simulated instruments hosted by the gateway.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

use crate::error::DeviceErrorCode;
use crate::io::ReadReason;

/// Behaviour of one simulated instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimInstrument {
    /// Answers `*IDN?` and `ID?` with the given identification plus `\n`.
    Identify(String),
    /// Returns whatever was written.
    Echo,
    /// Accepts writes, never produces output.
    Silent,
}

#[derive(Default)]
struct DeviceState {
    input: Vec<u8>,
    output: VecDeque<u8>,
    lock_holder: Option<i32>,
    status: VecDeque<u8>,
    idle_status: u8,
}

pub(crate) struct SimDevice {
    kind: SimInstrument,
    state: Mutex<DeviceState>,
    output_ready: Notify,
    lock_released: Notify,
}

type DeviceResult<T> = Result<T, DeviceErrorCode>;

impl SimDevice {
    pub(crate) fn new(kind: SimInstrument) -> Self {
        Self {
            kind,
            state: Mutex::new(DeviceState::default()),
            output_ready: Notify::new(),
            lock_released: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept written bytes. `end` marks the end of a message.
    pub(crate) fn write(&self, data: &[u8], end: bool) {
        let mut state = self.lock();
        match &self.kind {
            SimInstrument::Silent => {}
            SimInstrument::Echo => state.output.extend(data.iter().copied()),
            SimInstrument::Identify(idn) => {
                state.input.extend_from_slice(data);
                if end || data.ends_with(b"\n") {
                    let command = String::from_utf8_lossy(&state.input).trim().to_uppercase();
                    state.input.clear();
                    if command == "*IDN?" || command == "ID?" {
                        state.output.extend(idn.bytes());
                        state.output.push_back(b'\n');
                    }
                }
            }
        }
        if !state.output.is_empty() {
            self.output_ready.notify_waiters();
        }
    }

    fn take_output(&self, request: usize, termchar: Option<u8>) -> Option<(Vec<u8>, ReadReason)> {
        let mut state = self.lock();
        if state.output.is_empty() {
            return None;
        }
        let mut n = request.min(state.output.len());
        let mut reason = ReadReason::default();
        if let Some(tc) = termchar {
            if let Some(pos) = state.output.iter().take(n).position(|&b| b == tc) {
                n = pos + 1;
                reason.term_char = true;
            }
        }
        let data: Vec<u8> = state.output.drain(..n).collect();
        reason.end = state.output.is_empty();
        reason.request_count = data.len() == request && !reason.end && !reason.term_char;
        Some((data, reason))
    }

    /// Deliver up to `request` bytes, waiting at most `io_timeout` for output.
    pub(crate) async fn read(
        &self,
        request: usize,
        termchar: Option<u8>,
        io_timeout: Duration,
        abort: &Notify,
    ) -> DeviceResult<(Vec<u8>, ReadReason)> {
        let deadline = Instant::now() + io_timeout;
        let aborted = abort.notified();
        tokio::pin!(aborted);
        loop {
            let ready = self.output_ready.notified();
            if let Some(out) = self.take_output(request, termchar) {
                return Ok(out);
            }
            tokio::select! {
                _ = ready => {}
                _ = &mut aborted => return Err(DeviceErrorCode::Abort),
                _ = sleep_until(deadline) => return Err(DeviceErrorCode::IoTimeout),
            }
        }
    }

    pub(crate) fn clear(&self) {
        let mut state = self.lock();
        state.input.clear();
        state.output.clear();
    }

    pub(crate) fn status_byte(&self) -> u8 {
        let mut state = self.lock();
        match state.status.pop_front() {
            Some(stb) => stb,
            None => state.idle_status,
        }
    }

    pub(crate) fn push_status(&self, bytes: &[u8]) {
        self.lock().status.extend(bytes.iter().copied());
    }

    pub(crate) fn set_idle_status(&self, stb: u8) {
        self.lock().idle_status = stb;
    }

    /// Take the lock for `lid`, waiting up to `wait` for another holder.
    pub(crate) async fn acquire_lock(&self, lid: i32, wait: Duration) -> DeviceResult<()> {
        self.wait_for_lock(lid, wait, true).await
    }

    /// Succeed when `lid` may operate: nobody else holds the lock. Without
    /// `wait_lock` a foreign lock fails at once.
    pub(crate) async fn check_lock(&self, lid: i32, wait_lock: bool, wait: Duration) -> DeviceResult<()> {
        let wait = if wait_lock { wait } else { Duration::ZERO };
        self.wait_for_lock(lid, wait, false).await
    }

    async fn wait_for_lock(&self, lid: i32, wait: Duration, take: bool) -> DeviceResult<()> {
        let deadline = Instant::now() + wait;
        loop {
            let released = self.lock_released.notified();
            {
                let mut state = self.lock();
                match state.lock_holder {
                    None => {
                        if take {
                            state.lock_holder = Some(lid);
                        }
                        return Ok(());
                    }
                    Some(holder) if holder == lid => return Ok(()),
                    Some(_) => {}
                }
            }
            if Instant::now() >= deadline {
                return Err(DeviceErrorCode::DeviceLocked);
            }
            tokio::select! {
                _ = released => {}
                _ = sleep_until(deadline) => return Err(DeviceErrorCode::DeviceLocked),
            }
        }
    }

    /// Drop the lock if `lid` holds it.
    pub(crate) fn release_lock(&self, lid: i32) -> bool {
        let mut state = self.lock();
        if state.lock_holder == Some(lid) {
            state.lock_holder = None;
            self.lock_released.notify_waiters();
            true
        } else {
            false
        }
    }
}
