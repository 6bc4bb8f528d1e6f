//! Status-byte polling after every operation.
//!
//! [`StatusPoller`] wraps any [`InstrumentIo`] backend. After each successful
//! read, write, trigger, clear or local it polls the status byte and hands
//! each byte to a [`StatusClassifier`]:
//!
//! - [`PollVerdict::Ok`]: done, unless the byte reports more queued events,
//!   in which case polling continues (at most `max_drain` bytes).
//! - [`PollVerdict::Retry`]: sleep `n * backoff_step` for the n-th
//!   consecutive retry, then poll again (at most `max_retries` times).
//! - [`PollVerdict::Fatal`]: close the device and fail.
//!
//! Status polls issued by the poller go straight to the inner device, and
//! the poller's own `read_status_byte` is never followed by a poll, so a
//! poll never triggers another poll.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::PollConfig;
use crate::error::{AppResult, VxiError};
use crate::io::{InstrumentIo, Operation, ReadResult, StatusByte};

/// Classifier decision for one status byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollVerdict {
    /// Condition is fine.
    Ok,
    /// Not ready yet; poll again after a backoff.
    Retry,
    /// Unrecoverable; the reason ends up in the error.
    Fatal(String),
}

/// Application policy for interpreting status bytes.
pub trait StatusClassifier: Send + Sync {
    /// Judge `stb`, polled after `op`.
    fn classify(&self, op: Operation, stb: u8) -> PollVerdict;
}

impl<F> StatusClassifier for F
where
    F: Fn(Operation, u8) -> PollVerdict + Send + Sync,
{
    fn classify(&self, op: Operation, stb: u8) -> PollVerdict {
        self(op, stb)
    }
}

/// Backend wrapper that polls the status byte after each operation.
pub struct StatusPoller<D: InstrumentIo> {
    inner: D,
    classifier: Option<Box<dyn StatusClassifier>>,
    config: PollConfig,
}

impl<D: InstrumentIo> StatusPoller<D> {
    /// Poll with `classifier` after every operation.
    pub fn new(inner: D, classifier: impl StatusClassifier + 'static, config: PollConfig) -> Self {
        Self {
            inner,
            classifier: Some(Box::new(classifier)),
            config,
        }
    }

    /// No classifier: every call passes straight through.
    pub fn disabled(inner: D) -> Self {
        Self {
            inner,
            classifier: None,
            config: PollConfig::default(),
        }
    }

    /// Replace (or remove) the classifier.
    pub fn set_classifier(&mut self, classifier: Option<Box<dyn StatusClassifier>>) {
        self.classifier = classifier;
    }

    /// True when a classifier is installed.
    pub fn is_enabled(&self) -> bool {
        self.classifier.is_some()
    }

    /// Wrapped device.
    pub fn inner(&self) -> &D {
        &self.inner
    }

    /// Wrapped device, mutably.
    pub fn inner_mut(&mut self) -> &mut D {
        &mut self.inner
    }

    /// Unwrap the device.
    pub fn into_inner(self) -> D {
        self.inner
    }

    async fn poll_after(&mut self, op: Operation) -> AppResult<()> {
        let Some(classifier) = self.classifier.as_deref() else {
            return Ok(());
        };
        let result = drain(&mut self.inner, classifier, &self.config, op).await;
        if let Err(e) = &result {
            if matches!(
                e,
                VxiError::StatusFatal { .. } | VxiError::StatusRetriesExhausted { .. }
            ) {
                warn!(%op, error = %e, "Status poll failed, closing device");
                self.inner.close().await;
            }
        }
        result
    }
}

async fn drain<D: InstrumentIo>(
    inner: &mut D,
    classifier: &dyn StatusClassifier,
    config: &PollConfig,
    op: Operation,
) -> AppResult<()> {
    let mut retries = 0u32;
    let mut drained = 0u32;
    loop {
        let stb: StatusByte = inner.read_status_byte().await?;
        match classifier.classify(op, stb.value) {
            PollVerdict::Ok => {
                retries = 0;
                drained += 1;
                if !stb.more_pending || drained >= config.max_drain {
                    debug!(%op, stb = stb.value, drained, "Status poll done");
                    return Ok(());
                }
            }
            PollVerdict::Retry => {
                if retries >= config.max_retries {
                    return Err(VxiError::StatusRetriesExhausted { op, retries });
                }
                retries += 1;
                let backoff = config.backoff(retries);
                debug!(%op, stb = stb.value, retries, ?backoff, "Status not ready, backing off");
                tokio::time::sleep(backoff).await;
            }
            PollVerdict::Fatal(reason) => {
                return Err(VxiError::StatusFatal {
                    op,
                    stb: stb.value,
                    reason,
                });
            }
        }
    }
}

#[async_trait]
impl<D: InstrumentIo> InstrumentIo for StatusPoller<D> {
    async fn read(&mut self, max_len: usize) -> AppResult<ReadResult> {
        let result = self.inner.read(max_len).await?;
        self.poll_after(Operation::Read).await?;
        Ok(result)
    }

    async fn write(&mut self, data: &[u8]) -> AppResult<()> {
        self.inner.write(data).await?;
        self.poll_after(Operation::Write).await
    }

    async fn trigger(&mut self) -> AppResult<()> {
        self.inner.trigger().await?;
        self.poll_after(Operation::Trigger).await
    }

    async fn clear(&mut self) -> AppResult<()> {
        self.inner.clear().await?;
        self.poll_after(Operation::Clear).await
    }

    async fn local(&mut self) -> AppResult<()> {
        self.inner.local().await?;
        self.poll_after(Operation::Local).await
    }

    async fn read_status_byte(&mut self) -> AppResult<StatusByte> {
        self.inner.read_status_byte().await
    }

    async fn abort(&self) -> AppResult<()> {
        self.inner.abort().await
    }

    async fn close(&mut self) {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockInstrument;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn fast() -> PollConfig {
        PollConfig {
            backoff_step_ms: 5,
            max_retries: 3,
            max_drain: 4,
        }
    }

    #[tokio::test]
    async fn test_disabled_poller_never_polls() {
        let dev = MockInstrument::new();
        let mut poller = StatusPoller::disabled(dev.clone());
        poller.trigger().await.unwrap();
        poller.clear().await.unwrap();
        assert!(!poller.is_enabled());
        assert_eq!(dev.status_polls(), 0);
    }

    #[tokio::test]
    async fn test_ok_polls_once_per_operation() {
        let dev = MockInstrument::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let mut poller = StatusPoller::new(
            dev.clone(),
            move |op: Operation, _stb: u8| {
                assert_ne!(op, Operation::ReadStatusByte);
                counter.fetch_add(1, Ordering::SeqCst);
                PollVerdict::Ok
            },
            fast(),
        );
        poller.trigger().await.unwrap();
        poller.write(b"*RST\n").await.unwrap();
        poller.read_status_byte().await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(dev.status_polls(), 3);
    }

    #[tokio::test]
    async fn test_more_pending_drains_queue() {
        let dev = MockInstrument::new();
        dev.push_status(&[0x41, 0x42, 0x01]);
        let mut poller = StatusPoller::new(dev.clone(), |_: Operation, _: u8| PollVerdict::Ok, fast());
        poller.trigger().await.unwrap();
        assert_eq!(dev.status_polls(), 3);
    }

    #[tokio::test]
    async fn test_drain_is_bounded() {
        let dev = MockInstrument::new().with_idle_status(0x40);
        let mut poller = StatusPoller::new(dev.clone(), |_: Operation, _: u8| PollVerdict::Ok, fast());
        poller.trigger().await.unwrap();
        assert_eq!(dev.status_polls(), 4);
    }

    #[tokio::test]
    async fn test_retry_backs_off_linearly_then_succeeds() {
        let dev = MockInstrument::new();
        dev.push_status(&[0x01, 0x01, 0x00]);
        let config = PollConfig {
            backoff_step_ms: 20,
            ..fast()
        };
        let mut poller = StatusPoller::new(
            dev.clone(),
            |_: Operation, stb: u8| {
                if stb & 0x01 != 0 {
                    PollVerdict::Retry
                } else {
                    PollVerdict::Ok
                }
            },
            config,
        );
        let start = Instant::now();
        poller.trigger().await.unwrap();
        // 20ms + 40ms
        assert!(start.elapsed() >= Duration::from_millis(60));
        assert_eq!(dev.status_polls(), 3);
        assert!(!dev.is_closed());
    }

    #[tokio::test]
    async fn test_retries_exhausted_closes_device() {
        let dev = MockInstrument::new().with_idle_status(0x01);
        let mut poller = StatusPoller::new(dev.clone(), |_: Operation, _: u8| PollVerdict::Retry, fast());
        let err = poller.trigger().await.unwrap_err();
        assert!(matches!(
            err,
            VxiError::StatusRetriesExhausted {
                op: Operation::Trigger,
                retries: 3
            }
        ));
        assert_eq!(dev.status_polls(), 4);
        assert!(dev.is_closed());
    }

    #[tokio::test]
    async fn test_fatal_closes_device() {
        let dev = MockInstrument::new().with_idle_status(0x20);
        let mut poller = StatusPoller::new(
            dev.clone(),
            |_: Operation, stb: u8| {
                if stb & 0x20 != 0 {
                    PollVerdict::Fatal("execution error".to_string())
                } else {
                    PollVerdict::Ok
                }
            },
            fast(),
        );
        let err = poller.write(b"BOGUS\n").await.unwrap_err();
        match err {
            VxiError::StatusFatal { op, stb, reason } => {
                assert_eq!(op, Operation::Write);
                assert_eq!(stb, 0x20);
                assert_eq!(reason, "execution error");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(dev.is_closed());
        assert!(matches!(poller.trigger().await, Err(VxiError::NotOpen)));
    }

    #[tokio::test]
    async fn test_failed_operation_skips_poll() {
        let dev = MockInstrument::new();
        let mut poller = StatusPoller::new(dev.clone(), |_: Operation, _: u8| PollVerdict::Ok, fast());
        assert!(poller.read(8).await.unwrap_err().is_timeout());
        assert_eq!(dev.status_polls(), 0);
    }
}
