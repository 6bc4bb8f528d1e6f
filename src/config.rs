//! Link configuration using Figment
//!
//! Every per-link default lives in an explicit [`LinkConfig`] value that is
//! handed to each [`crate::DeviceLink`]; nothing is kept in process-wide
//! globals. Configuration is layered:
//! 1. Built-in defaults
//! 2. An optional TOML file
//! 3. Environment variables (prefixed with `VXI11_`, nested keys split by `__`)
//!
//! ```text
//! VXI11_IO_TIMEOUT_MS=3000
//! VXI11_LOCK__EXCLUSIVE=true
//! VXI11_TERM__TERMCHAR=10
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Exclusive-lock policy applied to calls that request locking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockPolicy {
    /// Request the exclusive lock.
    #[serde(default)]
    pub exclusive: bool,
    /// How long the gateway may wait for a competing lock to clear.
    #[serde(default)]
    pub wait_timeout_ms: u32,
}

impl LockPolicy {
    /// Lock wait as a `Duration`.
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.wait_timeout_ms))
    }
}

/// End-of-string handling for reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermConfig {
    /// Termination character, if any.
    #[serde(default)]
    pub termchar: Option<u8>,
    /// End reads when `termchar` arrives.
    #[serde(default)]
    pub terminate_on_char: bool,
    /// Mark the last chunk of every write with END.
    #[serde(default = "default_send_eoi")]
    pub send_eoi_on_write: bool,
}

impl Default for TermConfig {
    fn default() -> Self {
        Self {
            termchar: None,
            terminate_on_char: false,
            send_eoi_on_write: default_send_eoi(),
        }
    }
}

impl TermConfig {
    /// The character reads should stop on, when enabled.
    pub fn active_termchar(&self) -> Option<u8> {
        if self.terminate_on_char {
            self.termchar
        } else {
            None
        }
    }
}

/// Per-link settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Name used in log output for this client.
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// `clientId` sent with create-link.
    #[serde(default)]
    pub client_id: i32,
    /// Longest a single core-channel call may take.
    #[serde(default = "default_io_timeout")]
    pub io_timeout_ms: u32,
    /// Lock policy.
    #[serde(default)]
    pub lock: LockPolicy,
    /// Termination handling.
    #[serde(default)]
    pub term: TermConfig,
    /// Echo every transfer at info level.
    #[serde(default)]
    pub verbose: bool,
    /// Portmapper port on the gateway.
    #[serde(default = "default_portmapper_port")]
    pub portmapper_port: u16,
    /// Dial the core program here instead of asking the portmapper.
    #[serde(default)]
    pub core_port: Option<u16>,
    /// Slack on top of the server-side timeouts before giving up locally.
    #[serde(default = "default_rpc_grace")]
    pub rpc_grace_ms: u64,
    /// Bound on one abort round trip.
    #[serde(default = "default_abort_timeout")]
    pub abort_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            client_name: default_client_name(),
            client_id: 0,
            io_timeout_ms: default_io_timeout(),
            lock: LockPolicy::default(),
            term: TermConfig::default(),
            verbose: false,
            portmapper_port: default_portmapper_port(),
            core_port: None,
            rpc_grace_ms: default_rpc_grace(),
            abort_timeout_ms: default_abort_timeout(),
        }
    }
}

/// Status-poll retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Backoff per consecutive retry; the n-th retry sleeps `n * step`.
    #[serde(default = "default_backoff_step")]
    pub backoff_step_ms: u64,
    /// Consecutive retries allowed before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Most status bytes drained after one operation.
    #[serde(default = "default_max_drain")]
    pub max_drain: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            backoff_step_ms: default_backoff_step(),
            max_retries: default_max_retries(),
            max_drain: default_max_drain(),
        }
    }
}

impl PollConfig {
    /// Sleep before the given (1-based) consecutive retry.
    pub fn backoff(&self, retry: u32) -> Duration {
        Duration::from_millis(self.backoff_step_ms.saturating_mul(u64::from(retry)))
    }
}

fn default_client_name() -> String {
    "rust_vxi11".to_string()
}

fn default_io_timeout() -> u32 {
    10_000
}

fn default_send_eoi() -> bool {
    true
}

fn default_portmapper_port() -> u16 {
    111
}

fn default_rpc_grace() -> u64 {
    250
}

/// Upper bound on `rpc_grace_ms`; the local deadline stays close to the I/O timeout.
pub const MAX_RPC_GRACE_MS: u64 = 500;

fn default_abort_timeout() -> u64 {
    2000
}

fn default_backoff_step() -> u64 {
    50
}

fn default_max_retries() -> u32 {
    20
}

fn default_max_drain() -> u32 {
    16
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl LinkConfig {
    /// Load defaults, then `path` if it exists, then `VXI11_*` environment
    /// variables, and validate the result.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file is malformed or validation fails.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_figment(
            Figment::from(Serialized::defaults(LinkConfig::default()))
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed("VXI11_").split("__")),
        )
    }

    /// Defaults overridden by environment variables only.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if an override is malformed or validation fails.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_figment(
            Figment::from(Serialized::defaults(LinkConfig::default()))
                .merge(Env::prefixed("VXI11_").split("__")),
        )
    }

    fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.io_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "io_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.rpc_grace_ms == 0 || self.rpc_grace_ms > MAX_RPC_GRACE_MS {
            return Err(ConfigError::ValidationError(format!(
                "rpc_grace_ms must be between 1 and {}",
                MAX_RPC_GRACE_MS
            )));
        }
        if self.term.terminate_on_char && self.term.termchar.is_none() {
            return Err(ConfigError::ValidationError(
                "term.terminate_on_char requires term.termchar".to_string(),
            ));
        }
        if self.core_port == Some(0) {
            return Err(ConfigError::ValidationError(
                "core_port must not be 0".to_string(),
            ));
        }
        Ok(())
    }

    /// I/O timeout as a `Duration`.
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.io_timeout_ms))
    }

    /// Grace period as a `Duration`, capped at [`MAX_RPC_GRACE_MS`].
    pub fn rpc_grace(&self) -> Duration {
        Duration::from_millis(self.rpc_grace_ms.min(MAX_RPC_GRACE_MS))
    }

    /// Abort bound as a `Duration`.
    pub fn abort_timeout(&self) -> Duration {
        Duration::from_millis(self.abort_timeout_ms)
    }
}
