//! Instrument name parsing.
//!
//! A networked instrument is named `"<host>:<logical-name>"`, where the
//! logical name (e.g. `gpib0,5` or `inst0`) identifies a bus and device index
//! behind the gateway. Parsing splits on the first `:` only, so logical names
//! may themselves contain colons.

use std::fmt;
use std::str::FromStr;

use crate::error::VxiError;

/// Parsed `host:logical-name` pair. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstrumentAddress {
    host: String,
    device: String,
}

impl InstrumentAddress {
    /// Parse an instrument name.
    ///
    /// # Errors
    /// `InvalidAddress` when there is no `:` or either side is empty.
    pub fn parse(name: &str) -> Result<Self, VxiError> {
        let (host, device) = name
            .split_once(':')
            .ok_or_else(|| VxiError::InvalidAddress(name.to_string()))?;
        let (host, device) = (host.trim(), device.trim());
        if host.is_empty() || device.is_empty() {
            return Err(VxiError::InvalidAddress(name.to_string()));
        }
        Ok(Self {
            host: host.to_string(),
            device: device.to_string(),
        })
    }

    /// Gateway host name or IP.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Logical device name at the gateway.
    pub fn device(&self) -> &str {
        &self.device
    }
}

impl FromStr for InstrumentAddress {
    type Err = VxiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for InstrumentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.device)
    }
}
