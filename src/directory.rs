//! Instrument alias file.
//!
//! Maps short instrument names to addresses, one `name address` pair per
//! line. `#` starts a comment; blank lines are ignored; a later entry for
//! the same name replaces the earlier one.
//!
//! ```text
//! # bench 3
//! scope   gw-bench3:gpib0,7
//! siggen  gw-bench3:gpib0,19
//! ```

use std::collections::HashMap;
use std::path::Path;

use crate::error::{AppResult, VxiError};

/// Short-name to address lookup table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstrumentDirectory {
    entries: HashMap<String, String>,
}

impl InstrumentDirectory {
    /// Parse alias file text.
    ///
    /// # Errors
    /// `InvalidAddress` naming the line when a non-comment line has a key but
    /// no value.
    pub fn parse(text: &str) -> AppResult<Self> {
        let mut entries = HashMap::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = match raw.split_once('#') {
                Some((before, _)) => before,
                None => raw,
            }
            .trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = match line.split_once(char::is_whitespace) {
                Some((key, value)) if !value.trim().is_empty() => (key, value.trim()),
                _ => {
                    return Err(VxiError::InvalidAddress(format!(
                        "line {}: '{}' has no address",
                        lineno + 1,
                        line
                    )))
                }
            };
            entries.insert(key.to_string(), value.to_string());
        }
        Ok(Self { entries })
    }

    /// Read and parse an alias file.
    ///
    /// # Errors
    /// I/O failures and malformed lines.
    pub async fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::parse(&text)
    }

    /// Address for `name`, or `name` itself when it is not an alias.
    pub fn resolve<'a>(&'a self, name: &'a str) -> &'a str {
        self.entries.get(name).map(String::as_str).unwrap_or(name)
    }

    /// Address for an alias.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    /// Number of aliases.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no aliases are defined.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
