// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Worker configuration, loaded from JSON.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Limits and defaults for one worker runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Script timers allowed to wait for expiry at once.
    pub max_pending_timers: usize,
    /// Script timer handlers allowed to run at once.
    pub max_running_timers: usize,
    /// Frames kept per traceback.
    pub backtrace_depth: usize,
    /// Coroutines walked per traceback.
    pub backtrace_max_coroutines: usize,
    pub socket_connect_timeout_ms: u64,
    pub socket_send_timeout_ms: u64,
    pub socket_read_timeout_ms: u64,
    /// Upper bound on bytes buffered while scanning for a line.
    pub socket_buffer_size: usize,
    pub check_client_abort: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_pending_timers: 1024,
            max_running_timers: 256,
            backtrace_depth: 22,
            backtrace_max_coroutines: 5,
            socket_connect_timeout_ms: 60_000,
            socket_send_timeout_ms: 60_000,
            socket_read_timeout_ms: 60_000,
            socket_buffer_size: 4096,
            check_client_abort: false,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_send_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_read_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = RuntimeConfig::from_json(r#"{"max_running_timers": 2}"#).unwrap();
        assert_eq!(cfg.max_running_timers, 2);
        assert_eq!(cfg.max_pending_timers, 1024);
        assert_eq!(cfg.backtrace_depth, 22);
    }

    #[test]
    fn unknown_field_rejected() {
        let err = RuntimeConfig::from_json(r#"{"max_timers": 2}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"check_client_abort": true}}"#).unwrap();
        let cfg = RuntimeConfig::load(file.path()).unwrap();
        assert!(cfg.check_client_abort);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = RuntimeConfig::load("/nonexistent/weft.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/weft.json"));
    }
}
