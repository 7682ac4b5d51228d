//! Configuration for the remote bootstrap client.
//!
//! This module handles the runtime knobs of the subsystem: session RPC
//! deadlines and the transfer chunk sizing derived from the RPC message cap.

use log::warn;
use serde_derive::Deserialize;
use std::time::Duration;

const DEFAULT_BEGIN_SESSION_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_RPC_MAX_MESSAGE_SIZE: u64 = 50 * 1024 * 1024;

// Room reserved for response headers inside a single RPC message.
const TRANSFER_HEADER_MARGIN: u64 = 1024;

/// Runtime configuration for the remote bootstrap client.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Per-call deadline for BeginRemoteBootstrapSession and
    /// EndRemoteBootstrapSession, in milliseconds.
    pub begin_session_timeout_ms: u64,
    /// Upper bound on the size of a single RPC message.
    pub rpc_max_message_size: u64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl BootstrapConfig {
    /// Creates a new BootstrapConfig with default values.
    pub fn new() -> Self {
        BootstrapConfig {
            begin_session_timeout_ms: DEFAULT_BEGIN_SESSION_TIMEOUT_MS,
            rpc_max_message_size: DEFAULT_RPC_MAX_MESSAGE_SIZE,
        }
    }

    /// Loads configuration from a TOML file.
    ///
    /// Returns Some(BootstrapConfig) if successful, falling back to the
    /// defaults when the file is missing or malformed.
    pub fn from_toml(path: &str) -> Option<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the bootstrap config file, {:?}",
                    e
                );
                return Some(BootstrapConfig::new());
            }
        };
        let config: BootstrapConfig = match toml::from_str(&contents) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the bootstrap config file, {:?}",
                    e
                );
                return Some(BootstrapConfig::new());
            }
        };
        Some(config)
    }

    pub fn begin_session_timeout(&self) -> Duration {
        Duration::from_millis(self.begin_session_timeout_ms)
    }

    /// Largest chunk to request per FetchData call.
    pub fn max_transfer_length(&self) -> u64 {
        self.rpc_max_message_size
            .saturating_sub(TRANSFER_HEADER_MARGIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = BootstrapConfig::new();
        assert_eq!(config.begin_session_timeout(), Duration::from_secs(10));
        assert_eq!(
            config.max_transfer_length(),
            50 * 1024 * 1024 - TRANSFER_HEADER_MARGIN
        );
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = BootstrapConfig::from_toml("/nonexistent/bootstrap.toml").unwrap();
        assert_eq!(
            config.begin_session_timeout_ms,
            DEFAULT_BEGIN_SESSION_TIMEOUT_MS
        );
    }

    #[test]
    fn partial_toml_keeps_defaults_for_the_rest() {
        let config: BootstrapConfig = toml::from_str("begin_session_timeout_ms = 2500").unwrap();
        assert_eq!(config.begin_session_timeout_ms, 2500);
        assert_eq!(config.rpc_max_message_size, DEFAULT_RPC_MAX_MESSAGE_SIZE);
    }
}
