//! # Connection configuration
//!
//! Tunables of the request/response correlator and of the optional pcap
//! capture. The defaults match what the Crazyflie radio link needs: replies
//! are expected within 200ms and requests are resent up to 10 times.
//!
//! The configuration can be deserialized, missing fields take their default
//! value:
//! ```
//! # use crazyflie_crtp::Config;
//! let config: Config = serde_json::from_str(r#"{"request_retries": 3}"#).unwrap();
//! assert_eq!(config.request_retries, 3);
//! assert_eq!(config.request_timeout_ms, 200);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable holding the path of the pcap capture file
pub const PCAP_LOG_ENV: &str = "CRTP_PCAP_LOG";

/// Connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Time to wait for a reply before a request is resent, in milliseconds
    pub request_timeout_ms: u64,
    /// Number of times a request is resent before giving up
    pub request_retries: u32,
    /// Path of a pcap file to which all link traffic is mirrored
    pub pcap_log: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_timeout_ms: 200,
            request_retries: 10,
            pcap_log: None,
        }
    }
}

impl Config {
    /// Default configuration, with the capture path taken from `CRTP_PCAP_LOG` if set
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(path) = std::env::var_os(PCAP_LOG_ENV) {
            if !path.is_empty() {
                config.pcap_log = Some(PathBuf::from(path));
            }
        }
        config
    }

    /// Reply timeout as a [Duration]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_radio_timing() {
        let config = Config::default();
        assert_eq!(config.request_timeout(), Duration::from_millis(200));
        assert_eq!(config.request_retries, 10);
        assert!(config.pcap_log.is_none());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"pcap_log": "/tmp/capture.pcap"}"#).unwrap();
        assert_eq!(config.pcap_log, Some(PathBuf::from("/tmp/capture.pcap")));
        assert_eq!(config.request_retries, 10);
    }
}
