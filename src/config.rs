//! # Configuration Management
//!
//! Configuration for the measurement collector, stored in Cloudflare KV
//! under the `config` key and loaded at runtime with defaults for every
//! setting. The HTTP listener itself is platform-managed; only the API
//! prefix and the protocol limits are configurable here.

use crate::constants::{
    COLLECTOR_DB_BINDING, DEFAULT_API_ENDPOINT, DEFAULT_PAYLOAD_LIMIT,
    DEFAULT_UPLOAD_EXPIRATION_MS,
};
use serde::{Deserialize, Serialize};
use worker::kv::KvStore;
use worker::{console_log, Result};

/// Configuration for the measurement collector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// API prefix all measurement routes nest under, e.g. `/api/v3`.
    pub api_endpoint: String,

    /// Name of the D1 database binding holding metadata and sessions.
    /// Must match the binding name in the worker configuration.
    pub database_name: String,

    /// Maximum measurement payload in bytes. Applied to the declared total
    /// size on the pre-request and to every single chunk body.
    pub measurement_payload_limit: u64,

    /// Age in milliseconds after which an abandoned partial upload is
    /// reclaimed by the scheduled cleanup.
    pub upload_expiration_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_endpoint: DEFAULT_API_ENDPOINT.to_string(),
            database_name: COLLECTOR_DB_BINDING.to_string(),
            measurement_payload_limit: DEFAULT_PAYLOAD_LIMIT,
            upload_expiration_ms: DEFAULT_UPLOAD_EXPIRATION_MS,
        }
    }
}

impl Config {
    /// Loads configuration from KV storage with fallback to defaults.
    ///
    /// Expected JSON format under the `config` key:
    ///
    /// ```json
    /// {
    ///   "api_endpoint": "/api/v3",
    ///   "database_name": "COLLECTOR_DB",
    ///   "measurement_payload_limit": 104857600,
    ///   "upload_expiration_ms": 604800000
    /// }
    /// ```
    ///
    /// A missing key falls back to [`Config::default`]; a KV access error
    /// is propagated.
    pub async fn load(kv: &KvStore) -> Result<Self> {
        match kv.get("config").json().await? {
            Some(config) => {
                console_log!("Configuration loaded from KV storage");
                Ok(config)
            }
            None => {
                console_log!("Config not found in KV, using default");
                Ok(Self::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.api_endpoint, "/api/v3");
        assert_eq!(config.measurement_payload_limit, 104_857_600);
        assert_eq!(config.upload_expiration_ms, 604_800_000);
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = Config {
            api_endpoint: "/api/v4".into(),
            database_name: "COLLECTOR_DB".into(),
            measurement_payload_limit: 1024,
            upload_expiration_ms: 60_000,
        };

        let text = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
