use serde::Deserialize;

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_path() -> String {
    "/".to_string()
}

fn default_max_payload_size() -> usize {
    1024 * 1024
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

/// WebSocket server configuration.
///
/// Deserializable so it can be read from an application config file; every
/// field has a sensible default. `port` 0 binds an ephemeral port (useful
/// in tests); `heartbeat_interval_ms` 0 disables the heartbeat.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct WsServerConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub max_payload_size: usize,
    pub heartbeat_interval_ms: u64,
}

impl Default for WsServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            path: default_path(),
            max_payload_size: default_max_payload_size(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}
