use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// File config (figment-deserialized from defaults / relay-exchange.toml / env)
// =============================================================================
//
//   relay-exchange.toml:  [transport]
//                         long_poll_timeout_secs = 20
//
//   env var:              RELAY_TRANSPORT__LONG_POLL_TIMEOUT_SECS=20
//                         (double underscore = nesting)

pub const DEFAULT_CONFIG_FILE: &str = "relay-exchange.toml";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub transport: TransportFileConfig,
    #[serde(default)]
    pub script: ScriptFileConfig,
}

/// Listener settings (lives under `[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path prefix the exchange routes are mounted under.
    #[serde(default = "default_base_path")]
    pub base_path: String,
    /// Externally visible origin, prepended to routes in the client script
    /// when the exchange sits behind a proxy.
    #[serde(default)]
    pub public_url: Option<String>,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_path: default_base_path(),
            public_url: None,
        }
    }
}

/// Transport tunables (lives under `[transport]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportFileConfig {
    #[serde(default = "default_keepalive_timeout_secs")]
    pub keepalive_timeout_secs: u64,
    #[serde(default = "default_long_poll_timeout_secs")]
    pub long_poll_timeout_secs: u64,
    /// Long-poll sessions with no poll for this long are dropped.
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    /// Per-connection cap on undelivered outbound messages.
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
}

impl Default for TransportFileConfig {
    fn default() -> Self {
        Self {
            keepalive_timeout_secs: default_keepalive_timeout_secs(),
            long_poll_timeout_secs: default_long_poll_timeout_secs(),
            session_timeout_secs: default_session_timeout_secs(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
        }
    }
}

/// Client script generation (lives under `[script]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScriptFileConfig {
    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,
}

impl Default for ScriptFileConfig {
    fn default() -> Self {
        Self {
            cache_enabled: default_cache_enabled(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_base_path() -> String {
    "/relayr".to_string()
}

fn default_keepalive_timeout_secs() -> u64 {
    40
}

fn default_long_poll_timeout_secs() -> u64 {
    30
}

fn default_session_timeout_secs() -> u64 {
    90
}

fn default_outbound_queue_capacity() -> usize {
    10 * 1024
}

fn default_cache_enabled() -> bool {
    true
}

/// Build a figment that layers: defaults → config file → RELAY_* env vars.
pub fn load_config(config_file: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_file))
        .merge(Env::prefixed("RELAY_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig, handed to the exchange)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ExchangeConfig {
    /// A socket with no pong for this long is closed. Probes go out at half
    /// this interval.
    pub keepalive_timeout: Duration,
    /// How long a long-poll request is held open before returning `[]`.
    pub long_poll_timeout: Duration,
    pub session_timeout: Duration,
    pub outbound_queue_capacity: usize,
    pub script_cache_enabled: bool,
    pub public_url: Option<String>,
}

impl ExchangeConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            keepalive_timeout: Duration::from_secs(fc.transport.keepalive_timeout_secs.max(1)),
            long_poll_timeout: Duration::from_secs(fc.transport.long_poll_timeout_secs.max(1)),
            session_timeout: Duration::from_secs(fc.transport.session_timeout_secs.max(1)),
            outbound_queue_capacity: fc.transport.outbound_queue_capacity.max(1),
            script_cache_enabled: fc.script.cache_enabled,
            public_url: fc
                .server
                .public_url
                .as_ref()
                .map(|url| url.trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty()),
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        (self.keepalive_timeout / 2).max(Duration::from_millis(10))
    }

    /// How often idle long-poll sessions are swept.
    pub fn sweep_interval(&self) -> Duration {
        (self.session_timeout / 2).max(Duration::from_millis(10))
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}
