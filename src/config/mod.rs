//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (`IMENGINE_*`)
//! - CLI arguments (for the `imengine` binary)

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Account credentials
    #[serde(default)]
    pub account: AccountConfig,

    /// Control-channel server
    #[serde(default)]
    pub server: ServerConfig,

    /// Ticket (nexus) service
    #[serde(default)]
    pub nexus: NexusConfig,

    /// Peer streams
    #[serde(default)]
    pub peer: PeerConfig,

    /// Deadlines
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {e}")))
    }

    /// Default config file location (`<config dir>/imengine/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("imengine").join("config.toml"))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(account) = std::env::var("IMENGINE_ACCOUNT") {
            config.account.account = account;
        }
        if let Ok(password) = std::env::var("IMENGINE_PASSWORD") {
            config.account.password = password;
        }
        if let Ok(host) = std::env::var("IMENGINE_SERVER_HOST") {
            config.server.host = host;
        }
        if let Ok(port) = std::env::var("IMENGINE_SERVER_PORT") {
            if let Ok(port) = port.parse() {
                config.server.port = port;
            }
        }
        if let Ok(url) = std::env::var("IMENGINE_NEXUS_URL") {
            config.nexus.url = url;
        }
        if let Ok(identity) = std::env::var("IMENGINE_PEER_IDENTITY") {
            config.peer.local_identity = identity;
        }
        if let Ok(port) = std::env::var("IMENGINE_PEER_PORT") {
            if let Ok(port) = port.parse() {
                config.peer.listen_port = port;
            }
        }

        config
    }

    /// Merge with another config (other takes precedence where it differs from defaults)
    pub fn merge(self, other: Self) -> Self {
        let account = AccountConfig::default();
        let server = ServerConfig::default();
        let nexus = NexusConfig::default();
        let peer = PeerConfig::default();
        let timeouts = TimeoutConfig::default();
        Self {
            account: AccountConfig {
                account: prefer(self.account.account, other.account.account, &account.account),
                password: prefer(self.account.password, other.account.password, &account.password),
                initial_status: prefer(
                    self.account.initial_status,
                    other.account.initial_status,
                    &account.initial_status,
                ),
            },
            server: ServerConfig {
                host: prefer(self.server.host, other.server.host, &server.host),
                port: prefer(self.server.port, other.server.port, &server.port),
                protocol_versions: prefer(
                    self.server.protocol_versions,
                    other.server.protocol_versions,
                    &server.protocol_versions,
                ),
                client_version: prefer(
                    self.server.client_version,
                    other.server.client_version,
                    &server.client_version,
                ),
            },
            nexus: NexusConfig {
                url: prefer(self.nexus.url, other.nexus.url, &nexus.url),
                timeout_secs: prefer(
                    self.nexus.timeout_secs,
                    other.nexus.timeout_secs,
                    &nexus.timeout_secs,
                ),
            },
            peer: PeerConfig {
                local_identity: prefer(
                    self.peer.local_identity,
                    other.peer.local_identity,
                    &peer.local_identity,
                ),
                listen_port: prefer(self.peer.listen_port, other.peer.listen_port, &peer.listen_port),
                connect_timeout_secs: prefer(
                    self.peer.connect_timeout_secs,
                    other.peer.connect_timeout_secs,
                    &peer.connect_timeout_secs,
                ),
                handshake_timeout_secs: prefer(
                    self.peer.handshake_timeout_secs,
                    other.peer.handshake_timeout_secs,
                    &peer.handshake_timeout_secs,
                ),
                max_buffered_bytes: prefer(
                    self.peer.max_buffered_bytes,
                    other.peer.max_buffered_bytes,
                    &peer.max_buffered_bytes,
                ),
            },
            timeouts: TimeoutConfig {
                transaction_secs: prefer(
                    self.timeouts.transaction_secs,
                    other.timeouts.transaction_secs,
                    &timeouts.transaction_secs,
                ),
                login_step_secs: prefer(
                    self.timeouts.login_step_secs,
                    other.timeouts.login_step_secs,
                    &timeouts.login_step_secs,
                ),
                tick_millis: prefer(
                    self.timeouts.tick_millis,
                    other.timeouts.tick_millis,
                    &timeouts.tick_millis,
                ),
            },
        }
    }

    /// Check the values the engine cannot run without
    pub fn validate(&self) -> Result<()> {
        if self.account.account.is_empty() {
            return Err(EngineError::Config("account.account is empty".to_string()));
        }
        if self.server.host.is_empty() {
            return Err(EngineError::Config("server.host is empty".to_string()));
        }
        if self.server.protocol_versions.is_empty() {
            return Err(EngineError::Config(
                "server.protocol_versions is empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// `other` unless it is still the default.
fn prefer<T: PartialEq>(base: T, other: T, default: &T) -> T {
    if other != *default {
        other
    } else {
        base
    }
}

/// Account credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    /// Account identifier (e.g. `alice@example.com`)
    pub account: String,

    /// Credential handed to the ticket service
    pub password: String,

    /// Presence announced once contact sync completes
    pub initial_status: String,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            account: String::new(),
            password: String::new(),
            initial_status: "NLN".to_string(),
        }
    }
}

/// Control-channel server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Dispatch server host
    pub host: String,

    /// Dispatch server port
    pub port: u16,

    /// Protocol versions offered in the version negotiation, best first
    pub protocol_versions: Vec<String>,

    /// Client identification sent after version negotiation
    pub client_version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "messenger.hotmail.com".to_string(),
            port: 1863,
            protocol_versions: vec!["MSNP8".to_string()],
            client_version: "0x0409 winnt 5.1 i386 MSNMSGR 6.0.0602 MSMSGS".to_string(),
        }
    }
}

impl ServerConfig {
    /// Get the full server address
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Ticket service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NexusConfig {
    /// Login endpoint
    pub url: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for NexusConfig {
    fn default() -> Self {
        Self {
            url: "https://login.passport.com/login2.srf".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Peer stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Identity announced in our stream-open banner
    pub local_identity: String,

    /// Port for unsolicited inbound peer connections (0 disables the listener)
    pub listen_port: u16,

    /// Per-candidate connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// Time allowed for the banner exchange in seconds
    pub handshake_timeout_secs: u64,

    /// Upper bound on bytes queued in one connection's output buffer
    pub max_buffered_bytes: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            local_identity: String::new(),
            listen_port: 5298,
            connect_timeout_secs: 10,
            handshake_timeout_secs: 30,
            max_buffered_bytes: 1024 * 1024, // 1 MB
        }
    }
}

impl PeerConfig {
    /// Connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Handshake timeout as a duration
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Deadlines applied by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Transaction reply deadline in seconds (0 disables)
    pub transaction_secs: u64,

    /// Per login step deadline in seconds (0 disables)
    pub login_step_secs: u64,

    /// How often the driver checks deadlines, in milliseconds
    pub tick_millis: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            transaction_secs: 60,
            login_step_secs: 60,
            tick_millis: 500,
        }
    }
}

impl TimeoutConfig {
    /// Transaction deadline, if enabled
    pub fn transaction(&self) -> Option<Duration> {
        (self.transaction_secs > 0).then(|| Duration::from_secs(self.transaction_secs))
    }

    /// Login step deadline, if enabled
    pub fn login_step(&self) -> Option<Duration> {
        (self.login_step_secs > 0).then(|| Duration::from_secs(self.login_step_secs))
    }

    /// Driver tick interval
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis.max(10))
    }
}
