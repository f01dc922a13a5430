//! Herald Configuration
//!
//! This module provides configuration structures for a Herald node:
//! the advertised port, the coordination store and the election timings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::election::ElectionTimings;

/// Main Herald configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeraldConfig {
    /// Node-specific configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// Coordination store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Election timing configuration
    #[serde(default)]
    pub election: ElectionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Port the status endpoint listens on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host the status endpoint binds to
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Value published in the leader record (defaults to the port)
    #[serde(default)]
    pub advertise: Option<String>,
}

/// Coordination store flavour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// etcd v3 leases, election service and watches
    #[default]
    Session,
    /// etcd v2 keys with TTL, compare-and-swap and polling
    Poll,
}

/// Coordination store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Which store API to use
    #[serde(default)]
    pub backend: Backend,

    /// Store endpoints (host:port or URL), tried in order
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// Election key (defaults depend on the backend)
    #[serde(default)]
    pub key: Option<String>,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Election timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Session TTL in seconds (5 for session backend, 15 for poll backend)
    #[serde(default)]
    pub session_ttl_secs: Option<u64>,

    /// Delay before retrying a failed session creation
    #[serde(default = "default_session_retry_ms")]
    pub session_retry_ms: u64,

    /// Upper bound on one campaign attempt
    #[serde(default = "default_campaign_timeout_ms")]
    pub campaign_timeout_ms: u64,

    /// How long a follower observes before campaigning again
    #[serde(default = "default_follower_window_ms")]
    pub follower_window_ms: u64,

    /// Pause between election cycles
    #[serde(default = "default_cycle_delay_ms")]
    pub cycle_delay_ms: u64,

    /// Poll backend: interval between leader reads
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Poll backend: interval between leader record refreshes
    #[serde(default = "default_renew_interval_ms")]
    pub renew_interval_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_port() -> u16 {
    8080
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_endpoints() -> Vec<String> {
    vec!["127.0.0.1:2379".to_string()]
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_session_retry_ms() -> u64 {
    5000
}

fn default_campaign_timeout_ms() -> u64 {
    2000
}

fn default_follower_window_ms() -> u64 {
    5000
}

fn default_cycle_delay_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

fn default_renew_interval_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Default election key of the session backend (an election prefix)
pub const DEFAULT_SESSION_KEY: &str = "/leader-election/";

/// Default election key of the poll backend
pub const DEFAULT_POLL_KEY: &str = "leader";

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_host: default_bind_host(),
            advertise: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            endpoints: default_endpoints(),
            key: None,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: None,
            session_retry_ms: default_session_retry_ms(),
            campaign_timeout_ms: default_campaign_timeout_ms(),
            follower_window_ms: default_follower_window_ms(),
            cycle_delay_ms: default_cycle_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            renew_interval_ms: default_renew_interval_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl StoreConfig {
    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl HeraldConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: HeraldConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: HeraldConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.port == 0 {
            return Err(crate::Error::Config("node.port cannot be 0".into()));
        }

        if self.store.endpoints.iter().all(|e| e.trim().is_empty()) {
            return Err(crate::Error::Config("store.endpoints cannot be empty".into()));
        }

        if self.election_key().is_empty() {
            return Err(crate::Error::Config("store.key cannot be empty".into()));
        }

        if self.store.request_timeout_ms == 0 {
            return Err(crate::Error::Config("store.request_timeout_ms cannot be 0".into()));
        }

        if self.session_ttl().is_zero() {
            return Err(crate::Error::Config("election.session_ttl_secs cannot be 0".into()));
        }

        if self.election.campaign_timeout_ms == 0 || self.election.follower_window_ms == 0 {
            return Err(crate::Error::Config(
                "election.campaign_timeout_ms and election.follower_window_ms must be positive".into(),
            ));
        }

        if self.store.backend == Backend::Poll {
            if self.election.poll_interval_ms == 0 {
                return Err(crate::Error::Config("election.poll_interval_ms cannot be 0".into()));
            }
            if self.renew_interval() >= self.session_ttl() {
                return Err(crate::Error::Config(format!(
                    "election.renew_interval_ms ({}) must be less than the session TTL ({}s)",
                    self.election.renew_interval_ms,
                    self.session_ttl().as_secs()
                )));
            }
        }

        Ok(())
    }

    /// Get the election key, falling back to the backend default
    pub fn election_key(&self) -> &str {
        match (&self.store.key, self.store.backend) {
            (Some(key), _) => key,
            (None, Backend::Session) => DEFAULT_SESSION_KEY,
            (None, Backend::Poll) => DEFAULT_POLL_KEY,
        }
    }

    /// Get the value this node publishes when it leads
    pub fn advertised_value(&self) -> String {
        self.node
            .advertise
            .clone()
            .unwrap_or_else(|| self.node.port.to_string())
    }

    /// Get the status endpoint bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.node.bind_host, self.node.port)
    }

    /// Get session TTL as Duration
    pub fn session_ttl(&self) -> Duration {
        let secs = self.election.session_ttl_secs.unwrap_or(match self.store.backend {
            Backend::Session => 5,
            Backend::Poll => 15,
        });
        Duration::from_secs(secs)
    }

    /// Get renew interval as Duration
    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.election.renew_interval_ms)
    }

    /// Collect all election timings
    pub fn timings(&self) -> ElectionTimings {
        ElectionTimings {
            session_ttl: self.session_ttl(),
            session_retry: Duration::from_millis(self.election.session_retry_ms),
            campaign_timeout: Duration::from_millis(self.election.campaign_timeout_ms),
            follower_window: Duration::from_millis(self.election.follower_window_ms),
            cycle_delay: Duration::from_millis(self.election.cycle_delay_ms),
            poll_interval: Duration::from_millis(self.election.poll_interval_ms),
            renew_interval: self.renew_interval(),
        }
    }
}
