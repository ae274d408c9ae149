//! Configuration: the runtime session record and the process settings.
//!
//! [`SessionConfig`] is written by the setup endpoint and read by every loop
//! iteration of the streaming worker. It lives in a [`SessionConfigStore`] backed
//! by a `watch` channel, so a reader always sees a whole record (never a new key
//! with a stale device address) and the worker can await changes instead of
//! polling for them.
//!
//! [`BridgeConfig`] holds the tunables, loaded once from the environment.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::classifier::DEFAULT_CONFIDENCE_THRESHOLD;

/// Credentials and target device for the current session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub api_key: Option<String>,
    pub device_address: Option<String>,
    pub actuator_id: Option<String>,
}

impl SessionConfig {
    /// The inference credential, if one is set and non-blank.
    pub fn credential(&self) -> Option<&str> {
        non_blank(self.api_key.as_deref())
    }

    pub fn actuator(&self) -> Option<&str> {
        non_blank(self.actuator_id.as_deref())
    }

    pub fn has_credential(&self) -> bool {
        self.credential().is_some()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

/// Process-wide holder of the [`SessionConfig`]. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct SessionConfigStore {
    tx: Arc<watch::Sender<SessionConfig>>,
}

impl Default for SessionConfigStore {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl SessionConfigStore {
    pub fn new(initial: SessionConfig) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Replace the whole record in one step.
    pub fn set(&self, config: SessionConfig) {
        self.tx.send_replace(config);
    }

    /// Snapshot of the latest complete record.
    pub fn get(&self) -> SessionConfig {
        self.tx.borrow().clone()
    }

    /// Drop the credential; an active inference session is torn down on its next check.
    pub fn clear_credential(&self) {
        self.tx.send_modify(|config| config.api_key = None);
    }

    /// Receiver that is notified on every `set`.
    pub fn subscribe(&self) -> watch::Receiver<SessionConfig> {
        self.tx.subscribe()
    }
}

/// Tunables for the bridge, loaded from the environment.
///
/// | Env | Default | Description |
/// |-----|---------|-------------|
/// | AURA_INFERENCE_URL | wss://api.hume.ai/v0/stream/models | Streaming inference endpoint |
/// | AURA_INFERENCE_TIMEOUT_MS | 10000 | Max wait for one inference response |
/// | AURA_RECONNECT_BACKOFF_MS | 2000 | Fixed delay after any connection failure |
/// | AURA_IDLE_TICK_MS | 1000 | How often Idle re-checks for a credential |
/// | AURA_CONFIDENCE_THRESHOLD | 0.45 | Scores must be strictly above this |
/// | AURA_QUEUE_DEPTH | 256 | Ingress queue depth before oldest-frame eviction |
/// | AURA_TRANSITION_TIME | 5 | Light transition hint (deciseconds) |
/// | AURA_DISPATCH_CAPACITY | 32 | Pending light commands before new ones are dropped |
/// | AURA_DISPATCH_WORKERS | 2 | Concurrent blocking device calls |
/// | AURA_DEVICE_TIMEOUT_MS | 5000 | HTTP timeout for bridge calls |
/// | AURA_BRIDGE_USERNAME | unset | Pre-registered bridge user (skips link-button pairing) |
/// | AURA_LISTEN_ADDR | 127.0.0.1:5001 | Gateway bind address |
/// | AURA_LOG_DIR | unset | Also write daily log files here |
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub inference_url: String,
    pub inference_timeout: Duration,
    pub reconnect_backoff: Duration,
    pub idle_tick: Duration,
    pub confidence_threshold: f64,
    pub queue_depth: usize,
    pub transition_time: u16,
    pub dispatch_capacity: usize,
    pub dispatch_workers: usize,
    pub device_timeout: Duration,
    pub bridge_username: Option<String>,
    pub listen_addr: String,
    pub log_dir: Option<String>,
}

pub const DEFAULT_INFERENCE_URL: &str = "wss://api.hume.ai/v0/stream/models";
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:5001";

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            inference_url: DEFAULT_INFERENCE_URL.to_string(),
            inference_timeout: Duration::from_secs(10),
            reconnect_backoff: Duration::from_secs(2),
            idle_tick: Duration::from_secs(1),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            queue_depth: 256,
            transition_time: 5,
            dispatch_capacity: 32,
            dispatch_workers: 2,
            device_timeout: Duration::from_secs(5),
            bridge_username: None,
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            log_dir: None,
        }
    }
}

impl BridgeConfig {
    /// Load from environment. Unset or invalid values fall back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as `from_env` with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let opt = |name: &str| {
            lookup(name)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        let millis = |name: &str, default: Duration| {
            opt(name)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        };
        let count = |name: &str, default: usize| {
            opt(name)
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(default)
        };

        Self {
            inference_url: opt("AURA_INFERENCE_URL").unwrap_or(d.inference_url),
            inference_timeout: millis("AURA_INFERENCE_TIMEOUT_MS", d.inference_timeout),
            reconnect_backoff: millis("AURA_RECONNECT_BACKOFF_MS", d.reconnect_backoff),
            idle_tick: millis("AURA_IDLE_TICK_MS", d.idle_tick),
            confidence_threshold: opt("AURA_CONFIDENCE_THRESHOLD")
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|t| (0.0..=1.0).contains(t))
                .unwrap_or(d.confidence_threshold),
            queue_depth: count("AURA_QUEUE_DEPTH", d.queue_depth),
            transition_time: opt("AURA_TRANSITION_TIME")
                .and_then(|v| v.parse::<u16>().ok())
                .unwrap_or(d.transition_time),
            dispatch_capacity: count("AURA_DISPATCH_CAPACITY", d.dispatch_capacity),
            dispatch_workers: count("AURA_DISPATCH_WORKERS", d.dispatch_workers),
            device_timeout: millis("AURA_DEVICE_TIMEOUT_MS", d.device_timeout),
            bridge_username: opt("AURA_BRIDGE_USERNAME"),
            listen_addr: opt("AURA_LISTEN_ADDR").unwrap_or(d.listen_addr),
            log_dir: opt("AURA_LOG_DIR"),
        }
    }
}
