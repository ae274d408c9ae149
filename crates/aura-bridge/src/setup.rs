//! Configuration interface: connect the light bridge, then publish the session record.
//!
//! `configure` is blocking (the bridge handshake is synchronous). Callers on an
//! async runtime should run it on the blocking pool.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::actuator::ActuatorConnector;
use crate::config::{SessionConfig, SessionConfigStore};
use crate::dispatcher::ActuatorDispatcher;
use crate::error::{BridgeError, BridgeResult};

/// Body of a setup request. Accepts the legacy field names used by the web UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SetupRequest {
    #[serde(alias = "hue_ip")]
    pub device_address: String,
    #[serde(default, alias = "hume_key")]
    pub api_key: Option<String>,
    #[serde(default, alias = "light_name")]
    pub actuator_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetupOutcome {
    pub success: bool,
    pub message: String,
}

impl SetupOutcome {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Clone)]
pub struct SetupService {
    connector: Arc<dyn ActuatorConnector>,
    store: SessionConfigStore,
    dispatcher: ActuatorDispatcher,
}

impl SetupService {
    pub fn new(
        connector: Arc<dyn ActuatorConnector>,
        store: SessionConfigStore,
        dispatcher: ActuatorDispatcher,
    ) -> Self {
        Self {
            connector,
            store,
            dispatcher,
        }
    }

    /// Connect to the bridge at `device_address`. Only on success is the driver
    /// installed and the session record replaced; on failure nothing changes.
    ///
    /// A blank address is a [`BridgeError::Config`] and never reaches the bridge.
    /// A bridge that refuses is an `Ok` outcome with `success: false`.
    pub fn configure(&self, request: SetupRequest) -> BridgeResult<SetupOutcome> {
        let address = request.device_address.trim();
        if address.is_empty() {
            return Err(BridgeError::Config("Device address cannot be empty".into()));
        }

        info!(target: "aura::setup", address, "Connecting to light bridge");
        let driver = match self.connector.connect(address) {
            Ok(driver) => driver,
            Err(e) => {
                warn!(target: "aura::setup", error = %e, "Bridge connect failed");
                return Ok(SetupOutcome::failed(format!(
                    "Bridge connect failed. Did you press the physical link button? Error: {}",
                    e
                )));
            }
        };

        self.dispatcher.install_driver(driver);
        let config = SessionConfig {
            api_key: request.api_key.map(|k| k.trim().to_string()),
            device_address: Some(address.to_string()),
            actuator_id: request.actuator_id.map(|a| a.trim().to_string()),
        };
        let streaming = config.has_credential();
        self.store.set(config);
        info!(target: "aura::setup", streaming, "✅ Session configured");
        Ok(SetupOutcome::ok("Connected!"))
    }
}
