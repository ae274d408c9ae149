//! **Actuator driver**: the physical light and the bridge that controls it.
//!
//! [`ActuatorDriver::set_state`] is synchronous and may block for as long as the
//! device takes; callers in the streaming path go through the dispatcher instead
//! of calling it directly. [`HueBridge`] talks to a Philips Hue bridge over its
//! local REST API using blocking `reqwest`.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

use crate::classifier::ActuatorState;
use crate::error::{BridgeError, BridgeResult};

/// Device type reported when pairing with the bridge.
const DEVICE_TYPE: &str = "aura#bridge";

/// Hue error type for "link button not pressed".
const LINK_BUTTON_NOT_PRESSED: u64 = 101;

/// Sets the visible state of one actuator. Blocking; fails with `Device`.
pub trait ActuatorDriver: Send + Sync {
    fn set_state(
        &self,
        actuator_id: &str,
        state: &ActuatorState,
        transition_time: u16,
    ) -> BridgeResult<()>;
}

/// Builds a driver for a device address. Used once per setup request; fails with `Config`.
pub trait ActuatorConnector: Send + Sync {
    fn connect(&self, device_address: &str) -> BridgeResult<Arc<dyn ActuatorDriver>>;
}

/// Connector for Hue bridges.
#[derive(Debug, Clone)]
pub struct HueConnector {
    /// Pre-registered bridge user; when `None` the bridge is paired (link button required).
    pub username: Option<String>,
    pub timeout: Duration,
}

impl HueConnector {
    pub fn new(username: Option<String>, timeout: Duration) -> Self {
        Self { username, timeout }
    }
}

impl ActuatorConnector for HueConnector {
    fn connect(&self, device_address: &str) -> BridgeResult<Arc<dyn ActuatorDriver>> {
        let bridge = HueBridge::connect(device_address, self.username.as_deref(), self.timeout)?;
        Ok(Arc::new(bridge))
    }
}

/// A paired Hue bridge.
pub struct HueBridge {
    base_url: String,
    username: String,
    client: reqwest::blocking::Client,
    /// Light name → light id, refreshed on a miss.
    light_ids: Mutex<HashMap<String, String>>,
}

impl std::fmt::Debug for HueBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HueBridge")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HueBridge {
    /// Pair (if needed) and verify the bridge answers for our user.
    pub fn connect(address: &str, username: Option<&str>, timeout: Duration) -> BridgeResult<Self> {
        let address = address.trim();
        if address.is_empty() {
            return Err(BridgeError::Config("device address is empty".to_string()));
        }
        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BridgeError::Config(e.to_string()))?;

        let username = match username.map(str::trim).filter(|u| !u.is_empty()) {
            Some(u) => u.to_string(),
            None => Self::register(&client, &base_url)?,
        };

        let bridge = Self {
            base_url,
            username,
            client,
            light_ids: Mutex::new(HashMap::new()),
        };
        let lights = bridge.fetch_lights().map_err(|e| match e {
            BridgeError::Device(msg) => BridgeError::Config(msg),
            other => other,
        })?;
        info!(target: "aura::setup", lights = lights.len(), "✅ Bridge connected");
        bridge.replace_light_ids(lights);
        Ok(bridge)
    }

    fn register(client: &reqwest::blocking::Client, base_url: &str) -> BridgeResult<String> {
        let url = format!("{}/api", base_url);
        let body: Value = client
            .post(&url)
            .json(&serde_json::json!({ "devicetype": DEVICE_TYPE }))
            .send()
            .and_then(|r| r.json())
            .map_err(|e| BridgeError::Config(format!("bridge unreachable: {}", e)))?;
        parse_registration(&body)
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/{}/{}", self.base_url, self.username, path)
    }

    fn fetch_lights(&self) -> BridgeResult<HashMap<String, String>> {
        let body: Value = self
            .client
            .get(self.api_url("lights"))
            .send()
            .and_then(|r| r.json())
            .map_err(|e| BridgeError::Device(format!("bridge unreachable: {}", e)))?;
        parse_lights(&body)
    }

    fn replace_light_ids(&self, lights: HashMap<String, String>) {
        *self.light_ids.lock().unwrap_or_else(PoisonError::into_inner) = lights;
    }

    fn lookup(&self, actuator_id: &str) -> Option<String> {
        resolve_light_id(
            &self.light_ids.lock().unwrap_or_else(PoisonError::into_inner),
            actuator_id,
        )
    }

    /// Accepts a light id or a light name.
    fn resolve(&self, actuator_id: &str) -> BridgeResult<String> {
        if let Some(id) = self.lookup(actuator_id) {
            return Ok(id);
        }
        debug!(target: "aura::dispatch", actuator_id, "unknown light, refreshing light list");
        self.replace_light_ids(self.fetch_lights()?);
        self.lookup(actuator_id)
            .ok_or_else(|| BridgeError::Device(format!("no light named or numbered {:?}", actuator_id)))
    }
}

impl ActuatorDriver for HueBridge {
    fn set_state(
        &self,
        actuator_id: &str,
        state: &ActuatorState,
        transition_time: u16,
    ) -> BridgeResult<()> {
        let light_id = self.resolve(actuator_id)?;
        let body: Value = self
            .client
            .put(self.api_url(&format!("lights/{}/state", light_id)))
            .json(&state_body(state, transition_time))
            .send()
            .and_then(|r| r.json())
            .map_err(|e| BridgeError::Device(e.to_string()))?;
        match first_bridge_error(&body) {
            Some((kind, description)) => Err(BridgeError::Device(format!(
                "bridge error {}: {}",
                kind, description
            ))),
            None => Ok(()),
        }
    }
}

/// Body of a `PUT lights/<id>/state` call.
pub fn state_body(state: &ActuatorState, transition_time: u16) -> Value {
    serde_json::json!({
        "on": true,
        "hue": state.hue,
        "sat": state.saturation,
        "bri": state.brightness,
        "transitiontime": transition_time,
    })
}

/// First `{"error": {"type", "description"}}` entry of a bridge reply, if any.
fn first_bridge_error(body: &Value) -> Option<(u64, String)> {
    body.as_array()?.iter().find_map(|entry| {
        let error = entry.get("error")?;
        let kind = error.get("type").and_then(Value::as_u64).unwrap_or(0);
        let description = error
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        Some((kind, description))
    })
}

fn parse_registration(body: &Value) -> BridgeResult<String> {
    if let Some((kind, description)) = first_bridge_error(body) {
        if kind == LINK_BUTTON_NOT_PRESSED {
            return Err(BridgeError::Config(
                "link button not pressed on the bridge".to_string(),
            ));
        }
        return Err(BridgeError::Config(format!(
            "bridge refused pairing ({}): {}",
            kind, description
        )));
    }
    body.as_array()
        .and_then(|entries| {
            entries.iter().find_map(|e| {
                e.get("success")?
                    .get("username")?
                    .as_str()
                    .map(str::to_string)
            })
        })
        .ok_or_else(|| BridgeError::Config("bridge pairing reply had no username".to_string()))
}

/// `{"<id>": {"name": ...}}` → name → id.
fn parse_lights(body: &Value) -> BridgeResult<HashMap<String, String>> {
    if let Some((kind, description)) = first_bridge_error(body) {
        return Err(BridgeError::Device(format!(
            "bridge error {}: {}",
            kind, description
        )));
    }
    let lights = body
        .as_object()
        .ok_or_else(|| BridgeError::Device("unexpected light list shape".to_string()))?;
    Ok(lights
        .iter()
        .filter_map(|(id, light)| {
            let name = light.get("name")?.as_str()?;
            Some((name.to_string(), id.clone()))
        })
        .collect())
}

fn resolve_light_id(lights: &HashMap<String, String>, actuator_id: &str) -> Option<String> {
    if let Some(id) = lights.get(actuator_id) {
        return Some(id.clone());
    }
    lights
        .values()
        .find(|id| id.as_str() == actuator_id)
        .cloned()
}
