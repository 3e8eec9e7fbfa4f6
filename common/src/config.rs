use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_EVENTS: usize = 50;
pub const MAX_EVENTS_LIMIT: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BoardConfig {
    /// Relay id to GPIO number. Frozen once the controller is built.
    pub relay_pins: BTreeMap<String, i32>,
    pub max_events: usize,
    pub location: String,
    pub contact: String,
    pub timezone: String,
    pub status_led_pin: i32,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            relay_pins: default_relay_pins(),
            max_events: DEFAULT_MAX_EVENTS,
            location: "unknown".to_string(),
            contact: "unknown".to_string(),
            timezone: "Europe/Zurich".to_string(),
            status_led_pin: 13,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub http_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            http_port: 80,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub board: BoardConfig,
    pub network: NetworkConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.board.sanitize();
        if self.network.http_port == 0 {
            self.network.http_port = NetworkConfig::default().http_port;
        }
    }
}

impl BoardConfig {
    pub fn sanitize(&mut self) {
        self.max_events = self.max_events.clamp(1, MAX_EVENTS_LIMIT);

        self.relay_pins
            .retain(|id, pin| *pin >= 0 && is_valid_relay_id(id));
        if self.relay_pins.is_empty() {
            self.relay_pins = default_relay_pins();
        }

        if self.timezone.trim().is_empty() {
            self.timezone = BoardConfig::default().timezone;
        }
    }
}

fn is_valid_relay_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 8 && id.chars().all(|c| c.is_ascii_alphanumeric())
}

fn default_relay_pins() -> BTreeMap<String, i32> {
    [
        ("1", 21),
        ("2", 20),
        ("3", 19),
        ("4", 18),
        ("5", 17),
        ("6", 16),
        ("7", 15),
        ("8", 14),
    ]
    .into_iter()
    .map(|(id, pin)| (id.to_string(), pin))
    .collect()
}
