use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Relay id to on/off. Ordered so ids serialize as "1".."8".
pub type RelayStates = BTreeMap<String, bool>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

impl EventLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub message: String,
    pub time: String,
    pub date: String,
}

impl Event {
    /// Severity parsed back out of the message prefix.
    pub fn level(&self) -> Option<EventLevel> {
        [EventLevel::Info, EventLevel::Warning, EventLevel::Error]
            .into_iter()
            .find(|level| {
                self.message
                    .strip_prefix(level.as_str())
                    .is_some_and(|rest| rest.starts_with(": "))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemInfo {
    pub ip_address: String,
    pub ssid: String,
    pub free_memory: String,
    pub memory: String,
    pub allocated_memory: String,
    pub temperature: String,
    pub voltage: String,
    pub time: String,
    pub date: String,
    pub location: String,
    pub contact: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusColor {
    Red,
    Green,
    Blue,
    Yellow,
    Off,
}

impl StatusColor {
    pub fn rgb(self) -> (u8, u8, u8) {
        match self {
            Self::Red => (255, 0, 0),
            Self::Green => (0, 255, 0),
            Self::Blue => (0, 0, 255),
            Self::Yellow => (255, 255, 0),
            Self::Off => (0, 0, 0),
        }
    }
}

/// Lamp that shows where the device is in its lifecycle.
pub trait StatusIndicator {
    fn show(&mut self, color: StatusColor);
}
