use std::collections::BTreeMap;

use thiserror::Error;
use tracing::warn;

use crate::{
    events::EventLog,
    state_store::StateStore,
    storage::Storage,
    types::{EventLevel, RelayStates},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HardwareError {
    message: String,
}

impl HardwareError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("Invalid relay ID: {0}")]
    UnknownRelay(String),
    #[error("Invalid state: {0}. Must be 1 or 0")]
    InvalidState(String),
    #[error("Failed to drive relay {id}: {source}")]
    Hardware { id: String, source: HardwareError },
}

/// A physical output line a relay coil hangs off.
pub trait OutputLine {
    fn set_level(&mut self, on: bool) -> Result<(), HardwareError>;
}

pub struct RelayBinding<L> {
    pub id: String,
    pub pin: i32,
    pub line: L,
}

pub struct Relay<L> {
    pin: i32,
    line: L,
    on: bool,
}

impl<L> Relay<L> {
    pub fn line(&self) -> &L {
        &self.line
    }
}

/// Outcome of a relay change that reached the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    /// False when the new state could not be saved; hardware and storage disagree until
    /// the next successful save.
    pub persisted: bool,
}

/// Parses the "1"/"0" state token used on the wire.
pub fn parse_state_token(token: &str) -> Result<bool, RelayError> {
    match token {
        "1" => Ok(true),
        "0" => Ok(false),
        other => Err(RelayError::InvalidState(other.to_string())),
    }
}

pub fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

pub struct RelayController<L, S> {
    relays: BTreeMap<String, Relay<L>>,
    store: StateStore<S>,
    log: EventLog<S>,
}

impl<L: OutputLine, S: Storage> RelayController<L, S> {
    /// Restores the persisted snapshot (all off if it is missing or corrupt) and drives
    /// every line to match it.
    pub fn new(
        bindings: impl IntoIterator<Item = RelayBinding<L>>,
        store: StateStore<S>,
        log: EventLog<S>,
    ) -> Self {
        let mut controller = Self {
            relays: bindings
                .into_iter()
                .map(|binding| {
                    (
                        binding.id,
                        Relay {
                            pin: binding.pin,
                            line: binding.line,
                            on: false,
                        },
                    )
                })
                .collect(),
            store,
            log,
        };

        let persisted = controller.store.load();
        match &persisted {
            Some(_) => controller
                .log
                .append(EventLevel::Info, "Relay states loaded successfully"),
            None => controller
                .log
                .append(EventLevel::Warning, "Relay states reset to default"),
        }
        let persisted = persisted.unwrap_or_default();

        for (id, relay) in controller.relays.iter_mut() {
            // Ids the board no longer has are ignored; new ids start off.
            let on = persisted.get(id).copied().unwrap_or(false);
            match relay.line.set_level(on) {
                Ok(()) => relay.on = on,
                Err(err) => controller.log.append(
                    EventLevel::Error,
                    format!("Failed to restore relay {id} on GPIO{}: {err}", relay.pin),
                ),
            }
        }

        controller
            .log
            .append(EventLevel::Info, "Relay System Initialized");
        controller
    }

    pub fn get_all_states(&self) -> RelayStates {
        self.relays
            .iter()
            .map(|(id, relay)| (id.clone(), relay.on))
            .collect()
    }

    /// Fails with `UnknownRelay`, logging the valid ids, when `id` is not on the board.
    pub fn check_relay(&mut self, id: &str) -> Result<(), RelayError> {
        if self.relays.contains_key(id) {
            return Ok(());
        }
        let known = self.relays.keys().cloned().collect::<Vec<_>>().join(", ");
        self.log.append(
            EventLevel::Error,
            format!("Invalid relay ID : {id}. Must be one of {known}"),
        );
        Err(RelayError::UnknownRelay(id.to_string()))
    }

    pub fn set_relay(&mut self, id: &str, on: bool) -> Result<Applied, RelayError> {
        self.check_relay(id)?;
        let Some(relay) = self.relays.get_mut(id) else {
            return Err(RelayError::UnknownRelay(id.to_string()));
        };

        if let Err(source) = relay.line.set_level(on) {
            self.log.append(
                EventLevel::Error,
                format!("Failed to drive relay {id} on GPIO{}: {source}", relay.pin),
            );
            return Err(RelayError::Hardware {
                id: id.to_string(),
                source,
            });
        }
        relay.on = on;

        self.log
            .append(EventLevel::Info, format!("Relay {id} set to {}", on_off(on)));

        Ok(Applied {
            persisted: self.persist_states(),
        })
    }

    /// Applies `set_relay` to every relay, then logs one summary event. Returns the
    /// relays that could not be driven.
    pub fn set_all(&mut self, on: bool) -> Vec<RelayError> {
        let ids: Vec<String> = self.relays.keys().cloned().collect();
        let failures = ids
            .iter()
            .filter_map(|id| self.set_relay(id, on).err())
            .collect();

        self.log
            .append(EventLevel::Info, format!("All relays set to {}", on_off(on)));
        failures
    }

    /// Logs an event on behalf of a collaborator of the controller.
    pub fn record(&mut self, level: EventLevel, message: impl Into<String>) {
        self.log.append(level, message);
    }

    pub fn relay(&self, id: &str) -> Option<&Relay<L>> {
        self.relays.get(id)
    }

    pub fn events(&self) -> &EventLog<S> {
        &self.log
    }

    fn persist_states(&mut self) -> bool {
        let snapshot = self.get_all_states();
        match self.store.save(&snapshot) {
            Ok(()) => true,
            Err(err) => {
                warn!("relay states not persisted, hardware and storage diverge: {err}");
                self.log
                    .append(EventLevel::Error, "Failed to save relay states");
                false
            }
        }
    }
}
