use std::collections::VecDeque;

use chrono::{NaiveDateTime, Utc};
use chrono_tz::Tz;
use tracing::{error, info, warn};

use crate::{
    storage::{Storage, StoreError, EVENTS_KEY},
    types::{Event, EventLevel},
};

pub trait Clock {
    fn now(&self) -> NaiveDateTime;
}

/// Wall clock in a named IANA timezone. Unknown names fall back to UTC.
#[derive(Debug, Clone, Copy)]
pub struct ZonedClock {
    tz: Tz,
}

impl ZonedClock {
    pub fn new(timezone: &str) -> Self {
        let tz = timezone.parse::<Tz>().unwrap_or_else(|_| {
            warn!("unknown timezone `{timezone}`, using UTC");
            Tz::UTC
        });
        Self { tz }
    }
}

impl Clock for ZonedClock {
    fn now(&self) -> NaiveDateTime {
        Utc::now().with_timezone(&self.tz).naive_local()
    }
}

/// Bounded newest-first log, rewritten to storage on every append.
pub struct EventLog<S> {
    events: VecDeque<Event>,
    max_events: usize,
    storage: S,
    clock: Box<dyn Clock + Send>,
}

impl<S: Storage> EventLog<S> {
    /// Restores the persisted log. Missing or corrupt data starts an empty log.
    pub fn load(storage: S, clock: Box<dyn Clock + Send>, max_events: usize) -> Self {
        let max_events = max_events.max(1);
        let mut events = match storage.read(EVENTS_KEY) {
            Ok(Some(raw)) => {
                serde_json::from_slice::<VecDeque<Event>>(&raw).unwrap_or_else(|err| {
                    warn!("discarding corrupt event log: {err}");
                    VecDeque::new()
                })
            }
            Ok(None) => VecDeque::new(),
            Err(err) => {
                warn!("failed to read event log: {err}");
                VecDeque::new()
            }
        };
        events.truncate(max_events);

        Self {
            events,
            max_events,
            storage,
            clock,
        }
    }

    pub fn append(&mut self, level: EventLevel, message: impl Into<String>) {
        self.push(level, message.into());

        if let Err(err) = self.persist() {
            error!("failed to persist event log: {err}");
            // Report once; a second failure is only traced.
            self.push(EventLevel::Error, "Failed to save events log".to_string());
            if let Err(err) = self.persist() {
                error!("failed to persist event log after reporting: {err}");
            }
        }
    }

    /// Newest first.
    pub fn all(&self) -> Vec<Event> {
        self.events.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn push(&mut self, level: EventLevel, message: String) {
        match level {
            EventLevel::Info => info!("{message}"),
            EventLevel::Warning => warn!("{message}"),
            EventLevel::Error => error!("{message}"),
        }

        let now = self.clock.now();
        self.events.push_front(Event {
            message: format!("{}: {message}", level.as_str()),
            time: now.format("%H:%M:%S").to_string(),
            date: now.format("%d/%m/%Y").to_string(),
        });
        while self.events.len() > self.max_events {
            self.events.pop_back();
        }
    }

    fn persist(&mut self) -> Result<(), StoreError> {
        let payload = serde_json::to_vec(&self.events)?;
        self.storage.write(EVENTS_KEY, &payload)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{fixed_clock, MemoryStorage};

    fn messages<S: Storage>(log: &EventLog<S>) -> Vec<String> {
        log.iter().map(|event| event.message.clone()).collect()
    }

    #[test]
    fn append_stamps_time_and_date() {
        let mut log = EventLog::load(MemoryStorage::default(), fixed_clock(), 10);

        log.append(EventLevel::Info, "Relay 1 set to ON");

        assert_eq!(
            log.all(),
            vec![Event {
                message: "INFO: Relay 1 set to ON".to_string(),
                time: "07:05:03".to_string(),
                date: "09/03/2024".to_string(),
            }]
        );
    }

    #[test]
    fn newest_entry_comes_first_and_oldest_is_evicted() {
        let mut log = EventLog::load(MemoryStorage::default(), fixed_clock(), 3);

        for n in 1..=5 {
            log.append(EventLevel::Info, format!("event {n}"));
            assert!(log.len() <= 3);
        }

        assert_eq!(
            messages(&log),
            vec!["INFO: event 5", "INFO: event 4", "INFO: event 3"]
        );
    }

    #[test]
    fn every_append_rewrites_storage() {
        let storage = MemoryStorage::default();
        let mut log = EventLog::load(storage.clone(), fixed_clock(), 5);

        log.append(EventLevel::Warning, "first");
        log.append(EventLevel::Error, "second");

        assert_eq!(storage.writes(), vec![EVENTS_KEY, EVENTS_KEY]);
        let reloaded = EventLog::load(storage, fixed_clock(), 5);
        assert_eq!(messages(&reloaded), vec!["ERROR: second", "WARNING: first"]);
    }

    #[test]
    fn load_truncates_oversized_log_keeping_newest() {
        let storage = MemoryStorage::default();
        let mut log = EventLog::load(storage.clone(), fixed_clock(), 10);
        for n in 1..=6 {
            log.append(EventLevel::Info, format!("event {n}"));
        }

        let smaller = EventLog::load(storage, fixed_clock(), 2);

        assert_eq!(messages(&smaller), vec!["INFO: event 6", "INFO: event 5"]);
    }

    #[test]
    fn corrupt_log_starts_empty() {
        let storage = MemoryStorage::default();
        storage.insert(EVENTS_KEY, b"[{\"message\":");

        let log = EventLog::load(storage, fixed_clock(), 10);

        assert!(log.is_empty());
    }

    #[test]
    fn persist_failure_is_reported_once() {
        let storage = MemoryStorage::default();
        storage.fail_writes(true);
        let mut log = EventLog::load(storage.clone(), fixed_clock(), 10);

        log.append(EventLevel::Info, "Relay 2 set to OFF");

        assert_eq!(
            messages(&log),
            vec!["ERROR: Failed to save events log", "INFO: Relay 2 set to OFF"]
        );
        assert_eq!(storage.writes().len(), 2);
    }

    #[test]
    fn level_is_recovered_from_message() {
        let mut log = EventLog::load(MemoryStorage::default(), fixed_clock(), 10);
        log.append(EventLevel::Warning, "Relay states reset to default");

        assert_eq!(log.all()[0].level(), Some(EventLevel::Warning));
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        let clock = ZonedClock::new("Mars/Olympus_Mons");
        let drift = (clock.now() - Utc::now().naive_utc()).num_seconds().abs();
        assert!(drift < 5);
    }
}
