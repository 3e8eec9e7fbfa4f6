use tracing::warn;

use crate::{
    storage::{Storage, StoreError, RELAY_STATES_KEY},
    types::RelayStates,
};

pub struct StateStore<S> {
    storage: S,
}

impl<S: Storage> StateStore<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Never fails: missing, unreadable and unparsable data all yield `None`.
    pub fn load(&self) -> Option<RelayStates> {
        let raw = match self.storage.read(RELAY_STATES_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                warn!("failed to read relay states: {err}");
                return None;
            }
        };

        match serde_json::from_slice::<RelayStates>(&raw) {
            Ok(states) => Some(states),
            Err(err) => {
                warn!("discarding corrupt relay states: {err}");
                None
            }
        }
    }

    pub fn save(&mut self, states: &RelayStates) -> Result<(), StoreError> {
        let payload = serde_json::to_vec(states)?;
        self.storage.write(RELAY_STATES_KEY, &payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStorage;

    #[test]
    fn save_then_load_returns_same_states() {
        let storage = MemoryStorage::default();
        let mut store = StateStore::new(storage.clone());
        let states = RelayStates::from([("1".to_string(), true), ("2".to_string(), false)]);

        store.save(&states).unwrap();

        assert_eq!(StateStore::new(storage).load(), Some(states));
    }

    #[test]
    fn missing_data_loads_as_none() {
        let store = StateStore::new(MemoryStorage::default());
        assert_eq!(store.load(), None);
    }

    #[test]
    fn corrupt_data_loads_as_none() {
        let storage = MemoryStorage::default();
        storage.insert(RELAY_STATES_KEY, br#"{"1": tru"#);

        assert_eq!(StateStore::new(storage.clone()).load(), None);

        storage.insert(RELAY_STATES_KEY, br#"{"1": "yes"}"#);
        assert_eq!(StateStore::new(storage).load(), None);
    }

    #[test]
    fn read_failure_loads_as_none() {
        let storage = MemoryStorage::default();
        storage.insert(RELAY_STATES_KEY, br#"{"1": true}"#);
        storage.fail_reads(true);

        assert_eq!(StateStore::new(storage).load(), None);
    }

    #[test]
    fn write_failure_is_reported() {
        let storage = MemoryStorage::default();
        storage.fail_writes(true);
        let mut store = StateStore::new(storage);

        let result = store.save(&RelayStates::from([("1".to_string(), true)]));

        assert!(matches!(result, Err(StoreError::Backend(_))));
    }
}
