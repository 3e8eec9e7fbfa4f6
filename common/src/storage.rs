use thiserror::Error;

pub const RELAY_STATES_KEY: &str = "relay_states";
pub const EVENTS_KEY: &str = "events";
pub const RUNTIME_KEY: &str = "runtime";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored json is invalid: {0}")]
    Json(#[from] serde_json::Error),
    #[error("storage backend failed: {0}")]
    Backend(String),
}

/// Keyed blob storage. Every write replaces the whole value.
pub trait Storage {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn write(&mut self, key: &str, data: &[u8]) -> Result<(), StoreError>;
}
