pub mod api;
pub mod config;
pub mod events;
pub mod relay;
pub mod routes;
pub mod state_store;
pub mod storage;
pub mod system;
pub mod types;

#[cfg(test)]
mod testing;

pub use api::{dispatch, ApiResponse, Device};
pub use config::{BoardConfig, NetworkConfig, RuntimeConfig};
pub use events::{Clock, EventLog, ZonedClock};
pub use relay::{HardwareError, OutputLine, RelayBinding, RelayController, RelayError};
pub use routes::{resolve, validate_routes, ApiRequest, Method, RouteSpec, Unmatched, ROUTES};
pub use state_store::StateStore;
pub use storage::{Storage, StoreError};
pub use system::{AnalogInput, HeapStats, MemoryStats, NetworkStatus, SystemInfoReporter};
pub use types::{Event, EventLevel, RelayStates, StatusColor, StatusIndicator, SystemInfo};
