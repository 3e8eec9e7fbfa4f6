use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use chrono::{NaiveDate, NaiveDateTime};

use crate::{
    events::Clock,
    relay::{HardwareError, OutputLine},
    storage::{Storage, StoreError},
    system::{AnalogInput, HeapStats, MemoryStats, NetworkStatus},
};

/// In-memory storage; clones share the same entries.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
    writes: Arc<Mutex<Vec<String>>>,
}

impl MemoryStorage {
    pub fn insert(&self, key: &str, data: &[u8]) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Keys of attempted writes, in order.
    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }
}

impl Storage for MemoryStorage {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(StoreError::Backend(format!("read of `{key}` refused")));
        }
        Ok(self.get(key))
    }

    fn write(&mut self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        self.writes.lock().unwrap().push(key.to_string());
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(StoreError::Backend(format!("write of `{key}` refused")));
        }
        self.insert(key, data);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockLine {
    pub level: bool,
    pub writes: usize,
    pub fail: bool,
}

impl OutputLine for MockLine {
    fn set_level(&mut self, on: bool) -> Result<(), HardwareError> {
        if self.fail {
            return Err(HardwareError::new("line stuck"));
        }
        self.level = on;
        self.writes += 1;
        Ok(())
    }
}

pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

pub fn fixed_clock() -> Box<FixedClock> {
    let at = NaiveDate::from_ymd_opt(2024, 3, 9)
        .and_then(|date| date.and_hms_opt(7, 5, 3))
        .unwrap();
    Box::new(FixedClock(at))
}

pub struct FixedAnalog(pub Result<u16, &'static str>);

impl AnalogInput for FixedAnalog {
    fn read_u16(&mut self) -> Result<u16, HardwareError> {
        self.0.map_err(HardwareError::new)
    }
}

pub struct FixedNetwork {
    pub ip: Option<&'static str>,
    pub ssid: Option<&'static str>,
}

impl NetworkStatus for FixedNetwork {
    fn ip_address(&self) -> Option<String> {
        self.ip.map(str::to_string)
    }

    fn ssid(&self) -> Option<String> {
        self.ssid.map(str::to_string)
    }
}

pub struct FixedMemory(pub Option<HeapStats>);

impl MemoryStats for FixedMemory {
    fn heap(&self) -> Result<HeapStats, HardwareError> {
        self.0
            .ok_or_else(|| HardwareError::new("allocator statistics unavailable"))
    }
}
