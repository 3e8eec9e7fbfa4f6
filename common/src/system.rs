use crate::{events::Clock, relay::HardwareError, types::SystemInfo};

const UNKNOWN: &str = "unknown";
const ADC_FULL_SCALE: f32 = 65_535.0;
const ADC_REFERENCE_V: f32 = 3.3;

/// Analog input normalised to a 16-bit full scale.
pub trait AnalogInput {
    fn read_u16(&mut self) -> Result<u16, HardwareError>;
}

pub trait NetworkStatus {
    fn ip_address(&self) -> Option<String>;
    fn ssid(&self) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub free_bytes: u64,
    pub allocated_bytes: u64,
}

pub trait MemoryStats {
    fn heap(&self) -> Result<HeapStats, HardwareError>;
}

/// Die temperature from the on-chip sensor: 0.706 V at 27 °C, -1.721 mV per °C.
pub fn temperature_c(raw: u16) -> f32 {
    let volts = f32::from(raw) * ADC_REFERENCE_V / ADC_FULL_SCALE;
    27.0 - (volts - 0.706) / 0.001_721
}

/// Supply voltage seen through the 1:3 divider on the VSYS sense input.
pub fn supply_voltage(raw: u16) -> f32 {
    f32::from(raw) * 3.0 * ADC_REFERENCE_V / ADC_FULL_SCALE
}

fn kilobytes(bytes: u64) -> String {
    format!("{:.0}", bytes as f64 / 1000.0)
}

pub struct SystemInfoReporter {
    temperature: Box<dyn AnalogInput + Send>,
    supply: Box<dyn AnalogInput + Send>,
    network: Box<dyn NetworkStatus + Send>,
    memory: Box<dyn MemoryStats + Send>,
    clock: Box<dyn Clock + Send>,
    location: String,
    contact: String,
}

impl SystemInfoReporter {
    pub fn new(
        temperature: Box<dyn AnalogInput + Send>,
        supply: Box<dyn AnalogInput + Send>,
        network: Box<dyn NetworkStatus + Send>,
        memory: Box<dyn MemoryStats + Send>,
        clock: Box<dyn Clock + Send>,
        location: impl Into<String>,
        contact: impl Into<String>,
    ) -> Self {
        Self {
            temperature,
            supply,
            network,
            memory,
            clock,
            location: location.into(),
            contact: contact.into(),
        }
    }

    /// Point sample of every source. A failing source reports "unknown" rather than
    /// failing the whole snapshot.
    pub fn snapshot(&mut self) -> SystemInfo {
        let mut sensor_errors = Vec::new();

        let temperature = match self.temperature.read_u16() {
            Ok(raw) => format!("{:.2}", temperature_c(raw)),
            Err(err) => {
                sensor_errors.push(format!("temperature: {err}"));
                UNKNOWN.to_string()
            }
        };
        let voltage = match self.supply.read_u16() {
            Ok(raw) => format!("{:.2}", supply_voltage(raw)),
            Err(err) => {
                sensor_errors.push(format!("voltage: {err}"));
                UNKNOWN.to_string()
            }
        };

        let (free_memory, memory, allocated_memory) = match self.memory.heap() {
            Ok(heap) => (
                kilobytes(heap.free_bytes + heap.allocated_bytes),
                kilobytes(heap.free_bytes),
                kilobytes(heap.allocated_bytes),
            ),
            Err(err) => {
                tracing::warn!("memory statistics unavailable: {err}");
                (UNKNOWN.to_string(), UNKNOWN.to_string(), UNKNOWN.to_string())
            }
        };

        let now = self.clock.now();

        SystemInfo {
            ip_address: self
                .network
                .ip_address()
                .unwrap_or_else(|| UNKNOWN.to_string()),
            ssid: self.network.ssid().unwrap_or_else(|| UNKNOWN.to_string()),
            free_memory,
            memory,
            allocated_memory,
            temperature,
            voltage,
            time: now.format("%H:%M:%S").to_string(),
            date: now.format("%d.%m.%Y").to_string(),
            location: self.location.clone(),
            contact: self.contact.clone(),
            sensor_error: (!sensor_errors.is_empty()).then(|| sensor_errors.join("; ")),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{fixed_clock, FixedAnalog, FixedMemory, FixedNetwork};

    fn reporter(
        temperature: Result<u16, &'static str>,
        supply: Result<u16, &'static str>,
        heap: Option<HeapStats>,
    ) -> SystemInfoReporter {
        SystemInfoReporter::new(
            Box::new(FixedAnalog(temperature)),
            Box::new(FixedAnalog(supply)),
            Box::new(FixedNetwork {
                ip: Some("192.168.1.109"),
                ssid: Some("workshop"),
            }),
            Box::new(FixedMemory(heap)),
            fixed_clock(),
            "Garage",
            "ops@example.org",
        )
    }

    #[test]
    fn calibration_formulas() {
        assert!((temperature_c(14_021) - 27.0).abs() < 0.05);
        assert!(temperature_c(13_000) > temperature_c(14_000));
        assert!((supply_voltage(65_535) - 9.9).abs() < 1e-4);
        assert_eq!(supply_voltage(0), 0.0);
    }

    #[test]
    fn snapshot_formats_every_field_as_string() {
        let mut reporter = reporter(
            Ok(13_990),
            Ok(33_098),
            Some(HeapStats {
                free_bytes: 150_400,
                allocated_bytes: 42_600,
            }),
        );

        let info = reporter.snapshot();

        assert_eq!(
            info,
            SystemInfo {
                ip_address: "192.168.1.109".to_string(),
                ssid: "workshop".to_string(),
                free_memory: "193".to_string(),
                memory: "150".to_string(),
                allocated_memory: "43".to_string(),
                temperature: "27.89".to_string(),
                voltage: "5.00".to_string(),
                time: "07:05:03".to_string(),
                date: "09.03.2024".to_string(),
                location: "Garage".to_string(),
                contact: "ops@example.org".to_string(),
                sensor_error: None,
            }
        );

        let json = serde_json::to_value(&info).unwrap();
        let keys: Vec<&str> = json
            .as_object()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(keys.len(), 11);
        assert!(json.as_object().unwrap().values().all(|v| v.is_string()));
    }

    #[test]
    fn sensor_failure_is_reported_without_failing_snapshot() {
        let mut reporter = reporter(Err("adc timeout"), Ok(33_098), None);

        let info = reporter.snapshot();

        assert_eq!(info.temperature, "unknown");
        assert_eq!(info.voltage, "5.00");
        assert_eq!(info.free_memory, "unknown");
        assert_eq!(info.sensor_error.as_deref(), Some("temperature: adc timeout"));

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["sensor_error"], "temperature: adc timeout");
    }
}
