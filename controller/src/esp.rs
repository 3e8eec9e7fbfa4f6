use core::convert::TryInto;
use std::{
    net::Ipv4Addr,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::Method as HttpMethod,
    io::Write,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    gpio::{ADCPin, AnyOutputPin, Gpio1, Gpio2, Output, PinDriver},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::EspSntp,
    sys::EspError,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use relayboard_common::{
    dispatch, resolve, AnalogInput, ApiResponse, Device, EventLevel, EventLog, HardwareError,
    HeapStats, MemoryStats, Method, NetworkConfig, NetworkStatus, OutputLine, RelayBinding,
    RelayController, RuntimeConfig, StateStore, StatusColor, StatusIndicator, Storage,
    StoreError, SystemInfoReporter, ZonedClock, ROUTES,
};

const NVS_NAMESPACE: &str = "relayboard";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
/// ADC1 reads 12 bits; the calibration formulas expect a 16-bit scale.
const ADC_SHIFT: u32 = 4;

type EspDevice = Device<EspLine, NvsStorage>;
type SharedDevice = Arc<Mutex<EspDevice>>;
type EspRequest<'r, 'c> = Request<&'r mut EspHttpConnection<'c>>;

/// Relay snapshot and event log as NVS blobs, one entry per storage key.
#[derive(Clone)]
struct NvsStorage {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

struct EspLine {
    pin: PinDriver<'static, AnyOutputPin, Output>,
}

struct AdcInput<P: ADCPin<Adc = ADC1>> {
    channel: AdcChannelDriver<'static, P, Arc<AdcDriver<'static, ADC1>>>,
}

struct EspNetworkStatus;

struct EspMemory;

/// Single-colour lamp: lit for every lifecycle colour except `Off`.
struct StatusLed {
    pin: Option<PinDriver<'static, AnyOutputPin, Output>>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let mut runtime = load_runtime_config(&nvs_partition).unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_wifi_defaults(&mut runtime);
    runtime.sanitize();

    info!(
        "NVS config loaded: ssid=`{}`, relays={}, http_port={}",
        runtime.network.wifi_ssid,
        runtime.board.relay_pins.len(),
        runtime.network.http_port,
    );

    let mut status_led = StatusLed::new(runtime.board.status_led_pin);
    status_led.show(StatusColor::Yellow);

    let Peripherals {
        modem, adc1, pins, ..
    } = Peripherals::take()?;
    let storage = NvsStorage {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };
    let device = match build_device(&runtime, storage, adc1, pins.gpio1, pins.gpio2) {
        Ok(device) => Arc::new(Mutex::new(device)),
        Err(err) => {
            status_led.show(StatusColor::Red);
            return Err(err);
        }
    };

    let wifi = match connect_wifi(modem, sys_loop, nvs_partition, &runtime.network) {
        Ok(wifi) => {
            record(&device, EventLevel::Info, "Wifi connected");
            wifi
        }
        Err(err) => {
            status_led.show(StatusColor::Red);
            record(&device, EventLevel::Error, format!("Wifi connection failed: {err:#}"));
            return Err(err.context("wifi startup failed"));
        }
    };

    let _sntp = EspSntp::new_default().context("failed to start SNTP")?;
    info!("SNTP initialized");

    let server = match create_http_server(device.clone(), runtime.network.http_port) {
        Ok(server) => server,
        Err(err) => {
            status_led.show(StatusColor::Red);
            record(&device, EventLevel::Error, format!("Application failed: {err:#}"));
            return Err(err);
        }
    };

    record(&device, EventLevel::Info, "Application started. Welcome !");
    status_led.show(StatusColor::Green);

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
}

fn record(device: &SharedDevice, level: EventLevel, message: impl Into<String>) {
    match device.lock() {
        Ok(mut device) => device.controller.record(level, message),
        Err(_) => warn!("device lock poisoned, dropping event"),
    }
}

fn build_device(
    runtime: &RuntimeConfig,
    storage: NvsStorage,
    adc1: ADC1,
    temperature_pin: Gpio1,
    supply_pin: Gpio2,
) -> anyhow::Result<EspDevice> {
    let board = &runtime.board;
    let clock = ZonedClock::new(&board.timezone);

    let bindings = board
        .relay_pins
        .iter()
        .map(|(id, pin)| {
            let line = EspLine::new(*pin)
                .with_context(|| format!("failed to claim GPIO{pin} for relay {id}"))?;
            Ok(RelayBinding {
                id: id.clone(),
                pin: *pin,
                line,
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let log = EventLog::load(storage.clone(), Box::new(clock), board.max_events);
    let controller = RelayController::new(bindings, StateStore::new(storage), log);

    let adc = Arc::new(AdcDriver::new(adc1).context("failed to init ADC1")?);
    let config = AdcChannelConfig {
        attenuation: DB_11,
        ..Default::default()
    };
    let temperature = AdcInput {
        channel: AdcChannelDriver::new(adc.clone(), temperature_pin, &config)?,
    };
    let supply = AdcInput {
        channel: AdcChannelDriver::new(adc, supply_pin, &config)?,
    };

    let reporter = SystemInfoReporter::new(
        Box::new(temperature),
        Box::new(supply),
        Box::new(EspNetworkStatus),
        Box::new(EspMemory),
        Box::new(clock),
        &board.location,
        &board.contact,
    );

    Ok(Device {
        controller,
        reporter,
    })
}

fn create_http_server(device: SharedDevice, port: u16) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        http_port: port,
        uri_match_wildcard: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    for route in ROUTES {
        let uri = route.wildcard();
        for method in route.methods.iter().copied() {
            let device = device.clone();
            server.fn_handler::<anyhow::Error, _>(&uri, http_method(method), move |req| {
                handle_api(&device, method, req)
            })?;
        }
    }

    // Registered last so it only sees paths no route claimed.
    for method in [Method::Get, Method::Post] {
        server.fn_handler::<anyhow::Error, _>("/*", http_method(method), move |req| {
            write_json(req, 404, &serde_json::json!({ "error": "Not found" }))
        })?;
    }

    info!("relay board HTTP server listening on port {port}");
    Ok(server)
}

fn http_method(method: Method) -> HttpMethod {
    match method {
        Method::Get => HttpMethod::Get,
        Method::Post => HttpMethod::Post,
    }
}

fn handle_api(device: &SharedDevice, method: Method, req: EspRequest<'_, '_>) -> anyhow::Result<()> {
    let uri = req.uri().to_string();
    let request = match resolve(method, &uri) {
        Ok(request) => request,
        Err(unmatched) => return write_api_response(req, ApiResponse::unmatched(unmatched)),
    };

    let response = {
        let mut device = device
            .lock()
            .map_err(|_| anyhow!("device lock poisoned"))?;
        dispatch(&mut *device, request)
    };
    write_api_response(req, response)
}

fn write_api_response(req: EspRequest<'_, '_>, response: ApiResponse) -> anyhow::Result<()> {
    match response {
        ApiResponse::Json { status, body } => write_json(req, status, &body),
        ApiResponse::Reboot => {
            warn!("reboot requested, restarting");
            thread::sleep(Duration::from_millis(100));
            unsafe { esp_idf_svc::sys::esp_restart() };
        }
    }
}

fn write_json<T: Serialize>(req: EspRequest<'_, '_>, status: u16, payload: &T) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    let reason = (status == 200).then_some("OK");
    req.into_response(
        status,
        reason,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    if network.wifi_ssid.trim().is_empty() {
        return Err(anyhow!("wifi ssid is not configured"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    match last_err {
        None => Ok(esp_wifi),
        Some(err) => {
            let _ = wifi.stop();
            Err(anyhow!(
                "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}"
            ))
        }
    }
}

fn load_runtime_config(partition: &EspDefaultNvsPartition) -> anyhow::Result<RuntimeConfig> {
    let nvs = EspNvs::new(partition.clone(), NVS_NAMESPACE, true)?;
    let mut buffer = vec![0_u8; 4096];

    match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
        Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
        None => Ok(RuntimeConfig::default()),
    }
}

impl NvsStorage {
    fn open(&self) -> Result<EspNvs<esp_idf_svc::nvs::NvsDefault>, StoreError> {
        EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true).map_err(nvs_error)
    }
}

impl Storage for NvsStorage {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| StoreError::Backend("nvs lock poisoned".to_string()))?;
        let nvs = self.open()?;

        let Some(len) = nvs.blob_len(key).map_err(nvs_error)? else {
            return Ok(None);
        };
        let mut buffer = vec![0_u8; len];
        Ok(nvs
            .get_blob(key, &mut buffer)
            .map_err(nvs_error)?
            .map(<[u8]>::to_vec))
    }

    fn write(&mut self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| StoreError::Backend("nvs lock poisoned".to_string()))?;
        let mut nvs = self.open()?;
        nvs.set_blob(key, data).map_err(nvs_error)?;
        Ok(())
    }
}

fn nvs_error(err: EspError) -> StoreError {
    StoreError::Backend(format!("nvs: {err}"))
}

impl EspLine {
    fn new(pin: i32) -> Result<Self, EspError> {
        let mut pin = unsafe { PinDriver::output(AnyOutputPin::new(pin)) }?;
        pin.set_low()?;
        Ok(Self { pin })
    }
}

impl OutputLine for EspLine {
    fn set_level(&mut self, on: bool) -> Result<(), HardwareError> {
        let result = if on {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        result.map_err(|err| HardwareError::new(err.to_string()))
    }
}

impl<P: ADCPin<Adc = ADC1>> AnalogInput for AdcInput<P> {
    fn read_u16(&mut self) -> Result<u16, HardwareError> {
        let raw = self
            .channel
            .read_raw()
            .map_err(|err| HardwareError::new(format!("adc read failed: {err}")))?;
        Ok(raw.min(0x0fff) << ADC_SHIFT)
    }
}

impl NetworkStatus for EspNetworkStatus {
    fn ip_address(&self) -> Option<String> {
        let netif =
            unsafe { esp_idf_svc::sys::esp_netif_get_handle_from_ifkey(c"WIFI_STA_DEF".as_ptr()) };
        if netif.is_null() {
            return None;
        }

        let mut ip_info = esp_idf_svc::sys::esp_netif_ip_info_t::default();
        let rc = unsafe { esp_idf_svc::sys::esp_netif_get_ip_info(netif, &mut ip_info) };
        if rc != esp_idf_svc::sys::ESP_OK || ip_info.ip.addr == 0 {
            return None;
        }
        Some(Ipv4Addr::from(ip_info.ip.addr.to_le_bytes()).to_string())
    }

    fn ssid(&self) -> Option<String> {
        let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
        if rc != esp_idf_svc::sys::ESP_OK {
            return None;
        }

        let len = ap_info
            .ssid
            .iter()
            .position(|byte| *byte == 0)
            .unwrap_or(ap_info.ssid.len());
        Some(String::from_utf8_lossy(&ap_info.ssid[..len]).into_owned())
    }
}

impl MemoryStats for EspMemory {
    fn heap(&self) -> Result<HeapStats, HardwareError> {
        let free = unsafe { esp_idf_svc::sys::esp_get_free_heap_size() } as u64;
        let total = unsafe {
            esp_idf_svc::sys::heap_caps_get_total_size(esp_idf_svc::sys::MALLOC_CAP_DEFAULT)
        } as u64;
        if total == 0 {
            return Err(HardwareError::new("heap size unavailable"));
        }

        Ok(HeapStats {
            free_bytes: free,
            allocated_bytes: total.saturating_sub(free),
        })
    }
}

impl StatusLed {
    fn new(pin: i32) -> Self {
        let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) };
        match driver {
            Ok(mut driver) => {
                let _ = driver.set_low();
                Self { pin: Some(driver) }
            }
            Err(err) => {
                warn!("status LED unavailable on GPIO{pin}: {err}");
                Self { pin: None }
            }
        }
    }
}

impl StatusIndicator for StatusLed {
    fn show(&mut self, color: StatusColor) {
        info!("status lamp {color:?}");
        let Some(pin) = self.pin.as_mut() else {
            return;
        };

        let result = if color == StatusColor::Off {
            pin.set_low()
        } else {
            pin.set_high()
        };
        if let Err(err) = result {
            warn!("failed to drive status LED: {err}");
        }
    }
}
