use std::{
    any::Any,
    io::ErrorKind,
    net::{SocketAddr, UdpSocket},
    path::PathBuf,
    sync::Arc,
};

use anyhow::Context;
use axum::{
    extract::State,
    http::{Method as HttpMethod, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::any,
    Json, Router,
};
use serde::Serialize;
use tokio::{net::TcpListener, sync::Mutex};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use relayboard_common::{
    dispatch,
    storage::RUNTIME_KEY,
    validate_routes, AnalogInput, ApiResponse, Device, EventLevel, EventLog, HardwareError,
    HeapStats, MemoryStats, Method, NetworkStatus, OutputLine, RelayBinding, RelayController,
    RuntimeConfig, StateStore, StatusColor, StatusIndicator, Storage, StoreError,
    SystemInfoReporter, ZonedClock, ROUTES,
};

type HostDevice = Device<SimulatedLine, FileStorage>;

/// Raw readings around 27 °C and 5 V on the 16-bit scale.
const SIMULATED_TEMPERATURE_RAW: u16 = 14_000;
const SIMULATED_SUPPLY_RAW: u16 = 33_000;

/// Anything routed on the documentation range never leaves the host; it only picks the
/// outbound interface.
const ROUTE_PROBE_ADDR: &str = "192.0.2.1:80";

#[derive(Clone)]
struct AppState {
    device: Arc<Mutex<HostDevice>>,
    reboot: Arc<dyn Reboot>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Terminal reset of the device. Called after the reboot event is already persisted.
trait Reboot: Send + Sync {
    fn reboot(&self);
}

struct ProcessReboot;

impl Reboot for ProcessReboot {
    fn reboot(&self) {
        warn!("reboot requested, terminating process");
        std::process::exit(0);
    }
}

/// One JSON file per storage key inside the data directory.
#[derive(Debug, Clone)]
struct FileStorage {
    dir: Arc<PathBuf>,
}

impl FileStorage {
    fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Arc::new(dir.into()),
        }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl Storage for FileStorage {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match std::fs::read(self.path(key)) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&mut self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        std::fs::create_dir_all(self.dir.as_ref())?;
        let path = self.path(key);
        let staging = path.with_extension("json.tmp");
        std::fs::write(&staging, data)?;
        std::fs::rename(&staging, &path)?;
        Ok(())
    }
}

#[derive(Debug)]
struct SimulatedLine {
    pin: i32,
}

impl OutputLine for SimulatedLine {
    fn set_level(&mut self, on: bool) -> Result<(), HardwareError> {
        debug!("GPIO{} -> {}", self.pin, if on { "high" } else { "low" });
        Ok(())
    }
}

/// Slowly wandering reading so the system endpoint shows live-looking values.
struct SimulatedAdc {
    base: u16,
    step: u16,
    tick: u16,
}

impl SimulatedAdc {
    fn new(base: u16, step: u16) -> Self {
        Self {
            base,
            step,
            tick: 0,
        }
    }
}

impl AnalogInput for SimulatedAdc {
    fn read_u16(&mut self) -> Result<u16, HardwareError> {
        self.tick = self.tick.wrapping_add(1);
        Ok(self.base.saturating_add((self.tick % 8) * self.step))
    }
}

struct HostNetwork {
    ssid: Option<String>,
}

impl NetworkStatus for HostNetwork {
    fn ip_address(&self) -> Option<String> {
        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect(ROUTE_PROBE_ADDR).ok()?;
        socket.local_addr().ok().map(|addr| addr.ip().to_string())
    }

    fn ssid(&self) -> Option<String> {
        self.ssid.clone()
    }
}

struct ProcMeminfo;

impl MemoryStats for ProcMeminfo {
    fn heap(&self) -> Result<HeapStats, HardwareError> {
        let raw = std::fs::read_to_string("/proc/meminfo")
            .map_err(|err| HardwareError::new(format!("/proc/meminfo unreadable: {err}")))?;
        parse_meminfo(&raw).ok_or_else(|| HardwareError::new("/proc/meminfo is missing fields"))
    }
}

fn parse_meminfo(raw: &str) -> Option<HeapStats> {
    let field = |name: &str| -> Option<u64> {
        raw.lines()
            .find_map(|line| line.strip_prefix(name)?.strip_prefix(':'))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|value| value.parse::<u64>().ok())
            .map(|kib| kib * 1024)
    };

    let total = field("MemTotal")?;
    let available = field("MemAvailable")?;
    Some(HeapStats {
        free_bytes: available,
        allocated_bytes: total.saturating_sub(available),
    })
}

#[derive(Debug, Default)]
struct LoggedIndicator;

impl StatusIndicator for LoggedIndicator {
    fn show(&mut self, color: StatusColor) {
        let (r, g, b) = color.rgb();
        info!("status lamp {color:?} ({r},{g},{b})");
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("RELAYBOARD_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.relayboard"));
    let storage = FileStorage::new(&data_dir);

    let mut runtime = load_runtime_config(&storage).unwrap_or_else(|err| {
        warn!("failed to load runtime config from {}: {err:#}", data_dir.display());
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime);
    runtime.sanitize();

    let mut indicator = LoggedIndicator;
    indicator.show(StatusColor::Yellow);

    let state = AppState {
        device: Arc::new(Mutex::new(build_device(&runtime, storage))),
        reboot: Arc::new(ProcessReboot),
    };
    let app = match router(state.clone()) {
        Ok(app) => app,
        Err(err) => {
            indicator.show(StatusColor::Red);
            return Err(err);
        }
    };

    record(&state, EventLevel::Info, "Application started. Welcome !").await;
    indicator.show(StatusColor::Green);

    let addr = SocketAddr::from(([0, 0, 0, 0], runtime.network.http_port));
    let served = serve(addr, app).await;
    if let Err(err) = &served {
        indicator.show(StatusColor::Red);
        record(&state, EventLevel::Error, format!("Application failed: {err:#}")).await;
    }

    record(&state, EventLevel::Info, "Application stopped. Bye !").await;
    indicator.show(StatusColor::Off);
    served
}

async fn serve(addr: SocketAddr, app: Router) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind relay board server at {addr}"))?;

    info!("relay board listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

async fn record(state: &AppState, level: EventLevel, message: impl Into<String>) {
    state.device.lock().await.controller.record(level, message);
}

fn load_runtime_config(storage: &FileStorage) -> anyhow::Result<RuntimeConfig> {
    match storage.read(RUNTIME_KEY)? {
        Some(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
        None => Ok(RuntimeConfig::default()),
    }
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Some(port) = std::env::var("RELAYBOARD_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        runtime.network.http_port = port;
    }
    if let Ok(ssid) = std::env::var("RELAYBOARD_SSID") {
        runtime.network.wifi_ssid = ssid;
    }
}

fn build_device(runtime: &RuntimeConfig, storage: FileStorage) -> HostDevice {
    let board = &runtime.board;
    let clock = ZonedClock::new(&board.timezone);

    let bindings = board.relay_pins.iter().map(|(id, pin)| RelayBinding {
        id: id.clone(),
        pin: *pin,
        line: SimulatedLine { pin: *pin },
    });
    let log = EventLog::load(storage.clone(), Box::new(clock), board.max_events);
    let controller = RelayController::new(bindings, StateStore::new(storage), log);

    let ssid = Some(runtime.network.wifi_ssid.clone()).filter(|ssid| !ssid.is_empty());
    let reporter = SystemInfoReporter::new(
        Box::new(SimulatedAdc::new(SIMULATED_TEMPERATURE_RAW, 12)),
        Box::new(SimulatedAdc::new(SIMULATED_SUPPLY_RAW, 40)),
        Box::new(HostNetwork { ssid }),
        Box::new(ProcMeminfo),
        Box::new(clock),
        &board.location,
        &board.contact,
    );

    Device {
        controller,
        reporter,
    }
}

fn router(state: AppState) -> anyhow::Result<Router> {
    validate_routes(ROUTES).context("route table rejected")?;

    // Every method reaches `handle_api`, which answers unsupported ones with a JSON 405.
    let router = ROUTES
        .iter()
        .fold(Router::<AppState>::new(), |router, route| {
            router.route(route.pattern, any(handle_api))
        });

    Ok(router
        .fallback(handle_not_found)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

async fn handle_api(State(state): State<AppState>, method: HttpMethod, uri: Uri) -> Response {
    let method = if method == HttpMethod::GET {
        Method::Get
    } else if method == HttpMethod::POST {
        Method::Post
    } else {
        return error_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
    };

    let request = match relayboard_common::resolve(method, uri.path()) {
        Ok(request) => request,
        Err(unmatched) => return api_response(ApiResponse::unmatched(unmatched)),
    };

    let response = {
        let mut device = state.device.lock().await;
        dispatch(&mut *device, request)
    };

    if response == ApiResponse::Reboot {
        state.reboot.reboot();
        return StatusCode::ACCEPTED.into_response();
    }
    api_response(response)
}

async fn handle_not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!("request handler panicked: {detail}");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

fn api_response(response: ApiResponse) -> Response {
    match response {
        ApiResponse::Json { status, body } => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(body)).into_response()
        }
        ApiResponse::Reboot => StatusCode::ACCEPTED.into_response(),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
