use serde::Serialize;
use serde_json::{json, Value};

use crate::{
    relay::{on_off, parse_state_token, OutputLine, RelayController, RelayError},
    routes::{ApiRequest, Unmatched},
    storage::Storage,
    system::SystemInfoReporter,
    types::EventLevel,
};

/// Everything the HTTP layer may touch, owned in one place and handed to the server.
pub struct Device<L, S> {
    pub controller: RelayController<L, S>,
    pub reporter: SystemInfoReporter,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse {
    Json { status: u16, body: Value },
    /// The event is logged; the transport must now reset the device without replying.
    Reboot,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

impl ApiResponse {
    pub fn ok(body: Value) -> Self {
        Self::Json { status: 200, body }
    }

    pub fn error(status: u16, message: &str) -> Self {
        Self::Json {
            status,
            body: json!(ErrorBody { error: message }),
        }
    }

    pub fn unmatched(unmatched: Unmatched) -> Self {
        match unmatched {
            Unmatched::NotFound => Self::error(404, "Not found"),
            Unmatched::MethodNotAllowed => Self::error(405, "Method not allowed"),
        }
    }
}

pub fn dispatch<L: OutputLine, S: Storage>(
    device: &mut Device<L, S>,
    request: ApiRequest,
) -> ApiResponse {
    match request {
        ApiRequest::Relays => ApiResponse::ok(json!(device.controller.get_all_states())),
        ApiRequest::SetRelay { id, state } => set_relay(device, &id, &state),
        ApiRequest::SetAll { state } => set_all(device, &state),
        ApiRequest::System => ApiResponse::ok(json!(device.reporter.snapshot())),
        ApiRequest::Events => ApiResponse::ok(json!(device.controller.events().all())),
        ApiRequest::IsConnected => ApiResponse::ok(json!({ "connected": true })),
        ApiRequest::Reboot => {
            device
                .controller
                .record(EventLevel::Info, "System reboot initiated");
            ApiResponse::Reboot
        }
    }
}

fn set_relay<L: OutputLine, S: Storage>(
    device: &mut Device<L, S>,
    id: &str,
    token: &str,
) -> ApiResponse {
    if let Err(err) = device.controller.check_relay(id) {
        return ApiResponse::error(400, &err.to_string());
    }
    let on = match parse_state_token(token) {
        Ok(on) => on,
        Err(err) => {
            device.controller.record(
                EventLevel::Error,
                format!("Invalid state : {token} for relay ID : {id}. Must be 1 or 0"),
            );
            return ApiResponse::error(400, &err.to_string());
        }
    };

    match device.controller.set_relay(id, on) {
        Ok(_) => ApiResponse::ok(json!({ format!("Relay{id}"): on })),
        Err(err @ RelayError::UnknownRelay(_)) => ApiResponse::error(400, &err.to_string()),
        Err(err) => ApiResponse::error(500, &err.to_string()),
    }
}

fn set_all<L: OutputLine, S: Storage>(device: &mut Device<L, S>, token: &str) -> ApiResponse {
    let on = match parse_state_token(token) {
        Ok(on) => on,
        Err(err) => {
            device.controller.record(
                EventLevel::Error,
                format!("Invalid state : {token} for all relays. Must be 1 or 0"),
            );
            return ApiResponse::error(400, &err.to_string());
        }
    };

    let failures = device.controller.set_all(on);
    if failures.is_empty() {
        return ApiResponse::ok(json!(format!("All relays set to {token}")));
    }

    let detail = failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    ApiResponse::error(
        500,
        &format!("Some relays were not set to {}: {detail}", on_off(on)),
    )
}
