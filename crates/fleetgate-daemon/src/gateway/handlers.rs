//! Gateway handlers: check-in readback, event upload, apps-state
//! snapshots, and inventory replacement.

use axum::body::Bytes;
use axum::extract::{Extension, State};
use axum::Json;
use fleetgate_core::events::{AppsStates, DeviceUpdateEvent, NetworkInfo};
use fleetgate_core::fs::{AKTOML_FILE, HW_INFO_FILE, NET_INFO_FILE};
use fleetgate_core::store::gateway::{sanitize_events, Device};

use super::{CurrentDevice, GatewayState};
use crate::error::ApiError;

/// `GET /device`. The check-in already ran in the middleware; this just
/// returns the merged row.
pub(super) async fn device_get(
    Extension(CurrentDevice(device)): Extension<CurrentDevice>,
) -> Json<Device> {
    Json(device)
}

fn utf8_body(body: &Bytes) -> Result<&str, ApiError> {
    std::str::from_utf8(body).map_err(|_| ApiError::BadRequest("Body must be UTF-8".into()))
}

/// `POST /events` accepts a batch of update events. Validation is
/// non-fatal: as long as the body is well-formed JSON, unidentifiable
/// events are dropped with a warning and the upload still succeeds.
pub(super) async fn events_upload(
    State(state): State<GatewayState>,
    Extension(CurrentDevice(device)): Extension<CurrentDevice>,
    body: Bytes,
) -> Result<String, ApiError> {
    let events: Vec<DeviceUpdateEvent> = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Bad JSON body: {e}")))?;

    let valid = sanitize_events(events);
    if valid.is_empty() {
        // Zero valid events is still a successful upload.
        return Ok(String::new());
    }
    state
        .store
        .process_events(&device, &valid)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to save events"))?;
    Ok(String::new())
}

/// `POST /apps-states`: timestamped snapshot of the device's app state.
/// The body must parse and carry an RFC3339 `deviceTime`; the raw payload
/// is what gets stored.
pub(super) async fn apps_states_info(
    State(state): State<GatewayState>,
    Extension(CurrentDevice(device)): Extension<CurrentDevice>,
    body: Bytes,
) -> Result<String, ApiError> {
    let raw = utf8_body(&body)?;
    let states: AppsStates = serde_json::from_str(raw)
        .map_err(|e| ApiError::BadRequest(format!("Bad JSON body: {e}")))?;
    if chrono::DateTime::parse_from_rfc3339(&states.device_time).is_err() {
        return Err(ApiError::BadRequest(
            "deviceTime must be a valid RFC3339 datetime".into(),
        ));
    }
    state
        .store
        .save_apps_states(&device, raw)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to save apps states"))?;
    Ok(String::new())
}

/// `PUT /system_info` replaces `hardware-info` with the raw JSON body.
pub(super) async fn hardware_info(
    State(state): State<GatewayState>,
    Extension(CurrentDevice(device)): Extension<CurrentDevice>,
    body: Bytes,
) -> Result<String, ApiError> {
    let raw = utf8_body(&body)?;
    serde_json::from_str::<serde_json::Value>(raw)
        .map_err(|e| ApiError::BadRequest(format!("Bad JSON body: {e}")))?;
    state
        .store
        .put_file(&device, HW_INFO_FILE, raw)
        .map_err(|e| ApiError::internal(e, "Failed to save hardware info"))?;
    Ok(String::new())
}

/// `PUT /system_info/config` replaces `aktoml` with the raw TOML text.
pub(super) async fn aktoml_info(
    State(state): State<GatewayState>,
    Extension(CurrentDevice(device)): Extension<CurrentDevice>,
    body: Bytes,
) -> Result<String, ApiError> {
    let raw = utf8_body(&body)?;
    state
        .store
        .put_file(&device, AKTOML_FILE, raw)
        .map_err(|e| ApiError::internal(e, "Failed to save device config"))?;
    Ok(String::new())
}

/// `PUT /system_info/network` replaces `network-info`; the body must
/// parse as the expected string fields.
pub(super) async fn network_info(
    State(state): State<GatewayState>,
    Extension(CurrentDevice(device)): Extension<CurrentDevice>,
    body: Bytes,
) -> Result<String, ApiError> {
    let raw = utf8_body(&body)?;
    serde_json::from_str::<NetworkInfo>(raw)
        .map_err(|e| ApiError::BadRequest(format!("Bad JSON body: {e}")))?;
    state
        .store
        .put_file(&device, NET_INFO_FILE, raw)
        .map_err(|e| ApiError::internal(e, "Failed to save network info"))?;
    Ok(String::new())
}
