//! Device handlers: listing, readback, soft delete, update history, and
//! label patching.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use fleetgate_core::events::DeviceUpdateEvent;
use fleetgate_core::store::operator::{Device, DeviceListItem, DeviceListOpts};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::ApiState;
use crate::error::ApiError;

const LABEL_CONFLICT_MSG: &str = "A device with the same 'name' label value already exists";

pub(super) async fn device_list(
    State(state): State<ApiState>,
    Query(opts): Query<DeviceListOpts>,
) -> Result<Json<Vec<DeviceListItem>>, ApiError> {
    let devices = state.store.devices_list(&opts).map_err(|e| match e {
        fleetgate_core::store::StoreError::Invalid(msg) => ApiError::BadRequest(msg),
        e => ApiError::internal(e, "Unexpected error listing devices"),
    })?;
    Ok(Json(devices))
}

fn lookup_device(state: &ApiState, uuid: &str) -> Result<Device, ApiError> {
    state
        .store
        .device_get(uuid)
        .map_err(|e| ApiError::internal(e, "Failed to lookup device"))?
        .ok_or(ApiError::NotFound)
}

pub(super) async fn device_get(
    State(state): State<ApiState>,
    Path(uuid): Path<String>,
) -> Result<Json<Device>, ApiError> {
    Ok(Json(lookup_device(&state, &uuid)?))
}

pub(super) async fn device_delete(
    State(state): State<ApiState>,
    Path(uuid): Path<String>,
) -> Result<StatusCode, ApiError> {
    let deleted = state
        .store
        .device_delete(&uuid)
        .map_err(|e| ApiError::internal(e, "Failed to delete device"))?;
    if deleted {
        Ok(StatusCode::OK)
    } else {
        Err(ApiError::NotFound)
    }
}

pub(super) async fn device_updates_list(
    State(state): State<ApiState>,
    Path(uuid): Path<String>,
) -> Result<Json<Vec<String>>, ApiError> {
    lookup_device(&state, &uuid)?;
    let updates = state
        .store
        .device_updates(&uuid)
        .map_err(|e| ApiError::internal(e, "Failed to lookup device updates"))?;
    Ok(Json(updates))
}

pub(super) async fn device_updates_get(
    State(state): State<ApiState>,
    Path((uuid, update_id)): Path<(String, String)>,
) -> Result<Json<Vec<DeviceUpdateEvent>>, ApiError> {
    lookup_device(&state, &uuid)?;
    let events = state
        .store
        .device_events(&uuid, &update_id)
        .map_err(|e| ApiError::internal(e, "Failed to lookup device update events"))?;
    if events.is_empty() {
        return Err(ApiError::NotFound);
    }
    Ok(Json(events))
}

#[derive(Debug, Serialize)]
pub(super) struct AppsStatesResp {
    pub apps_states: Vec<serde_json::Value>,
}

pub(super) async fn device_apps_states_get(
    State(state): State<ApiState>,
    Path(uuid): Path<String>,
) -> Result<Json<AppsStatesResp>, ApiError> {
    lookup_device(&state, &uuid)?;
    let apps_states = state
        .store
        .device_apps_states(&uuid)
        .map_err(|e| ApiError::internal(e, "Failed to lookup device apps states"))?;
    Ok(Json(AppsStatesResp { apps_states }))
}

/// `name` and `group` always lead the known-labels answer; everything else
/// follows in catalog order.
const STANDARD_LABELS: [&str; 2] = ["name", "group"];

pub(super) async fn device_known_labels_get(
    State(state): State<ApiState>,
) -> Result<Json<Vec<String>>, ApiError> {
    let known = state
        .store
        .known_device_label_names()
        .map_err(|e| ApiError::internal(e, "Failed to lookup known device labels"))?;
    let mut labels: Vec<String> = STANDARD_LABELS.iter().map(ToString::to_string).collect();
    labels.extend(known.into_iter().filter(|l| !STANDARD_LABELS.contains(&l.as_str())));
    Ok(Json(labels))
}

pub(super) async fn device_known_groups_get(
    State(state): State<ApiState>,
) -> Result<Json<Vec<String>>, ApiError> {
    let groups = state
        .store
        .known_device_group_names()
        .map_err(|e| ApiError::internal(e, "Failed to lookup known device groups"))?;
    Ok(Json(groups))
}

/// `PATCH /devices/:uuid/labels` body: explicit upserts and deletes.
#[derive(Debug, Default, Deserialize)]
pub(super) struct LabelsReq {
    #[serde(default, alias = "Upserts")]
    upserts: BTreeMap<String, String>,
    #[serde(default, alias = "Deletes")]
    deletes: Vec<String>,
}

/// `PUT /devices/:uuid/labels` body: the full desired label set.
type LabelsPutReq = BTreeMap<String, Option<String>>;

pub(super) async fn device_labels_patch(
    State(state): State<ApiState>,
    Path(uuid): Path<String>,
    Json(req): Json<LabelsReq>,
) -> Result<StatusCode, ApiError> {
    let device = lookup_device(&state, &uuid)?;
    let labels = parse_labels(req)?;
    state
        .store
        .patch_device_labels(&labels, &[device.item.uuid])
        .map_err(|e| ApiError::from_store(e, LABEL_CONFLICT_MSG))?;
    Ok(StatusCode::OK)
}

pub(super) async fn device_labels_put(
    State(state): State<ApiState>,
    Path(uuid): Path<String>,
    Json(mut labels): Json<LabelsPutReq>,
) -> Result<StatusCode, ApiError> {
    let device = lookup_device(&state, &uuid)?;
    validate_labels(&labels)?;

    // Replace semantics: any currently-set label missing from the request
    // is deleted via an explicit null in the merge-patch.
    for key in device.item.labels.keys() {
        labels.entry(key.clone()).or_insert(None);
    }

    state
        .store
        .patch_device_labels(&labels, &[device.item.uuid])
        .map_err(|e| ApiError::from_store(e, LABEL_CONFLICT_MSG))?;
    Ok(StatusCode::OK)
}

// Together with the catalog's cap on the labels document size, these
// limits keep at least a couple dozen labels per device possible.
const MAX_LABEL_NAME: usize = 20;
const MAX_LABEL_VALUE: usize = 60;

// Label names are lowercase only; label values are case-sensitive.
static VALID_LABEL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_\-\.]+$").expect("hard-coded pattern must compile"));
static VALID_LABEL_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_\-\.]+$").expect("hard-coded pattern must compile"));

fn parse_labels(req: LabelsReq) -> Result<BTreeMap<String, Option<String>>, ApiError> {
    if req.upserts.is_empty() && req.deletes.is_empty() {
        return Err(ApiError::BadRequest(
            "at least one label change must be requested".into(),
        ));
    }
    let mut labels: BTreeMap<String, Option<String>> = req
        .upserts
        .into_iter()
        .map(|(k, v)| (k, Some(v)))
        .collect();
    for key in req.deletes {
        if labels.contains_key(&key) {
            return Err(ApiError::BadRequest(format!(
                "a label {key} cannot be both updated and deleted at once"
            )));
        }
        labels.insert(key, None);
    }
    validate_labels(&labels)?;
    Ok(labels)
}

fn validate_labels(labels: &BTreeMap<String, Option<String>>) -> Result<(), ApiError> {
    for (name, value) in labels {
        if name.len() > MAX_LABEL_NAME {
            return Err(ApiError::BadRequest(format!(
                "label {name} exceeds maximum label name limit {MAX_LABEL_NAME}"
            )));
        }
        if !VALID_LABEL_NAME.is_match(name) {
            return Err(ApiError::BadRequest(format!(
                "label {name} name must match a given regexp: ^[a-z0-9_\\-.]+$"
            )));
        }
        if let Some(value) = value {
            if value.len() > MAX_LABEL_VALUE {
                return Err(ApiError::BadRequest(format!(
                    "label {name} exceeds maximum label value limit {MAX_LABEL_VALUE}"
                )));
            }
            if !VALID_LABEL_VALUE.is_match(value) {
                return Err(ApiError::BadRequest(format!(
                    "label {name} value must match a given regexp: ^[A-Za-z0-9_\\-.]+$"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_labels_requires_some_change() {
        assert!(parse_labels(LabelsReq::default()).is_err());
    }

    #[test]
    fn parse_labels_rejects_update_and_delete_of_same_key() {
        let req = LabelsReq {
            upserts: BTreeMap::from([("name".to_string(), "x".to_string())]),
            deletes: vec!["name".to_string()],
        };
        assert!(parse_labels(req).is_err());
    }

    #[test]
    fn label_validation_limits() {
        let too_long_name = "x".repeat(MAX_LABEL_NAME + 1);
        let labels = BTreeMap::from([(too_long_name, Some("v".to_string()))]);
        assert!(validate_labels(&labels).is_err());

        let labels = BTreeMap::from([(
            "name".to_string(),
            Some("y".repeat(MAX_LABEL_VALUE + 1)),
        )]);
        assert!(validate_labels(&labels).is_err());

        let labels = BTreeMap::from([("UPPER".to_string(), Some("v".to_string()))]);
        assert!(validate_labels(&labels).is_err());

        let labels = BTreeMap::from([("name".to_string(), Some("bad value".to_string()))]);
        assert!(validate_labels(&labels).is_err());

        let labels = BTreeMap::from([("name".to_string(), Some("Good.Value-1".to_string()))]);
        assert!(validate_labels(&labels).is_ok());
    }
}
