//! Update browsing and the two-phase rollout protocol.

use std::collections::BTreeMap;

use axum::body::Bytes;
use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::Json;
use fleetgate_core::store::operator::Rollout;

use super::{ApiState, IsProd};
use crate::error::ApiError;

pub(super) async fn update_list(
    State(state): State<ApiState>,
    Extension(IsProd(is_prod)): Extension<IsProd>,
) -> Result<Json<BTreeMap<String, Vec<String>>>, ApiError> {
    list_updates(&state, "", is_prod).map(Json)
}

pub(super) async fn update_list_tag(
    State(state): State<ApiState>,
    Extension(IsProd(is_prod)): Extension<IsProd>,
    Path((_prod, tag)): Path<(String, String)>,
) -> Result<Json<BTreeMap<String, Vec<String>>>, ApiError> {
    list_updates(&state, &tag, is_prod).map(Json)
}

fn list_updates(
    state: &ApiState,
    tag: &str,
    is_prod: bool,
) -> Result<BTreeMap<String, Vec<String>>, ApiError> {
    state
        .store
        .list_updates(tag, is_prod)
        .map_err(|e| ApiError::internal(e, "Failed to look up updates"))
}

pub(super) async fn update_get_tuf(
    State(state): State<ApiState>,
    Extension(IsProd(is_prod)): Extension<IsProd>,
    Path((_prod, tag, update)): Path<(String, String, String)>,
) -> Result<Json<BTreeMap<String, serde_json::Value>>, ApiError> {
    let metas = state
        .store
        .update_tuf_metadata(&tag, &update, is_prod)
        .map_err(|e| ApiError::internal(e, "failed to get update TUF metadata"))?;
    Ok(Json(metas))
}

pub(super) async fn rollout_list(
    State(state): State<ApiState>,
    Extension(IsProd(is_prod)): Extension<IsProd>,
    Path((_prod, tag, update)): Path<(String, String, String)>,
) -> Result<Json<Vec<String>>, ApiError> {
    let rollouts = state
        .store
        .list_rollouts(&tag, &update, is_prod)
        .map_err(|e| ApiError::internal(e, "Failed to look up update rollouts"))?;
    Ok(Json(rollouts))
}

pub(super) async fn rollout_get(
    State(state): State<ApiState>,
    Extension(IsProd(is_prod)): Extension<IsProd>,
    Path((_prod, tag, update, rollout)): Path<(String, String, String, String)>,
) -> Result<Json<Rollout>, ApiError> {
    let body = state
        .store
        .get_rollout(&tag, &update, &rollout, is_prod)
        .map_err(|e| ApiError::from_store(e, "Failed to look up update rollout"))?;
    Ok(Json(body))
}

/// `PUT .../rollouts/:rollout` is the write path of the rollout state
/// machine:
///
/// 1. request validation (shape, update exists, rollout is new);
/// 2. Phase A: journal the intent, write the rollout file uncommitted;
/// 3. Phase B: bulk catalog update returning the effective uuids, then
///    rewrite the file with `committed=true`.
///
/// A crash between the phases is recovered by the rollout watchdog, which
/// replays journaled intents. Phase B is idempotent, so replays converge.
pub(super) async fn rollout_put(
    State(state): State<ApiState>,
    Extension(IsProd(is_prod)): Extension<IsProd>,
    Path((_prod, tag, update, rollout)): Path<(String, String, String, String)>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let req: Rollout = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Bad JSON body: {e}")))?;
    if req.uuids.is_empty() && req.groups.is_empty() {
        return Err(ApiError::BadRequest(
            "Either uuids or groups must be set".into(),
        ));
    }
    if !req.effective_uuids.is_empty() {
        return Err(ApiError::BadRequest("Effective uuids are readonly".into()));
    }

    // The update must have been staged on disk already.
    let updates = list_updates(&state, &tag, is_prod)?;
    let update_exists = updates
        .get(&tag)
        .is_some_and(|names| names.iter().any(|name| *name == update));
    if !update_exists {
        return Err(ApiError::NotFound);
    }

    if state.store.rollout_exists(&tag, &update, &rollout, is_prod) {
        return Err(ApiError::Conflict(
            "Rollout with this name already exists".into(),
        ));
    }

    state
        .store
        .create_rollout(&tag, &update, &rollout, is_prod, &req)
        .map_err(|e| ApiError::internal(e, "Failed to save rollout to disk"))?;
    state
        .store
        .commit_rollout(&tag, &update, &rollout, is_prod, req)
        .map_err(|e| ApiError::internal(e, "Failed to update devices for rollout"))?;

    Ok(StatusCode::ACCEPTED)
}
