//! Device gateway HTTP surface.
//!
//! Every request on this server arrives over mTLS; the accept loop stashes
//! the peer's certificate identity in the request extensions as
//! [`PeerIdentity`]. The auth middleware turns that into a catalog row
//! (creating it on first contact), and the check-in middleware folds the
//! `x-ats-*` inventory headers into the row before any handler runs.

mod handlers;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::Router;
use fleetgate_core::store::gateway::{CheckIn, Device, GatewayStore};
use tracing::{error, info};

use crate::error::ApiError;
use crate::middleware::request_context;

/// Identity extracted from the first peer certificate at accept time.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    /// Certificate CN; the device uuid.
    pub uuid: String,
    /// True when the `businessCategory` RDN equals `"production"`.
    pub is_prod: bool,
    /// PEM-encoded SubjectPublicKeyInfo.
    pub pubkey_pem: String,
}

/// The authenticated device, placed in request extensions after check-in.
#[derive(Debug, Clone)]
pub struct CurrentDevice(pub Device);

#[derive(Clone)]
pub struct GatewayState {
    pub store: Arc<GatewayStore>,
}

/// Builds the gateway router with its middleware chain: request context,
/// device auth, check-in, then the handlers.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/device", get(handlers::device_get))
        .route("/events", post(handlers::events_upload))
        .route("/apps-states", post(handlers::apps_states_info))
        .route("/system_info", put(handlers::hardware_info))
        .route("/system_info/config", put(handlers::aktoml_info))
        .route("/system_info/network", put(handlers::network_info))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            checkin_device,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_device,
        ))
        .layer(axum::middleware::from_fn(request_context))
        .fallback(crate::middleware::not_found)
        .with_state(state)
}

/// Resolves the peer certificate to a device row, creating one on first
/// check-in. Deleted devices are refused; a changed public key fails
/// loudly because rotation is not implemented.
async fn auth_device(
    State(state): State<GatewayState>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(identity) = req.extensions().get::<PeerIdentity>().cloned() else {
        return ApiError::Forbidden("client certificate required".into()).into_response();
    };

    let device = match state.store.device_get(&identity.uuid) {
        Ok(device) => device,
        Err(e) => {
            return ApiError::internal(e, "Unable to query for device").into_response();
        }
    };

    let device = match device {
        Some(device) if device.deleted => {
            return ApiError::Forbidden(format!(
                "Device({}) has been deleted",
                identity.uuid
            ))
            .into_response();
        }
        Some(device) => {
            if device.pubkey != identity.pubkey_pem {
                // Key rotation is deliberately unimplemented; refuse the
                // connection unmissably instead of accepting a key we
                // cannot vouch for.
                error!(device = %identity.uuid, "device presented a new public key; rotation is not implemented");
                return ApiError::Internal(
                    "device public key rotation is not implemented".into(),
                )
                .into_response();
            }
            device
        }
        None => {
            match state
                .store
                .device_create(&identity.uuid, &identity.pubkey_pem, identity.is_prod)
            {
                Ok(device) => {
                    info!(device = %identity.uuid, is_prod = identity.is_prod, "created device");
                    device
                }
                Err(e) => {
                    return ApiError::internal(e, "Unable to create device").into_response();
                }
            }
        }
    };

    req.extensions_mut().insert(CurrentDevice(device));
    next.run(req).await
}

/// Folds the `x-ats-*` inventory headers into the device row. Headers that
/// are absent leave their columns untouched; unchanged inventory inside
/// the dedup window skips the catalog entirely.
async fn checkin_device(
    State(state): State<GatewayState>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(CurrentDevice(mut device)) = req.extensions().get::<CurrentDevice>().cloned()
    else {
        return ApiError::Internal("device context missing".into()).into_response();
    };

    let update = check_in_from_headers(req.headers());
    if let Err(e) = state.store.device_check_in(&mut device, update) {
        return ApiError::internal(e, "Unable to check in device").into_response();
    }
    req.extensions_mut().insert(CurrentDevice(device));
    next.run(req).await
}

fn check_in_from_headers(headers: &HeaderMap) -> CheckIn {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    };
    CheckIn {
        tag: get("x-ats-tags"),
        target_name: get("x-ats-target"),
        ostree_hash: get("x-ats-ostreehash"),
        apps: get("x-ats-dockerapps"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_map_onto_check_in_fields() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ats-tags", "tag1".parse().unwrap());
        headers.insert("x-ats-dockerapps", "a,b,c".parse().unwrap());

        let update = check_in_from_headers(&headers);
        assert_eq!(update.tag.as_deref(), Some("tag1"));
        assert_eq!(update.apps.as_deref(), Some("a,b,c"));
        assert!(update.target_name.is_none());
        assert!(update.ostree_hash.is_none());
    }
}
