//! Operator API under `/v1`.
//!
//! Middleware chain: request context → user auth (bearer token or session
//! cookie) → per-route scope gate. The `/updates/:prod` subtree also runs
//! parameter validation, which parses the branch selector and regex-checks
//! every present path parameter; violations answer 404 so unauthorized
//! probing cannot distinguish "malformed" from "absent".

mod devices;
mod rollouts;
mod tail;

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use axum::extract::{RawPathParams, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, put};
use axum::Router;
use fleetgate_core::scopes::{
    Scopes, SCOPE_DEVICES_D, SCOPE_DEVICES_R, SCOPE_DEVICES_RU, SCOPE_UPDATES_R,
    SCOPE_UPDATES_RU,
};
use fleetgate_core::store::operator::OperatorStore;
use fleetgate_core::store::users::User;
use regex::Regex;

use crate::auth::AuthProvider;
use crate::error::ApiError;
use crate::middleware::request_context;

/// Default interval between keepalive frames on idle SSE connections.
pub const KEEPALIVE_RESPONSE_INTERVAL: Duration = Duration::from_secs(10);

/// The authenticated (already downscoped) operator.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub Arc<User>);

/// Branch selector parsed from the `:prod` path parameter.
#[derive(Debug, Clone, Copy)]
pub struct IsProd(pub bool);

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<OperatorStore>,
    pub provider: Arc<dyn AuthProvider>,
    pub keepalive_interval: Duration,
}

impl ApiState {
    #[must_use]
    pub fn new(store: Arc<OperatorStore>, provider: Arc<dyn AuthProvider>) -> Self {
        Self {
            store,
            provider,
            keepalive_interval: KEEPALIVE_RESPONSE_INTERVAL,
        }
    }

    /// Test servers shrink the keepalive interval to observe frames.
    #[must_use]
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }
}

/// Builds the `/v1` router (plus the request-context layer). The auth
/// provider's own routes (`/auth/login`, ...) are mounted by the caller.
pub fn router(state: ApiState) -> Router {
    // validate_update_params must be a route layer: router-level layers run
    // before path matching, when the nested captures are not yet available.
    let updates = Router::new()
        .route(
            "/",
            get(rollouts::update_list)
                .route_layer(axum::middleware::from_fn_with_state(SCOPE_UPDATES_R, require_scope))
                .route_layer(axum::middleware::from_fn(validate_update_params)),
        )
        .route(
            "/:tag",
            get(rollouts::update_list_tag)
                .route_layer(axum::middleware::from_fn_with_state(SCOPE_UPDATES_R, require_scope))
                .route_layer(axum::middleware::from_fn(validate_update_params)),
        )
        .route(
            "/:tag/:update/tuf",
            get(rollouts::update_get_tuf)
                .route_layer(axum::middleware::from_fn_with_state(SCOPE_UPDATES_R, require_scope))
                .route_layer(axum::middleware::from_fn(validate_update_params)),
        )
        .route(
            "/:tag/:update/rollouts",
            get(rollouts::rollout_list)
                .route_layer(axum::middleware::from_fn_with_state(SCOPE_UPDATES_R, require_scope))
                .route_layer(axum::middleware::from_fn(validate_update_params)),
        )
        .route(
            "/:tag/:update/rollouts/:rollout",
            get(rollouts::rollout_get)
                .route_layer(axum::middleware::from_fn_with_state(SCOPE_UPDATES_R, require_scope))
                .route_layer(axum::middleware::from_fn(validate_update_params)),
        )
        .route(
            "/:tag/:update/rollouts/:rollout",
            put(rollouts::rollout_put)
                .route_layer(axum::middleware::from_fn_with_state(SCOPE_UPDATES_RU, require_scope))
                .route_layer(axum::middleware::from_fn(validate_update_params)),
        )
        .route(
            "/:tag/:update/rollouts/:rollout/tail",
            get(tail::rollout_tail)
                .route_layer(axum::middleware::from_fn_with_state(SCOPE_UPDATES_R, require_scope))
                .route_layer(axum::middleware::from_fn(validate_update_params)),
        )
        .route(
            "/:tag/:update/tail",
            get(tail::update_tail)
                .route_layer(axum::middleware::from_fn_with_state(SCOPE_UPDATES_R, require_scope))
                .route_layer(axum::middleware::from_fn(validate_update_params)),
        );

    let v1 = Router::new()
        .route(
            "/devices",
            get(devices::device_list).route_layer(axum::middleware::from_fn_with_state(SCOPE_DEVICES_R, require_scope)),
        )
        .route(
            "/devices/:uuid",
            get(devices::device_get).route_layer(axum::middleware::from_fn_with_state(SCOPE_DEVICES_R, require_scope)),
        )
        .route(
            "/devices/:uuid",
            delete(devices::device_delete).route_layer(axum::middleware::from_fn_with_state(SCOPE_DEVICES_D, require_scope)),
        )
        .route(
            "/devices/:uuid/apps-states",
            get(devices::device_apps_states_get).route_layer(axum::middleware::from_fn_with_state(SCOPE_DEVICES_R, require_scope)),
        )
        .route(
            "/devices/:uuid/updates",
            get(devices::device_updates_list).route_layer(axum::middleware::from_fn_with_state(SCOPE_DEVICES_R, require_scope)),
        )
        .route(
            "/devices/:uuid/updates/:id",
            get(devices::device_updates_get).route_layer(axum::middleware::from_fn_with_state(SCOPE_DEVICES_R, require_scope)),
        )
        .route(
            "/devices/:uuid/labels",
            patch(devices::device_labels_patch).route_layer(axum::middleware::from_fn_with_state(SCOPE_DEVICES_RU, require_scope)),
        )
        .route(
            "/devices/:uuid/labels",
            put(devices::device_labels_put).route_layer(axum::middleware::from_fn_with_state(SCOPE_DEVICES_RU, require_scope)),
        )
        .route(
            "/known-labels/devices",
            get(devices::device_known_labels_get).route_layer(axum::middleware::from_fn_with_state(SCOPE_DEVICES_R, require_scope)),
        )
        .route(
            "/known-labels/device-groups",
            get(devices::device_known_groups_get).route_layer(axum::middleware::from_fn_with_state(SCOPE_DEVICES_R, require_scope)),
        )
        .nest("/updates/:prod", updates)
        .layer(axum::middleware::from_fn_with_state(state.clone(), auth_user));

    Router::new()
        .nest("/v1", v1)
        .fallback(crate::middleware::not_found)
        .layer(axum::middleware::from_fn(request_context))
        .with_state(state)
}

/// 403 unless the resolved user holds at least one of the covering scopes.
async fn require_scope(
    State(required): State<Scopes>,
    req: Request,
    next: Next,
) -> Response {
    let Some(CurrentUser(user)) = req.extensions().get::<CurrentUser>() else {
        return ApiError::Internal("user context missing".into()).into_response();
    };
    if !user.allowed_scopes.has(required) {
        return ApiError::Forbidden(format!("user missing required scope: {required}"))
            .into_response();
    }
    next.run(req).await
}

/// Resolves the operator via the auth provider; anonymous requests get a
/// 401 before any handler runs.
async fn auth_user(State(state): State<ApiState>, mut req: Request, next: Next) -> Response {
    match state.provider.get_user(req.headers()) {
        Ok(Some(user)) => {
            req.extensions_mut().insert(CurrentUser(Arc::new(user)));
            next.run(req).await
        }
        Ok(None) => ApiError::Unauthorized.into_response(),
        // Malformed credentials (a bad Authorization header) are the
        // caller's problem, not ours.
        Err(fleetgate_core::store::StoreError::Invalid(_)) => {
            ApiError::Unauthorized.into_response()
        }
        Err(e) => ApiError::internal(e, "Could not resolve user").into_response(),
    }
}

static VALID_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_\-\.\+]+$").expect("hard-coded pattern must compile"));
static VALID_UPDATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_\-\.]+$").expect("hard-coded pattern must compile"));

/// Parses `:prod` into [`IsProd`] and regex-validates each present path
/// parameter. Violations are 404 by design.
async fn validate_update_params(
    params: RawPathParams,
    mut req: Request,
    next: Next,
) -> Response {
    let mut is_prod = None;
    for (name, value) in &params {
        let ok = match name {
            "prod" => {
                is_prod = match value {
                    "prod" => Some(true),
                    "ci" => Some(false),
                    _ => return ApiError::NotFound.into_response(),
                };
                true
            }
            "tag" => VALID_TAG.is_match(value),
            "update" | "rollout" => VALID_UPDATE.is_match(value),
            _ => true,
        };
        if !ok {
            return ApiError::NotFound.into_response();
        }
    }
    let Some(is_prod) = is_prod else {
        return ApiError::NotFound.into_response();
    };
    req.extensions_mut().insert(IsProd(is_prod));
    next.run(req).await
}
