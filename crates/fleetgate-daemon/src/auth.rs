//! Operator authentication: the provider contract plus the local
//! username/password provider.
//!
//! Resolution order is fixed by the contract: an `Authorization: Bearer`
//! header wins, otherwise the session cookie is consulted. Both paths
//! downscope the resolved user to the intersection of the credential's
//! scopes and the user's current scopes (see the users store).
//!
//! The OAuth2 login flows of the web UI are out of scope here; the local
//! provider answers JSON 401s instead of rendering login pages.

use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::header::{HeaderMap, AUTHORIZATION, COOKIE, SET_COOKIE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use fleetgate_core::auth::password_verify;
use fleetgate_core::fs::AuthConfig;
use fleetgate_core::store::users::{User, UserStore};
use fleetgate_core::store::StoreError;
use serde::Deserialize;
use tracing::warn;

use crate::error::ApiError;

/// Session cookie set on login.
pub const AUTH_COOKIE_NAME: &str = "fleetgate-session";

/// An authenticated web session: the resolved (downscoped) user plus the
/// opaque session id, so callers can invalidate it.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub user: User,
}

/// Resolves requests to users. `get_user` and `get_session` return
/// `Ok(None)` for anonymous or invalid credentials; the middleware decides
/// how to answer.
pub trait AuthProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bearer token first, session cookie second.
    fn get_user(&self, headers: &HeaderMap) -> Result<Option<User>, StoreError>;

    /// Session cookie only.
    fn get_session(&self, headers: &HeaderMap) -> Result<Option<Session>, StoreError>;

    /// Invalidates a session.
    fn drop_session(&self, session: &Session) -> Result<(), StoreError>;
}

fn bearer_token(headers: &HeaderMap) -> Result<Option<&str>, StoreError> {
    let Some(value) = headers.get(AUTHORIZATION) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| StoreError::Invalid("invalid authorization header".into()))?;
    let mut parts = value.splitn(2, ' ');
    match (parts.next(), parts.next()) {
        (Some(scheme), Some(token)) if scheme.eq_ignore_ascii_case("bearer") => Ok(Some(token)),
        _ => Err(StoreError::Invalid("invalid authorization header".into())),
    }
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    for value in headers.get_all(COOKIE) {
        let Ok(value) = value.to_str() else { continue };
        for pair in value.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            if parts.next() == Some(AUTH_COOKIE_NAME) {
                if let Some(v) = parts.next() {
                    if !v.is_empty() {
                        return Some(v.to_string());
                    }
                }
            }
        }
    }
    None
}

/// Username/password provider over the catalog's users table.
pub struct LocalProvider {
    users: Arc<UserStore>,
    session_timeout: chrono::Duration,
}

impl LocalProvider {
    #[must_use]
    pub fn new(users: Arc<UserStore>, config: &AuthConfig) -> Self {
        Self {
            users,
            session_timeout: chrono::Duration::hours(i64::from(
                config.session_timeout_hours(),
            )),
        }
    }

    /// Login/logout routes, mounted next to `/v1` on the operator server.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/auth/login", post(handle_login))
            .route("/auth/logout", post(handle_logout))
            .with_state(Arc::clone(self))
    }
}

impl AuthProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    fn get_user(&self, headers: &HeaderMap) -> Result<Option<User>, StoreError> {
        if let Some(token) = bearer_token(headers)? {
            // Tokens too short to carry the key-derivation salt are just
            // invalid credentials, not a server fault.
            return match self.users.get_by_token(token) {
                Err(StoreError::Invalid(_)) => Ok(None),
                other => other,
            };
        }
        Ok(self.get_session(headers)?.map(|s| s.user))
    }

    fn get_session(&self, headers: &HeaderMap) -> Result<Option<Session>, StoreError> {
        let Some(id) = session_cookie(headers) else {
            return Ok(None);
        };
        Ok(self
            .users
            .get_by_session(&id)?
            .map(|user| Session { id, user }))
    }

    fn drop_session(&self, session: &Session) -> Result<(), StoreError> {
        self.users.delete_session(&session.user, &session.id)
    }
}

#[derive(Debug, Deserialize)]
struct LoginReq {
    username: String,
    password: String,
}

async fn handle_login(
    State(provider): State<Arc<LocalProvider>>,
    connect: Option<ConnectInfo<std::net::SocketAddr>>,
    Json(req): Json<LoginReq>,
) -> Result<Response, ApiError> {
    let user = provider
        .users
        .get(&req.username)
        .map_err(|e| ApiError::internal(e, "Unable to look up user"))?;
    let Some(user) = user else {
        // Same answer for unknown users and bad passwords.
        return Err(ApiError::Forbidden("Invalid username or password".into()));
    };

    let ok = password_verify(&req.password, &user.password)
        .map_err(|e| ApiError::internal(e, "Internal error verifying password"))?;
    if !ok {
        return Err(ApiError::Forbidden("Invalid username or password".into()));
    }

    let remote_ip = connect
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let expires = chrono::Utc::now() + provider.session_timeout;
    let session_id = provider
        .users
        .create_session(&user, &remote_ip, expires.timestamp(), user.allowed_scopes)
        .map_err(|e| ApiError::internal(e, "Could not create user session"))?;

    let cookie = format!(
        "{AUTH_COOKIE_NAME}={session_id}; Path=/; Max-Age={}; HttpOnly; Secure; SameSite=Strict",
        provider.session_timeout.num_seconds()
    );
    let mut res = StatusCode::NO_CONTENT.into_response();
    match cookie.parse() {
        Ok(value) => {
            res.headers_mut().insert(SET_COOKIE, value);
        }
        Err(e) => return Err(ApiError::internal(e, "Could not encode session cookie")),
    }
    Ok(res)
}

async fn handle_logout(
    State(provider): State<Arc<LocalProvider>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let session = provider
        .get_session(&headers)
        .map_err(|e| ApiError::internal(e, "Unable to look up session"))?
        .ok_or(ApiError::Unauthorized)?;
    if let Err(e) = provider.drop_session(&session) {
        warn!(error = %e, "unable to delete session from storage");
    }

    let mut res = StatusCode::NO_CONTENT.into_response();
    let clear = format!("{AUTH_COOKIE_NAME}=; Path=/; Max-Age=0; HttpOnly; Secure");
    if let Ok(value) = clear.parse() {
        res.headers_mut().insert(SET_COOKIE, value);
    }
    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_header_parsing() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).unwrap().is_none());

        headers.insert(AUTHORIZATION, "Bearer abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap(), Some("abc123"));

        headers.insert(AUTHORIZATION, "bearer xyz".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap(), Some("xyz"));

        headers.insert(AUTHORIZATION, "Basic abc".parse().unwrap());
        assert!(bearer_token(&headers).is_err());
    }

    #[test]
    fn session_cookie_extraction() {
        let mut headers = HeaderMap::new();
        assert!(session_cookie(&headers).is_none());

        headers.insert(
            COOKIE,
            format!("other=1; {AUTH_COOKIE_NAME}=sess-id; theme=dark")
                .parse()
                .unwrap(),
        );
        assert_eq!(session_cookie(&headers).unwrap(), "sess-id");
    }
}
