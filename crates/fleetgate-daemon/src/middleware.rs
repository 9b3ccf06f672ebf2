//! Request-scoped plumbing shared by both servers: a per-request id echoed
//! in `X-Request-ID`, a tracing span carrying it, and response logging.
//! Error bodies are rewritten to append the request id so operators can
//! correlate a failure report with the log line.

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{error, info, info_span, Instrument};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request ids are short random strings rather than uuids; 12 alphanumeric
/// characters are plenty for log correlation.
const REQUEST_ID_LEN: usize = 12;

fn random_request_id() -> String {
    let rng = rand::thread_rng();
    rng.sample_iter(&Alphanumeric)
        .take(REQUEST_ID_LEN)
        .map(char::from)
        .collect()
}

/// Outer middleware of both routers.
pub async fn request_context(req: Request, next: Next) -> Response {
    let rid = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(random_request_id);
    let method = req.method().clone();
    let uri = req.uri().to_string();

    let span = info_span!("request", req_id = %rid, uri = %uri);
    async move {
        let res = next.run(req).await;
        let status = res.status();
        if status.is_client_error() || status.is_server_error() {
            error!(method = %method, status = status.as_u16(), "response");
        } else {
            info!(method = %method, status = status.as_u16(), "response");
        }
        finalize_response(res, &rid).await
    }
    .instrument(span)
    .await
}

/// Echoes the request id and, for error statuses, appends it to the body
/// so the id reaches the user even when only the body is kept.
async fn finalize_response(res: Response, rid: &str) -> Response {
    let status = res.status();
    let mut res = if status.is_client_error() || status.is_server_error() {
        rewrite_error_body(res, rid).await
    } else {
        res
    };
    if let Ok(value) = HeaderValue::from_str(rid) {
        res.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    res
}

async fn rewrite_error_body(res: Response, rid: &str) -> Response {
    let (mut parts, body) = res.into_parts();
    // Error bodies are short messages; anything oversized passes through
    // untouched.
    let bytes = match axum::body::to_bytes(body, 64 * 1024).await {
        Ok(bytes) => bytes,
        Err(_) => return Response::from_parts(parts, Body::empty()),
    };
    let message = String::from_utf8_lossy(&bytes);
    let message = message.trim_end();
    let body = if message.is_empty() {
        format!("request-id: {rid}\n")
    } else {
        format!("{message} (request-id: {rid})\n")
    };
    parts
        .headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    parts.headers.remove(axum::http::header::CONTENT_LENGTH);
    Response::from_parts(parts, Body::from(body))
}

/// 404 fallback used by both routers.
pub async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}
