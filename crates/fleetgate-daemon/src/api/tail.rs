//! Server-sent-event tailers over `logs/rollouts.log`.
//!
//! Each connection follows the growing log file, assigning ascending
//! 1-based event ids (line N has id N) so clients resume with
//! `Last-Event-ID`. Idle connections receive comment-only keepalive
//! frames. When no rollout has produced a log yet, a single synthetic
//! `error` event (id 0, retry 1000) is sent and the stream ends.

use std::convert::Infallible;

use axum::extract::{Extension, Path, State};
use axum::http::header::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use super::{ApiState, IsProd};
use crate::error::ApiError;

const NO_LOGS_MESSAGE: &str = "No rollout logs for this update yet.";
const KEEPALIVE_TEXT: &str = "keepalive";

pub(super) async fn update_tail(
    State(state): State<ApiState>,
    Extension(IsProd(is_prod)): Extension<IsProd>,
    Path((_prod, tag, update)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    tail_response(&state, &tag, &update, is_prod, &headers)
}

/// The per-rollout tail follows the same per-update feed; the rollout
/// name is validated by the middleware and scopes the client's view, not
/// the file.
pub(super) async fn rollout_tail(
    State(state): State<ApiState>,
    Extension(IsProd(is_prod)): Extension<IsProd>,
    Path((_prod, tag, update, _rollout)): Path<(String, String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    tail_response(&state, &tag, &update, is_prod, &headers)
}

fn tail_response(
    state: &ApiState,
    tag: &str,
    update: &str,
    is_prod: bool,
    headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    if !state.store.rollout_log_exists(tag, update, is_prod) {
        let event = Event::default()
            .event("error")
            .id("0")
            .retry(std::time::Duration::from_millis(1000))
            .data(NO_LOGS_MESSAGE);
        let stream = futures::stream::iter([Ok::<_, Infallible>(event)]);
        return Ok(Sse::new(stream).into_response());
    }

    let rx = state
        .store
        .tail_rollouts_log(tag, update, is_prod)
        .map_err(|e| ApiError::internal(e, "Failed to tail rollout logs"))?;

    // Number lines as they stream by; resumption skips ids the client
    // already saw. A read error ends the stream, closing the connection.
    let stream = ReceiverStream::new(rx)
        .scan(0u64, move |next_id, line| {
            let item = match line {
                Ok(line) => {
                    *next_id += 1;
                    if *next_id <= last_event_id {
                        Some(None)
                    } else {
                        Some(Some(
                            Event::default()
                                .event("log")
                                .id(next_id.to_string())
                                .data(line),
                        ))
                    }
                }
                Err(_) => None,
            };
            futures::future::ready(item)
        })
        .filter_map(|item| futures::future::ready(item.map(Ok::<_, Infallible>)));

    Ok(Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(state.keepalive_interval)
                .text(KEEPALIVE_TEXT),
        )
        .into_response())
}
