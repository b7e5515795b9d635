//! HTTP surface: the provider push webhook and the user-facing watch actions.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::classifier::Classifier;
use crate::db::Pool;
use crate::gmail::MailProvider;
use crate::identity::{IdentityProvider, UserIdentity};
use crate::model::decode_change_notification;
use crate::sms::SmsSender;
use crate::{processor, watch};

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub mail: Arc<dyn MailProvider>,
    pub classifier: Arc<dyn Classifier>,
    pub sender: Arc<dyn SmsSender>,
    pub identity: Arc<dyn IdentityProvider>,
    /// Delay before the fetch continuation runs, decoupling the checkpoint
    /// write from the slow fetch/classify path.
    pub task_delay: chrono::Duration,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/receive", post(receive_notification))
        .route("/watch/start", post(start_watch))
        .route("/watch/stop", post(stop_watch))
        .route("/watch/status", get(watch_status))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Provider push endpoint. Always answers 200: the provider treats anything
/// else as a redelivery request, and a redelivery storm is worse than one
/// silently dropped notification.
async fn receive_notification(State(state): State<AppState>, body: Bytes) -> StatusCode {
    match parse_push_envelope(&body) {
        Some((email, checkpoint)) => {
            info!(email, checkpoint, "received push notification");
            if let Err(err) =
                processor::on_change_notification(&state.pool, &email, checkpoint, state.task_delay)
                    .await
            {
                warn!(?err, email, "failed to process change notification");
            }
        }
        None => warn!("ignoring undecodable push notification"),
    }
    StatusCode::OK
}

/// Decode the Pub/Sub-style envelope: `{"message": {"data": <base64url>}}`
/// wrapping a JSON object with `emailAddress` and `historyId` fields.
pub fn parse_push_envelope(body: &[u8]) -> Option<(String, i64)> {
    let envelope: Value = serde_json::from_slice(body).ok()?;
    let data = envelope.get("message")?.get("data")?.as_str()?;
    let decoded = crate::gmail::model::decode_base64url(data).ok()?;
    decode_change_notification(&decoded)
}

async fn resolve_caller(state: &AppState, headers: &HeaderMap) -> Result<UserIdentity, Response> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "missing bearer token"))?;
    state
        .identity
        .resolve(bearer)
        .await
        .map_err(|err| error_response(StatusCode::UNAUTHORIZED, &format!("unauthorized: {err}")))
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

#[derive(Deserialize)]
struct StartWatchReq {
    phone_number: String,
}

async fn start_watch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<StartWatchReq>,
) -> Response {
    let user = match resolve_caller(&state, &headers).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if req.phone_number.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "phone_number is required");
    }

    match watch::start_watching(
        &state.pool,
        state.mail.as_ref(),
        state.identity.as_ref(),
        &user,
        req.phone_number.trim(),
    )
    .await
    {
        Ok(created) => Json(json!({ "watching": true, "created": created })).into_response(),
        Err(err) => {
            warn!(?err, subject = user.subject, "failed to start watch");
            error_response(StatusCode::BAD_GATEWAY, "failed to start watch")
        }
    }
}

async fn stop_watch(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user = match resolve_caller(&state, &headers).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    match watch::stop_watching(
        &state.pool,
        state.mail.as_ref(),
        state.identity.as_ref(),
        &user,
    )
    .await
    {
        Ok(deleted) => Json(json!({ "watching": false, "deleted": deleted })).into_response(),
        Err(err) => {
            warn!(?err, subject = user.subject, "failed to stop watch");
            error_response(StatusCode::BAD_GATEWAY, "failed to stop watch")
        }
    }
}

async fn watch_status(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user = match resolve_caller(&state, &headers).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    match watch::watch_status(&state.pool, &user.subject).await {
        Ok(Some(watch)) => Json(json!({ "watch": watch })).into_response(),
        Ok(None) => Json(json!({ "watch": null })).into_response(),
        Err(err) => {
            warn!(?err, subject = user.subject, "failed to load watch status");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to load status")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    fn envelope(inner: &str) -> Vec<u8> {
        let data = URL_SAFE_NO_PAD.encode(inner);
        serde_json::to_vec(&json!({ "message": { "data": data } })).unwrap()
    }

    #[test]
    fn parses_wrapped_notification() {
        let body = envelope(r#"{"emailAddress":"a@example.com","historyId":105}"#);
        assert_eq!(
            parse_push_envelope(&body),
            Some(("a@example.com".to_string(), 105))
        );
    }

    #[test]
    fn accepts_string_history_id() {
        let body = envelope(r#"{"emailAddress":"a@example.com","historyId":"105"}"#);
        assert_eq!(
            parse_push_envelope(&body),
            Some(("a@example.com".to_string(), 105))
        );
    }

    #[test]
    fn rejects_incomplete_payloads() {
        assert!(parse_push_envelope(b"not json").is_none());
        assert!(parse_push_envelope(&envelope(r#"{"emailAddress":"a@example.com"}"#)).is_none());
        assert!(parse_push_envelope(&envelope(r#"{"historyId":105}"#)).is_none());
        assert!(parse_push_envelope(&envelope("plain text")).is_none());
    }
}
