//! ActivityPub endpoints
//!
//! - Actor profile
//! - Inbox (activity receiving)

use axum::body::Bytes;
use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde_json::Value;
use tower_http::limit::RequestBodyLimitLayer;

use crate::AppState;
use crate::error::AppError;
use crate::federation::vocab::id_of;
use crate::federation::{
    ACTIVITY_CONTENT_TYPE, actor_uri_from_key_id, key_id_matches_actor, parse_signature_header,
    verify_request,
};
use crate::metrics::{
    ERRORS_TOTAL, FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL,
    HTTP_REQUESTS_TOTAL,
};

/// Largest inbound activity we accept
const MAX_INBOX_BODY_BYTES: usize = 1024 * 1024;

/// Create ActivityPub router
///
/// Routes:
/// - GET /users/:username - Actor profile
/// - POST /users/:username/inbox - Personal inbox
/// - POST /inbox - Shared inbox
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/users/:username", get(actor))
        .route("/users/:username/inbox", post(inbox))
        .route("/inbox", post(shared_inbox))
        .layer(RequestBodyLimitLayer::new(MAX_INBOX_BODY_BYTES))
}

/// GET /users/:username
///
/// Returns ActivityPub Actor document.
///
/// Content-Type: application/activity+json
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let actor = state
        .db
        .get_local_actor(&username)
        .await?
        .ok_or(AppError::NotFound)?;

    let attachment: Value = serde_json::from_str(&actor.attributes).unwrap_or(Value::Array(vec![]));
    let document = serde_json::json!({
        "@context": [
            "https://www.w3.org/ns/activitystreams",
            "https://w3id.org/security/v1"
        ],
        "type": actor.actor_type.as_activity_type(),
        "id": actor.uri,
        "preferredUsername": actor.name,
        "name": actor.display_name,
        "summary": actor.note,
        "url": actor.url,
        "manuallyApprovesFollowers": actor.locked,
        "inbox": actor.inbox,
        "outbox": actor.outbox,
        "followers": actor.followers,
        "following": actor.following,
        "featured": actor.featured,
        "endpoints": {
            "sharedInbox": actor.shared_inbox
        },
        "attachment": attachment,
        "published": actor.created_at.to_rfc3339(),
        "publicKey": {
            "id": actor.key_id(),
            "owner": actor.uri,
            "publicKeyPem": actor.public_key_pem
        }
    });

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/users/:username", "200"])
        .inc();

    Ok((
        [(header::CONTENT_TYPE, ACTIVITY_CONTENT_TYPE)],
        Json(document),
    )
        .into_response())
}

/// POST /users/:username/inbox
///
/// Receives incoming ActivityPub activities for one local actor.
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    if state.db.get_local_actor(&username).await?.is_none() {
        return Err(AppError::NotFound);
    }
    receive(&state, "/users/:username/inbox", method, uri, headers, body).await
}

/// POST /inbox
///
/// Shared inbox for all actors on this instance.
async fn shared_inbox(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    receive(&state, "/inbox", method, uri, headers, body).await
}

/// Authenticate, parse and process one inbound activity
///
/// # Steps
/// 1. Verify HTTP Signature
/// 2. Parse activity
/// 3. Check the signer owns the activity
/// 4. Run the activity through the processor
///
/// Processing failures are logged and still answered with 202.
async fn receive(
    state: &AppState,
    endpoint: &'static str,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let _fed_timer = FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["inbound"])
        .start_timer();

    let mut request = http::Request::builder()
        .method(method)
        .uri(uri)
        .body(body)
        .map_err(|e| AppError::Validation(format!("Invalid request: {}", e)))?;
    *request.headers_mut() = headers;

    let key_id = match verify_request(&request, state.key_cache.as_ref()).await {
        Ok(key_id) => key_id,
        Err(error) => {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["inbound", "unauthorized"])
                .inc();
            schedule_key_refresh(state, &request).await;
            tracing::warn!(error = %error, "Rejected inbound activity");
            return Err(error);
        }
    };

    let activity: Value = serde_json::from_slice(request.body())
        .map_err(|e| AppError::Validation(format!("Invalid JSON: {}", e)))?;

    let actor_uri = activity
        .get("actor")
        .and_then(id_of)
        .ok_or_else(|| AppError::Validation("Missing actor field".to_string()))?;

    if !key_id_matches_actor(&key_id, actor_uri) {
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["inbound", "unauthorized"])
            .inc();
        return Err(AppError::Signature(
            "Signature keyId actor mismatch".to_string(),
        ));
    }

    match state.processor.process(&activity, actor_uri).await {
        Ok(()) => {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["inbound", "success"])
                .inc();
        }
        Err(error) => {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["inbound", "dropped"])
                .inc();
            ERRORS_TOTAL
                .with_label_values(&[error.kind(), "inbox"])
                .inc();
            tracing::warn!(
                actor_uri,
                activity_id = ?activity.get("id"),
                activity_type = ?activity.get("type"),
                error = %error,
                "Dropped inbound activity"
            );
        }
    }

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", endpoint, "202"])
        .inc();
    Ok(StatusCode::ACCEPTED)
}

/// The signer may have rotated its key: drop the cached copy and queue a
/// re-fetch of its actor document
async fn schedule_key_refresh<B>(state: &AppState, request: &http::Request<B>) {
    let Some(key_id) = request
        .headers()
        .get("signature")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| parse_signature_header(value).ok())
        .map(|parsed| parsed.key_id)
    else {
        return;
    };

    state.key_cache.invalidate(&key_id).await;

    let actor_uri = actor_uri_from_key_id(&key_id);
    match state.db.get_actor_by_uri(actor_uri).await {
        Ok(Some(actor)) if !actor.is_local() => {
            if let Err(error) = state.db.upsert_actor_refresh_request(actor.id).await {
                tracing::error!(actor_uri, error = %error, "Failed to queue actor refresh");
            } else {
                tracing::info!(actor_uri, "Queued actor refresh after signature failure");
            }
        }
        Ok(_) => {}
        Err(error) => {
            tracing::error!(actor_uri, error = %error, "Failed to look up signing actor");
        }
    }
}
