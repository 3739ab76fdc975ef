use axum::body::Bytes;
use axum::extract::State;
use axum::extract::rejection::BytesRejection;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use tracing::{debug, warn};

use crate::models::wallet::WebhookAck;
use crate::state::AppState;
use crate::stripe::{SIGNATURE_HEADER, SignatureError, parse_event};

use super::HttpError;

pub fn router() -> Router<AppState> {
    Router::new().route("/stripe", post(receive_stripe_event))
}

/// Verifies and enqueues; crediting happens on the webhook worker.
async fn receive_stripe_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<WebhookAck>, HttpError> {
    let body = body.map_err(|err| {
        HttpError::new(
            StatusCode::BAD_REQUEST,
            format!("Webhook body could not be read: {err}"),
        )
    })?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if let Err(err) = state.verifier.verify(&body, signature, Utc::now().timestamp()) {
        warn!("Webhook signature verification failed: {err}");
        return Err(signature_error(err));
    }

    let event = parse_event(&body).map_err(|err| {
        HttpError::new(StatusCode::BAD_REQUEST, format!("Webhook Error: {err}"))
    })?;

    if state.webhooks.processor().is_settled(&event.id) {
        debug!("Webhook event {} already settled; acknowledging", event.id);
        return Ok(Json(WebhookAck {
            received: true,
            duplicate: true,
        }));
    }

    debug!("Accepted webhook event {} ({})", event.id, event.event_type);
    state.webhooks.dispatch(event);
    Ok(Json(WebhookAck {
        received: true,
        duplicate: false,
    }))
}

fn signature_error(err: SignatureError) -> HttpError {
    HttpError::new(StatusCode::BAD_REQUEST, format!("Webhook Error: {err}"))
}
