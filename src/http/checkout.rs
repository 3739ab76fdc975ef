use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use tracing::{error, info};

use crate::models::wallet::{CheckoutRequest, CheckoutResponse};
use crate::packages::TokenPackage;
use crate::state::AppState;
use crate::stripe::CheckoutSessionRequest;

use super::HttpError;
use super::auth::AuthenticatedUser;

const RETRYABLE_MESSAGE: &str = "Could not create checkout session. Please try again.";

pub fn router() -> Router<AppState> {
    Router::new().route("/", post(create_checkout))
}

async fn create_checkout(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(request): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, HttpError> {
    let package = TokenPackage::from_id(&request.package_id).ok_or_else(|| {
        HttpError::new(
            StatusCode::BAD_REQUEST,
            "Invalid package selected.".to_string(),
        )
    })?;
    let price_id = state.catalog.price_for(package).ok_or_else(|| {
        HttpError::new(
            StatusCode::BAD_REQUEST,
            format!("Package {package} is not available for purchase."),
        )
    })?;

    let session_request = CheckoutSessionRequest {
        user_id,
        package,
        price_id: price_id.to_string(),
        success_url: state.catalog.success_url.clone(),
        cancel_url: state.catalog.cancel_url.clone(),
        customer_email: request.customer_email.filter(|email| !email.trim().is_empty()),
    };

    let session = state
        .checkout
        .create_session(&session_request)
        .await
        .map_err(|err| {
            error!("Checkout session creation failed for user {user_id}: {err}");
            HttpError::new(StatusCode::BAD_GATEWAY, RETRYABLE_MESSAGE.to_string())
        })?;
    let url = session
        .url
        .filter(|url| !url.is_empty())
        .ok_or_else(|| HttpError::new(StatusCode::BAD_GATEWAY, RETRYABLE_MESSAGE.to_string()))?;

    info!("Checkout session {} opened for user {user_id} package {package}", session.id);
    Ok(Json(CheckoutResponse { url }))
}
