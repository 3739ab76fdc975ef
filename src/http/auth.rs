use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::request::Parts;
use uuid::Uuid;

use super::HttpError;

/// Set by the upstream identity layer after it authenticates the session.
pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser(pub Uuid);

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = HttpError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                HttpError::new(StatusCode::UNAUTHORIZED, "User not authenticated".to_string())
            })?;
        let user_id = Uuid::parse_str(value).map_err(|_| {
            HttpError::new(StatusCode::UNAUTHORIZED, "Invalid user identity".to_string())
        })?;
        Ok(Self(user_id))
    }
}
