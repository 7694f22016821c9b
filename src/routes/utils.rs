use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::json;

use crate::error::RideError;
use crate::lifecycle::Session;

use super::session::SessionService;

#[inline]
pub fn validate_session(
    headers: &HeaderMap,
    service: &SessionService,
) -> Result<Session, StatusCode> {
    let jwt_header_token = match headers.get("Authorization").map(|token| token.to_str()) {
        Some(Ok(token)) => token.strip_prefix("Bearer ").unwrap_or(token),
        _ => {
            return Err(StatusCode::UNAUTHORIZED);
        }
    };
    match service.verify_token(jwt_header_token) {
        Ok(session) => Ok(session),
        Err(_) => Err(StatusCode::UNAUTHORIZED),
    }
}

/// Uniform error body: machine code plus a human message per taxonomy kind.
pub fn error_response(err: RideError) -> (StatusCode, Json<serde_json::Value>) {
    if let RideError::Database(ref db_err) = err {
        tracing::error!("database failure surfaced to route: {db_err}");
    }
    (
        err.status_code(),
        Json(json!({
            "error": err.code(),
            "message": err.user_message(),
        })),
    )
}

/// Same body shape for token failures, so every error a handler returns is
/// `{error, message}` JSON.
pub fn auth_error(status: StatusCode) -> (StatusCode, Json<serde_json::Value>) {
    (
        status,
        Json(json!({
            "error": "UNAUTHORIZED",
            "message": "Invalid token",
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_bodies_carry_code_and_message() {
        let (status, body) = error_response(RideError::RideLocked);
        assert_eq!(status, StatusCode::LOCKED);
        assert_eq!(body["error"], "RIDE_LOCKED");
        assert!(body["message"].as_str().unwrap().contains("retry"));

        let (status, body) = auth_error(StatusCode::UNAUTHORIZED);
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "UNAUTHORIZED");
    }
}
