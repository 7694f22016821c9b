use axum::http::StatusCode;
use thiserror::Error;

use crate::db::rides::RideStatus;

/// Domain errors surfaced by the lifecycle controller and stores.
///
/// Side-effect failures (notifications, messages) never appear here; they are
/// logged by the dispatcher and swallowed.
#[derive(Debug, Error)]
pub enum RideError {
    #[error("ride not found")]
    RideNotFound,

    #[error("ride request not found")]
    RequestNotFound,

    #[error("this ride has been cancelled")]
    RideCancelled,

    #[error("this ride was never accepted by a driver")]
    RideNotAccepted,

    #[error("operation not valid while the ride is {current}")]
    InvalidStatus { current: RideStatus },

    #[error("another update for this ride is in progress, please retry")]
    RideLocked,

    #[error("you are not a party to this ride")]
    Unauthorized,

    #[error("incorrect pickup code")]
    InvalidOtp,

    #[error("pickup code has expired")]
    OtpExpired,

    #[error("{0}")]
    Validation(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl RideError {
    /// Stable machine-readable code, independent of the display message.
    pub fn code(&self) -> &'static str {
        match self {
            RideError::RideNotFound => "RIDE_NOT_FOUND",
            RideError::RequestNotFound => "REQUEST_NOT_FOUND",
            RideError::RideCancelled => "RIDE_CANCELLED",
            RideError::RideNotAccepted => "RIDE_NOT_ACCEPTED",
            RideError::InvalidStatus { .. } => "INVALID_STATUS",
            RideError::RideLocked => "RIDE_LOCKED",
            RideError::Unauthorized => "UNAUTHORIZED",
            RideError::InvalidOtp => "INVALID_OTP",
            RideError::OtpExpired => "OTP_EXPIRED",
            RideError::Validation(_) => "VALIDATION_ERROR",
            RideError::Database(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            RideError::RideNotFound | RideError::RequestNotFound => StatusCode::NOT_FOUND,
            RideError::RideCancelled
            | RideError::RideNotAccepted
            | RideError::InvalidStatus { .. } => StatusCode::CONFLICT,
            RideError::RideLocked => StatusCode::LOCKED,
            RideError::Unauthorized => StatusCode::FORBIDDEN,
            RideError::InvalidOtp | RideError::OtpExpired => StatusCode::UNPROCESSABLE_ENTITY,
            RideError::Validation(_) => StatusCode::BAD_REQUEST,
            RideError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to the end user. Database details stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            RideError::Database(_) => "something went wrong, please try again".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct_per_kind() {
        let errors = [
            RideError::RideNotFound,
            RideError::RequestNotFound,
            RideError::RideCancelled,
            RideError::RideNotAccepted,
            RideError::InvalidStatus {
                current: RideStatus::Completed,
            },
            RideError::RideLocked,
            RideError::Unauthorized,
            RideError::InvalidOtp,
            RideError::OtpExpired,
            RideError::Validation("reason is required".into()),
        ];
        let mut codes: Vec<&str> = errors.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn database_errors_are_not_leaked_to_users() {
        let err = RideError::Database(sqlx::Error::RowNotFound);
        assert!(!err.user_message().contains("row"));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn invalid_status_reports_current_state() {
        let err = RideError::InvalidStatus {
            current: RideStatus::InProgress,
        };
        assert!(err.to_string().contains("in_progress"));
    }
}
