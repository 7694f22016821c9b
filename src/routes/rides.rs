use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::db::rides::UserType;
use crate::error::RideError;
use crate::lifecycle::{LifecycleController, NewRequest};
use crate::sync::RideFeed;

use super::session::SessionService;
use super::utils::{auth_error, error_response, validate_session};

#[derive(Clone)]
pub struct RideRoutesState {
    pub sessions: Arc<SessionService>,
    pub controller: LifecycleController,
    pub feed: RideFeed,
}

#[derive(Debug, Deserialize)]
struct AcceptRequest {
    request_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct VerifyOtpRequest {
    otp: String,
}

#[derive(Debug, Deserialize)]
struct CancelRequest {
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DriverStatusRequest {
    online: bool,
}

#[derive(Debug, Deserialize)]
struct LocationUpdate {
    lat: f64,
    lng: f64,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    completed: Vec<crate::db::rides::CompletedRide>,
    cancelled: Vec<crate::db::rides::CancelledRide>,
}

async fn create_request(
    headers: HeaderMap,
    State(state): State<RideRoutesState>,
    Json(body): Json<NewRequest>,
) -> impl IntoResponse {
    let session = match validate_session(&headers, &state.sessions) {
        Ok(session) => session,
        Err(status) => return Err(auth_error(status)),
    };
    match state.controller.create_request(session, body).await {
        Ok(request) => Ok((StatusCode::CREATED, Json(request))),
        Err(err) => {
            tracing::warn!("request creation rejected: {err}");
            Err(error_response(err))
        }
    }
}

async fn list_open_requests(
    headers: HeaderMap,
    State(state): State<RideRoutesState>,
) -> impl IntoResponse {
    let session = match validate_session(&headers, &state.sessions) {
        Ok(session) => session,
        Err(status) => return Err((status, "Invalid token")),
    };
    if session.user_type != UserType::Driver {
        return Err((StatusCode::FORBIDDEN, "Drivers only"));
    }
    match state.controller.store().list_open_requests().await {
        Ok(requests) => Ok(Json(requests)),
        Err(err) => {
            tracing::error!("failed to list open requests: {err}");
            Err((StatusCode::INTERNAL_SERVER_ERROR, "Failed to list requests"))
        }
    }
}

async fn accept_ride(
    headers: HeaderMap,
    State(state): State<RideRoutesState>,
    Json(body): Json<AcceptRequest>,
) -> impl IntoResponse {
    let session = match validate_session(&headers, &state.sessions) {
        Ok(session) => session,
        Err(status) => return Err(auth_error(status)),
    };
    tracing::info!(request_id = %body.request_id, driver_id = %session.user_id, "accept requested");
    match state.controller.accept(session, body.request_id).await {
        Ok(result) => Ok((StatusCode::OK, Json(result))),
        Err(err) => {
            tracing::warn!(request_id = %body.request_id, "accept rejected: {err}");
            Err(error_response(err))
        }
    }
}

async fn verify_otp(
    headers: HeaderMap,
    State(state): State<RideRoutesState>,
    Path(ride_id): Path<Uuid>,
    Json(body): Json<VerifyOtpRequest>,
) -> impl IntoResponse {
    let session = match validate_session(&headers, &state.sessions) {
        Ok(session) => session,
        Err(status) => return Err(auth_error(status)),
    };
    match state.controller.start(session, ride_id, &body.otp).await {
        Ok(result) => Ok(Json(json!({ "success": true, "started_at": result.started_at }))),
        Err(err) => {
            tracing::warn!(%ride_id, "otp verification failed: {err}");
            Err(error_response(err))
        }
    }
}

async fn complete_ride(
    headers: HeaderMap,
    State(state): State<RideRoutesState>,
    Path(ride_id): Path<Uuid>,
) -> impl IntoResponse {
    let session = match validate_session(&headers, &state.sessions) {
        Ok(session) => session,
        Err(status) => return Err(auth_error(status)),
    };
    match state.controller.complete(session, ride_id).await {
        Ok(result) => Ok(Json(json!({
            "success": true,
            "fare": result.fare,
            "already_completed": result.already_completed,
            "message": result.message,
        }))),
        Err(err) => {
            tracing::warn!(%ride_id, "completion rejected: {err}");
            Err(error_response(err))
        }
    }
}

async fn cancel_ride(
    headers: HeaderMap,
    State(state): State<RideRoutesState>,
    Path(ride_id): Path<Uuid>,
    Json(body): Json<CancelRequest>,
) -> impl IntoResponse {
    let session = match validate_session(&headers, &state.sessions) {
        Ok(session) => session,
        Err(status) => return Err(auth_error(status)),
    };
    match state.controller.cancel(session, ride_id, body.reason).await {
        Ok(result) => Ok(Json(result)),
        Err(err) => {
            tracing::warn!(%ride_id, "cancellation rejected: {err}");
            Err(error_response(err))
        }
    }
}

async fn list_active(
    headers: HeaderMap,
    State(state): State<RideRoutesState>,
) -> impl IntoResponse {
    let session = match validate_session(&headers, &state.sessions) {
        Ok(session) => session,
        Err(status) => return Err((status, "Invalid token")),
    };
    match state
        .controller
        .store()
        .list_active_for_user(session.user_id)
        .await
    {
        Ok(rides) => Ok(Json(rides)),
        Err(err) => {
            tracing::error!("failed to list active rides: {err}");
            Err((StatusCode::INTERNAL_SERVER_ERROR, "Failed to list rides"))
        }
    }
}

async fn ride_history(
    headers: HeaderMap,
    State(state): State<RideRoutesState>,
) -> impl IntoResponse {
    let session = match validate_session(&headers, &state.sessions) {
        Ok(session) => session,
        Err(status) => return Err((status, "Invalid token")),
    };
    let store = state.controller.store();
    let completed = store.list_completed_for_user(session.user_id).await;
    let cancelled = store.list_cancelled_for_user(session.user_id).await;
    match (completed, cancelled) {
        (Ok(completed), Ok(cancelled)) => Ok(Json(HistoryResponse {
            completed,
            cancelled,
        })),
        (completed, cancelled) => {
            if let Err(err) = completed {
                tracing::error!("failed to load completed rides: {err}");
            }
            if let Err(err) = cancelled {
                tracing::error!("failed to load cancelled rides: {err}");
            }
            Err((StatusCode::INTERNAL_SERVER_ERROR, "Failed to load history"))
        }
    }
}

// Snapshot maintained by the polling task; may lag the tables by one
// refresh interval.
async fn ride_feed(
    headers: HeaderMap,
    State(state): State<RideRoutesState>,
) -> impl IntoResponse {
    let session = match validate_session(&headers, &state.sessions) {
        Ok(session) => session,
        Err(status) => return Err((status, "Invalid token")),
    };
    let snapshot: Vec<_> = state
        .feed
        .snapshot()
        .into_iter()
        .filter(|ride| ride.parent_id == session.user_id || ride.driver_id == session.user_id)
        .collect();
    Ok(Json(snapshot))
}

// Only the ride's own driver may move its position marker.
async fn update_location(
    headers: HeaderMap,
    State(state): State<RideRoutesState>,
    Path(ride_id): Path<Uuid>,
    Json(body): Json<LocationUpdate>,
) -> impl IntoResponse {
    let session = match validate_session(&headers, &state.sessions) {
        Ok(session) => session,
        Err(status) => return Err(auth_error(status)),
    };
    if session.user_type != UserType::Driver {
        return Err(error_response(RideError::Unauthorized));
    }
    let ride = match state.controller.store().find_active(ride_id).await {
        Ok(Some(ride)) => ride,
        Ok(None) => return Err(error_response(RideError::RideNotFound)),
        Err(err) => return Err(error_response(RideError::from(err))),
    };
    if ride.driver_id != session.user_id {
        return Err(error_response(RideError::Unauthorized));
    }
    match state
        .controller
        .store()
        .update_current_location(ride_id, session.user_id, body.lat, body.lng, Utc::now())
        .await
    {
        Ok(true) => Ok(StatusCode::NO_CONTENT),
        Ok(false) => Err(error_response(RideError::RideNotFound)),
        Err(err) => {
            tracing::error!(%ride_id, "failed to update location: {err}");
            Err(error_response(RideError::from(err)))
        }
    }
}

async fn set_driver_status(
    headers: HeaderMap,
    State(state): State<RideRoutesState>,
    Json(body): Json<DriverStatusRequest>,
) -> impl IntoResponse {
    let session = match validate_session(&headers, &state.sessions) {
        Ok(session) => session,
        Err(status) => return Err((status, "Invalid token")),
    };
    if session.user_type != UserType::Driver {
        return Err((StatusCode::FORBIDDEN, "Drivers only"));
    }
    match state
        .controller
        .store()
        .set_driver_online(session.user_id, body.online, Utc::now())
        .await
    {
        Ok(()) => {
            tracing::info!(driver_id = %session.user_id, online = body.online, "driver status updated");
            Ok(StatusCode::NO_CONTENT)
        }
        Err(err) => {
            tracing::error!("failed to update driver status: {err}");
            Err((StatusCode::INTERNAL_SERVER_ERROR, "Failed to update status"))
        }
    }
}

pub fn ride_routes(state: RideRoutesState) -> Router {
    Router::new()
        .route("/requests", post(create_request))
        .route("/requests/open", get(list_open_requests))
        .route("/rides/accept", post(accept_ride))
        .route("/rides/:id/verify-otp", post(verify_otp))
        .route("/rides/:id/complete", post(complete_ride))
        .route("/rides/:id/cancel", post(cancel_ride))
        .route("/rides/:id/location", put(update_location))
        .route("/rides/active", get(list_active))
        .route("/rides/history", get(ride_history))
        .route("/rides/feed", get(ride_feed))
        .route("/drivers/status", put(set_driver_status))
        .with_state(state)
}
