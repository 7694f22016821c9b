use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{sse::Event, IntoResponse, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use uuid::Uuid;

use crate::db::inbox::InboxStore;
use crate::db::wallet::WalletStore;

use super::session::SessionService;
use super::utils::validate_session;

#[derive(Clone)]
pub struct WalletRoutesState {
    pub sessions: Arc<SessionService>,
    pub wallet: WalletStore,
    pub inbox: InboxStore,
}

// Balance plus a recomputation from the transaction log; a drift is shown to
// the caller, not repaired.
async fn get_balance(
    headers: HeaderMap,
    State(state): State<WalletRoutesState>,
) -> impl IntoResponse {
    let session = match validate_session(&headers, &state.sessions) {
        Ok(session) => session,
        Err(status) => return Err((status, "Invalid token")),
    };
    match state.wallet.balance_report(session.user_id).await {
        Ok(report) => {
            if report.discrepancy_flagged {
                tracing::warn!(
                    user_id = %session.user_id,
                    discrepancy = %report.discrepancy,
                    "wallet balance drift detected"
                );
            }
            Ok(Json(report))
        }
        Err(err) => {
            tracing::error!("failed to compute balance report: {err}");
            Err((StatusCode::INTERNAL_SERVER_ERROR, "Failed to load balance"))
        }
    }
}

// Transactions stream out as server-sent events, oldest first.
async fn list_transactions(
    headers: HeaderMap,
    State(state): State<WalletRoutesState>,
) -> Result<impl IntoResponse, (StatusCode, &'static str)> {
    let session = match validate_session(&headers, &state.sessions) {
        Ok(session) => session,
        Err(status) => return Err((status, "Invalid token")),
    };

    let transactions = match state.wallet.list_transactions(session.user_id).await {
        Ok(transactions) => transactions,
        Err(err) => {
            tracing::error!("failed to retrieve transactions: {err}");
            return Err((StatusCode::INTERNAL_SERVER_ERROR, "Failed to retrieve transactions"));
        }
    };

    let stream = futures::stream::iter(transactions)
        .map(|transaction| Event::default().json_data(transaction));

    let sse = Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(std::time::Duration::from_secs(2))
            .text("keep-alive-text"),
    );

    Ok(sse)
}

async fn list_notifications(
    headers: HeaderMap,
    State(state): State<WalletRoutesState>,
) -> impl IntoResponse {
    let session = match validate_session(&headers, &state.sessions) {
        Ok(session) => session,
        Err(status) => return Err((status, "Invalid token")),
    };
    match state.inbox.list_notifications(session.user_id).await {
        Ok(notifications) => Ok(Json(notifications)),
        Err(err) => {
            tracing::error!("failed to list notifications: {err}");
            Err((StatusCode::INTERNAL_SERVER_ERROR, "Failed to list notifications"))
        }
    }
}

async fn mark_notification_read(
    headers: HeaderMap,
    State(state): State<WalletRoutesState>,
    Path(notification_id): Path<Uuid>,
) -> impl IntoResponse {
    let session = match validate_session(&headers, &state.sessions) {
        Ok(session) => session,
        Err(status) => return Err((status, "Invalid token")),
    };
    match state
        .inbox
        .mark_notification_read(session.user_id, notification_id)
        .await
    {
        Ok(true) => Ok(StatusCode::NO_CONTENT),
        Ok(false) => Err((StatusCode::NOT_FOUND, "Notification not found")),
        Err(err) => {
            tracing::error!("failed to mark notification read: {err}");
            Err((StatusCode::INTERNAL_SERVER_ERROR, "Failed to update notification"))
        }
    }
}

async fn list_messages(
    headers: HeaderMap,
    State(state): State<WalletRoutesState>,
) -> impl IntoResponse {
    let session = match validate_session(&headers, &state.sessions) {
        Ok(session) => session,
        Err(status) => return Err((status, "Invalid token")),
    };
    match state.inbox.list_messages(session.user_id).await {
        Ok(messages) => Ok(Json(messages)),
        Err(err) => {
            tracing::error!("failed to list messages: {err}");
            Err((StatusCode::INTERNAL_SERVER_ERROR, "Failed to list messages"))
        }
    }
}

pub fn wallet_routes(state: WalletRoutesState) -> Router {
    Router::new()
        .route("/wallet/balance", get(get_balance))
        .route("/wallet/transactions", get(list_transactions))
        .route("/notifications", get(list_notifications))
        .route("/notifications/:id/read", post(mark_notification_read))
        .route("/messages", get(list_messages))
        .with_state(state)
}
