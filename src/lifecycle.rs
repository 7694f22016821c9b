//! Ride lifecycle controller.
//!
//! Owns every state transition (request -> accept -> start -> complete or
//! cancel). Each transition runs as one database transaction behind an
//! in-process per-ride lock, so a partition move and its paired wallet
//! mutation land together or not at all. Side effects are emitted as events
//! after commit and handled elsewhere; nothing here blocks on them.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::db::rides::{
    CancelledRide, CompletedRide, GeoPoint, RequestStatus, Ride, RideRequest, RideStatus,
    RideStore, UserType,
};
use crate::db::utils::round_money;
use crate::db::wallet::{LedgerEntry, WalletStore};
use crate::error::RideError;
use crate::otp;

/// Explicit caller identity, passed into every controller call instead of
/// being read from ambient state.
#[derive(Debug, Clone, Copy)]
pub struct Session {
    pub user_id: Uuid,
    pub user_type: UserType,
}

/// Tunable lifecycle rules. The penalty direction and OTP expiry are policy
/// knobs rather than hardcoded behavior.
#[derive(Debug, Clone)]
pub struct LifecyclePolicy {
    pub platform_fee_rate: Decimal,
    pub cancellation_penalty_rate: Decimal,
    pub otp_ttl: Option<Duration>,
    pub penalty_to_counterparty: bool,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            platform_fee_rate: Decimal::new(15, 2),        // 15%
            cancellation_penalty_rate: Decimal::new(10, 2), // 10%
            otp_ttl: None,
            penalty_to_counterparty: true,
        }
    }
}

impl LifecyclePolicy {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let rate = |key: &str, fallback: Decimal| {
            dotenv::var(key)
                .ok()
                .and_then(|raw| raw.parse::<Decimal>().ok())
                .unwrap_or(fallback)
        };
        Self {
            platform_fee_rate: rate("PLATFORM_FEE_RATE", defaults.platform_fee_rate),
            cancellation_penalty_rate: rate(
                "CANCELLATION_PENALTY_RATE",
                defaults.cancellation_penalty_rate,
            ),
            otp_ttl: dotenv::var("OTP_EXPIRY_MINUTES")
                .ok()
                .and_then(|raw| raw.parse::<i64>().ok())
                .map(Duration::minutes),
            penalty_to_counterparty: dotenv::var("PENALTY_TO_COUNTERPARTY")
                .map(|raw| raw != "false" && raw != "0")
                .unwrap_or(defaults.penalty_to_counterparty),
        }
    }
}

/// Emitted after a transition commits; consumed by the side-effect
/// dispatcher. Losing one of these never fails the transition.
#[derive(Debug, Clone)]
pub enum RideEvent {
    RequestAccepted {
        ride_id: Uuid,
        parent_id: Uuid,
        driver_id: Uuid,
        otp: String,
    },
    RideStarted {
        ride_id: Uuid,
        parent_id: Uuid,
    },
    RideCompleted {
        ride_id: Uuid,
        parent_id: Uuid,
        fare: Decimal,
    },
    RideCancelled {
        ride_id: Uuid,
        cancelled_by_type: UserType,
        counterparty: Option<Uuid>,
        reason: Option<String>,
        fine: Option<Decimal>,
        reopened: bool,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct AcceptResult {
    pub ride_id: Uuid,
    pub otp: String,
    pub otp_generated_at: DateTime<Utc>,
    pub estimated_arrival: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartResult {
    pub ride_id: Uuid,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompleteResult {
    pub ride_id: Uuid,
    pub fare: Decimal,
    pub already_completed: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelResult {
    pub success: bool,
    pub ride_id: Uuid,
    pub cancelled_by: Uuid,
    pub cancelled_by_type: UserType,
    pub penalty_applied: bool,
    pub penalty_amount: Option<Decimal>,
    pub reopened: bool,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewRequest {
    pub child_id: Uuid,
    pub origin: GeoPoint,
    pub destination: GeoPoint,
    pub scheduled_time: DateTime<Utc>,
    pub fare_estimate: Decimal,
}

/// One guard per ride id. Holding it does not serialize the database; it
/// only turns a concurrent transition on the same ride into `RideLocked`
/// so the caller can retry manually.
#[derive(Default)]
struct RideLocks {
    held: Mutex<HashSet<Uuid>>,
}

struct RideLockGuard {
    locks: Arc<RideLocks>,
    id: Uuid,
}

impl RideLocks {
    fn acquire(self: &Arc<Self>, id: Uuid) -> Result<RideLockGuard, RideError> {
        let mut held = self.held.lock().expect("ride lock set poisoned");
        if !held.insert(id) {
            return Err(RideError::RideLocked);
        }
        Ok(RideLockGuard {
            locks: Arc::clone(self),
            id,
        })
    }
}

impl Drop for RideLockGuard {
    fn drop(&mut self) {
        if let Ok(mut held) = self.locks.held.lock() {
            held.remove(&self.id);
        }
    }
}

#[derive(Clone)]
pub struct LifecycleController {
    pool: SqlitePool,
    rides: RideStore,
    wallet: WalletStore,
    policy: LifecyclePolicy,
    locks: Arc<RideLocks>,
    events: UnboundedSender<RideEvent>,
}

impl LifecycleController {
    pub fn new(pool: SqlitePool, policy: LifecyclePolicy, events: UnboundedSender<RideEvent>) -> Self {
        Self {
            rides: RideStore::new(pool.clone()),
            wallet: WalletStore::new(pool.clone()),
            pool,
            policy,
            locks: Arc::new(RideLocks::default()),
            events,
        }
    }

    pub fn store(&self) -> &RideStore {
        &self.rides
    }

    pub fn wallet(&self) -> &WalletStore {
        &self.wallet
    }

    fn emit(&self, event: RideEvent) {
        if self.events.send(event).is_err() {
            tracing::warn!("side-effect dispatcher is gone, dropping ride event");
        }
    }

    /// Parent files a new ride request.
    pub async fn create_request(
        &self,
        session: Session,
        new_request: NewRequest,
    ) -> Result<RideRequest, RideError> {
        if session.user_type != UserType::Parent {
            return Err(RideError::Unauthorized);
        }
        if new_request.fare_estimate <= Decimal::ZERO {
            return Err(RideError::Validation(
                "fare estimate must be positive".to_string(),
            ));
        }
        let request = RideRequest {
            id: Uuid::new_v4(),
            parent_id: session.user_id,
            child_id: new_request.child_id,
            origin: new_request.origin,
            destination: new_request.destination,
            scheduled_time: new_request.scheduled_time,
            fare_estimate: round_money(new_request.fare_estimate),
            status: RequestStatus::Pending,
            created_at: Utc::now(),
        };
        self.rides.insert_request(&request).await?;
        tracing::info!(request_id = %request.id, parent_id = %request.parent_id, "ride request created");
        Ok(request)
    }

    /// Driver takes a pending request. The request row is consumed and a
    /// scheduled ride with a fresh pickup code appears in its place.
    pub async fn accept(&self, session: Session, request_id: Uuid) -> Result<AcceptResult, RideError> {
        if session.user_type != UserType::Driver {
            return Err(RideError::Unauthorized);
        }
        let _guard = self.locks.acquire(request_id)?;
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        if !self.rides.driver_is_online(&mut tx, session.user_id).await? {
            return Err(RideError::Validation(
                "you must be online to accept rides".to_string(),
            ));
        }
        if self
            .rides
            .count_active_for_driver(&mut tx, session.user_id)
            .await?
            > 0
        {
            return Err(RideError::Validation(
                "finish your current ride before accepting another".to_string(),
            ));
        }

        let request = self
            .rides
            .get_request(&mut tx, request_id)
            .await?
            .ok_or(RideError::RequestNotFound)?;

        // optimistic guard against two drivers racing on the same request; a
        // committed accept deletes the row, so the loser sees the same
        // not-found it would get a moment later
        if request.status != RequestStatus::Pending
            || !self.rides.mark_request_accepted(&mut tx, request_id).await?
        {
            return Err(RideError::RequestNotFound);
        }
        self.rides.delete_request(&mut tx, request_id).await?;

        let ride = Ride {
            id: Uuid::new_v4(),
            request_id: request.id,
            parent_id: request.parent_id,
            driver_id: session.user_id,
            child_id: request.child_id,
            estimated_arrival: Some(estimate_arrival(
                request.scheduled_time,
                &request.origin,
                &request.destination,
            )),
            origin: request.origin,
            destination: request.destination,
            current_location: None,
            scheduled_time: request.scheduled_time,
            fare: request.fare_estimate,
            otp: otp::generate(),
            otp_generated_at: now,
            status: RideStatus::Scheduled,
            actual_pickup_time: None,
            updated_at: now,
        };
        self.rides.insert_ride(&mut tx, &ride).await?;
        tx.commit().await?;

        tracing::info!(ride_id = %ride.id, driver_id = %session.user_id, "request accepted");
        self.emit(RideEvent::RequestAccepted {
            ride_id: ride.id,
            parent_id: ride.parent_id,
            driver_id: ride.driver_id,
            otp: ride.otp.clone(),
        });

        Ok(AcceptResult {
            ride_id: ride.id,
            otp: ride.otp,
            otp_generated_at: ride.otp_generated_at,
            estimated_arrival: ride.estimated_arrival.unwrap_or(ride.scheduled_time),
        })
    }

    /// OTP-gated start. The state check comes before the code comparison: a
    /// correct code for a ride that is no longer scheduled is still rejected.
    pub async fn start(
        &self,
        session: Session,
        ride_id: Uuid,
        candidate_otp: &str,
    ) -> Result<StartResult, RideError> {
        let _guard = self.locks.acquire(ride_id)?;
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        let ride = match self.rides.get_ride(&mut tx, ride_id).await? {
            Some(ride) => ride,
            None => return Err(self.resolve_missing(&mut tx, ride_id).await?),
        };
        if session.user_id != ride.driver_id {
            return Err(RideError::Unauthorized);
        }
        if ride.status != RideStatus::Scheduled {
            return Err(RideError::InvalidStatus {
                current: ride.status,
            });
        }
        if otp::expired(ride.otp_generated_at, now, self.policy.otp_ttl) {
            return Err(RideError::OtpExpired);
        }
        if !otp::verify(&ride.otp, candidate_otp) {
            return Err(RideError::InvalidOtp);
        }

        self.rides.set_ride_started(&mut tx, ride_id, now).await?;
        tx.commit().await?;

        tracing::info!(ride_id = %ride_id, "pickup verified, ride started");
        self.emit(RideEvent::RideStarted {
            ride_id,
            parent_id: ride.parent_id,
        });
        Ok(StartResult {
            ride_id,
            started_at: now,
        })
    }

    /// Driver marks the ride finished. Idempotent: a retry after a completion
    /// that already landed reports success without touching any wallet.
    pub async fn complete(&self, session: Session, ride_id: Uuid) -> Result<CompleteResult, RideError> {
        let _guard = self.locks.acquire(ride_id)?;
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        if let Some(prior) = self.rides.get_completed(&mut tx, ride_id).await? {
            tracing::info!(ride_id = %ride_id, "completion retried after it already landed");
            return Ok(CompleteResult {
                ride_id,
                fare: prior.fare,
                already_completed: true,
                message: "ride was already completed, no new action taken".to_string(),
            });
        }

        let ride = match self.rides.get_ride(&mut tx, ride_id).await? {
            Some(ride) => ride,
            None => return Err(self.resolve_missing(&mut tx, ride_id).await?),
        };
        if session.user_id != ride.driver_id {
            return Err(RideError::Unauthorized);
        }
        if !matches!(ride.status, RideStatus::Scheduled | RideStatus::InProgress) {
            return Err(RideError::InvalidStatus {
                current: ride.status,
            });
        }

        let fee = round_money(ride.fare * self.policy.platform_fee_rate);
        let picked_up = ride.actual_pickup_time.unwrap_or(ride.scheduled_time);
        let completed = CompletedRide {
            id: ride.id,
            request_id: ride.request_id,
            parent_id: ride.parent_id,
            driver_id: ride.driver_id,
            child_id: ride.child_id,
            origin: ride.origin.clone(),
            destination: ride.destination.clone(),
            scheduled_time: ride.scheduled_time,
            fare: ride.fare,
            completed_at: now,
            actual_pickup_time: ride.actual_pickup_time,
            actual_dropoff_time: now,
            distance_traveled: haversine_km(&ride.origin, &ride.destination),
            duration_minutes: (now - picked_up).num_minutes().max(0),
        };

        self.rides.delete_ride(&mut tx, ride_id).await?;
        self.rides.insert_completed(&mut tx, &completed).await?;
        self.wallet
            .debit(
                &mut tx,
                LedgerEntry::new(ride.parent_id, ride.fare, "ride_fare")
                    .description("fare for completed ride")
                    .ride(ride.id),
                now,
            )
            .await?;
        self.wallet
            .credit(
                &mut tx,
                LedgerEntry::new(ride.driver_id, ride.fare, "ride_payment")
                    .description("payout for completed ride")
                    .fee(fee)
                    .ride(ride.id),
                now,
            )
            .await?;
        tx.commit().await?;

        tracing::info!(ride_id = %ride_id, fare = %ride.fare, "ride completed");
        self.emit(RideEvent::RideCompleted {
            ride_id,
            parent_id: ride.parent_id,
            fare: ride.fare,
        });
        Ok(CompleteResult {
            ride_id,
            fare: ride.fare,
            already_completed: false,
            message: "ride completed".to_string(),
        })
    }

    /// Cancellation, with rules that differ by actor and state:
    /// in-progress rides cost the canceller a fine paid to the other party;
    /// a scheduled ride cancelled by its driver is re-opened for other
    /// drivers at the driver's expense; a parent walking away from a
    /// scheduled ride or a pending request pays nothing.
    pub async fn cancel(
        &self,
        session: Session,
        ride_id: Uuid,
        reason: Option<String>,
    ) -> Result<CancelResult, RideError> {
        let _guard = self.locks.acquire(ride_id)?;
        let now = Utc::now();
        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());

        let mut tx = self.pool.begin().await?;

        let ride = match self.rides.get_ride(&mut tx, ride_id).await? {
            Some(ride) => ride,
            None => {
                // cancelled is reachable straight from a pending request
                if let Some(request) = self.rides.get_request(&mut tx, ride_id).await? {
                    return self
                        .cancel_pending_request(tx, session, request, reason, now)
                        .await;
                }
                return Err(self.resolve_missing(&mut tx, ride_id).await?);
            }
        };

        let canceller_type = if session.user_id == ride.parent_id {
            UserType::Parent
        } else if session.user_id == ride.driver_id {
            UserType::Driver
        } else {
            return Err(RideError::Unauthorized);
        };

        match (ride.status, canceller_type) {
            (RideStatus::InProgress, _) => {
                let reason = reason.ok_or_else(|| {
                    RideError::Validation(
                        "a reason is required to cancel a ride in progress".to_string(),
                    )
                })?;
                let fine = round_money(ride.fare * self.policy.cancellation_penalty_rate);
                let counterparty = match canceller_type {
                    UserType::Parent => ride.driver_id,
                    UserType::Driver => ride.parent_id,
                };

                self.rides.delete_ride(&mut tx, ride_id).await?;
                self.rides
                    .insert_cancelled(
                        &mut tx,
                        &terminal_record(&ride, session.user_id, canceller_type, Some(reason.clone()), now, Some(fine)),
                    )
                    .await?;
                self.wallet
                    .debit(
                        &mut tx,
                        LedgerEntry::new(session.user_id, fine, "cancellation_fine")
                            .description("fine for cancelling a ride in progress")
                            .ride(ride.id),
                        now,
                    )
                    .await?;
                if self.policy.penalty_to_counterparty {
                    self.wallet
                        .credit(
                            &mut tx,
                            LedgerEntry::new(counterparty, fine, "cancellation_compensation")
                                .description("compensation for a ride cancelled in progress")
                                .ride(ride.id),
                            now,
                        )
                        .await?;
                }
                tx.commit().await?;

                tracing::info!(ride_id = %ride_id, by = %session.user_id, %fine, "in-progress ride cancelled");
                self.emit(RideEvent::RideCancelled {
                    ride_id,
                    cancelled_by_type: canceller_type,
                    counterparty: Some(counterparty),
                    reason: Some(reason),
                    fine: Some(fine),
                    reopened: false,
                });
                Ok(CancelResult {
                    success: true,
                    ride_id,
                    cancelled_by: session.user_id,
                    cancelled_by_type: canceller_type,
                    penalty_applied: true,
                    penalty_amount: Some(fine),
                    reopened: false,
                    message: format!("ride cancelled, a fine of {fine} was applied"),
                })
            }
            (RideStatus::Scheduled, UserType::Parent) => {
                self.rides.delete_ride(&mut tx, ride_id).await?;
                self.rides
                    .insert_cancelled(
                        &mut tx,
                        &terminal_record(&ride, session.user_id, UserType::Parent, reason.clone(), now, None),
                    )
                    .await?;
                tx.commit().await?;

                tracing::info!(ride_id = %ride_id, "scheduled ride cancelled by parent");
                self.emit(RideEvent::RideCancelled {
                    ride_id,
                    cancelled_by_type: UserType::Parent,
                    counterparty: Some(ride.driver_id),
                    reason,
                    fine: None,
                    reopened: false,
                });
                Ok(CancelResult {
                    success: true,
                    ride_id,
                    cancelled_by: session.user_id,
                    cancelled_by_type: UserType::Parent,
                    penalty_applied: false,
                    penalty_amount: None,
                    reopened: false,
                    message: "ride cancelled".to_string(),
                })
            }
            (RideStatus::Scheduled, UserType::Driver) => {
                // the booking goes back on the board for other drivers; the
                // fine stays with the platform
                let fine = round_money(ride.fare * self.policy.cancellation_penalty_rate);
                self.rides.delete_ride(&mut tx, ride_id).await?;
                self.rides.reopen_request(&mut tx, &ride, now).await?;
                self.wallet
                    .debit(
                        &mut tx,
                        LedgerEntry::new(session.user_id, fine, "cancellation_fine")
                            .description("fine for dropping an accepted ride")
                            .ride(ride.id),
                        now,
                    )
                    .await?;
                tx.commit().await?;

                tracing::info!(ride_id = %ride_id, request_id = %ride.request_id, %fine, "driver dropped scheduled ride, request re-opened");
                self.emit(RideEvent::RideCancelled {
                    ride_id,
                    cancelled_by_type: UserType::Driver,
                    counterparty: Some(ride.parent_id),
                    reason,
                    fine: Some(fine),
                    reopened: true,
                });
                Ok(CancelResult {
                    success: true,
                    ride_id,
                    cancelled_by: session.user_id,
                    cancelled_by_type: UserType::Driver,
                    penalty_applied: true,
                    penalty_amount: Some(fine),
                    reopened: true,
                    message: format!(
                        "ride released back to other drivers, a fine of {fine} was applied"
                    ),
                })
            }
            (current, _) => Err(RideError::InvalidStatus { current }),
        }
    }

    async fn cancel_pending_request(
        &self,
        mut tx: sqlx::Transaction<'_, sqlx::Sqlite>,
        session: Session,
        request: RideRequest,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<CancelResult, RideError> {
        if session.user_id != request.parent_id {
            return Err(RideError::Unauthorized);
        }
        self.rides.delete_request(&mut tx, request.id).await?;
        self.rides
            .insert_cancelled(
                &mut tx,
                &CancelledRide {
                    id: request.id,
                    request_id: request.id,
                    parent_id: request.parent_id,
                    driver_id: None,
                    child_id: request.child_id,
                    origin: request.origin,
                    destination: request.destination,
                    scheduled_time: request.scheduled_time,
                    fare: request.fare_estimate,
                    cancelled_by: session.user_id,
                    cancelled_by_type: UserType::Parent,
                    cancellation_reason: reason.clone(),
                    cancelled_at: now,
                    fine_applied: false,
                    cancellation_fine: Decimal::ZERO,
                },
            )
            .await?;
        tx.commit().await?;

        tracing::info!(request_id = %request.id, "pending request withdrawn");
        self.emit(RideEvent::RideCancelled {
            ride_id: request.id,
            cancelled_by_type: UserType::Parent,
            counterparty: None,
            reason,
            fine: None,
            reopened: false,
        });
        Ok(CancelResult {
            success: true,
            ride_id: request.id,
            cancelled_by: session.user_id,
            cancelled_by_type: UserType::Parent,
            penalty_applied: false,
            penalty_amount: None,
            reopened: false,
            message: "ride request withdrawn".to_string(),
        })
    }

    /// Friendlier error for an id that is not in the active partition.
    async fn resolve_missing(
        &self,
        conn: &mut sqlx::SqliteConnection,
        ride_id: Uuid,
    ) -> Result<RideError, RideError> {
        if self.rides.get_cancelled(conn, ride_id).await?.is_some() {
            return Ok(RideError::RideCancelled);
        }
        if self.rides.get_completed(conn, ride_id).await?.is_some() {
            return Ok(RideError::InvalidStatus {
                current: RideStatus::Completed,
            });
        }
        if let Some(request) = self.rides.get_request(conn, ride_id).await? {
            if request.status == RequestStatus::Pending {
                return Ok(RideError::RideNotAccepted);
            }
        }
        Ok(RideError::RideNotFound)
    }
}

fn terminal_record(
    ride: &Ride,
    cancelled_by: Uuid,
    cancelled_by_type: UserType,
    reason: Option<String>,
    now: DateTime<Utc>,
    fine: Option<Decimal>,
) -> CancelledRide {
    CancelledRide {
        id: ride.id,
        request_id: ride.request_id,
        parent_id: ride.parent_id,
        driver_id: Some(ride.driver_id),
        child_id: ride.child_id,
        origin: ride.origin.clone(),
        destination: ride.destination.clone(),
        scheduled_time: ride.scheduled_time,
        fare: ride.fare,
        cancelled_by,
        cancelled_by_type,
        cancellation_reason: reason,
        cancelled_at: now,
        fine_applied: fine.is_some(),
        cancellation_fine: fine.unwrap_or(Decimal::ZERO),
    }
}

fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Rough arrival estimate: scheduled pickup plus travel time at suburban
/// average speed.
fn estimate_arrival(
    scheduled_time: DateTime<Utc>,
    origin: &GeoPoint,
    destination: &GeoPoint,
) -> DateTime<Utc> {
    const AVERAGE_SPEED_KMH: f64 = 40.0;
    let minutes = (haversine_km(origin, destination) / AVERAGE_SPEED_KMH * 60.0).ceil() as i64;
    scheduled_time + Duration::minutes(minutes.max(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::rides::Partition;
    use crate::db::testing;
    use std::str::FromStr;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    struct Harness {
        pool: SqlitePool,
        controller: LifecycleController,
        events: UnboundedReceiver<RideEvent>,
    }

    async fn harness() -> Harness {
        harness_with(LifecyclePolicy::default()).await
    }

    async fn harness_with(policy: LifecyclePolicy) -> Harness {
        let pool = testing::memory_pool().await;
        let (tx, rx) = mpsc::unbounded_channel();
        Harness {
            controller: LifecycleController::new(pool.clone(), policy, tx),
            pool,
            events: rx,
        }
    }

    fn parent_session() -> Session {
        Session {
            user_id: Uuid::new_v4(),
            user_type: UserType::Parent,
        }
    }

    fn driver_session() -> Session {
        Session {
            user_id: Uuid::new_v4(),
            user_type: UserType::Driver,
        }
    }

    fn money(raw: &str) -> Decimal {
        Decimal::from_str(raw).unwrap()
    }

    fn new_request(fare: &str) -> NewRequest {
        let (origin, destination) = testing::sample_geo();
        NewRequest {
            child_id: Uuid::new_v4(),
            origin,
            destination,
            scheduled_time: Utc::now() + Duration::hours(2),
            fare_estimate: money(fare),
        }
    }

    fn wrong_code(otp: &str) -> &'static str {
        if otp == "111111" {
            "222222"
        } else {
            "111111"
        }
    }

    /// Parent books, driver goes online and accepts. Returns the accept
    /// result alongside both sessions.
    async fn booked_ride(h: &Harness, fare: &str) -> (Session, Session, AcceptResult) {
        let parent = parent_session();
        let driver = driver_session();
        let request = h
            .controller
            .create_request(parent, new_request(fare))
            .await
            .unwrap();
        h.controller
            .store()
            .set_driver_online(driver.user_id, true, Utc::now())
            .await
            .unwrap();
        let accepted = h.controller.accept(driver, request.id).await.unwrap();
        (parent, driver, accepted)
    }

    #[tokio::test]
    async fn happy_path_wrong_code_then_complete() {
        let mut h = harness().await;
        let (parent, driver, accepted) = booked_ride(&h, "120").await;
        let ride_id = accepted.ride_id;

        // pickup code delivery is driven by the accept event
        match h.events.recv().await.unwrap() {
            RideEvent::RequestAccepted { otp, parent_id, .. } => {
                assert_eq!(otp, accepted.otp);
                assert_eq!(parent_id, parent.user_id);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // wrong code leaves the ride scheduled
        let err = h
            .controller
            .start(driver, ride_id, wrong_code(&accepted.otp))
            .await
            .unwrap_err();
        assert!(matches!(err, RideError::InvalidOtp));
        assert_eq!(
            h.controller.store().locate(ride_id).await.unwrap(),
            vec![Partition::Active]
        );

        h.controller
            .start(driver, ride_id, &accepted.otp)
            .await
            .unwrap();

        let result = h.controller.complete(driver, ride_id).await.unwrap();
        assert!(!result.already_completed);
        assert_eq!(result.fare, money("120"));

        assert_eq!(
            h.controller.store().locate(ride_id).await.unwrap(),
            vec![Partition::Completed]
        );
        // 15% platform fee comes out of the driver payout
        assert_eq!(
            h.controller.wallet().balance(driver.user_id).await.unwrap(),
            money("102")
        );
        assert_eq!(
            h.controller.wallet().balance(parent.user_id).await.unwrap(),
            money("-120")
        );
        let parent_log = h
            .controller
            .wallet()
            .list_transactions(parent.user_id)
            .await
            .unwrap();
        assert_eq!(parent_log.len(), 1);
        assert_eq!(parent_log[0].amount, money("120"));
        assert_eq!(
            parent_log[0].direction,
            crate::db::wallet::Direction::Debit
        );
    }

    #[tokio::test]
    async fn completing_twice_is_idempotent_and_wallet_neutral() {
        let h = harness().await;
        let (parent, driver, accepted) = booked_ride(&h, "120").await;
        h.controller
            .start(driver, accepted.ride_id, &accepted.otp)
            .await
            .unwrap();

        h.controller.complete(driver, accepted.ride_id).await.unwrap();
        let driver_before = h.controller.wallet().balance(driver.user_id).await.unwrap();
        let parent_before = h.controller.wallet().balance(parent.user_id).await.unwrap();

        let second = h.controller.complete(driver, accepted.ride_id).await.unwrap();
        assert!(second.already_completed);
        assert_eq!(second.fare, money("120"));

        assert_eq!(
            h.controller.wallet().balance(driver.user_id).await.unwrap(),
            driver_before
        );
        assert_eq!(
            h.controller.wallet().balance(parent.user_id).await.unwrap(),
            parent_before
        );
    }

    #[tokio::test]
    async fn stranger_cannot_cancel_and_nothing_changes() {
        let h = harness().await;
        let (_parent, _driver, accepted) = booked_ride(&h, "120").await;

        let stranger = parent_session();
        let err = h
            .controller
            .cancel(stranger, accepted.ride_id, Some("mine now".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, RideError::Unauthorized));

        assert_eq!(
            h.controller.store().locate(accepted.ride_id).await.unwrap(),
            vec![Partition::Active]
        );
        assert_eq!(
            h.controller.wallet().balance(stranger.user_id).await.unwrap(),
            Decimal::ZERO
        );
    }

    #[tokio::test]
    async fn driver_dropping_scheduled_ride_reopens_the_request() {
        let h = harness().await;
        let (_parent, driver, accepted) = booked_ride(&h, "120").await;

        let result = h
            .controller
            .cancel(driver, accepted.ride_id, None)
            .await
            .unwrap();
        assert!(result.reopened);
        assert!(result.penalty_applied);
        assert_eq!(result.penalty_amount, Some(money("12")));

        // booking is pending again under the original request id
        let open = h.controller.store().list_open_requests().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].status, RequestStatus::Pending);
        assert_eq!(open[0].fare_estimate, money("120"));

        assert!(h
            .controller
            .store()
            .locate(accepted.ride_id)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            h.controller.wallet().balance(driver.user_id).await.unwrap(),
            money("-12")
        );
    }

    #[tokio::test]
    async fn parent_cancelling_scheduled_ride_pays_nothing() {
        let h = harness().await;
        let (parent, driver, accepted) = booked_ride(&h, "120").await;

        let result = h
            .controller
            .cancel(parent, accepted.ride_id, None)
            .await
            .unwrap();
        assert!(!result.penalty_applied);
        assert!(!result.reopened);

        assert_eq!(
            h.controller.store().locate(accepted.ride_id).await.unwrap(),
            vec![Partition::Cancelled]
        );
        let mut conn = h.pool.acquire().await.unwrap();
        let cancelled = h
            .controller
            .store()
            .get_cancelled(&mut conn, accepted.ride_id)
            .await
            .unwrap()
            .unwrap();
        drop(conn);
        assert!(!cancelled.fine_applied);
        assert_eq!(cancelled.cancellation_fine, Decimal::ZERO);
        assert_eq!(cancelled.cancelled_by_type, UserType::Parent);

        assert_eq!(
            h.controller.wallet().balance(parent.user_id).await.unwrap(),
            Decimal::ZERO
        );
        assert_eq!(
            h.controller.wallet().balance(driver.user_id).await.unwrap(),
            Decimal::ZERO
        );
    }

    #[tokio::test]
    async fn in_progress_cancellation_moves_the_fine_to_the_counterparty() {
        let h = harness().await;
        let (parent, driver, accepted) = booked_ride(&h, "200").await;
        h.controller
            .start(driver, accepted.ride_id, &accepted.otp)
            .await
            .unwrap();

        let result = h
            .controller
            .cancel(driver, accepted.ride_id, Some("car trouble".to_string()))
            .await
            .unwrap();
        assert!(result.penalty_applied);
        assert_eq!(result.penalty_amount, Some(money("20")));
        assert_eq!(result.cancelled_by_type, UserType::Driver);

        assert_eq!(
            h.controller.wallet().balance(driver.user_id).await.unwrap(),
            money("-20")
        );
        assert_eq!(
            h.controller.wallet().balance(parent.user_id).await.unwrap(),
            money("20")
        );

        let mut conn = h.pool.acquire().await.unwrap();
        let cancelled = h
            .controller
            .store()
            .get_cancelled(&mut conn, accepted.ride_id)
            .await
            .unwrap()
            .unwrap();
        drop(conn);
        assert_eq!(cancelled.cancelled_by_type, UserType::Driver);
        assert_eq!(cancelled.cancellation_fine, money("20"));
        assert!(cancelled.fine_applied);
        assert_eq!(cancelled.cancellation_reason.as_deref(), Some("car trouble"));
    }

    #[tokio::test]
    async fn in_progress_cancellation_requires_a_reason() {
        let h = harness().await;
        let (parent, driver, accepted) = booked_ride(&h, "200").await;
        h.controller
            .start(driver, accepted.ride_id, &accepted.otp)
            .await
            .unwrap();

        for reason in [None, Some("   ".to_string())] {
            let err = h
                .controller
                .cancel(parent, accepted.ride_id, reason)
                .await
                .unwrap_err();
            assert!(matches!(err, RideError::Validation(_)));
        }
        assert_eq!(
            h.controller.store().locate(accepted.ride_id).await.unwrap(),
            vec![Partition::Active]
        );
    }

    #[tokio::test]
    async fn correct_code_is_rejected_once_ride_is_underway() {
        let h = harness().await;
        let (_parent, driver, accepted) = booked_ride(&h, "120").await;
        h.controller
            .start(driver, accepted.ride_id, &accepted.otp)
            .await
            .unwrap();

        // state check outranks code correctness
        let err = h
            .controller
            .start(driver, accepted.ride_id, &accepted.otp)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RideError::InvalidStatus {
                current: RideStatus::InProgress
            }
        ));
    }

    #[tokio::test]
    async fn accept_needs_an_online_and_free_driver() {
        let h = harness().await;
        let parent = parent_session();
        let driver = driver_session();
        let request = h
            .controller
            .create_request(parent, new_request("120"))
            .await
            .unwrap();

        // offline
        let err = h.controller.accept(driver, request.id).await.unwrap_err();
        assert!(matches!(err, RideError::Validation(_)));

        h.controller
            .store()
            .set_driver_online(driver.user_id, true, Utc::now())
            .await
            .unwrap();
        h.controller.accept(driver, request.id).await.unwrap();

        // busy with the ride just accepted
        let second = h
            .controller
            .create_request(parent, new_request("80"))
            .await
            .unwrap();
        let err = h.controller.accept(driver, second.id).await.unwrap_err();
        assert!(matches!(err, RideError::Validation(_)));
    }

    #[tokio::test]
    async fn consumed_request_cannot_be_accepted_again() {
        let h = harness().await;
        let (_parent, _driver, _accepted) = booked_ride(&h, "120").await;

        let late_driver = driver_session();
        h.controller
            .store()
            .set_driver_online(late_driver.user_id, true, Utc::now())
            .await
            .unwrap();
        let open = h.controller.store().list_open_requests().await.unwrap();
        assert!(open.is_empty());
    }

    #[tokio::test]
    async fn held_lock_surfaces_ride_locked() {
        let h = harness().await;
        let (parent, _driver, accepted) = booked_ride(&h, "120").await;

        let _guard = h.controller.locks.acquire(accepted.ride_id).unwrap();
        let err = h
            .controller
            .cancel(parent, accepted.ride_id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RideError::RideLocked));
        drop(_guard);

        // manual retry goes through once the lock clears
        h.controller
            .cancel(parent, accepted.ride_id, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn parent_can_withdraw_a_pending_request() {
        let h = harness().await;
        let parent = parent_session();
        let request = h
            .controller
            .create_request(parent, new_request("90"))
            .await
            .unwrap();

        let result = h
            .controller
            .cancel(parent, request.id, Some("plans changed".to_string()))
            .await
            .unwrap();
        assert!(!result.penalty_applied);
        assert_eq!(
            h.controller.store().locate(request.id).await.unwrap(),
            vec![Partition::Cancelled]
        );

        // a driver arriving later finds nothing to accept
        let driver = driver_session();
        h.controller
            .store()
            .set_driver_online(driver.user_id, true, Utc::now())
            .await
            .unwrap();
        let err = h.controller.accept(driver, request.id).await.unwrap_err();
        assert!(matches!(err, RideError::RequestNotFound));
    }

    #[tokio::test]
    async fn counterparty_credit_can_be_disabled_by_policy() {
        let h = harness_with(LifecyclePolicy {
            penalty_to_counterparty: false,
            ..LifecyclePolicy::default()
        })
        .await;
        let (parent, driver, accepted) = booked_ride(&h, "200").await;
        h.controller
            .start(driver, accepted.ride_id, &accepted.otp)
            .await
            .unwrap();

        h.controller
            .cancel(driver, accepted.ride_id, Some("car trouble".to_string()))
            .await
            .unwrap();

        assert_eq!(
            h.controller.wallet().balance(driver.user_id).await.unwrap(),
            money("-20")
        );
        // the fine stays with the platform
        assert_eq!(
            h.controller.wallet().balance(parent.user_id).await.unwrap(),
            Decimal::ZERO
        );
    }

    #[tokio::test]
    async fn expired_code_is_rejected_when_policy_enables_expiry() {
        let h = harness_with(LifecyclePolicy {
            otp_ttl: Some(Duration::zero()),
            ..LifecyclePolicy::default()
        })
        .await;
        let (_parent, driver, accepted) = booked_ride(&h, "120").await;

        let err = h
            .controller
            .start(driver, accepted.ride_id, &accepted.otp)
            .await
            .unwrap_err();
        assert!(matches!(err, RideError::OtpExpired));
    }

    #[tokio::test]
    async fn terminal_rides_answer_with_their_fate() {
        let h = harness().await;
        let (parent, driver, accepted) = booked_ride(&h, "120").await;
        h.controller
            .start(driver, accepted.ride_id, &accepted.otp)
            .await
            .unwrap();
        h.controller
            .cancel(driver, accepted.ride_id, Some("car trouble".to_string()))
            .await
            .unwrap();

        let err = h.controller.complete(driver, accepted.ride_id).await.unwrap_err();
        assert!(matches!(err, RideError::RideCancelled));
        let err = h
            .controller
            .cancel(parent, accepted.ride_id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RideError::RideCancelled));
    }

    #[tokio::test]
    async fn completed_ride_rejects_cancellation_with_current_status() {
        let h = harness().await;
        let (parent, driver, accepted) = booked_ride(&h, "120").await;
        h.controller
            .start(driver, accepted.ride_id, &accepted.otp)
            .await
            .unwrap();
        h.controller.complete(driver, accepted.ride_id).await.unwrap();

        let err = h
            .controller
            .cancel(parent, accepted.ride_id, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RideError::InvalidStatus {
                current: RideStatus::Completed
            }
        ));
    }

    #[tokio::test]
    async fn id_lives_in_exactly_one_partition_at_every_step() {
        let h = harness().await;
        let (_parent, driver, accepted) = booked_ride(&h, "120").await;
        let ride_id = accepted.ride_id;
        let store = h.controller.store();

        assert_eq!(store.locate(ride_id).await.unwrap().len(), 1);
        h.controller.start(driver, ride_id, &accepted.otp).await.unwrap();
        assert_eq!(store.locate(ride_id).await.unwrap().len(), 1);
        h.controller.complete(driver, ride_id).await.unwrap();
        assert_eq!(
            store.locate(ride_id).await.unwrap(),
            vec![Partition::Completed]
        );
    }

    #[tokio::test]
    async fn parent_cannot_complete_and_driver_cannot_book() {
        let h = harness().await;
        let (parent, _driver, accepted) = booked_ride(&h, "120").await;

        let err = h.controller.complete(parent, accepted.ride_id).await.unwrap_err();
        assert!(matches!(err, RideError::Unauthorized));

        let err = h
            .controller
            .create_request(driver_session(), new_request("50"))
            .await
            .unwrap_err();
        assert!(matches!(err, RideError::Unauthorized));
    }

    #[tokio::test]
    async fn cancel_response_body_reports_success() {
        let h = harness().await;
        let (parent, _driver, accepted) = booked_ride(&h, "120").await;

        let result = h
            .controller
            .cancel(parent, accepted.ride_id, None)
            .await
            .unwrap();
        assert!(result.success);

        let body = serde_json::to_value(&result).unwrap();
        assert_eq!(body["success"], serde_json::Value::Bool(true));
        assert!(body.get("message").is_some());
        assert_eq!(body["penalty_applied"], serde_json::Value::Bool(false));
    }

    #[tokio::test]
    async fn request_taken_mid_accept_reads_as_gone() {
        let h = harness().await;
        let mut request = testing::sample_request();
        request.status = RequestStatus::Accepted;
        h.controller.store().insert_request(&request).await.unwrap();

        let driver = driver_session();
        h.controller
            .store()
            .set_driver_online(driver.user_id, true, Utc::now())
            .await
            .unwrap();
        // the winning accept deletes the row before committing, so the loser
        // gets the same answer either side of that commit
        let err = h.controller.accept(driver, request.id).await.unwrap_err();
        assert!(matches!(err, RideError::RequestNotFound));
    }

    #[test]
    fn haversine_knows_a_known_distance() {
        let (origin, destination) = testing::sample_geo();
        let km = haversine_km(&origin, &destination);
        // roughly 4.2km between the two sample points
        assert!(km > 3.0 && km < 6.0, "got {km}");
    }
}
