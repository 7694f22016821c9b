use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::utils::{decimal_from_db, decimal_to_db, uuid_from_db};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    Pending,
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

impl RideStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RideStatus::Pending => "pending",
            RideStatus::Scheduled => "scheduled",
            RideStatus::InProgress => "in_progress",
            RideStatus::Completed => "completed",
            RideStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(RideStatus::Pending),
            "scheduled" => Some(RideStatus::Scheduled),
            "in_progress" => Some(RideStatus::InProgress),
            "completed" => Some(RideStatus::Completed),
            "cancelled" => Some(RideStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for RideStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requests only ever sit in `pending` or, transiently inside the accept
/// transaction, `accepted`; a committed accept removes the row entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Accepted,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Accepted => "accepted",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(RequestStatus::Pending),
            "accepted" => Some(RequestStatus::Accepted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    Parent,
    Driver,
}

impl UserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::Parent => "parent",
            UserType::Driver => "driver",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "parent" => Some(UserType::Parent),
            "driver" => Some(UserType::Driver),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
    pub address: String,
}

/// Pre-acceptance booking intent created by a parent. Consumed on driver
/// acceptance, producing a ride.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideRequest {
    pub id: Uuid,
    pub parent_id: Uuid,
    pub child_id: Uuid,
    pub origin: GeoPoint,
    pub destination: GeoPoint,
    pub scheduled_time: DateTime<Utc>,
    pub fare_estimate: Decimal,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ride {
    pub id: Uuid,
    pub request_id: Uuid,
    pub parent_id: Uuid,
    pub driver_id: Uuid,
    pub child_id: Uuid,
    pub origin: GeoPoint,
    pub destination: GeoPoint,
    pub current_location: Option<(f64, f64)>,
    pub scheduled_time: DateTime<Utc>,
    pub estimated_arrival: Option<DateTime<Utc>>,
    pub fare: Decimal,
    pub otp: String,
    pub otp_generated_at: DateTime<Utc>,
    pub status: RideStatus,
    pub actual_pickup_time: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedRide {
    pub id: Uuid,
    pub request_id: Uuid,
    pub parent_id: Uuid,
    pub driver_id: Uuid,
    pub child_id: Uuid,
    pub origin: GeoPoint,
    pub destination: GeoPoint,
    pub scheduled_time: DateTime<Utc>,
    pub fare: Decimal,
    pub completed_at: DateTime<Utc>,
    pub actual_pickup_time: Option<DateTime<Utc>>,
    pub actual_dropoff_time: DateTime<Utc>,
    pub distance_traveled: f64,
    pub duration_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelledRide {
    pub id: Uuid,
    pub request_id: Uuid,
    pub parent_id: Uuid,
    pub driver_id: Option<Uuid>,
    pub child_id: Uuid,
    pub origin: GeoPoint,
    pub destination: GeoPoint,
    pub scheduled_time: DateTime<Utc>,
    pub fare: Decimal,
    pub cancelled_by: Uuid,
    pub cancelled_by_type: UserType,
    pub cancellation_reason: Option<String>,
    pub cancelled_at: DateTime<Utc>,
    pub fine_applied: bool,
    pub cancellation_fine: Decimal,
}

/// The four logical partitions a ride id may live in. A ride belongs to
/// exactly one at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    Requests,
    Active,
    Completed,
    Cancelled,
}

fn status_from_row(row: &SqliteRow, column: &str) -> Result<RideStatus, sqlx::Error> {
    let raw: String = row.try_get(column)?;
    RideStatus::parse(&raw).ok_or_else(|| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: format!("unknown ride status: {raw}").into(),
    })
}

fn request_status_from_row(row: &SqliteRow, column: &str) -> Result<RequestStatus, sqlx::Error> {
    let raw: String = row.try_get(column)?;
    RequestStatus::parse(&raw).ok_or_else(|| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: format!("unknown request status: {raw}").into(),
    })
}

fn request_from_row(row: &SqliteRow) -> Result<RideRequest, sqlx::Error> {
    Ok(RideRequest {
        id: uuid_from_db("id", &row.try_get::<String, _>("id")?)?,
        parent_id: uuid_from_db("parent_id", &row.try_get::<String, _>("parent_id")?)?,
        child_id: uuid_from_db("child_id", &row.try_get::<String, _>("child_id")?)?,
        origin: GeoPoint {
            lat: row.try_get("origin_lat")?,
            lng: row.try_get("origin_lng")?,
            address: row.try_get("origin_address")?,
        },
        destination: GeoPoint {
            lat: row.try_get("destination_lat")?,
            lng: row.try_get("destination_lng")?,
            address: row.try_get("destination_address")?,
        },
        scheduled_time: row.try_get("scheduled_time")?,
        fare_estimate: decimal_from_db("fare_estimate", &row.try_get::<String, _>("fare_estimate")?)?,
        status: request_status_from_row(row, "status")?,
        created_at: row.try_get("created_at")?,
    })
}

fn ride_from_row(row: &SqliteRow) -> Result<Ride, sqlx::Error> {
    let current_lat: Option<f64> = row.try_get("current_lat")?;
    let current_lng: Option<f64> = row.try_get("current_lng")?;
    Ok(Ride {
        id: uuid_from_db("id", &row.try_get::<String, _>("id")?)?,
        request_id: uuid_from_db("request_id", &row.try_get::<String, _>("request_id")?)?,
        parent_id: uuid_from_db("parent_id", &row.try_get::<String, _>("parent_id")?)?,
        driver_id: uuid_from_db("driver_id", &row.try_get::<String, _>("driver_id")?)?,
        child_id: uuid_from_db("child_id", &row.try_get::<String, _>("child_id")?)?,
        origin: GeoPoint {
            lat: row.try_get("origin_lat")?,
            lng: row.try_get("origin_lng")?,
            address: row.try_get("origin_address")?,
        },
        destination: GeoPoint {
            lat: row.try_get("destination_lat")?,
            lng: row.try_get("destination_lng")?,
            address: row.try_get("destination_address")?,
        },
        current_location: match (current_lat, current_lng) {
            (Some(lat), Some(lng)) => Some((lat, lng)),
            _ => None,
        },
        scheduled_time: row.try_get("scheduled_time")?,
        estimated_arrival: row.try_get("estimated_arrival")?,
        fare: decimal_from_db("fare", &row.try_get::<String, _>("fare")?)?,
        otp: row.try_get("otp")?,
        otp_generated_at: row.try_get("otp_generated_at")?,
        status: status_from_row(row, "status")?,
        actual_pickup_time: row.try_get("actual_pickup_time")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn completed_from_row(row: &SqliteRow) -> Result<CompletedRide, sqlx::Error> {
    Ok(CompletedRide {
        id: uuid_from_db("id", &row.try_get::<String, _>("id")?)?,
        request_id: uuid_from_db("request_id", &row.try_get::<String, _>("request_id")?)?,
        parent_id: uuid_from_db("parent_id", &row.try_get::<String, _>("parent_id")?)?,
        driver_id: uuid_from_db("driver_id", &row.try_get::<String, _>("driver_id")?)?,
        child_id: uuid_from_db("child_id", &row.try_get::<String, _>("child_id")?)?,
        origin: GeoPoint {
            lat: row.try_get("origin_lat")?,
            lng: row.try_get("origin_lng")?,
            address: row.try_get("origin_address")?,
        },
        destination: GeoPoint {
            lat: row.try_get("destination_lat")?,
            lng: row.try_get("destination_lng")?,
            address: row.try_get("destination_address")?,
        },
        scheduled_time: row.try_get("scheduled_time")?,
        fare: decimal_from_db("fare", &row.try_get::<String, _>("fare")?)?,
        completed_at: row.try_get("completed_at")?,
        actual_pickup_time: row.try_get("actual_pickup_time")?,
        actual_dropoff_time: row.try_get("actual_dropoff_time")?,
        distance_traveled: row.try_get("distance_traveled")?,
        duration_minutes: row.try_get("duration_minutes")?,
    })
}

fn cancelled_from_row(row: &SqliteRow) -> Result<CancelledRide, sqlx::Error> {
    let driver_id: Option<String> = row.try_get("driver_id")?;
    let by_type_raw: String = row.try_get("cancelled_by_type")?;
    let cancelled_by_type =
        UserType::parse(&by_type_raw).ok_or_else(|| sqlx::Error::ColumnDecode {
            index: "cancelled_by_type".to_string(),
            source: format!("unknown actor type: {by_type_raw}").into(),
        })?;
    Ok(CancelledRide {
        id: uuid_from_db("id", &row.try_get::<String, _>("id")?)?,
        request_id: uuid_from_db("request_id", &row.try_get::<String, _>("request_id")?)?,
        parent_id: uuid_from_db("parent_id", &row.try_get::<String, _>("parent_id")?)?,
        driver_id: driver_id
            .map(|raw| uuid_from_db("driver_id", &raw))
            .transpose()?,
        child_id: uuid_from_db("child_id", &row.try_get::<String, _>("child_id")?)?,
        origin: GeoPoint {
            lat: row.try_get("origin_lat")?,
            lng: row.try_get("origin_lng")?,
            address: row.try_get("origin_address")?,
        },
        destination: GeoPoint {
            lat: row.try_get("destination_lat")?,
            lng: row.try_get("destination_lng")?,
            address: row.try_get("destination_address")?,
        },
        scheduled_time: row.try_get("scheduled_time")?,
        fare: decimal_from_db("fare", &row.try_get::<String, _>("fare")?)?,
        cancelled_by: uuid_from_db("cancelled_by", &row.try_get::<String, _>("cancelled_by")?)?,
        cancelled_by_type,
        cancellation_reason: row.try_get("cancellation_reason")?,
        cancelled_at: row.try_get("cancelled_at")?,
        fine_applied: row.try_get::<i64, _>("fine_applied")? != 0,
        cancellation_fine: decimal_from_db(
            "cancellation_fine",
            &row.try_get::<String, _>("cancellation_fine")?,
        )?,
    })
}

// Ride record store. Reads go through the pool; anything that participates in
// a lifecycle transition takes the transaction's connection so the partition
// move and the wallet mutation commit together.
#[derive(Clone)]
pub struct RideStore {
    pool: SqlitePool,
}

impl RideStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert_request(&self, request: &RideRequest) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO ride_requests
                (id, parent_id, child_id, origin_lat, origin_lng, origin_address,
                 destination_lat, destination_lng, destination_address,
                 scheduled_time, fare_estimate, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(request.id.to_string())
        .bind(request.parent_id.to_string())
        .bind(request.child_id.to_string())
        .bind(request.origin.lat)
        .bind(request.origin.lng)
        .bind(&request.origin.address)
        .bind(request.destination.lat)
        .bind(request.destination.lng)
        .bind(&request.destination.address)
        .bind(request.scheduled_time)
        .bind(decimal_to_db(request.fare_estimate))
        .bind(request.status.as_str())
        .bind(request.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_request(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
    ) -> Result<Option<RideRequest>, sqlx::Error> {
        sqlx::query("SELECT * FROM ride_requests WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(conn)
            .await?
            .map(|row| request_from_row(&row))
            .transpose()
    }

    pub async fn list_open_requests(&self) -> Result<Vec<RideRequest>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT * FROM ride_requests WHERE status = 'pending' ORDER BY scheduled_time",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(request_from_row).collect()
    }

    /// Optimistic accept guard: flips the request to `accepted` only if it is
    /// still `pending`. Returns false when another driver got there first.
    pub async fn mark_request_accepted(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE ride_requests SET status = 'accepted' WHERE id = ? AND status = 'pending'",
        )
        .bind(id.to_string())
        .execute(conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn delete_request(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM ride_requests WHERE id = ?")
            .bind(id.to_string())
            .execute(conn)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Re-opens a cancelled ride as a pending request under its original
    /// request id, so other drivers can pick it up again.
    pub async fn reopen_request(
        &self,
        conn: &mut SqliteConnection,
        ride: &Ride,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO ride_requests
                (id, parent_id, child_id, origin_lat, origin_lng, origin_address,
                 destination_lat, destination_lng, destination_address,
                 scheduled_time, fare_estimate, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(ride.request_id.to_string())
        .bind(ride.parent_id.to_string())
        .bind(ride.child_id.to_string())
        .bind(ride.origin.lat)
        .bind(ride.origin.lng)
        .bind(&ride.origin.address)
        .bind(ride.destination.lat)
        .bind(ride.destination.lng)
        .bind(&ride.destination.address)
        .bind(ride.scheduled_time)
        .bind(decimal_to_db(ride.fare))
        .bind(now)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn insert_ride(
        &self,
        conn: &mut SqliteConnection,
        ride: &Ride,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO rides
                (id, request_id, parent_id, driver_id, child_id,
                 origin_lat, origin_lng, origin_address,
                 destination_lat, destination_lng, destination_address,
                 current_lat, current_lng, scheduled_time, estimated_arrival,
                 fare, otp, otp_generated_at, status, actual_pickup_time, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(ride.id.to_string())
        .bind(ride.request_id.to_string())
        .bind(ride.parent_id.to_string())
        .bind(ride.driver_id.to_string())
        .bind(ride.child_id.to_string())
        .bind(ride.origin.lat)
        .bind(ride.origin.lng)
        .bind(&ride.origin.address)
        .bind(ride.destination.lat)
        .bind(ride.destination.lng)
        .bind(&ride.destination.address)
        .bind(ride.current_location.map(|(lat, _)| lat))
        .bind(ride.current_location.map(|(_, lng)| lng))
        .bind(ride.scheduled_time)
        .bind(ride.estimated_arrival)
        .bind(decimal_to_db(ride.fare))
        .bind(&ride.otp)
        .bind(ride.otp_generated_at)
        .bind(ride.status.as_str())
        .bind(ride.actual_pickup_time)
        .bind(ride.updated_at)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn get_ride(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
    ) -> Result<Option<Ride>, sqlx::Error> {
        sqlx::query("SELECT * FROM rides WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(conn)
            .await?
            .map(|row| ride_from_row(&row))
            .transpose()
    }

    pub async fn set_ride_started(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
        pickup_time: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE rides SET status = 'in_progress', actual_pickup_time = ?, updated_at = ? WHERE id = ?",
        )
        .bind(pickup_time)
        .bind(pickup_time)
        .bind(id.to_string())
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Position update scoped to the ride's own driver; a stranger driver's
    /// id matches zero rows.
    pub async fn update_current_location(
        &self,
        id: Uuid,
        driver_id: Uuid,
        lat: f64,
        lng: f64,
        now: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE rides SET current_lat = ?, current_lng = ?, updated_at = ? WHERE id = ? AND driver_id = ?",
        )
        .bind(lat)
        .bind(lng)
        .bind(now)
        .bind(id.to_string())
        .bind(driver_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn find_active(&self, id: Uuid) -> Result<Option<Ride>, sqlx::Error> {
        sqlx::query("SELECT * FROM rides WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| ride_from_row(&row))
            .transpose()
    }

    pub async fn delete_ride(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM rides WHERE id = ?")
            .bind(id.to_string())
            .execute(conn)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn insert_completed(
        &self,
        conn: &mut SqliteConnection,
        ride: &CompletedRide,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO completed_rides
                (id, request_id, parent_id, driver_id, child_id,
                 origin_lat, origin_lng, origin_address,
                 destination_lat, destination_lng, destination_address,
                 scheduled_time, fare, completed_at, actual_pickup_time,
                 actual_dropoff_time, distance_traveled, duration_minutes)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(ride.id.to_string())
        .bind(ride.request_id.to_string())
        .bind(ride.parent_id.to_string())
        .bind(ride.driver_id.to_string())
        .bind(ride.child_id.to_string())
        .bind(ride.origin.lat)
        .bind(ride.origin.lng)
        .bind(&ride.origin.address)
        .bind(ride.destination.lat)
        .bind(ride.destination.lng)
        .bind(&ride.destination.address)
        .bind(ride.scheduled_time)
        .bind(decimal_to_db(ride.fare))
        .bind(ride.completed_at)
        .bind(ride.actual_pickup_time)
        .bind(ride.actual_dropoff_time)
        .bind(ride.distance_traveled)
        .bind(ride.duration_minutes)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn get_completed(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
    ) -> Result<Option<CompletedRide>, sqlx::Error> {
        sqlx::query("SELECT * FROM completed_rides WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(conn)
            .await?
            .map(|row| completed_from_row(&row))
            .transpose()
    }

    pub async fn insert_cancelled(
        &self,
        conn: &mut SqliteConnection,
        ride: &CancelledRide,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO cancelled_rides
                (id, request_id, parent_id, driver_id, child_id,
                 origin_lat, origin_lng, origin_address,
                 destination_lat, destination_lng, destination_address,
                 scheduled_time, fare, cancelled_by, cancelled_by_type,
                 cancellation_reason, cancelled_at, fine_applied, cancellation_fine)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(ride.id.to_string())
        .bind(ride.request_id.to_string())
        .bind(ride.parent_id.to_string())
        .bind(ride.driver_id.map(|id| id.to_string()))
        .bind(ride.child_id.to_string())
        .bind(ride.origin.lat)
        .bind(ride.origin.lng)
        .bind(&ride.origin.address)
        .bind(ride.destination.lat)
        .bind(ride.destination.lng)
        .bind(&ride.destination.address)
        .bind(ride.scheduled_time)
        .bind(decimal_to_db(ride.fare))
        .bind(ride.cancelled_by.to_string())
        .bind(ride.cancelled_by_type.as_str())
        .bind(&ride.cancellation_reason)
        .bind(ride.cancelled_at)
        .bind(ride.fine_applied as i64)
        .bind(decimal_to_db(ride.cancellation_fine))
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn get_cancelled(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
    ) -> Result<Option<CancelledRide>, sqlx::Error> {
        sqlx::query("SELECT * FROM cancelled_rides WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(conn)
            .await?
            .map(|row| cancelled_from_row(&row))
            .transpose()
    }

    pub async fn count_active_for_driver(
        &self,
        conn: &mut SqliteConnection,
        driver_id: Uuid,
    ) -> Result<i64, sqlx::Error> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM rides WHERE driver_id = ?")
            .bind(driver_id.to_string())
            .fetch_one(conn)
            .await?;
        row.try_get("n")
    }

    pub async fn list_active_for_user(&self, user_id: Uuid) -> Result<Vec<Ride>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT * FROM rides WHERE parent_id = ? OR driver_id = ? ORDER BY scheduled_time",
        )
        .bind(user_id.to_string())
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(ride_from_row).collect()
    }

    pub async fn list_active(&self) -> Result<Vec<Ride>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM rides ORDER BY scheduled_time")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(ride_from_row).collect()
    }

    pub async fn list_completed_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<CompletedRide>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT * FROM completed_rides WHERE parent_id = ? OR driver_id = ? ORDER BY completed_at DESC",
        )
        .bind(user_id.to_string())
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(completed_from_row).collect()
    }

    pub async fn list_cancelled_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<CancelledRide>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT * FROM cancelled_rides WHERE parent_id = ? OR driver_id = ? ORDER BY cancelled_at DESC",
        )
        .bind(user_id.to_string())
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(cancelled_from_row).collect()
    }

    /// Which partitions hold this id right now. The lifecycle invariant says
    /// the answer always has length 0 (unknown id) or 1.
    pub async fn locate(&self, id: Uuid) -> Result<Vec<Partition>, sqlx::Error> {
        let id = id.to_string();
        let mut found = Vec::new();
        let tables = [
            ("ride_requests", Partition::Requests),
            ("rides", Partition::Active),
            ("completed_rides", Partition::Completed),
            ("cancelled_rides", Partition::Cancelled),
        ];
        for (table, partition) in tables {
            let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {table} WHERE id = ?"))
                .bind(&id)
                .fetch_one(&self.pool)
                .await?;
            if row.try_get::<i64, _>("n")? > 0 {
                found.push(partition);
            }
        }
        Ok(found)
    }

    pub async fn set_driver_online(
        &self,
        driver_id: Uuid,
        online: bool,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO driver_status (user_id, online, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET online = excluded.online, updated_at = excluded.updated_at
            "#,
        )
        .bind(driver_id.to_string())
        .bind(online as i64)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn driver_is_online(
        &self,
        conn: &mut SqliteConnection,
        driver_id: Uuid,
    ) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT online FROM driver_status WHERE user_id = ?")
            .bind(driver_id.to_string())
            .fetch_optional(conn)
            .await?;
        Ok(match row {
            Some(row) => row.try_get::<i64, _>("online")? != 0,
            None => false,
        })
    }
}
