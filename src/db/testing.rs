//! Shared fixtures for store and controller tests.

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::rides::{GeoPoint, Ride, RequestStatus, RideRequest, RideStatus};

/// In-memory SQLite with the embedded migrations applied. A single connection
/// keeps every test on one private database; callers must drop any held
/// connection before going back through the pool.
pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations");
    pool
}

pub fn sample_geo() -> (GeoPoint, GeoPoint) {
    (
        GeoPoint {
            lat: -33.9249,
            lng: 18.4241,
            address: "12 Kloof Street, Cape Town".to_string(),
        },
        GeoPoint {
            lat: -33.9608,
            lng: 18.4098,
            address: "Greenfields Primary School".to_string(),
        },
    )
}

pub fn sample_request() -> RideRequest {
    let (origin, destination) = sample_geo();
    RideRequest {
        id: Uuid::new_v4(),
        parent_id: Uuid::new_v4(),
        child_id: Uuid::new_v4(),
        origin,
        destination,
        scheduled_time: Utc::now() + Duration::hours(2),
        fare_estimate: Decimal::new(12000, 2), // 120.00
        status: RequestStatus::Pending,
        created_at: Utc::now(),
    }
}

pub fn sample_ride() -> Ride {
    let (origin, destination) = sample_geo();
    let now = Utc::now();
    Ride {
        id: Uuid::new_v4(),
        request_id: Uuid::new_v4(),
        parent_id: Uuid::new_v4(),
        driver_id: Uuid::new_v4(),
        child_id: Uuid::new_v4(),
        origin,
        destination,
        current_location: None,
        scheduled_time: now + Duration::hours(2),
        estimated_arrival: Some(now + Duration::hours(2) + Duration::minutes(25)),
        fare: Decimal::new(12000, 2),
        otp: "483920".to_string(),
        otp_generated_at: now,
        status: RideStatus::Scheduled,
        actual_pickup_time: None,
        updated_at: now,
    }
}
