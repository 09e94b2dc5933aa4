//! Parking repositories
//!
//! Collaborator contracts consumed by the scanner, and their Postgres
//! implementation over the parking service schema.

use super::types::*;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

#[async_trait]
pub trait ZoneRepository: Send + Sync {
    async fn list_zones(&self) -> Result<Vec<Zone>>;
    async fn list_places_with_location(&self, zone_id: ZoneId) -> Result<Vec<PlaceLocation>>;
    async fn mark_checked(&self, zone_id: ZoneId, at: DateTime<Utc>) -> Result<()>;
}

#[async_trait]
pub trait BookingRepository: Send + Sync {
    /// Bookings active at `now`
    async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<Booking>>;
}

#[async_trait]
pub trait ViolationRepository: Send + Sync {
    async fn list_by_place(&self, place_id: PlaceId) -> Result<Vec<ViolationRecord>>;
    async fn create(&self, violation: NewViolation) -> Result<ViolationRecord>;
}

#[async_trait]
pub trait PlaceRepository: Send + Sync {
    async fn set_status(&self, place_id: PlaceId, status: PlaceStatus) -> Result<()>;
}

#[async_trait]
pub trait CameraRepository: Send + Sync {
    /// Snapshot reference of every camera in the zone
    async fn get_snapshots(&self, zone_id: ZoneId) -> Result<Vec<CameraSnapshot>>;
}

/// Booking status id meaning "active"
const BOOKING_STATUS_ACTIVE: i32 = 1;

#[derive(FromRow)]
struct PlaceLocationRow {
    place_id: i32,
    place_number: i32,
    location: Option<serde_json::Value>,
}

impl From<PlaceLocationRow> for PlaceLocation {
    fn from(row: PlaceLocationRow) -> Self {
        let location = match row.location {
            Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                tracing::warn!(place_id = row.place_id, error = %e, "Unreadable place polygon");
                Polygon::default()
            }),
            None => Polygon::default(),
        };
        PlaceLocation {
            place_id: row.place_id,
            place_number: row.place_number,
            location,
        }
    }
}

/// Postgres-backed store
#[derive(Clone)]
pub struct PgParkingStore {
    pool: PgPool,
}

impl PgParkingStore {
    /// Create new store
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// Timestamp columns are `timestamp without time zone` holding UTC

#[async_trait]
impl ZoneRepository for PgParkingStore {
    async fn list_zones(&self) -> Result<Vec<Zone>> {
        let zones = sqlx::query_as::<_, Zone>(
            r#"
            SELECT id, zone_name AS name, update_time AT TIME ZONE 'UTC' AS last_checked_at
            FROM parking_zones
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(zones)
    }

    async fn list_places_with_location(&self, zone_id: ZoneId) -> Result<Vec<PlaceLocation>> {
        let rows = sqlx::query_as::<_, PlaceLocationRow>(
            r#"
            SELECT DISTINCT ON (p.id) p.id AS place_id, p.place_number, cpp.location
            FROM parking_places p
            LEFT JOIN camera_parking_places cpp ON cpp.parking_place_id = p.id
            WHERE p.parking_zone_id = $1
            ORDER BY p.id, cpp.id
            "#,
        )
        .bind(zone_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(PlaceLocation::from).collect())
    }

    async fn mark_checked(&self, zone_id: ZoneId, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE parking_zones SET update_time = $1::timestamptz AT TIME ZONE 'UTC' WHERE id = $2",
        )
        .bind(at)
        .bind(zone_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::Repository(format!("zone {} not found", zone_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl BookingRepository for PgParkingStore {
    async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<Booking>> {
        let bookings = sqlx::query_as::<_, Booking>(
            r#"
            SELECT id, parking_place_id AS place_id,
                   start_time AT TIME ZONE 'UTC' AS start_time,
                   end_time AT TIME ZONE 'UTC' AS end_time
            FROM bookings
            WHERE booking_status_id = $1
              AND start_time <= ($2::timestamptz AT TIME ZONE 'UTC')
              AND (end_time IS NULL OR end_time >= ($2::timestamptz AT TIME ZONE 'UTC'))
            "#,
        )
        .bind(BOOKING_STATUS_ACTIVE)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(bookings)
    }
}

#[async_trait]
impl ViolationRepository for PgParkingStore {
    async fn list_by_place(&self, place_id: PlaceId) -> Result<Vec<ViolationRecord>> {
        let records = sqlx::query_as::<_, ViolationRecord>(
            r#"
            SELECT id, parking_place_id AS place_id, car_number,
                   "timestamp" AT TIME ZONE 'UTC' AS "timestamp"
            FROM violations
            WHERE parking_place_id = $1
            ORDER BY "timestamp" DESC
            "#,
        )
        .bind(place_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn create(&self, violation: NewViolation) -> Result<ViolationRecord> {
        let record = sqlx::query_as::<_, ViolationRecord>(
            r#"
            INSERT INTO violations (parking_place_id, car_number, "timestamp")
            VALUES ($1, $2, $3::timestamptz AT TIME ZONE 'UTC')
            RETURNING id, parking_place_id AS place_id, car_number,
                      "timestamp" AT TIME ZONE 'UTC' AS "timestamp"
            "#,
        )
        .bind(violation.place_id)
        .bind(&violation.car_number)
        .bind(violation.timestamp)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }
}

#[async_trait]
impl PlaceRepository for PgParkingStore {
    async fn set_status(&self, place_id: PlaceId, status: PlaceStatus) -> Result<()> {
        let result = sqlx::query("UPDATE parking_places SET place_status_id = $1 WHERE id = $2")
            .bind(status.status_id())
            .bind(place_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::Repository(format!("place {} not found", place_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl CameraRepository for PgParkingStore {
    async fn get_snapshots(&self, zone_id: ZoneId) -> Result<Vec<CameraSnapshot>> {
        let snapshots = sqlx::query_as::<_, CameraSnapshot>(
            r#"
            SELECT id AS camera_id, NULLIF(url, '') AS image_url
            FROM cameras
            WHERE parking_zone_id = $1
            ORDER BY id
            "#,
        )
        .bind(zone_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(snapshots)
    }
}
