//! Parking domain types
//!
//! Zones, places, bookings and violations as seen by the scanner

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashSet;

pub type ZoneId = i32;
pub type PlaceId = i32;

/// Parking zone
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Zone {
    pub id: ZoneId,
    pub name: String,
    /// Last time the scanner finished with this zone
    pub last_checked_at: Option<DateTime<Utc>>,
}

/// Place outline inside the zone image, `[[x, y], ...]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Polygon(pub Vec<[f64; 2]>);

impl Polygon {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Place with the polygon used for cropping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceLocation {
    pub place_id: PlaceId,
    pub place_number: i32,
    pub location: Polygon,
}

/// Places to examine in one zone for one cycle; never cached across cycles
#[derive(Debug, Clone)]
pub struct ZoneSnapshot {
    pub zone: Zone,
    pub places: Vec<PlaceLocation>,
}

/// Booking of a place
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Booking {
    pub id: i32,
    pub place_id: PlaceId,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Booking {
    /// Active iff `start <= now <= end`, or open-ended and `start <= now`
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        match self.end_time {
            Some(end) => self.start_time <= now && now <= end,
            None => self.start_time <= now,
        }
    }
}

/// Places with a booking active at scan time
#[derive(Debug, Clone, Default)]
pub struct BookedPlaceSet(HashSet<PlaceId>);

impl BookedPlaceSet {
    pub fn collect(bookings: &[Booking], now: DateTime<Utc>) -> Self {
        Self(
            bookings
                .iter()
                .filter(|b| b.is_active_at(now))
                .map(|b| b.place_id)
                .collect(),
        )
    }

    pub fn contains(&self, place_id: PlaceId) -> bool {
        self.0.contains(&place_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Stored violation
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ViolationRecord {
    pub id: i32,
    pub place_id: PlaceId,
    pub car_number: String,
    pub timestamp: DateTime<Utc>,
}

/// Violation to create
#[derive(Debug, Clone)]
pub struct NewViolation {
    pub place_id: PlaceId,
    pub car_number: String,
    pub timestamp: DateTime<Utc>,
}

/// Place status written by the scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceStatus {
    Free,
    Occupied,
}

impl PlaceStatus {
    /// Row id in `place_statuses`
    pub fn status_id(self) -> i32 {
        match self {
            PlaceStatus::Free => 1,
            PlaceStatus::Occupied => 2,
        }
    }
}

/// Snapshot reference from one zone camera
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CameraSnapshot {
    pub camera_id: i32,
    pub image_url: Option<String>,
}

/// Normalized occupancy class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OccupancyClass {
    Occupied,
    Free,
    Unknown,
}

impl OccupancyClass {
    /// Single normalization point for detector labels (case and whitespace insensitive).
    /// The detector reports either English or Russian labels.
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "occupied" | "busy" | "taken" | "занято" => OccupancyClass::Occupied,
            "free" | "empty" | "vacant" | "свободно" => OccupancyClass::Free,
            _ => OccupancyClass::Unknown,
        }
    }
}

/// One place's classification for one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub status: String,
    pub parking_status: String,
    pub plate_number: Option<String>,
}

impl DetectionResult {
    pub fn occupancy(&self) -> OccupancyClass {
        OccupancyClass::normalize(&self.parking_status)
    }

    /// Trimmed, non-empty plate number
    pub fn plate(&self) -> Option<&str> {
        self.plate_number
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }
}
