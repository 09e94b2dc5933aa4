//! In-memory parking store
//!
//! Implements every collaborator trait over plain collections, with
//! failure injection and call counters for scanner tests.

use super::repository::*;
use super::types::*;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

struct StoredPlace {
    zone_id: ZoneId,
    place_number: i32,
    location: Polygon,
    status: Option<PlaceStatus>,
}

#[derive(Default)]
struct StoreState {
    zones: BTreeMap<ZoneId, Zone>,
    places: BTreeMap<PlaceId, StoredPlace>,
    bookings: Vec<Booking>,
    violations: Vec<ViolationRecord>,
    cameras: BTreeMap<ZoneId, Vec<CameraSnapshot>>,
    failing_zones: HashSet<ZoneId>,
    next_violation_id: i32,
}

/// In-memory store
#[derive(Default)]
pub struct InMemoryParkingStore {
    state: Mutex<StoreState>,
    fail_list_zones: AtomicBool,
    fail_list_bookings: AtomicBool,
    zone_list_calls: AtomicUsize,
    status_writes: AtomicUsize,
}

impl InMemoryParkingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_zone(&self, id: ZoneId, name: &str) {
        self.state().zones.insert(
            id,
            Zone {
                id,
                name: name.to_string(),
                last_checked_at: None,
            },
        );
    }

    pub fn add_place(&self, zone_id: ZoneId, place_id: PlaceId, location: Polygon) {
        self.state().places.insert(
            place_id,
            StoredPlace {
                zone_id,
                place_number: place_id,
                location,
                status: None,
            },
        );
    }

    pub fn add_booking(&self, booking: Booking) {
        self.state().bookings.push(booking);
    }

    pub fn add_violation(&self, place_id: PlaceId, car_number: &str, timestamp: DateTime<Utc>) {
        let mut state = self.state();
        state.next_violation_id += 1;
        let id = state.next_violation_id;
        state.violations.push(ViolationRecord {
            id,
            place_id,
            car_number: car_number.to_string(),
            timestamp,
        });
    }

    pub fn add_camera(&self, zone_id: ZoneId, camera_id: i32, image_url: Option<&str>) {
        self.state()
            .cameras
            .entry(zone_id)
            .or_default()
            .push(CameraSnapshot {
                camera_id,
                image_url: image_url.map(str::to_string),
            });
    }

    /// `list_zones` fails while set
    pub fn set_fail_list_zones(&self, fail: bool) {
        self.fail_list_zones.store(fail, Ordering::SeqCst);
    }

    /// `list_active` fails while set
    pub fn set_fail_list_bookings(&self, fail: bool) {
        self.fail_list_bookings.store(fail, Ordering::SeqCst);
    }

    /// `list_places_with_location` fails for this zone
    pub fn fail_places_for_zone(&self, zone_id: ZoneId) {
        self.state().failing_zones.insert(zone_id);
    }

    pub fn violations(&self) -> Vec<ViolationRecord> {
        self.state().violations.clone()
    }

    pub fn place_status(&self, place_id: PlaceId) -> Option<PlaceStatus> {
        self.state().places.get(&place_id).and_then(|p| p.status)
    }

    pub fn last_checked(&self, zone_id: ZoneId) -> Option<DateTime<Utc>> {
        self.state().zones.get(&zone_id).and_then(|z| z.last_checked_at)
    }

    /// Number of `list_zones` calls, one per scan cycle
    pub fn zone_list_calls(&self) -> usize {
        self.zone_list_calls.load(Ordering::SeqCst)
    }

    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ZoneRepository for InMemoryParkingStore {
    async fn list_zones(&self) -> Result<Vec<Zone>> {
        self.zone_list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_list_zones.load(Ordering::SeqCst) {
            return Err(Error::Repository("zone listing unavailable".to_string()));
        }
        Ok(self.state().zones.values().cloned().collect())
    }

    async fn list_places_with_location(&self, zone_id: ZoneId) -> Result<Vec<PlaceLocation>> {
        let state = self.state();
        if state.failing_zones.contains(&zone_id) {
            return Err(Error::Repository(format!("places of zone {} unavailable", zone_id)));
        }
        Ok(state
            .places
            .iter()
            .filter(|(_, p)| p.zone_id == zone_id)
            .map(|(id, p)| PlaceLocation {
                place_id: *id,
                place_number: p.place_number,
                location: p.location.clone(),
            })
            .collect())
    }

    async fn mark_checked(&self, zone_id: ZoneId, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state();
        let zone = state
            .zones
            .get_mut(&zone_id)
            .ok_or_else(|| Error::Repository(format!("zone {} not found", zone_id)))?;
        zone.last_checked_at = Some(at);
        Ok(())
    }
}

#[async_trait]
impl BookingRepository for InMemoryParkingStore {
    async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<Booking>> {
        if self.fail_list_bookings.load(Ordering::SeqCst) {
            return Err(Error::Repository("booking listing unavailable".to_string()));
        }
        Ok(self
            .state()
            .bookings
            .iter()
            .filter(|b| b.is_active_at(now))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ViolationRepository for InMemoryParkingStore {
    async fn list_by_place(&self, place_id: PlaceId) -> Result<Vec<ViolationRecord>> {
        Ok(self
            .state()
            .violations
            .iter()
            .filter(|v| v.place_id == place_id)
            .cloned()
            .collect())
    }

    async fn create(&self, violation: NewViolation) -> Result<ViolationRecord> {
        let mut state = self.state();
        state.next_violation_id += 1;
        let record = ViolationRecord {
            id: state.next_violation_id,
            place_id: violation.place_id,
            car_number: violation.car_number,
            timestamp: violation.timestamp,
        };
        state.violations.push(record.clone());
        Ok(record)
    }
}

#[async_trait]
impl PlaceRepository for InMemoryParkingStore {
    async fn set_status(&self, place_id: PlaceId, status: PlaceStatus) -> Result<()> {
        let mut state = self.state();
        let place = state
            .places
            .get_mut(&place_id)
            .ok_or_else(|| Error::Repository(format!("place {} not found", place_id)))?;
        place.status = Some(status);
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl CameraRepository for InMemoryParkingStore {
    async fn get_snapshots(&self, zone_id: ZoneId) -> Result<Vec<CameraSnapshot>> {
        Ok(self.state().cameras.get(&zone_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_places_grouped_by_zone() {
        let store = InMemoryParkingStore::new();
        store.add_zone(1, "A");
        store.add_zone(2, "B");
        store.add_place(1, 10, Polygon::default());
        store.add_place(2, 20, Polygon::default());

        let places = store.list_places_with_location(1).await.unwrap();
        assert_eq!(places.len(), 1);
        assert_eq!(places[0].place_id, 10);
    }

    #[tokio::test]
    async fn test_list_active_applies_window() {
        let store = InMemoryParkingStore::new();
        let now = Utc::now();
        store.add_booking(Booking {
            id: 1,
            place_id: 2,
            start_time: now - Duration::hours(1),
            end_time: Some(now - Duration::minutes(1)),
        });
        assert!(store.list_active(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_checked_unknown_zone() {
        let store = InMemoryParkingStore::new();
        assert!(store.mark_checked(99, Utc::now()).await.is_err());
    }
}
