//! Violation classifier
//!
//! Turns one place's detection into state changes: an occupied unbooked
//! place records a violation unless the same car was already recorded on
//! that place inside the dedup window.

use crate::error::Result;
use crate::parking::{
    DetectionResult, NewViolation, OccupancyClass, PlaceId, PlaceRepository, PlaceStatus,
    ViolationRecord, ViolationRepository,
};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// What `apply` did for one place
#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    ViolationRecorded(ViolationRecord),
    DuplicateSuppressed,
    /// Occupied, but no plate to record against
    OccupiedWithoutPlate,
    MarkedFree,
    Inconclusive,
}

pub struct ViolationClassifier {
    violations: Arc<dyn ViolationRepository>,
    places: Arc<dyn PlaceRepository>,
    dedup_window: Duration,
}

impl ViolationClassifier {
    pub fn new(
        violations: Arc<dyn ViolationRepository>,
        places: Arc<dyn PlaceRepository>,
        dedup_window: Duration,
    ) -> Self {
        Self {
            violations,
            places,
            dedup_window,
        }
    }

    pub async fn apply(&self, place_id: PlaceId, detection: &DetectionResult) -> Result<ApplyOutcome> {
        self.apply_at(place_id, detection, Utc::now()).await
    }

    pub async fn apply_at(
        &self,
        place_id: PlaceId,
        detection: &DetectionResult,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome> {
        match detection.occupancy() {
            OccupancyClass::Occupied => {
                let outcome = match detection.plate() {
                    Some(plate) => self.record_violation(place_id, plate, now).await?,
                    None => {
                        tracing::warn!(place_id = place_id, "Occupied place without a readable plate");
                        ApplyOutcome::OccupiedWithoutPlate
                    }
                };
                self.places.set_status(place_id, PlaceStatus::Occupied).await?;
                Ok(outcome)
            }
            OccupancyClass::Free => {
                self.places.set_status(place_id, PlaceStatus::Free).await?;
                tracing::debug!(place_id = place_id, "Place marked free");
                Ok(ApplyOutcome::MarkedFree)
            }
            OccupancyClass::Unknown => {
                tracing::info!(
                    place_id = place_id,
                    parking_status = %detection.parking_status,
                    "Inconclusive detection, place left unchanged"
                );
                Ok(ApplyOutcome::Inconclusive)
            }
        }
    }

    async fn record_violation(
        &self,
        place_id: PlaceId,
        plate: &str,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome> {
        // Read-then-write; overlapping cycles are not serialized
        let existing = self.violations.list_by_place(place_id).await?;
        // a window reaching past the calendar start covers every record
        let since = now.checked_sub_signed(self.dedup_window);
        let duplicate = existing.iter().any(|v| {
            v.car_number.trim() == plate && since.map_or(true, |since| v.timestamp >= since)
        });

        if duplicate {
            tracing::debug!(place_id = place_id, car_number = %plate, "Violation already recorded inside window");
            return Ok(ApplyOutcome::DuplicateSuppressed);
        }

        let record = self
            .violations
            .create(NewViolation {
                place_id,
                car_number: plate.to_string(),
                timestamp: now,
            })
            .await?;

        tracing::info!(
            violation_id = record.id,
            place_id = place_id,
            car_number = %plate,
            "Violation recorded"
        );
        Ok(ApplyOutcome::ViolationRecorded(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parking::{InMemoryParkingStore, Polygon};

    fn detection(parking_status: &str, plate: Option<&str>) -> DetectionResult {
        DetectionResult {
            status: "success".to_string(),
            parking_status: parking_status.to_string(),
            plate_number: plate.map(str::to_string),
        }
    }

    fn setup() -> (Arc<InMemoryParkingStore>, ViolationClassifier) {
        let store = Arc::new(InMemoryParkingStore::new());
        store.add_zone(1, "Z");
        store.add_place(1, 5, Polygon::default());
        let classifier = ViolationClassifier::new(store.clone(), store.clone(), Duration::hours(2));
        (store, classifier)
    }

    #[tokio::test]
    async fn test_same_plate_inside_window_suppressed() {
        let (store, classifier) = setup();
        let now = Utc::now();
        store.add_violation(5, "A123BC", now - Duration::minutes(30));

        let outcome = classifier
            .apply_at(5, &detection("occupied", Some("A123BC")), now)
            .await
            .unwrap();

        assert!(matches!(outcome, ApplyOutcome::DuplicateSuppressed));
        assert_eq!(store.violations().len(), 1);
        assert_eq!(store.place_status(5), Some(PlaceStatus::Occupied));
    }

    #[tokio::test]
    async fn test_other_plate_creates_record() {
        let (store, classifier) = setup();
        let now = Utc::now();
        store.add_violation(5, "A123BC", now - Duration::minutes(30));

        let outcome = classifier
            .apply_at(5, &detection("occupied", Some("B456CD")), now)
            .await
            .unwrap();

        match outcome {
            ApplyOutcome::ViolationRecorded(record) => {
                assert_eq!(record.place_id, 5);
                assert_eq!(record.car_number, "B456CD");
                assert_eq!(record.timestamp, now);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(store.violations().len(), 2);
    }

    #[tokio::test]
    async fn test_record_outside_window_does_not_block() {
        let (store, classifier) = setup();
        let now = Utc::now();
        store.add_violation(5, "A123BC", now - Duration::hours(3));

        let outcome = classifier
            .apply_at(5, &detection("Занято", Some(" A123BC ")), now)
            .await
            .unwrap();

        assert!(matches!(outcome, ApplyOutcome::ViolationRecorded(_)));
        assert_eq!(store.violations().len(), 2);
    }

    #[tokio::test]
    async fn test_same_plate_other_place_not_a_duplicate() {
        let (store, classifier) = setup();
        store.add_place(1, 6, Polygon::default());
        let now = Utc::now();
        store.add_violation(6, "A123BC", now - Duration::minutes(10));

        let outcome = classifier
            .apply_at(5, &detection("occupied", Some("A123BC")), now)
            .await
            .unwrap();
        assert!(matches!(outcome, ApplyOutcome::ViolationRecorded(_)));
    }

    #[tokio::test]
    async fn test_unbounded_window_suppresses_old_record() {
        let (store, _) = setup();
        let classifier = ViolationClassifier::new(store.clone(), store.clone(), Duration::MAX);
        let now = Utc::now();
        store.add_violation(5, "A123BC", now - Duration::days(3650));

        let outcome = classifier
            .apply_at(5, &detection("occupied", Some("A123BC")), now)
            .await
            .unwrap();
        assert!(matches!(outcome, ApplyOutcome::DuplicateSuppressed));
    }

    #[tokio::test]
    async fn test_free_and_unknown() {
        let (store, classifier) = setup();

        let outcome = classifier.apply(5, &detection(" FREE ", None)).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::MarkedFree));
        assert_eq!(store.place_status(5), Some(PlaceStatus::Free));

        let writes = store.status_writes();
        let outcome = classifier.apply(5, &detection("maybe", Some("A123BC"))).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::Inconclusive));
        assert_eq!(store.status_writes(), writes);
        assert_eq!(store.place_status(5), Some(PlaceStatus::Free));
        assert!(store.violations().is_empty());
    }

    #[tokio::test]
    async fn test_occupied_without_plate_sets_status_only() {
        let (store, classifier) = setup();

        let outcome = classifier.apply(5, &detection("occupied", Some("  "))).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::OccupiedWithoutPlate));
        assert_eq!(store.place_status(5), Some(PlaceStatus::Occupied));
        assert!(store.violations().is_empty());
    }
}
