//! Zone scan orchestrator
//!
//! One cycle: list zones and active bookings once, then for each zone
//! crop + classify every unbooked place and hand results to the classifier.

use super::classifier::{ApplyOutcome, ViolationClassifier};
use super::image_policy::ImageAcquisitionPolicy;
use crate::error::{Error, Result};
use crate::parking::{
    BookedPlaceSet, BookingRepository, DetectionResult, PlaceId, Zone, ZoneRepository,
    ZoneSnapshot,
};
use crate::vision_client::PlaceAnalyzer;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;

/// Per-cycle statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub zones_checked: usize,
    pub zones_skipped: usize,
    pub zones_failed: usize,
    pub places_scanned: usize,
    pub places_skipped_booked: usize,
    pub places_failed: usize,
    pub violations_created: usize,
    pub duplicates_suppressed: usize,
    pub marked_free: usize,
    pub inconclusive: usize,
}

/// Everything a cycle reads from or writes through
pub struct ScanCollaborators {
    pub zones: Arc<dyn ZoneRepository>,
    pub bookings: Arc<dyn BookingRepository>,
    pub images: Arc<dyn ImageAcquisitionPolicy>,
    pub analyzer: Arc<dyn PlaceAnalyzer>,
    pub classifier: Arc<ViolationClassifier>,
}

pub struct ZoneScanOrchestrator {
    zones: Arc<dyn ZoneRepository>,
    bookings: Arc<dyn BookingRepository>,
    images: Arc<dyn ImageAcquisitionPolicy>,
    analyzer: Arc<dyn PlaceAnalyzer>,
    classifier: Arc<ViolationClassifier>,
    max_in_flight: usize,
}

impl ZoneScanOrchestrator {
    pub fn new(collaborators: ScanCollaborators, max_in_flight: usize) -> Self {
        Self {
            zones: collaborators.zones,
            bookings: collaborators.bookings,
            images: collaborators.images,
            analyzer: collaborators.analyzer,
            classifier: collaborators.classifier,
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Run one full pass over all zones
    ///
    /// Fails only when zones or bookings cannot be listed.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let started = Utc::now();

        let zones = self.zones.list_zones().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to list zones, cycle aborted");
            e
        })?;
        let bookings = self.bookings.list_active(started).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to list active bookings, cycle aborted");
            e
        })?;
        let booked = BookedPlaceSet::collect(&bookings, started);

        tracing::info!(
            zones = zones.len(),
            booked_places = booked.len(),
            "Scan cycle started"
        );

        let mut report = CycleReport::default();
        for zone in zones {
            self.scan_zone(zone, &booked, &mut report).await;
        }

        tracing::info!(
            zones_checked = report.zones_checked,
            zones_skipped = report.zones_skipped,
            zones_failed = report.zones_failed,
            places_scanned = report.places_scanned,
            places_failed = report.places_failed,
            violations_created = report.violations_created,
            duration_ms = (Utc::now() - started).num_milliseconds(),
            "Scan cycle completed"
        );
        Ok(report)
    }

    async fn scan_zone(&self, zone: Zone, booked: &BookedPlaceSet, report: &mut CycleReport) {
        let zone_id = zone.id;
        let places = match self.zones.list_places_with_location(zone_id).await {
            Ok(places) => places,
            Err(e) => {
                tracing::error!(zone_id = zone_id, error = %e, "Failed to list places, zone skipped");
                report.zones_failed += 1;
                return;
            }
        };

        let total = places.len();
        let snapshot = ZoneSnapshot {
            zone,
            places: places
                .into_iter()
                .filter(|p| !booked.contains(p.place_id))
                .collect(),
        };
        report.places_skipped_booked += total - snapshot.places.len();

        if snapshot.places.is_empty() {
            tracing::info!(zone_id = zone_id, places = total, "No unbooked places, zone skipped");
            report.zones_skipped += 1;
            self.stamp(zone_id).await;
            return;
        }

        let image = match self.images.acquire(&snapshot.zone, &snapshot.places).await {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(zone_id = zone_id, error = %e, "Image acquisition failed");
                None
            }
        };
        let Some(image) = image else {
            tracing::warn!(zone_id = zone_id, "No camera image for zone, zone skipped");
            report.zones_skipped += 1;
            self.stamp(zone_id).await;
            return;
        };

        let results: Vec<(PlaceId, Result<DetectionResult>)> = stream::iter(snapshot.places)
            .map(|place| {
                let analyzer = Arc::clone(&self.analyzer);
                let image = image.clone();
                async move {
                    let result = analyzer.analyze(&image, &place).await;
                    (place.place_id, result)
                }
            })
            .buffer_unordered(self.max_in_flight)
            .collect()
            .await;

        for (place_id, result) in results {
            report.places_scanned += 1;
            match result {
                Ok(detection) => self.apply(zone_id, place_id, &detection, report).await,
                Err(e) => {
                    log_place_failure(zone_id, place_id, &e);
                    report.places_failed += 1;
                }
            }
        }

        report.zones_checked += 1;
        self.stamp(zone_id).await;
    }

    async fn apply(
        &self,
        zone_id: i32,
        place_id: PlaceId,
        detection: &DetectionResult,
        report: &mut CycleReport,
    ) {
        match self.classifier.apply(place_id, detection).await {
            Ok(ApplyOutcome::ViolationRecorded(_)) => report.violations_created += 1,
            Ok(ApplyOutcome::DuplicateSuppressed) => report.duplicates_suppressed += 1,
            Ok(ApplyOutcome::OccupiedWithoutPlate) => {}
            Ok(ApplyOutcome::MarkedFree) => report.marked_free += 1,
            Ok(ApplyOutcome::Inconclusive) => report.inconclusive += 1,
            Err(e) => {
                tracing::error!(zone_id = zone_id, place_id = place_id, error = %e, "Failed to apply detection");
                report.places_failed += 1;
            }
        }
    }

    async fn stamp(&self, zone_id: i32) {
        if let Err(e) = self.zones.mark_checked(zone_id, Utc::now()).await {
            tracing::warn!(zone_id = zone_id, error = %e, "Failed to stamp zone check time");
        }
    }
}

fn log_place_failure(zone_id: i32, place_id: PlaceId, error: &Error) {
    if error.is_per_call() {
        tracing::warn!(zone_id = zone_id, place_id = place_id, error = %error, "Place skipped");
    } else {
        tracing::error!(zone_id = zone_id, place_id = place_id, error = %error, "Place pipeline failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parking::{Booking, InMemoryParkingStore, PlaceLocation, PlaceStatus, Polygon};
    use crate::violation_scan::FirstCameraSnapshot;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Clone)]
    enum Script {
        Detect(&'static str, Option<&'static str>),
        Timeout,
        Malformed,
    }

    #[derive(Default)]
    struct ScriptedAnalyzer {
        scripts: HashMap<PlaceId, Script>,
        seen: Mutex<Vec<(String, PlaceId)>>,
    }

    impl ScriptedAnalyzer {
        fn with(mut self, place_id: PlaceId, script: Script) -> Self {
            self.scripts.insert(place_id, script);
            self
        }

        fn seen_places(&self) -> Vec<PlaceId> {
            let mut ids: Vec<_> = self.seen.lock().unwrap().iter().map(|(_, id)| *id).collect();
            ids.sort();
            ids
        }
    }

    #[async_trait]
    impl PlaceAnalyzer for ScriptedAnalyzer {
        async fn analyze(&self, image_url: &str, place: &PlaceLocation) -> Result<DetectionResult> {
            self.seen
                .lock()
                .unwrap()
                .push((image_url.to_string(), place.place_id));
            match self.scripts.get(&place.place_id).cloned() {
                Some(Script::Detect(status, plate)) => Ok(DetectionResult {
                    status: "success".to_string(),
                    parking_status: status.to_string(),
                    plate_number: plate.map(str::to_string),
                }),
                Some(Script::Timeout) => Err(Error::RpcTimeout {
                    request_id: format!("req-{}", place.place_id),
                }),
                Some(Script::Malformed) | None => {
                    Err(Error::MalformedResponse("no image_url".to_string()))
                }
            }
        }
    }

    fn square() -> Polygon {
        Polygon(vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]])
    }

    fn orchestrator(
        store: &Arc<InMemoryParkingStore>,
        analyzer: Arc<ScriptedAnalyzer>,
    ) -> ZoneScanOrchestrator {
        let classifier = Arc::new(ViolationClassifier::new(
            store.clone(),
            store.clone(),
            Duration::hours(2),
        ));
        ZoneScanOrchestrator::new(
            ScanCollaborators {
                zones: store.clone(),
                bookings: store.clone(),
                images: Arc::new(FirstCameraSnapshot::new(store.clone())),
                analyzer,
                classifier,
            },
            4,
        )
    }

    fn zone_with_places(store: &InMemoryParkingStore, zone_id: i32, places: &[PlaceId]) {
        store.add_zone(zone_id, &format!("Z{}", zone_id));
        store.add_camera(zone_id, zone_id * 100, Some(&format!("images/zone{}.jpg", zone_id)));
        for place in places {
            store.add_place(zone_id, *place, square());
        }
    }

    #[tokio::test]
    async fn test_booked_place_never_analyzed() {
        let store = Arc::new(InMemoryParkingStore::new());
        zone_with_places(&store, 1, &[1, 2]);
        let now = Utc::now();
        store.add_booking(Booking {
            id: 1,
            place_id: 2,
            start_time: now - Duration::hours(1),
            end_time: Some(now + Duration::hours(1)),
        });

        let analyzer = Arc::new(
            ScriptedAnalyzer::default()
                .with(1, Script::Detect("free", None))
                .with(2, Script::Detect("occupied", Some("Z999ZZ"))),
        );
        let report = orchestrator(&store, analyzer.clone()).run_cycle().await.unwrap();

        assert_eq!(analyzer.seen_places(), vec![1]);
        assert_eq!(report.places_skipped_booked, 1);
        assert_eq!(report.marked_free, 1);
        assert!(store.violations().is_empty());
        assert_eq!(store.place_status(2), None);
    }

    #[tokio::test]
    async fn test_place_failures_do_not_abort_zone() {
        let store = Arc::new(InMemoryParkingStore::new());
        zone_with_places(&store, 1, &[1, 2, 3, 4]);

        let analyzer = Arc::new(
            ScriptedAnalyzer::default()
                .with(1, Script::Timeout)
                .with(2, Script::Malformed)
                .with(3, Script::Detect("occupied", Some("A123BC")))
                .with(4, Script::Detect("???", None)),
        );
        let report = orchestrator(&store, analyzer).run_cycle().await.unwrap();

        assert_eq!(report.places_scanned, 4);
        assert_eq!(report.places_failed, 2);
        assert_eq!(report.violations_created, 1);
        assert_eq!(report.inconclusive, 1);
        assert_eq!(report.zones_checked, 1);
        assert_eq!(store.place_status(3), Some(PlaceStatus::Occupied));
        assert_eq!(store.place_status(1), None);
        assert!(store.last_checked(1).is_some());
    }

    #[tokio::test]
    async fn test_zone_image_passed_to_analyzer() {
        let store = Arc::new(InMemoryParkingStore::new());
        zone_with_places(&store, 7, &[70]);
        let analyzer = Arc::new(ScriptedAnalyzer::default().with(70, Script::Detect("free", None)));

        orchestrator(&store, analyzer.clone()).run_cycle().await.unwrap();

        let seen = analyzer.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![("images/zone7.jpg".to_string(), 70)]);
    }

    #[tokio::test]
    async fn test_skipped_zones_still_stamped() {
        let store = Arc::new(InMemoryParkingStore::new());
        // every place booked
        zone_with_places(&store, 1, &[1]);
        let now = Utc::now();
        store.add_booking(Booking {
            id: 1,
            place_id: 1,
            start_time: now - Duration::hours(1),
            end_time: None,
        });
        // no camera
        store.add_zone(2, "Z2");
        store.add_place(2, 20, square());

        let analyzer = Arc::new(ScriptedAnalyzer::default());
        let report = orchestrator(&store, analyzer.clone()).run_cycle().await.unwrap();

        assert_eq!(report.zones_skipped, 2);
        assert_eq!(report.zones_checked, 0);
        assert!(analyzer.seen_places().is_empty());
        assert!(store.last_checked(1).is_some());
        assert!(store.last_checked(2).is_some());
    }

    struct BrokenCameras;

    #[async_trait]
    impl ImageAcquisitionPolicy for BrokenCameras {
        async fn acquire(&self, zone: &Zone, _: &[PlaceLocation]) -> Result<Option<String>> {
            Err(Error::Repository(format!("cameras of zone {} unavailable", zone.id)))
        }
    }

    #[tokio::test]
    async fn test_image_lookup_error_skips_and_stamps_zone() {
        let store = Arc::new(InMemoryParkingStore::new());
        zone_with_places(&store, 1, &[1]);
        let analyzer = Arc::new(ScriptedAnalyzer::default().with(1, Script::Detect("free", None)));
        let classifier = Arc::new(ViolationClassifier::new(
            store.clone(),
            store.clone(),
            Duration::hours(2),
        ));
        let orchestrator = ZoneScanOrchestrator::new(
            ScanCollaborators {
                zones: store.clone(),
                bookings: store.clone(),
                images: Arc::new(BrokenCameras),
                analyzer: analyzer.clone(),
                classifier,
            },
            4,
        );

        let report = orchestrator.run_cycle().await.unwrap();

        assert_eq!(report.zones_skipped, 1);
        assert_eq!(report.zones_failed, 0);
        assert!(analyzer.seen_places().is_empty());
        assert!(store.last_checked(1).is_some());
    }

    #[tokio::test]
    async fn test_failing_zone_does_not_abort_cycle() {
        let store = Arc::new(InMemoryParkingStore::new());
        zone_with_places(&store, 1, &[1]);
        zone_with_places(&store, 2, &[2]);
        store.fail_places_for_zone(1);

        let analyzer = Arc::new(ScriptedAnalyzer::default().with(2, Script::Detect("free", None)));
        let report = orchestrator(&store, analyzer).run_cycle().await.unwrap();

        assert_eq!(report.zones_failed, 1);
        assert_eq!(report.zones_checked, 1);
        assert!(store.last_checked(1).is_none());
        assert!(store.last_checked(2).is_some());
    }

    #[tokio::test]
    async fn test_listing_failures_abort_cycle() {
        let store = Arc::new(InMemoryParkingStore::new());
        zone_with_places(&store, 1, &[1]);
        let analyzer = Arc::new(ScriptedAnalyzer::default());
        let orchestrator = orchestrator(&store, analyzer.clone());

        store.set_fail_list_zones(true);
        assert!(matches!(orchestrator.run_cycle().await, Err(Error::Repository(_))));

        store.set_fail_list_zones(false);
        store.set_fail_list_bookings(true);
        assert!(orchestrator.run_cycle().await.is_err());
        assert!(analyzer.seen_places().is_empty());
        assert!(store.last_checked(1).is_none());
    }
}
