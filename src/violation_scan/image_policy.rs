//! Zone image acquisition

use crate::error::Result;
use crate::parking::{CameraRepository, PlaceLocation, Zone};
use async_trait::async_trait;
use std::sync::Arc;

/// Chooses the image reference sent to the cropper for a zone
#[async_trait]
pub trait ImageAcquisitionPolicy: Send + Sync {
    /// `None` means the zone has no usable image this cycle
    async fn acquire(&self, zone: &Zone, places: &[PlaceLocation]) -> Result<Option<String>>;
}

/// First zone camera with a non-empty snapshot reference
pub struct FirstCameraSnapshot {
    cameras: Arc<dyn CameraRepository>,
}

impl FirstCameraSnapshot {
    pub fn new(cameras: Arc<dyn CameraRepository>) -> Self {
        Self { cameras }
    }
}

#[async_trait]
impl ImageAcquisitionPolicy for FirstCameraSnapshot {
    async fn acquire(&self, zone: &Zone, _places: &[PlaceLocation]) -> Result<Option<String>> {
        let snapshots = self.cameras.get_snapshots(zone.id).await?;
        let chosen = snapshots.into_iter().find_map(|s| {
            s.image_url
                .map(|url| url.trim().to_string())
                .filter(|url| !url.is_empty())
                .map(|url| (s.camera_id, url))
        });

        Ok(chosen.map(|(camera_id, url)| {
            tracing::debug!(zone_id = zone.id, camera_id = camera_id, image_url = %url, "Zone image chosen");
            url
        }))
    }
}
