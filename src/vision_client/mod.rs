//! VisionClient - Crop/Classify Peer Adapter
//!
//! ## Responsibilities
//!
//! - Crop stage: one queue RPC per place (zone image + polygon -> cropped image)
//! - Classify stage: queue RPC, or the synchronous detector HTTP endpoint
//! - Response parsing into known variants; unknown layouts are rejected

use crate::error::{Error, Result};
use crate::parking::{DetectionResult, PlaceId, PlaceLocation, Polygon};
use crate::rpc_client::RpcClient;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// One place to cut out of the zone image
#[derive(Debug, Clone, Serialize)]
pub struct PlaceCut {
    pub place_id: PlaceId,
    pub location: Polygon,
}

/// Crop request payload
#[derive(Debug, Clone, Serialize)]
pub struct CropRequest {
    pub image_url: String,
    pub places: Vec<PlaceCut>,
}

/// Cropped image for a place
#[derive(Debug, Clone, Deserialize)]
pub struct PlaceImage {
    pub place_id: PlaceId,
    pub image_url: String,
}

/// Entry of a bare list reply; `place_id` may be omitted
#[derive(Debug, Clone, Deserialize)]
pub struct ListedImage {
    #[serde(default)]
    pub place_id: Option<PlaceId>,
    pub image_url: String,
}

/// Cropper reply layouts, tried in declaration order
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CropResponse {
    /// `{"place_images": [{"place_id", "image_url"}]}`
    PlaceImages { place_images: Vec<PlaceImage> },
    /// `{"error": "..."}`
    Failed { error: String },
    /// `{"image_url": "...", "place_id"?}`
    Single {
        image_url: String,
        #[serde(default)]
        place_id: Option<PlaceId>,
    },
    /// `[{"place_id"?, "image_url"}]`
    Listed(Vec<ListedImage>),
}

impl CropResponse {
    /// Cropped image reference for `place_id`
    pub fn image_for(&self, place_id: PlaceId) -> Result<String> {
        let found = match self {
            CropResponse::PlaceImages { place_images } => place_images
                .iter()
                .find(|img| img.place_id == place_id)
                .map(|img| img.image_url.clone()),
            CropResponse::Failed { error } => {
                return Err(Error::MalformedResponse(format!("cropper error: {}", error)));
            }
            CropResponse::Single {
                image_url,
                place_id: reported,
            } => match reported {
                Some(other) if *other != place_id => None,
                _ => Some(image_url.clone()),
            },
            CropResponse::Listed(items) => items
                .iter()
                .find(|img| img.place_id == Some(place_id))
                .or_else(|| match items.as_slice() {
                    [only] if only.place_id.is_none() => Some(only),
                    _ => None,
                })
                .map(|img| img.image_url.clone()),
        };

        match found {
            Some(url) if !url.trim().is_empty() => Ok(url),
            _ => Err(Error::MalformedResponse(format!(
                "no image_url for place {} in crop response",
                place_id
            ))),
        }
    }
}

/// Classify request payload
#[derive(Debug, Clone, Serialize)]
pub struct ClassifyRequest {
    pub filename: String,
}

/// Classifier reply layouts, tried in declaration order
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ClassifyResponse {
    /// `{"status"?, "parking_status", "plate_number"?}` (detector layout)
    Detection {
        #[serde(default)]
        status: Option<String>,
        parking_status: String,
        #[serde(default)]
        plate_number: Option<String>,
    },
    /// `{"class_id", "class_name", "plate_number"?}` (queue classifier layout)
    Class {
        class_id: i64,
        class_name: String,
        #[serde(default)]
        plate_number: Option<String>,
    },
    /// `{"error": "..."}`
    Failed { error: String },
}

impl ClassifyResponse {
    pub fn into_detection(self) -> Result<DetectionResult> {
        match self {
            ClassifyResponse::Detection {
                status,
                parking_status,
                plate_number,
            } => Ok(DetectionResult {
                status: status.unwrap_or_else(|| "unknown".to_string()),
                parking_status,
                plate_number,
            }),
            ClassifyResponse::Class {
                class_id,
                class_name,
                plate_number,
            } => {
                tracing::trace!(class_id = class_id, class_name = %class_name, "Classifier class");
                Ok(DetectionResult {
                    status: "ok".to_string(),
                    parking_status: class_name,
                    plate_number,
                })
            }
            ClassifyResponse::Failed { error } => Err(Error::MalformedResponse(format!(
                "classifier error: {}",
                error
            ))),
        }
    }
}

/// Detector HTTP client (`POST /detect`)
pub struct DirectorClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl DirectorClient {
    /// Create new client with the default 30s timeout
    pub fn new(base_url: String) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    /// Create new client with custom timeout
    pub fn with_timeout(base_url: String, timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "detector URL must be http(s), got '{}'",
                base_url
            )));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    /// Check detector health
    pub async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/healthz", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    /// Classify a cropped image by object name
    pub async fn detect(&self, filename: &str) -> Result<DetectionResult> {
        let url = format!("{}/detect", self.base_url);
        tracing::debug!(url = %url, filename = %filename, "Sending detection request");

        let resp = self
            .client
            .post(&url)
            .json(&ClassifyRequest {
                filename: filename.to_string(),
            })
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api(format!("detector returned {} - {}", status, body)));
        }

        let json: serde_json::Value = resp.json().await?;
        let parsed: ClassifyResponse = serde_json::from_value(json).map_err(|e| {
            Error::MalformedResponse(format!("detector response not recognised: {}", e))
        })?;
        parsed.into_detection()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Queue names and per-stage timeouts
#[derive(Debug, Clone)]
pub struct VisionConfig {
    pub crop_queue: String,
    pub classify_queue: String,
    pub crop_timeout: Duration,
    pub classify_timeout: Duration,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            crop_queue: "cut_queue".to_string(),
            classify_queue: "classify_queue".to_string(),
            crop_timeout: Duration::from_secs(30),
            classify_timeout: Duration::from_secs(15),
        }
    }
}

/// Where the classify stage goes
pub enum ClassifyBackend {
    /// `classify_queue` RPC
    Queue,
    /// Synchronous detector endpoint
    Director(DirectorClient),
}

/// Per-place crop + classify pipeline
#[async_trait]
pub trait PlaceAnalyzer: Send + Sync {
    async fn analyze(&self, image_url: &str, place: &PlaceLocation) -> Result<DetectionResult>;
}

/// Vision pipeline over the RPC client
pub struct VisionPipeline {
    rpc: Arc<RpcClient>,
    config: VisionConfig,
    backend: ClassifyBackend,
}

impl VisionPipeline {
    pub fn new(rpc: Arc<RpcClient>, config: VisionConfig, backend: ClassifyBackend) -> Self {
        Self {
            rpc,
            config,
            backend,
        }
    }

    /// Crop the place out of the zone image
    pub async fn crop(&self, image_url: &str, place: &PlaceLocation) -> Result<String> {
        if place.location.is_empty() {
            return Err(Error::MalformedResponse(format!(
                "place {} has no location polygon",
                place.place_id
            )));
        }

        let request = CropRequest {
            image_url: image_url.to_string(),
            places: vec![PlaceCut {
                place_id: place.place_id,
                location: place.location.clone(),
            }],
        };
        let response: CropResponse = self
            .rpc
            .call(&self.config.crop_queue, &request, self.config.crop_timeout)
            .await?;

        let cropped = response.image_for(place.place_id)?;
        tracing::debug!(place_id = place.place_id, image_url = %cropped, "Place cropped");
        Ok(cropped)
    }

    /// Detector health; queue peers are not probed
    pub async fn backend_healthy(&self) -> bool {
        match &self.backend {
            ClassifyBackend::Queue => true,
            ClassifyBackend::Director(director) => director.health_check().await.unwrap_or(false),
        }
    }

    /// Classify a cropped image
    pub async fn classify(&self, filename: &str) -> Result<DetectionResult> {
        match &self.backend {
            ClassifyBackend::Queue => {
                let response: ClassifyResponse = self
                    .rpc
                    .call(
                        &self.config.classify_queue,
                        &ClassifyRequest {
                            filename: filename.to_string(),
                        },
                        self.config.classify_timeout,
                    )
                    .await?;
                response.into_detection()
            }
            ClassifyBackend::Director(director) => director.detect(filename).await,
        }
    }
}

#[async_trait]
impl PlaceAnalyzer for VisionPipeline {
    async fn analyze(&self, image_url: &str, place: &PlaceLocation) -> Result<DetectionResult> {
        let cropped = self.crop(image_url, place).await?;
        let detection = self.classify(&cropped).await?;
        tracing::info!(
            place_id = place.place_id,
            parking_status = %detection.parking_status,
            plate_number = detection.plate_number.as_deref().unwrap_or("-"),
            "Place classified"
        );
        Ok(detection)
    }
}
