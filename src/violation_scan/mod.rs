//! ViolationScan - Periodic Unbooked-Occupancy Scanner
//!
//! ## Responsibilities
//!
//! - Scheduler: one cycle per interval, never overlapping, start/stop
//! - Orchestrator: zones -> unbooked places -> crop/classify -> classifier
//! - Classifier: deduplicated violation records and place status writes
//! - Image policy: which zone image the crop stage receives
//!
//! ## Failure containment
//!
//! A failing place never aborts its zone, and a failing zone never aborts
//! the cycle. Only a failure to list zones or bookings aborts a cycle.

mod classifier;
mod image_policy;
mod orchestrator;
mod scheduler;

pub use classifier::{ApplyOutcome, ViolationClassifier};
pub use image_policy::{FirstCameraSnapshot, ImageAcquisitionPolicy};
pub use orchestrator::{CycleReport, ScanCollaborators, ZoneScanOrchestrator};
pub use scheduler::ScanScheduler;
