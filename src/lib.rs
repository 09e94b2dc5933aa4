//! Parkwatch Library
//!
//! Parking violation scanner over a message-broker RPC layer
//!
//! ## Architecture (6 Components)
//!
//! 1. Broker - Transport adapter (RabbitMQ, in-memory)
//! 2. Correlation - Ephemeral reply channels bound to one-shot promises
//! 3. RpcClient - Request envelope, publish, await under timeout
//! 4. VisionClient - Crop/classify peers and their response layouts
//! 5. Parking - Domain types and storage collaborators
//! 6. ViolationScan - Periodic zone scan, classification, dedup
//!
//! ## Design Principles
//!
//! - Every reply channel is owned by exactly one call and closed on every exit path
//! - Failures inside one place's pipeline never reach sibling places or the scheduler

pub mod broker;
pub mod correlation;
pub mod error;
pub mod parking;
pub mod rpc_client;
pub mod state;
pub mod violation_scan;
pub mod vision_client;

pub use error::{Error, Result};
pub use state::{AppConfig, AppState};
