//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub (for federation)
//! - Metrics (Prometheus) and health

mod activitypub;
mod metrics;

pub use activitypub::activitypub_router;
pub use metrics::operations_router;
