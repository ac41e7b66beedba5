//! Live snapshot (`createLiveImage`) server action
//!
//! Exposes the action over HTTP and ships in-process implementations of the
//! compute and policy collaborators for standalone deployments.

pub mod controller;
pub mod handlers;
pub mod local_backend;
pub mod policy;

pub use controller::{
    image_location, Accepted, AppError, LiveImageController, SnapshotRequest, ACTION_KEY,
    EXTENSION_POLICY,
};
pub use handlers::{build_router, live_image_routes, AppState, CallerContext};
pub use local_backend::{InMemoryCompute, Inventory, InventoryError, LIVE_SNAPSHOT_POLICY};
pub use policy::{PolicyError, RulePolicy};
