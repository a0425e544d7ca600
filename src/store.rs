//! Durable-store collaborator: the `StatsStore` seam, the versioned record
//! envelope, and the JSON file backends.

pub mod json;
pub mod mirror;
pub mod record;

pub use json::JsonFileStore;
pub use mirror::MirroredStore;
pub use record::{StatsRecord, StatsStore, CURRENT_VERSION};
