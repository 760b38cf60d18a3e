pub mod cache;
pub mod gap;
pub mod store;

pub use cache::SnapshotCache;
pub use store::SnapshotStore;
