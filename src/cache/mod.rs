//! Local asset cache.
//!
//! - `storage`: filesystem tree plus the manifest index
//! - `lifecycle`: VALID/STALE/EXPIRED/INVALID classification and expiry sweep
//! - `layer`: cache-first read facade
//! - `refresh`: background refresh workers

pub mod layer;
pub mod lifecycle;
pub mod refresh;
pub mod storage;
pub mod types;

pub use layer::{AssetCache, RefreshReport};
pub use lifecycle::{CleanupStats, LifecycleManager};
pub use refresh::RefreshPool;
pub use storage::{CacheStats, CacheStore, ChecksumMismatch, Manifest, ManifestEntry};
pub use types::{AssetMetadata, CacheLifecycle, CacheResult, CacheSource};
