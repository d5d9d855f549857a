//! Offline-first asset and instance synchronization.
//!
//! Remotely authored assets are cached on disk with a TTL lifecycle and read
//! cache-first. User-authored instances are edited locally with a change log
//! and synced against the remote with conflict detection. A connectivity
//! monitor drives offline mode, which defers sync work until the remote is
//! back.

pub mod assets;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod instances;
pub mod lock;
pub mod logging;
pub mod remote;
pub mod uri;

#[cfg(test)]
mod test_support;

pub use engine::{EngineStatus, SyncEngine};
pub use error::SyncError;
