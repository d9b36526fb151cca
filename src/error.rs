//! Error types for adapter copies and prefetch operations

use thiserror::Error;

use crate::AdapterId;

/// Failure reported by an adapter copy (asynchronous or synchronous)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CopyError {
    /// Transient transfer failure, safe to retry once locally
    #[error("adapter transfer failed: {0}")]
    Transfer(String),
    /// The device itself is unusable; cannot be retried locally
    #[error("device unusable: {0}")]
    Device(String),
}

impl CopyError {
    /// Fatal errors must propagate to the orchestrator unmodified
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Device(_))
    }
}

/// Error surfaced to callers of `wait_for_prefetch`
#[derive(Debug, Error)]
pub enum PrefetchError {
    /// The load failed even after the local synchronous retry
    #[error("failed to load adapter '{id}': {source}")]
    CopyFailed {
        id: AdapterId,
        #[source]
        source: CopyError,
    },
    /// Every slot is pinned by in-flight compute; nothing can be freed
    #[error("no unpinned slot available for adapter '{0}'")]
    NoSlotAvailable(AdapterId),
    /// Unrecoverable device error, passed through from the copy primitive
    #[error("{0}")]
    Device(CopyError),
}

impl PrefetchError {
    /// True if compute cannot proceed at all (device-level failure)
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Device(_))
    }
}
