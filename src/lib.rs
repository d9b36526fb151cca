//! Predictive LoRA adapter prefetching for multi-tenant inference serving
//!
//! Swappable adapters live in host storage and must be staged into a small
//! number of device-resident slots before a batch can run. This crate hides
//! that load latency: a frequency/recency predictor forecasts which adapters
//! the next batch will need, and a slot-based memory pool stages them on a
//! background copy thread while the current batch computes.
//!
//! Architecture:
//! ```text
//! serving loop ──► PrefetchCoordinator ──► PrefetchPredictor (forecast)
//!                        │
//!                        └──► LoraMemoryPool ──► CopyExecutor (background copies)
//!                                   │
//!                                   └──► AdapterSource (host weight storage)
//! ```
//!
//! Correctness contract: compute never reads a slot before its copy's
//! completion signal was observed (`wait_for_prefetch` is the only way to a
//! readable slot), and an in-flight copy's slot is never rebound.
//! One pool serves one device; multi-device hosts instantiate one
//! coordinator per device with no cross-pool coupling.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod pool;
pub mod predictor;
pub mod source;

/// Identifier of a LoRA adapter, as assigned by the serving framework
pub type AdapterId = String;

pub use config::PrefetchConfig;
pub use coordinator::PrefetchCoordinator;
pub use error::{CopyError, PrefetchError};
pub use executor::{CopyExecutor, CopyHandle, CopyOp, CopyOutcome, InlineExecutor, TransferThread};
pub use metrics::{PrefetchMetrics, PrefetchStats};
pub use pool::{LoraMemoryPool, Slot, SlotRef, SlotState};
pub use predictor::{BatchRecord, PrefetchPredictor};
pub use source::{AdapterSource, AdapterWeights, InMemorySource};
