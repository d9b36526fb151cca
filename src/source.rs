//! Host-side adapter weight source
//!
//! The prefetch subsystem treats the serving framework's weight storage as
//! opaque: the only assumed primitive is "produce the weights for adapter X".
//! `InMemorySource` is a reference implementation backed by a registry of
//! pre-staged adapters, used by benchmarks and the unit tests.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::CopyError;
use crate::AdapterId;

/// A single adapter's weights, staged host-side and copied into a slot.
///
/// The low-rank matrices are kept as one flat buffer; the pool never
/// interprets the contents, it only moves them.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterWeights {
    pub id: AdapterId,
    /// LoRA rank (r)
    pub rank: usize,
    /// LoRA alpha scaling factor
    pub alpha: f32,
    /// Flattened A/B matrix data
    pub data: Vec<f32>,
}

impl AdapterWeights {
    pub fn size_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }
}

/// The single external dependency of the memory pool: load an adapter's
/// weights from host storage. Implementations must be callable from the
/// background copy thread.
pub trait AdapterSource: Send + Sync {
    fn load(&self, id: &str) -> Result<AdapterWeights, CopyError>;
}

/// Adapter source backed by a fixed in-memory registry
pub struct InMemorySource {
    adapters: HashMap<AdapterId, AdapterWeights>,
    /// Simulated per-load transfer latency (benchmarks)
    delay: Option<Duration>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
            delay: None,
        }
    }

    /// Register an adapter with synthetic weights of `n_elements` floats
    pub fn register(&mut self, id: &str, rank: usize, n_elements: usize) {
        self.adapters.insert(
            id.to_string(),
            AdapterWeights {
                id: id.to_string(),
                rank,
                alpha: rank as f32,
                data: vec![0.0f32; n_elements],
            },
        );
    }

    /// Simulate transfer latency on every load
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl Default for InMemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterSource for InMemorySource {
    fn load(&self, id: &str) -> Result<AdapterWeights, CopyError> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.adapters
            .get(id)
            .cloned()
            .ok_or_else(|| CopyError::Transfer(format!("adapter '{}' not found in source", id)))
    }
}
