//! Prefetch subsystem configuration
//!
//! Plain settings struct filled in by the host serving framework; file or
//! CLI parsing happens there, not here.

use anyhow::{bail, Result};

/// Tuning knobs for one predictor + pool pair (one per device)
#[derive(Debug, Clone)]
pub struct PrefetchConfig {
    /// Device slots in the pool
    pub num_slots: usize,
    /// Batches of history the predictor keeps
    pub history_window: usize,
    /// Upper bound on adapters predicted (and prefetched) per batch
    pub max_predictions: usize,
    /// Log cumulative metrics every N batches (0 disables periodic logging)
    pub metrics_interval: u64,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            num_slots: 8,
            history_window: 10,
            max_predictions: 4,
            metrics_interval: 50,
        }
    }
}

impl PrefetchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_slots == 0 {
            bail!("num_slots must be at least 1");
        }
        if self.history_window == 0 {
            bail!("history_window must be at least 1");
        }
        if self.max_predictions > self.num_slots {
            bail!(
                "max_predictions ({}) exceeds num_slots ({}): predictions could never all fit",
                self.max_predictions,
                self.num_slots
            );
        }
        Ok(())
    }
}
