//! Per-batch driver tying predictor and pool together
//!
//! The serving loop calls `prepare_batch` before compute and `finish_batch`
//! after it. Between batches the coordinator feeds the predictor, issues
//! speculative prefetches for the forecast, and periodically reports
//! metrics. The load latency of correctly predicted adapters is hidden
//! behind the current batch's compute.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::config::PrefetchConfig;
use crate::error::PrefetchError;
use crate::executor::CopyExecutor;
use crate::pool::{LoraMemoryPool, SlotRef};
use crate::predictor::PrefetchPredictor;
use crate::source::AdapterSource;
use crate::AdapterId;

/// Composes one predictor and one memory pool for a single device
pub struct PrefetchCoordinator {
    predictor: PrefetchPredictor,
    pool: LoraMemoryPool,
    config: PrefetchConfig,
    batches: u64,
}

impl PrefetchCoordinator {
    pub fn new(
        config: PrefetchConfig,
        source: Arc<dyn AdapterSource>,
        executor: Box<dyn CopyExecutor>,
    ) -> Result<Self> {
        config.validate().context("invalid prefetch configuration")?;
        info!(
            "Prefetch coordinator: {} slots, window {}, up to {} predictions/batch",
            config.num_slots, config.history_window, config.max_predictions
        );
        Ok(Self {
            predictor: PrefetchPredictor::new(config.history_window),
            pool: LoraMemoryPool::new(config.num_slots, source, executor),
            config,
            batches: 0,
        })
    }

    /// Make every required adapter resident and pinned before compute.
    ///
    /// Adapters are awaited in id order so slot assignment is deterministic
    /// for a given pool state. If any adapter fails, pins already acquired
    /// for this batch are released before the error is returned.
    pub fn prepare_batch(
        &mut self,
        required: &HashSet<AdapterId>,
    ) -> Result<Vec<SlotRef>, PrefetchError> {
        let mut ids: Vec<&AdapterId> = required.iter().collect();
        ids.sort_unstable();

        let mut pinned = Vec::with_capacity(ids.len());
        for id in ids {
            match self.pool.wait_for_prefetch(id) {
                Ok(slot) => pinned.push(slot),
                Err(err) => {
                    for slot in &pinned {
                        self.pool.release(&slot.adapter);
                    }
                    return Err(err);
                }
            }
        }
        Ok(pinned)
    }

    /// Un-pin the batch's adapters, record the batch, and prefetch the
    /// forecast for the next one.
    pub fn finish_batch(&mut self, required: &HashSet<AdapterId>) {
        for id in required {
            self.pool.release(id);
        }

        self.predictor.record_batch(required);
        let predicted = self
            .predictor
            .predict_next_loras(required, self.config.max_predictions);
        debug!("Predicted next adapters: {:?}", predicted);
        for id in &predicted {
            self.pool.async_prefetch_lora(id);
        }

        self.batches += 1;
        if self.config.metrics_interval > 0 && self.batches % self.config.metrics_interval == 0 {
            self.pool.log_prefetch_metrics();
        }
    }

    pub fn pool(&self) -> &LoraMemoryPool {
        &self.pool
    }

    pub fn predictor(&self) -> &PrefetchPredictor {
        &self.predictor
    }

    pub fn batches_processed(&self) -> u64 {
        self.batches
    }
}
