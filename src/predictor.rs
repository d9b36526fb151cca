//! Statistical prediction of upcoming adapter demand
//!
//! The predictor observes the adapter sets used by recent batches and ranks
//! adapters likely to be needed next. History is a bounded ring of batch
//! records; per-adapter occurrence counts and last-seen positions are
//! maintained incrementally, so recording is O(batch size) and prediction is
//! O(distinct adapters observed), with no history rescans.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::AdapterId;

/// Snapshot of one batch: the adapter set it used plus its sequence position.
/// Immutable after creation.
#[derive(Debug, Clone)]
pub struct BatchRecord {
    /// Members, sorted for deterministic iteration
    adapters: Vec<AdapterId>,
    /// Position in the overall batch sequence
    seq: u64,
}

impl BatchRecord {
    pub fn adapters(&self) -> &[AdapterId] {
        &self.adapters
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// Frequency/recency predictor over a sliding window of batches
pub struct PrefetchPredictor {
    /// Ring of recent batches, capacity = window
    history: VecDeque<BatchRecord>,
    window: usize,
    /// Occurrence count within `history`, maintained incrementally
    frequency: HashMap<AdapterId, u32>,
    /// Sequence number of the most recent batch containing each adapter
    last_seen: HashMap<AdapterId, u64>,
    /// Sequence counter, incremented per recorded batch
    seq: u64,
}

impl PrefetchPredictor {
    pub fn new(window: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(window),
            window: window.max(1),
            frequency: HashMap::new(),
            last_seen: HashMap::new(),
            seq: 0,
        }
    }

    /// Record the adapter set one batch used. An empty set is valid.
    pub fn record_batch(&mut self, adapters: &HashSet<AdapterId>) {
        self.seq += 1;

        // Admit: evict the oldest record first, reversing its tally
        if self.history.len() == self.window {
            if let Some(evicted) = self.history.pop_front() {
                for id in evicted.adapters() {
                    if let Some(count) = self.frequency.get_mut(id) {
                        *count -= 1;
                        if *count == 0 {
                            self.frequency.remove(id);
                            self.last_seen.remove(id);
                        }
                    }
                }
            }
        }

        let mut members: Vec<AdapterId> = adapters.iter().cloned().collect();
        members.sort_unstable();
        for id in &members {
            *self.frequency.entry(id.clone()).or_insert(0) += 1;
            self.last_seen.insert(id.clone(), self.seq);
        }

        debug!(
            "Predictor: recorded batch {} ({} adapters, history {}/{})",
            self.seq,
            members.len(),
            self.history.len() + 1,
            self.window
        );

        self.history.push_back(BatchRecord {
            adapters: members,
            seq: self.seq,
        });
    }

    /// Rank up to `max_predictions` adapters likely needed by the next batch.
    ///
    /// Members of `current` are guaranteed needed again, so they come first
    /// (in id order). Remaining candidates are ranked by
    /// `frequency + 1 / (1 + age)`: one full occurrence always outweighs any
    /// recency bonus, and among equal counts the most recently seen adapter
    /// wins. Exact ties fall back to ascending id order. Never fails; with
    /// empty history this degrades to `current` alone.
    pub fn predict_next_loras(
        &self,
        current: &HashSet<AdapterId>,
        max_predictions: usize,
    ) -> Vec<AdapterId> {
        let mut result: Vec<AdapterId> = current.iter().cloned().collect();
        result.sort_unstable();
        result.truncate(max_predictions);

        if result.len() == max_predictions || self.history.is_empty() {
            return result;
        }

        let mut candidates: Vec<(f64, &AdapterId)> = self
            .frequency
            .iter()
            .filter(|(id, _)| !current.contains(*id))
            .map(|(id, &count)| {
                let age = self.seq - self.last_seen.get(id).copied().unwrap_or(0);
                let score = count as f64 + 1.0 / (1.0 + age as f64);
                (score, id)
            })
            .collect();

        // Highest score first; equal scores resolve by ascending id
        candidates.sort_unstable_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(b.1))
        });

        for (_, id) in candidates {
            if result.len() == max_predictions {
                break;
            }
            result.push(id.clone());
        }

        result
    }

    /// Number of batches currently in the window
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Occurrence count of an adapter within the window
    pub fn frequency(&self, id: &str) -> u32 {
        self.frequency.get(id).copied().unwrap_or(0)
    }

    /// Number of distinct adapters observed within the window
    pub fn tracked_adapters(&self) -> usize {
        self.frequency.len()
    }
}
