//! Slot-based device memory pool for swappable adapters
//!
//! Owns a fixed set of device-resident slots, maps adapter identity to slot,
//! runs background loads on the copy timeline, and exposes the blocking
//! `wait_for_prefetch` that compute must pass through before reading a slot.
//!
//! Slot lifecycle:
//! ```text
//! Empty ──(prefetch / sync load)──► Loading ──(copy ok)──► Ready ──┐
//!   ▲                                  │                     ▲     │ pin
//!   │                                  │ copy fails          │     ▼
//!   └──────(retry exhausted)──────── Error ──(retry ok)──────┘  (in use)
//! ```
//! A pinned slot is never an eviction victim, and the victim search is
//! restricted to Empty/Ready slots, so a Loading slot can never be rebound
//! while its copy is still in flight.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::PrefetchError;
use crate::executor::{CopyExecutor, CopyHandle};
use crate::metrics::{PrefetchMetrics, PrefetchStats};
use crate::source::{AdapterSource, AdapterWeights};
use crate::AdapterId;

/// Lifecycle state of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No adapter bound
    Empty,
    /// Copy in flight; contents must not be read or rebound
    Loading,
    /// Fully loaded; readable after `wait_for_prefetch` returned it
    Ready,
    /// Last copy failed; transient state inside the retry path
    Error,
}

/// One fixed-capacity device memory region
pub struct Slot {
    state: SlotState,
    /// Bound adapter; undefined (None) when Empty
    adapter: Option<AdapterId>,
    weights: Option<AdapterWeights>,
    /// True while a batch currently depends on this slot
    pinned: bool,
    /// Pool clock value of the last use, for LRU victim selection
    last_used: u64,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: SlotState::Empty,
            adapter: None,
            weights: None,
            pinned: false,
            last_used: 0,
        }
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn adapter(&self) -> Option<&str> {
        self.adapter.as_deref()
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }
}

/// Reference to a ready slot, handed to compute after a successful wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRef {
    pub index: usize,
    pub adapter: AdapterId,
}

/// An issued-but-not-yet-awaited background load
struct PendingPrefetch {
    slot: usize,
    handle: CopyHandle,
}

/// Fixed-size pool of adapter slots with LRU eviction and async prefetch
pub struct LoraMemoryPool {
    slots: Vec<Slot>,
    /// Adapter id → slot index, for Ready slots only
    resident: HashMap<AdapterId, usize>,
    /// Adapter id → in-flight background load
    pending: HashMap<AdapterId, PendingPrefetch>,
    source: Arc<dyn AdapterSource>,
    executor: Box<dyn CopyExecutor>,
    metrics: PrefetchMetrics,
    /// Monotonic use counter driving LRU order
    clock: u64,
}

impl LoraMemoryPool {
    pub fn new(
        num_slots: usize,
        source: Arc<dyn AdapterSource>,
        executor: Box<dyn CopyExecutor>,
    ) -> Self {
        info!("LoRA memory pool: {} slots", num_slots);
        Self {
            slots: (0..num_slots).map(|_| Slot::new()).collect(),
            resident: HashMap::new(),
            pending: HashMap::new(),
            source,
            executor,
            metrics: PrefetchMetrics::new(),
            clock: 0,
        }
    }

    /// Issue a speculative background load for `id`. Never blocks.
    ///
    /// Idempotent: already-resident and already-pending adapters are left
    /// alone. With every slot pinned or loading the prefetch is silently
    /// deferred (counted in metrics) rather than blocking.
    pub fn async_prefetch_lora(&mut self, id: &str) {
        if self.resident.contains_key(id) || self.pending.contains_key(id) {
            return;
        }

        let Some(victim) = self.select_victim() else {
            self.metrics.record_deferral();
            debug!("Prefetch of '{}' deferred: no unpinned slot", id);
            return;
        };

        self.evict(victim);
        let slot = &mut self.slots[victim];
        slot.state = SlotState::Loading;
        slot.adapter = Some(id.to_string());
        slot.weights = None;

        let source = Arc::clone(&self.source);
        let target = id.to_string();
        let handle = self.executor.submit(Box::new(move || source.load(&target)));
        self.pending.insert(
            id.to_string(),
            PendingPrefetch {
                slot: victim,
                handle,
            },
        );
        debug!("Prefetch of '{}' issued into slot {}", id, victim);
    }

    /// Block until `id` is resident and return its (pinned) slot.
    ///
    /// Every use of an adapter must pass through here before compute reads
    /// the slot. On success the slot is pinned; the caller un-pins via
    /// [`release`](Self::release) once the batch's compute finishes.
    pub fn wait_for_prefetch(&mut self, id: &str) -> Result<SlotRef, PrefetchError> {
        self.metrics.record_request();
        self.clock += 1;

        // Already resident: hit, no waiting
        if let Some(&idx) = self.resident.get(id) {
            self.metrics.record_hit();
            return Ok(self.pin(idx));
        }

        // In flight: suspend until the completion signal fires
        if let Some(pending) = self.pending.remove(id) {
            match self.executor.wait(pending.handle) {
                Ok(weights) => {
                    self.metrics.record_hit();
                    return Ok(self.install(pending.slot, id, weights));
                }
                Err(err) if err.is_fatal() => {
                    self.metrics.record_miss();
                    self.metrics.record_failure();
                    self.reset_slot(pending.slot);
                    return Err(PrefetchError::Device(err));
                }
                Err(err) => {
                    // Loading → Error, then reset and retry once synchronously
                    warn!("Async load of '{}' failed, retrying inline: {}", id, err);
                    self.metrics.record_miss();
                    self.metrics.record_failure();
                    self.slots[pending.slot].state = SlotState::Error;
                    self.reset_slot(pending.slot);
                    return self.load_sync(pending.slot, id, 1);
                }
            }
        }

        // Mispredicted or never prefetched: synchronous fallback
        self.metrics.record_miss();
        let Some(victim) = self.select_victim() else {
            return Err(PrefetchError::NoSlotAvailable(id.to_string()));
        };
        self.evict(victim);
        self.load_sync(victim, id, 2)
    }

    /// Un-pin the slot holding `id` once the batch's compute finishes.
    /// Paired with the pin taken by `wait_for_prefetch`.
    pub fn release(&mut self, id: &str) {
        match self.resident.get(id) {
            Some(&idx) => {
                self.slots[idx].pinned = false;
            }
            None => debug!("Release for non-resident adapter '{}'", id),
        }
    }

    /// Log and return the cumulative prefetch counters. Safe at any time.
    pub fn log_prefetch_metrics(&self) -> PrefetchStats {
        let stats = self.metrics.snapshot();
        info!("{}", stats);
        stats
    }

    /// Weights of a slot previously returned by `wait_for_prefetch`.
    /// None if the binding has since changed.
    pub fn adapter_weights(&self, slot_ref: &SlotRef) -> Option<&AdapterWeights> {
        let slot = self.slots.get(slot_ref.index)?;
        if slot.state == SlotState::Ready && slot.adapter() == Some(slot_ref.adapter.as_str()) {
            slot.weights.as_ref()
        } else {
            None
        }
    }

    pub fn is_resident(&self, id: &str) -> bool {
        self.resident.contains_key(id)
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn slot(&self, index: usize) -> &Slot {
        &self.slots[index]
    }

    pub fn metrics(&self) -> &PrefetchMetrics {
        &self.metrics
    }

    /// Least-recently-used unpinned slot in Empty/Ready state.
    /// Empty slots carry `last_used == 0` and so win before any Ready slot;
    /// remaining ties resolve to the lowest index.
    fn select_victim(&self) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                !s.pinned && matches!(s.state, SlotState::Empty | SlotState::Ready)
            })
            .min_by_key(|(i, s)| (s.last_used, *i))
            .map(|(i, _)| i)
    }

    /// Unbind whatever currently occupies `idx` (no-op for Empty slots)
    fn evict(&mut self, idx: usize) {
        let slot = &mut self.slots[idx];
        if let Some(prev) = slot.adapter.take() {
            self.resident.remove(&prev);
            slot.weights = None;
            slot.state = SlotState::Empty;
            self.metrics.record_eviction();
            debug!("Evicted adapter '{}' from slot {}", prev, idx);
        }
    }

    fn reset_slot(&mut self, idx: usize) {
        let slot = &mut self.slots[idx];
        slot.state = SlotState::Empty;
        slot.adapter = None;
        slot.weights = None;
    }

    /// Mark `idx` Ready with `weights`, register residency, and pin
    fn install(&mut self, idx: usize, id: &str, weights: AdapterWeights) -> SlotRef {
        let slot = &mut self.slots[idx];
        slot.state = SlotState::Ready;
        slot.adapter = Some(id.to_string());
        slot.weights = Some(weights);
        self.resident.insert(id.to_string(), idx);
        self.pin(idx)
    }

    fn pin(&mut self, idx: usize) -> SlotRef {
        let slot = &mut self.slots[idx];
        slot.pinned = true;
        slot.last_used = self.clock;
        SlotRef {
            index: idx,
            adapter: slot.adapter.clone().unwrap_or_default(),
        }
    }

    /// Load `id` into `idx` on the calling timeline, with `attempts` tries
    /// for transient failures. Device errors propagate immediately.
    fn load_sync(
        &mut self,
        idx: usize,
        id: &str,
        attempts: u32,
    ) -> Result<SlotRef, PrefetchError> {
        self.slots[idx].state = SlotState::Loading;
        self.slots[idx].adapter = Some(id.to_string());

        let mut attempt = 0;
        loop {
            match self.source.load(id) {
                Ok(weights) => return Ok(self.install(idx, id, weights)),
                Err(err) if err.is_fatal() => {
                    self.metrics.record_failure();
                    self.reset_slot(idx);
                    return Err(PrefetchError::Device(err));
                }
                Err(err) => {
                    self.metrics.record_failure();
                    self.slots[idx].state = SlotState::Error;
                    attempt += 1;
                    if attempt >= attempts {
                        warn!(
                            "Synchronous load of '{}' failed after {} attempt(s): {}",
                            id, attempt, err
                        );
                        self.reset_slot(idx);
                        return Err(PrefetchError::CopyFailed {
                            id: id.to_string(),
                            source: err,
                        });
                    }
                    debug!("Retrying load of '{}' after transient failure: {}", id, err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CopyError;
    use crate::executor::{InlineExecutor, TransferThread};
    use crate::source::InMemorySource;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn pool_with(adapters: &[&str], num_slots: usize) -> LoraMemoryPool {
        let mut source = InMemorySource::new();
        for id in adapters {
            source.register(id, 16, 64);
        }
        LoraMemoryPool::new(num_slots, Arc::new(source), Box::new(InlineExecutor))
    }

    /// Source that fails a configurable number of loads before succeeding
    struct FlakySource {
        fail_first: u32,
        calls: AtomicU32,
        fatal: bool,
    }

    impl FlakySource {
        fn transient(fail_first: u32) -> Self {
            Self {
                fail_first,
                calls: AtomicU32::new(0),
                fatal: false,
            }
        }

        fn fatal() -> Self {
            Self {
                fail_first: u32::MAX,
                calls: AtomicU32::new(0),
                fatal: true,
            }
        }
    }

    impl AdapterSource for FlakySource {
        fn load(&self, id: &str) -> Result<AdapterWeights, CopyError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fatal {
                return Err(CopyError::Device("device unusable".into()));
            }
            if n < self.fail_first {
                return Err(CopyError::Transfer("simulated transfer fault".into()));
            }
            Ok(AdapterWeights {
                id: id.to_string(),
                rank: 8,
                alpha: 8.0,
                data: vec![0.5; 32],
            })
        }
    }

    fn assert_no_duplicate_bindings(pool: &LoraMemoryPool) {
        let mut seen = std::collections::HashSet::new();
        for i in 0..pool.num_slots() {
            if let Some(id) = pool.slot(i).adapter() {
                assert!(seen.insert(id.to_string()), "adapter '{}' bound twice", id);
            }
        }
    }

    #[test]
    fn test_prefetch_then_wait_is_hit() {
        let mut pool = pool_with(&["a"], 2);
        pool.async_prefetch_lora("a");
        assert_eq!(pool.pending_count(), 1);

        let slot = pool.wait_for_prefetch("a").unwrap();
        assert_eq!(slot.adapter, "a");
        assert_eq!(pool.slot(slot.index).state(), SlotState::Ready);
        assert!(pool.slot(slot.index).is_pinned());
        assert!(pool.adapter_weights(&slot).is_some());
        assert_eq!(pool.pending_count(), 0);

        let stats = pool.log_prefetch_metrics();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn test_wait_without_prefetch_falls_back_synchronously() {
        let mut pool = pool_with(&["y"], 2);
        let slot = pool.wait_for_prefetch("y").unwrap();
        assert_eq!(slot.adapter, "y");
        assert_eq!(pool.slot(slot.index).state(), SlotState::Ready);

        let stats = pool.metrics().snapshot();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[test]
    fn test_prefetch_idempotent() {
        let mut pool = pool_with(&["a"], 2);
        pool.async_prefetch_lora("a");
        pool.async_prefetch_lora("a");
        assert_eq!(pool.pending_count(), 1);

        pool.wait_for_prefetch("a").unwrap();
        // Resident now: further prefetches are no-ops
        pool.async_prefetch_lora("a");
        assert_eq!(pool.pending_count(), 0);
        assert_no_duplicate_bindings(&pool);
    }

    #[test]
    fn test_two_prefetches_fill_two_slots_without_eviction() {
        let mut pool = pool_with(&["a", "b"], 2);
        pool.async_prefetch_lora("a");
        pool.async_prefetch_lora("b");

        let sa = pool.wait_for_prefetch("a").unwrap();
        let sb = pool.wait_for_prefetch("b").unwrap();
        assert_ne!(sa.index, sb.index);

        let stats = pool.metrics().snapshot();
        assert_eq!(stats.evictions, 0);
        assert_eq!(stats.hits, 2);
        assert_no_duplicate_bindings(&pool);
    }

    #[test]
    fn test_prefetch_deferred_while_pinned_then_succeeds() {
        let mut pool = pool_with(&["a", "b"], 1);
        pool.wait_for_prefetch("a").unwrap(); // pins the only slot

        pool.async_prefetch_lora("b");
        assert_eq!(pool.pending_count(), 0); // deferred, no state change
        assert!(pool.is_resident("a"));
        assert_eq!(pool.metrics().snapshot().deferrals, 1);

        pool.release("a");
        pool.async_prefetch_lora("b");
        assert_eq!(pool.pending_count(), 1);

        let slot = pool.wait_for_prefetch("b").unwrap();
        assert_eq!(slot.adapter, "b");
        assert!(!pool.is_resident("a"));
        assert_eq!(pool.metrics().snapshot().evictions, 1);
    }

    #[test]
    fn test_lru_victim_selection() {
        let mut pool = pool_with(&["a", "b", "c"], 2);
        let sa = pool.wait_for_prefetch("a").unwrap();
        let sb = pool.wait_for_prefetch("b").unwrap();
        pool.release("a");
        pool.release("b");

        // Touch "a" again so "b" becomes least recently used
        let sa2 = pool.wait_for_prefetch("a").unwrap();
        assert_eq!(sa.index, sa2.index);
        pool.release("a");

        pool.async_prefetch_lora("c");
        let sc = pool.wait_for_prefetch("c").unwrap();
        assert_eq!(sc.index, sb.index);
        assert!(!pool.is_resident("b"));
        assert!(pool.is_resident("a"));
        assert_no_duplicate_bindings(&pool);
    }

    #[test]
    fn test_wait_resident_is_hit_and_repins() {
        let mut pool = pool_with(&["a"], 1);
        let s1 = pool.wait_for_prefetch("a").unwrap();
        pool.release("a");
        assert!(!pool.slot(s1.index).is_pinned());

        let s2 = pool.wait_for_prefetch("a").unwrap();
        assert_eq!(s1, s2);
        assert!(pool.slot(s2.index).is_pinned());

        let stats = pool.metrics().snapshot();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_all_slots_pinned_fails_wait() {
        let mut pool = pool_with(&["a", "b"], 1);
        pool.wait_for_prefetch("a").unwrap();

        let err = pool.wait_for_prefetch("b").unwrap_err();
        assert!(matches!(err, PrefetchError::NoSlotAvailable(_)));
        // The pinned slot is untouched
        assert!(pool.is_resident("a"));
    }

    #[test]
    fn test_async_failure_retries_synchronously() {
        // First load (async) fails, the inline retry succeeds
        let source = Arc::new(FlakySource::transient(1));
        let mut pool = LoraMemoryPool::new(2, source, Box::new(InlineExecutor));

        pool.async_prefetch_lora("a");
        let slot = pool.wait_for_prefetch("a").unwrap();
        assert_eq!(slot.adapter, "a");
        assert_eq!(pool.slot(slot.index).state(), SlotState::Ready);

        let stats = pool.metrics().snapshot();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.misses, 1); // fallback path taken
        assert_eq!(stats.hits, 0);
    }

    #[test]
    fn test_persistent_transient_failure_surfaces_after_retry() {
        let source = Arc::new(FlakySource::transient(u32::MAX));
        let mut pool = LoraMemoryPool::new(2, source, Box::new(InlineExecutor));

        pool.async_prefetch_lora("a");
        let err = pool.wait_for_prefetch("a").unwrap_err();
        assert!(matches!(err, PrefetchError::CopyFailed { .. }));

        // Slot reset to Empty with the failure reported
        assert!(!pool.is_resident("a"));
        assert_eq!(pool.slot(0).state(), SlotState::Empty);
        let stats = pool.metrics().snapshot();
        assert_eq!(stats.failures, 2); // async attempt + sync retry
        assert_eq!(stats.hits + stats.misses, stats.requests);
    }

    #[test]
    fn test_sync_path_retries_once_then_fails() {
        let source = Arc::new(FlakySource::transient(u32::MAX));
        let mut pool = LoraMemoryPool::new(1, source, Box::new(InlineExecutor));

        let err = pool.wait_for_prefetch("a").unwrap_err();
        assert!(matches!(err, PrefetchError::CopyFailed { .. }));
        assert_eq!(pool.metrics().snapshot().failures, 2);
    }

    #[test]
    fn test_sync_path_transient_then_ok() {
        let source = Arc::new(FlakySource::transient(1));
        let mut pool = LoraMemoryPool::new(1, source, Box::new(InlineExecutor));

        let slot = pool.wait_for_prefetch("a").unwrap();
        assert_eq!(slot.adapter, "a");
        assert_eq!(pool.metrics().snapshot().failures, 1);
    }

    #[test]
    fn test_device_error_is_fatal_and_unretried() {
        let source = Arc::new(FlakySource::fatal());
        let mut pool = LoraMemoryPool::new(2, source, Box::new(InlineExecutor));

        pool.async_prefetch_lora("a");
        let err = pool.wait_for_prefetch("a").unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, PrefetchError::Device(_)));
        // No local retry for device errors
        assert_eq!(pool.metrics().snapshot().failures, 1);
        assert_eq!(pool.slot(0).state(), SlotState::Empty);
    }

    #[test]
    fn test_metrics_accounting_over_mixed_run() {
        let mut pool = pool_with(&["a", "b", "c", "d"], 2);
        pool.async_prefetch_lora("a");
        pool.wait_for_prefetch("a").unwrap();
        pool.wait_for_prefetch("b").unwrap();
        pool.release("a");
        pool.release("b");
        pool.async_prefetch_lora("c"); // evicts LRU
        pool.wait_for_prefetch("c").unwrap();
        pool.wait_for_prefetch("d").unwrap(); // evicts the other
        pool.release("c");
        pool.release("d");

        let stats = pool.metrics().snapshot();
        assert_eq!(stats.hits + stats.misses, stats.requests);
        assert_eq!(stats.requests, 4);
        assert!(stats.evictions <= 4);
        assert_no_duplicate_bindings(&pool);
    }

    #[test]
    fn test_weights_unreadable_after_rebind() {
        let mut pool = pool_with(&["a", "b"], 1);
        let sa = pool.wait_for_prefetch("a").unwrap();
        pool.release("a");
        pool.wait_for_prefetch("b").unwrap();

        // The stale SlotRef no longer grants access
        assert!(pool.adapter_weights(&sa).is_none());
    }

    #[test]
    fn test_release_unknown_adapter_is_noop() {
        let mut pool = pool_with(&["a"], 1);
        pool.release("never-loaded");
        assert_eq!(pool.metrics().snapshot().requests, 0);
    }

    #[test]
    fn test_with_background_copy_thread() {
        let mut source = InMemorySource::new();
        source.register("a", 16, 64);
        source.register("b", 16, 64);
        let mut pool =
            LoraMemoryPool::new(2, Arc::new(source), Box::new(TransferThread::spawn()));

        pool.async_prefetch_lora("a");
        pool.async_prefetch_lora("b");
        let sa = pool.wait_for_prefetch("a").unwrap();
        let sb = pool.wait_for_prefetch("b").unwrap();
        assert_eq!(sa.adapter, "a");
        assert_eq!(sb.adapter, "b");
        assert_eq!(pool.metrics().snapshot().hits, 2);
    }
}
