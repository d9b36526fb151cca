//! Background copy execution
//!
//! The copy timeline is an injectable abstraction with two operations,
//! `submit(op) -> handle` and `wait(handle) -> outcome`, instead of a
//! process-wide device-stream singleton. `TransferThread` runs copies on a
//! dedicated background thread; `InlineExecutor` runs them synchronously at
//! submit time, which makes the memory pool fully testable without threads.

use std::sync::mpsc;
use std::thread;

use tracing::{debug, info};

use crate::error::CopyError;
use crate::source::AdapterWeights;

/// Result of one adapter copy
pub type CopyOutcome = Result<AdapterWeights, CopyError>;

/// A unit of copy work, executed on the copy timeline
pub type CopyOp = Box<dyn FnOnce() -> CopyOutcome + Send + 'static>;

/// Completion handle for a submitted copy.
///
/// Consumed exactly once by `CopyExecutor::wait`; observing the outcome is
/// the synchronization point after which the target slot may be read.
pub struct CopyHandle {
    inner: HandleInner,
}

enum HandleInner {
    /// Copy runs elsewhere; completion arrives on this channel
    Pending(mpsc::Receiver<CopyOutcome>),
    /// Copy already ran at submit time
    Done(CopyOutcome),
}

impl CopyHandle {
    fn pending(rx: mpsc::Receiver<CopyOutcome>) -> Self {
        Self {
            inner: HandleInner::Pending(rx),
        }
    }

    fn done(outcome: CopyOutcome) -> Self {
        Self {
            inner: HandleInner::Done(outcome),
        }
    }

    /// Block until the copy's completion signal fires
    fn recv(self) -> CopyOutcome {
        match self.inner {
            HandleInner::Pending(rx) => rx.recv().unwrap_or_else(|_| {
                Err(CopyError::Transfer(
                    "copy worker exited before completing transfer".to_string(),
                ))
            }),
            HandleInner::Done(outcome) => outcome,
        }
    }
}

/// The copy timeline the memory pool submits work to
pub trait CopyExecutor: Send {
    /// Enqueue a copy. Must never block the calling (compute) timeline.
    fn submit(&self, op: CopyOp) -> CopyHandle;

    /// Suspend the calling timeline until the copy completes
    fn wait(&self, handle: CopyHandle) -> CopyOutcome {
        handle.recv()
    }
}

struct Job {
    op: CopyOp,
    done: mpsc::Sender<CopyOutcome>,
}

/// Dedicated background thread draining a queue of copy jobs.
///
/// Dropping the executor closes the queue and joins the worker; handles for
/// jobs the worker never finished resolve to a transfer error rather than
/// hanging.
pub struct TransferThread {
    jobs: Option<mpsc::Sender<Job>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl TransferThread {
    pub fn spawn() -> Self {
        let (jobs_tx, jobs_rx) = mpsc::channel::<Job>();
        let worker = thread::Builder::new()
            .name("adapter-copy".into())
            .spawn(move || {
                while let Ok(job) = jobs_rx.recv() {
                    let outcome = (job.op)();
                    // Receiver may be gone if the pool was dropped mid-copy
                    let _ = job.done.send(outcome);
                }
                debug!("adapter copy thread shutting down");
            })
            .expect("failed to spawn adapter copy thread");

        info!("Adapter copy thread started");
        Self {
            jobs: Some(jobs_tx),
            worker: Some(worker),
        }
    }
}

impl CopyExecutor for TransferThread {
    fn submit(&self, op: CopyOp) -> CopyHandle {
        let (done_tx, done_rx) = mpsc::channel();
        match &self.jobs {
            Some(jobs) if jobs.send(Job { op, done: done_tx }).is_ok() => {
                CopyHandle::pending(done_rx)
            }
            _ => CopyHandle::done(Err(CopyError::Transfer(
                "copy thread unavailable".to_string(),
            ))),
        }
    }
}

impl Drop for TransferThread {
    fn drop(&mut self) {
        // Closing the job channel lets the worker loop exit
        drop(self.jobs.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Executor that runs each copy inline at submit time.
///
/// Used by tests to make the pool's state machine fully deterministic, and
/// usable anywhere background transfer offers no benefit.
pub struct InlineExecutor;

impl CopyExecutor for InlineExecutor {
    fn submit(&self, op: CopyOp) -> CopyHandle {
        CopyHandle::done(op())
    }
}
