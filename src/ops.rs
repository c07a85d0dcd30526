//! Serial operation queue
//!
//! User operations are serialized through a bounded-depth queue with three
//! priorities. One worker drains the queue; within a priority, arrival order
//! holds, and a newly arrived higher-priority operation always runs before
//! older lower-priority ones. Submissions past the depth bound are rejected
//! rather than buffered: a caller stacking operations faster than they
//! complete is pacing, not queueing.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Default bound on in-flight operations
pub const DEFAULT_DEPTH: usize = 3;

/// Operation priorities, highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpPriority {
    /// Pause/stop: the user wants silence now
    UserInteractive,
    /// Skips and other track changes
    High,
    /// Everything else
    Normal,
}

type Op = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Bounded-depth serial queue
pub struct OperationQueue {
    interactive_tx: mpsc::UnboundedSender<Op>,
    high_tx: mpsc::UnboundedSender<Op>,
    normal_tx: mpsc::UnboundedSender<Op>,
    in_flight: Arc<AtomicUsize>,
    depth: usize,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl OperationQueue {
    pub fn new(depth: usize) -> Self {
        let (interactive_tx, mut interactive_rx) = mpsc::unbounded_channel::<Op>();
        let (high_tx, mut high_rx) = mpsc::unbounded_channel::<Op>();
        let (normal_tx, mut normal_rx) = mpsc::unbounded_channel::<Op>();
        let in_flight = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&in_flight);
        let worker = tokio::spawn(async move {
            loop {
                let op = tokio::select! {
                    biased;
                    op = interactive_rx.recv() => op,
                    op = high_rx.recv() => op,
                    op = normal_rx.recv() => op,
                };
                match op {
                    Some(op) => {
                        op.await;
                        counter.fetch_sub(1, Ordering::SeqCst);
                    }
                    None => break,
                }
            }
            debug!("operation queue worker stopped");
        });

        Self {
            interactive_tx,
            high_tx,
            normal_tx,
            in_flight,
            depth: depth.max(1),
            worker: std::sync::Mutex::new(Some(worker)),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run an operation through the queue and await its result.
    ///
    /// Fails with `RateLimited` when the queue is already at depth.
    pub async fn run<T, F>(&self, priority: OpPriority, label: &str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        // reserve a slot; give it back if the reservation overshot
        let previous = self.in_flight.fetch_add(1, Ordering::SeqCst);
        if previous >= self.depth {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            warn!(label, depth = self.depth, "operation queue at depth, rejecting");
            return Err(Error::RateLimited(format!(
                "operation queue is at depth {}",
                self.depth
            )));
        }

        let (result_tx, result_rx) = oneshot::channel();
        let wrapped: Op = Box::pin(async move {
            let _ = result_tx.send(op.await);
        });

        let tx = match priority {
            OpPriority::UserInteractive => &self.interactive_tx,
            OpPriority::High => &self.high_tx,
            OpPriority::Normal => &self.normal_tx,
        };
        if tx.send(wrapped).is_err() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::invalid_state("queue stopped", label));
        }

        result_rx
            .await
            .map_err(|_| Error::invalid_state("queue stopped", label))
    }

    /// Stop the worker; queued operations are dropped
    pub fn shutdown(&self) {
        if let Some(worker) = self.worker.lock().expect("worker lock").take() {
            worker.abort();
        }
    }
}

impl Drop for OperationQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
