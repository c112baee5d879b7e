// src/limiter.rs

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Counting admission gate for size probes, shared across many tasks.
///
/// At most `limit` permits are out at once. The gate also records how many
/// are currently held and the highest number ever held simultaneously.
#[derive(Debug, Clone)]
pub struct ProbeGate {
    state: Arc<GateState>,
}

#[derive(Debug)]
struct GateState {
    semaphore: Arc<Semaphore>,
    limit: usize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Held while one probe request is on the wire. Released on drop.
#[derive(Debug)]
pub struct ProbePermit {
    state: Arc<GateState>,
    _permit: OwnedSemaphorePermit,
}

impl ProbeGate {
    /// Creates a gate admitting `limit` concurrent probes. A limit of 0 is
    /// raised to 1 so the gate can never deadlock.
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            state: Arc::new(GateState {
                semaphore: Arc::new(Semaphore::new(limit)),
                limit,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
        }
    }

    /// Waits for a free slot.
    pub async fn acquire(&self) -> Result<ProbePermit, AcquireError> {
        let permit = self.state.semaphore.clone().acquire_owned().await?;
        let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak.fetch_max(now, Ordering::SeqCst);
        Ok(ProbePermit {
            state: self.state.clone(),
            _permit: permit,
        })
    }

    pub fn limit(&self) -> usize {
        self.state.limit
    }

    /// Number of permits currently held.
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of permits ever held at the same time.
    pub fn peak(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }
}

impl Drop for ProbePermit {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
