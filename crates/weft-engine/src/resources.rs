use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::debug;

use weft_core::config::CapacityConfig;
use weft_core::error::{Result, WeftError};
use weft_core::types::ResourceRequest;

/// Fractional amounts are tracked in thousandths so that release exactly
/// undoes acquire.
const SCALE: f64 = 1000.0;

fn units(amount: f64) -> u64 {
    (amount.max(0.0) * SCALE).round() as u64
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Amount {
    cpu: u64,
    memory: u64,
    accelerators: u32,
}

impl Amount {
    fn of(request: &ResourceRequest) -> Self {
        Self {
            cpu: units(request.cpu),
            memory: units(request.memory_gb),
            accelerators: request.accelerators,
        }
    }
}

#[derive(Debug, Default)]
struct Usage {
    held: Amount,
    tasks: usize,
}

/// Resources currently leased out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolUsage {
    pub cpu: f64,
    pub memory_gb: f64,
    pub accelerators: u32,
    pub tasks: usize,
}

/// Engine-wide pool of declared resources.
///
/// A task holds a [`ResourceLease`] from just before its first attempt until
/// its terminal outcome, except while it waits on nested work. The sum of
/// held leases never exceeds capacity, and the number of held leases never
/// exceeds `max_tasks`.
pub struct ResourcePool {
    capacity: Amount,
    max_tasks: usize,
    usage: Mutex<Usage>,
    released: Notify,
}

impl ResourcePool {
    pub fn new(capacity: &CapacityConfig, max_tasks: usize) -> Self {
        Self {
            capacity: Amount {
                cpu: units(capacity.cpu),
                memory: units(capacity.memory_gb),
                accelerators: capacity.accelerators,
            },
            max_tasks: max_tasks.max(1),
            usage: Mutex::new(Usage::default()),
            released: Notify::new(),
        }
    }

    /// Whether the request could be granted on an idle pool.
    pub fn admits(&self, request: &ResourceRequest) -> bool {
        let want = Amount::of(request);
        want.cpu <= self.capacity.cpu
            && want.memory <= self.capacity.memory
            && want.accelerators <= self.capacity.accelerators
    }

    /// Grant the request now if it fits.
    pub fn try_acquire(self: &Arc<Self>, request: &ResourceRequest) -> Option<ResourceLease> {
        let want = Amount::of(request);
        let mut usage = self.usage.lock().unwrap_or_else(|e| e.into_inner());
        let fits = usage.tasks < self.max_tasks
            && usage.held.cpu + want.cpu <= self.capacity.cpu
            && usage.held.memory + want.memory <= self.capacity.memory
            && usage.held.accelerators + want.accelerators <= self.capacity.accelerators;
        if !fits {
            return None;
        }
        usage.held.cpu += want.cpu;
        usage.held.memory += want.memory;
        usage.held.accelerators += want.accelerators;
        usage.tasks += 1;
        Some(ResourceLease {
            pool: self.clone(),
            amount: want,
        })
    }

    /// Wait until the request fits, then grant it.
    ///
    /// Fails immediately if the request exceeds total capacity.
    pub async fn acquire(self: &Arc<Self>, request: &ResourceRequest) -> Result<ResourceLease> {
        if !self.admits(request) {
            return Err(WeftError::ResourceUnsatisfiable {
                function: String::new(),
                detail: format!(
                    "requested cpu={} memory_gb={} accelerators={}",
                    request.cpu, request.memory_gb, request.accelerators
                ),
            });
        }
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed.
            notified.as_mut().enable();

            if let Some(lease) = self.try_acquire(request) {
                return Ok(lease);
            }
            debug!(
                cpu = request.cpu,
                memory_gb = request.memory_gb,
                "Waiting for resources"
            );
            notified.await;
        }
    }

    pub fn usage(&self) -> PoolUsage {
        let usage = self.usage.lock().unwrap_or_else(|e| e.into_inner());
        PoolUsage {
            cpu: usage.held.cpu as f64 / SCALE,
            memory_gb: usage.held.memory as f64 / SCALE,
            accelerators: usage.held.accelerators,
            tasks: usage.tasks,
        }
    }

    fn release(&self, amount: Amount) {
        {
            let mut usage = self.usage.lock().unwrap_or_else(|e| e.into_inner());
            usage.held.cpu -= amount.cpu;
            usage.held.memory -= amount.memory;
            usage.held.accelerators -= amount.accelerators;
            usage.tasks -= 1;
        }
        self.released.notify_waiters();
    }
}

/// Resources held by one running task. Released on drop.
pub struct ResourceLease {
    pool: Arc<ResourcePool>,
    amount: Amount,
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        self.pool.release(self.amount);
    }
}

/// The lease of a running task that may wait on nested work.
///
/// While the task is suspended on children it launched, the lease goes back
/// to the pool so the children can be placed; the task takes it again before
/// it continues. Overlapping waits in one body share a single suspension.
pub(crate) struct HeldLease {
    pool: Arc<ResourcePool>,
    request: ResourceRequest,
    state: Mutex<HoldState>,
}

struct HoldState {
    lease: Option<ResourceLease>,
    suspended: usize,
    closed: bool,
}

impl HeldLease {
    pub(crate) fn new(
        pool: Arc<ResourcePool>,
        request: ResourceRequest,
        lease: ResourceLease,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            request,
            state: Mutex::new(HoldState {
                lease: Some(lease),
                suspended: 0,
                closed: false,
            }),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, HoldState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `fut` with the lease given back, re-acquiring it afterwards.
    ///
    /// If `fut` is dropped before completing, the task stays unleased until
    /// its next nested wait completes.
    pub(crate) async fn yielding<F: Future>(&self, fut: F) -> F::Output {
        let suspension = self.suspend();
        let output = fut.await;
        drop(suspension);
        self.resume().await;
        output
    }

    /// Give the lease back for good. Later waits no longer re-acquire it.
    pub(crate) fn close(&self) {
        let released = {
            let mut state = self.state();
            state.closed = true;
            state.lease.take()
        };
        drop(released);
    }

    fn suspend(&self) -> Suspension<'_> {
        let released = {
            let mut state = self.state();
            state.suspended += 1;
            state.lease.take()
        };
        if released.is_some() {
            debug!("Lease released while waiting on nested work");
        }
        drop(released);
        Suspension { hold: self }
    }

    async fn resume(&self) {
        {
            let state = self.state();
            if state.closed || state.suspended > 0 || state.lease.is_some() {
                return;
            }
        }
        // Admitted once already, so acquire only waits for capacity.
        let Ok(lease) = self.pool.acquire(&self.request).await else {
            return;
        };
        let surplus = {
            let mut state = self.state();
            if state.closed || state.suspended > 0 || state.lease.is_some() {
                Some(lease)
            } else {
                state.lease = Some(lease);
                None
            }
        };
        drop(surplus);
    }

    #[cfg(test)]
    fn is_held(&self) -> bool {
        self.state().lease.is_some()
    }
}

struct Suspension<'a> {
    hold: &'a HeldLease,
}

impl Drop for Suspension<'_> {
    fn drop(&mut self) {
        self.hold.state().suspended -= 1;
    }
}
