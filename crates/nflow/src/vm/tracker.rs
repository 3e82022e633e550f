//! Per-run Resource Tracking
//!
//! Each VM carries a tracker that the QuickJS interrupt handler consults on
//! every check quantum. A watcher task re-checks wall-clock and operation
//! limits on a 10 ms tick and trips the interrupted flag; the memory limit is
//! enforced by the engine allocator (the pool arms it per acquire), with an
//! optional probe hook for watcher-side sampling where one is available.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::VmPoolConfig;

/// Watcher tick period
pub const WATCH_TICK: Duration = Duration::from_millis(10);

/// Per-run resource limits
#[derive(Debug, Clone, Copy)]
pub struct VmLimits {
    pub memory_bytes: usize,
    pub time: Duration,
    pub operations: u64,
    /// Watcher ticks between memory-probe samples
    pub check_interval: u64,
}

impl From<&VmPoolConfig> for VmLimits {
    fn from(config: &VmPoolConfig) -> Self {
        Self {
            memory_bytes: config.max_memory_mb.saturating_mul(1024 * 1024),
            time: Duration::from_secs(config.max_execution_seconds),
            operations: config.max_operations,
            check_interval: config.check_interval.max(1),
        }
    }
}

/// Which limit tripped an interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LimitKind {
    Time = 1,
    Memory = 2,
    Operations = 3,
}

/// Optional memory sampler for the watcher loop
pub type MemoryProbe = Box<dyn Fn() -> Option<usize> + Send + Sync>;

/// Shared counters for one VM
pub struct ResourceTracker {
    limits: VmLimits,
    epoch: Instant,
    start_nanos: AtomicU64,
    operations: AtomicU64,
    memory_baseline: AtomicU64,
    interrupted: AtomicBool,
    limit_kind: AtomicU8,
}

impl ResourceTracker {
    pub fn new(limits: VmLimits) -> Self {
        Self {
            limits,
            epoch: Instant::now(),
            start_nanos: AtomicU64::new(0),
            operations: AtomicU64::new(0),
            memory_baseline: AtomicU64::new(0),
            interrupted: AtomicBool::new(false),
            limit_kind: AtomicU8::new(0),
        }
    }

    pub fn limits(&self) -> &VmLimits {
        &self.limits
    }

    /// Arm the tracker for a new run
    pub fn begin(&self, memory_baseline: usize) {
        self.start_nanos
            .store(self.epoch.elapsed().as_nanos() as u64, Ordering::SeqCst);
        self.operations.store(0, Ordering::SeqCst);
        self.memory_baseline
            .store(memory_baseline as u64, Ordering::SeqCst);
        self.interrupted.store(false, Ordering::SeqCst);
        self.limit_kind.store(0, Ordering::SeqCst);
    }

    /// Elapsed wall clock of the current run
    pub fn elapsed(&self) -> Duration {
        let now = self.epoch.elapsed().as_nanos() as u64;
        Duration::from_nanos(now.saturating_sub(self.start_nanos.load(Ordering::Relaxed)))
    }

    pub fn operation_count(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    pub fn memory_baseline(&self) -> usize {
        self.memory_baseline.load(Ordering::Relaxed) as usize
    }

    /// Interrupt-handler entry point: one check quantum.
    ///
    /// Counts the quantum, self-checks the cheap limits and reports whether
    /// execution must be interrupted.
    pub fn tick_operation(&self) -> bool {
        let ops = self.operations.fetch_add(1, Ordering::Relaxed) + 1;
        if ops > self.limits.operations {
            self.trip(LimitKind::Operations);
        } else if self.elapsed() > self.limits.time {
            self.trip(LimitKind::Time);
        }
        self.is_interrupted()
    }

    /// Trip the interrupted flag; the first kind wins
    pub fn trip(&self, kind: LimitKind) {
        if !self.interrupted.swap(true, Ordering::SeqCst) {
            self.limit_kind.store(kind as u8, Ordering::SeqCst);
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Human-readable description of the tripped limit
    pub fn limit_message(&self) -> Option<String> {
        if !self.is_interrupted() {
            return None;
        }
        Some(match self.limit_kind.load(Ordering::SeqCst) {
            1 => format!(
                "execution time exceeded {}s",
                self.limits.time.as_secs_f64()
            ),
            2 => format!(
                "memory growth exceeded {} bytes",
                self.limits.memory_bytes
            ),
            3 => format!("operation count exceeded {}", self.limits.operations),
            _ => "interrupted".to_string(),
        })
    }
}

/// Watcher handle; aborts the loop on drop
pub struct Watcher {
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawn the 10 ms watcher for one run.
///
/// Every tick re-checks elapsed time and operation count; every
/// `check_interval` ticks the memory probe (when present) is sampled against
/// the baseline.
pub fn spawn_watcher(tracker: Arc<ResourceTracker>, probe: Option<MemoryProbe>) -> Watcher {
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(WATCH_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut tick: u64 = 0;
        loop {
            ticker.tick().await;
            tick += 1;
            if tracker.is_interrupted() {
                continue;
            }
            if tracker.elapsed() > tracker.limits().time {
                tracker.trip(LimitKind::Time);
                continue;
            }
            if tracker.operation_count() > tracker.limits().operations {
                tracker.trip(LimitKind::Operations);
                continue;
            }
            if tick % tracker.limits().check_interval == 0 {
                if let Some(probe) = &probe {
                    if let Some(current) = probe() {
                        let delta = current.saturating_sub(tracker.memory_baseline());
                        if delta > tracker.limits().memory_bytes {
                            tracker.trip(LimitKind::Memory);
                        }
                    }
                }
            }
        }
    });
    Watcher { handle }
}
