//! VM Pool
//!
//! Bounded pool of JavaScript VMs. Acquire takes an idle instance when one is
//! available, creates a new one while the live count is under `max_size`, and
//! otherwise waits up to five seconds for a release before failing with a
//! pool-exhausted error. Capacity is reserved before the (fallible) create and
//! undone on failure so a failed construction never leaks a slot.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::VmPoolConfig;
use crate::types::{Error, Result};

use super::globals::{self, RESERVED_NAMES};
use super::runtime::JsVm;
use super::tracker::{spawn_watcher, LimitKind, VmLimits, Watcher};

/// How long acquire blocks for a release before giving up
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

struct IdleVm {
    vm: JsVm,
    idle_since: Instant,
}

struct PoolState {
    idle: VecDeque<IdleVm>,
    /// VMs alive anywhere: idle here or owned by a guard
    live: usize,
}

#[derive(Default)]
struct PoolCounters {
    created: AtomicU64,
    recycled: AtomicU64,
    dropped: AtomicU64,
    exhausted: AtomicU64,
}

/// Point-in-time pool numbers for metrics and `/health`
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolMetrics {
    pub live: usize,
    pub idle: usize,
    pub created: u64,
    pub recycled: u64,
    pub dropped: u64,
    pub exhausted: u64,
}

/// Bounded pool of [`JsVm`] instances
pub struct VmPool {
    config: VmPoolConfig,
    limits: VmLimits,
    env: serde_json::Value,
    state: Mutex<PoolState>,
    notify: Notify,
    next_id: AtomicU64,
    counters: PoolCounters,
}

impl VmPool {
    pub fn new(config: VmPoolConfig, env: serde_json::Value) -> Arc<Self> {
        let limits = VmLimits::from(&config);
        Arc::new(Self {
            config,
            limits,
            env,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                live: 0,
            }),
            notify: Notify::new(),
            next_id: AtomicU64::new(1),
            counters: PoolCounters::default(),
        })
    }

    pub fn limits(&self) -> &VmLimits {
        &self.limits
    }

    /// Create `preload_size` idle VMs up front
    pub fn preload(self: &Arc<Self>) -> Result<usize> {
        let target = self.config.preload_size.min(self.config.max_size);
        let mut created = 0;
        for _ in 0..target {
            let vm = self.create_vm()?;
            let mut state = self.state.lock();
            state.live += 1;
            state.idle.push_back(IdleVm {
                vm,
                idle_since: Instant::now(),
            });
            created += 1;
        }
        if created > 0 {
            tracing::info!(preloaded = created, "vm pool preloaded");
        }
        Ok(created)
    }

    fn create_vm(&self) -> Result<JsVm> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let vm = JsVm::new(id, self.limits)?;
        globals::install_static(&vm, &self.config, &self.env)?;
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        Ok(vm)
    }

    /// Acquire a VM for one run.
    ///
    /// The returned guard owns the VM exclusively; its resource tracker is
    /// armed and a watcher task runs until the guard drops.
    pub async fn acquire(self: &Arc<Self>) -> Result<VmGuard> {
        let deadline = tokio::time::Instant::now() + ACQUIRE_TIMEOUT;
        loop {
            // Fast path: an idle instance.
            if let Some(idle) = self.state.lock().idle.pop_front() {
                self.counters.recycled.fetch_add(1, Ordering::Relaxed);
                return Ok(self.guard(idle.vm));
            }

            // Create while under the cap; reserve the slot first.
            let reserved = {
                let mut state = self.state.lock();
                if state.live < self.config.max_size {
                    state.live += 1;
                    true
                } else {
                    false
                }
            };
            if reserved {
                match self.create_vm() {
                    Ok(vm) => return Ok(self.guard(vm)),
                    Err(e) => {
                        self.state.lock().live -= 1;
                        self.notify.notify_one();
                        return Err(e);
                    }
                }
            }

            // Saturated: wait for a release.
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(max_size = self.config.max_size, "vm pool exhausted");
                    return Err(Error::PoolExhausted);
                }
            }
        }
    }

    fn guard(self: &Arc<Self>, vm: JsVm) -> VmGuard {
        vm.begin_run();
        let watcher = spawn_watcher(vm.tracker().clone(), None);
        VmGuard {
            vm: Some(vm),
            pool: self.clone(),
            _watcher: watcher,
        }
    }

    fn release(&self, vm: JsVm) {
        vm.end_run();

        // A memory-tripped VM keeps its bloat; recycling it would tax the
        // next run's baseline.
        let memory_tripped = vm
            .tracker()
            .limit_message()
            .map(|m| m.contains("memory"))
            .unwrap_or(false)
            || vm.memory_used() > self.limits.memory_bytes;

        if let Err(e) = vm.clear_globals(RESERVED_NAMES) {
            tracing::warn!(vm = vm.id(), error = %e, "failed to clear vm globals, dropping");
            self.drop_vm();
            return;
        }
        if memory_tripped {
            tracing::debug!(vm = vm.id(), "dropping memory-heavy vm");
            self.drop_vm();
            return;
        }

        let mut state = self.state.lock();
        if state.idle.len() >= self.config.max_size {
            state.live -= 1;
            drop(state);
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        } else {
            state.idle.push_back(IdleVm {
                vm,
                idle_since: Instant::now(),
            });
            drop(state);
        }
        self.notify.notify_one();
    }

    fn drop_vm(&self) {
        self.state.lock().live -= 1;
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
    }

    /// Evict VMs idle past the configured horizon
    pub fn sweep_idle(&self) -> usize {
        let horizon = Duration::from_secs(self.config.idle_timeout * 60);
        let mut state = self.state.lock();
        let before = state.idle.len();
        state.idle.retain(|idle| idle.idle_since.elapsed() < horizon);
        let evicted = before - state.idle.len();
        state.live -= evicted;
        drop(state);
        if evicted > 0 {
            self.counters
                .dropped
                .fetch_add(evicted as u64, Ordering::Relaxed);
            self.notify.notify_waiters();
        }
        evicted
    }

    /// Spawn the idle sweep and, when enabled, the metrics log
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs(pool.config.cleanup_interval.max(1) * 60);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = pool.sweep_idle();
                if evicted > 0 {
                    tracing::debug!(evicted = evicted, "idle vms evicted");
                }
                if pool.config.enable_metrics {
                    let metrics = pool.metrics();
                    tracing::info!(
                        live = metrics.live,
                        idle = metrics.idle,
                        created = metrics.created,
                        recycled = metrics.recycled,
                        dropped = metrics.dropped,
                        exhausted = metrics.exhausted,
                        "vm pool stats"
                    );
                }
            }
        })
    }

    /// Drop every idle VM (shutdown path)
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        let evicted = state.idle.len();
        state.idle.clear();
        state.live -= evicted;
    }

    pub fn metrics(&self) -> PoolMetrics {
        let state = self.state.lock();
        PoolMetrics {
            live: state.live,
            idle: state.idle.len(),
            created: self.counters.created.load(Ordering::Relaxed),
            recycled: self.counters.recycled.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
        }
    }
}

/// Exclusive handle to a pooled VM; returns it on drop
pub struct VmGuard {
    vm: Option<JsVm>,
    pool: Arc<VmPool>,
    _watcher: Watcher,
}

impl VmGuard {
    /// Mark the VM as tripped so release drops it instead of pooling
    pub fn poison_memory(&self) {
        if let Some(vm) = &self.vm {
            vm.tracker().trip(LimitKind::Memory);
        }
    }
}

impl Deref for VmGuard {
    type Target = JsVm;

    fn deref(&self) -> &JsVm {
        self.vm.as_ref().expect("vm taken")
    }
}

impl Drop for VmGuard {
    fn drop(&mut self) {
        if let Some(vm) = self.vm.take() {
            self.pool.release(vm);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_config(max_size: usize) -> VmPoolConfig {
        VmPoolConfig {
            max_size,
            preload_size: 0,
            ..VmPoolConfig::default()
        }
    }

    #[tokio::test]
    async fn test_acquire_creates_then_recycles() {
        let pool = VmPool::new(pool_config(2), serde_json::json!({}));

        let first_id = {
            let guard = pool.acquire().await.unwrap();
            guard.id()
        };
        let guard = pool.acquire().await.unwrap();
        assert_eq!(guard.id(), first_id);

        let metrics = pool.metrics();
        assert_eq!(metrics.created, 1);
        assert_eq!(metrics.recycled, 1);
    }

    #[tokio::test]
    async fn test_release_clears_request_globals() {
        let pool = VmPool::new(pool_config(1), serde_json::json!({}));

        {
            let guard = pool.acquire().await.unwrap();
            guard.set_global_str("payload", "leftover").unwrap();
        }

        let guard = pool.acquire().await.unwrap();
        assert_eq!(
            guard.get_global_json("payload").unwrap(),
            serde_json::Value::Null
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_times_out() {
        let pool = VmPool::new(pool_config(1), serde_json::json!({}));
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        // Paused time auto-advances to the acquire deadline.
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::PoolExhausted)));
        drop(held);
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let pool = VmPool::new(pool_config(1), serde_json::json!({}));
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|g| g.id()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);

        let id = waiter.await.unwrap().unwrap();
        assert_eq!(id, 1);
    }

    #[tokio::test]
    async fn test_preload() {
        let pool = VmPool::new(
            VmPoolConfig {
                max_size: 4,
                preload_size: 2,
                ..VmPoolConfig::default()
            },
            serde_json::json!({}),
        );
        assert_eq!(pool.preload().unwrap(), 2);
        let metrics = pool.metrics();
        assert_eq!(metrics.idle, 2);
        assert_eq!(metrics.live, 2);
    }
}
