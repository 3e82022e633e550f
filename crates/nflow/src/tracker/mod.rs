//! Log Tracker
//!
//! Best-effort, high-throughput persistence of per-step execution records.
//! One bounded channel feeds N batch workers; each worker owns a local batch
//! it flushes on size or on a periodic tick, handing the full batch to a
//! background task that writes with retries. A circuit breaker stops enqueues
//! after a run of consecutive failures and closes again after a cool-down.
//! Entries are never silently lost: each one ends up processed or counted as
//! dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::config::TrackerConfig;
use crate::types::Result;

/// Retries after the initial write attempt
pub const MAX_RETRIES: u32 = 3;
/// Base delay of the exponential backoff (100ms · 2^i)
pub const RETRY_BASE: Duration = Duration::from_millis(100);
/// Consecutive failures that trip the breaker
pub const MAX_CONSECUTIVE_ERRORS: u64 = 50;
/// Breaker watcher tick
pub const BREAKER_TICK: Duration = Duration::from_secs(5);
/// Cool-down before the breaker closes again
pub const BREAKER_RESET: Duration = Duration::from_secs(30);
/// Drain grace on shutdown
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// One per-step execution record
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct TrackerEntry {
    pub log_id: String,
    pub box_id: String,
    pub box_name: String,
    pub box_type: String,
    pub username: String,
    pub ip: String,
    pub real_ip: String,
    pub url: String,
    pub user_agent: String,
    pub query_string: String,
    pub hostname: String,
    pub host: String,
    pub next_connection: String,
    pub duration_ms: u64,
    pub order_box: i64,
    pub json_payload: String,
}

impl TrackerEntry {
    /// Positional row in the persisted column order
    pub fn to_row(&self) -> serde_json::Value {
        serde_json::json!([
            self.log_id,
            self.box_id,
            self.box_name,
            self.box_type,
            self.url,
            self.username,
            self.next_connection,
            self.duration_ms,
            self.order_box,
            self.json_payload,
            self.ip,
            self.real_ip,
            self.user_agent,
            self.query_string,
            self.hostname,
            self.host,
        ])
    }
}

/// Destination of tracker batches (SQL writers live outside the core)
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write_batch(&self, rows: &[TrackerEntry]) -> Result<()>;
}

/// Discards every batch
pub struct NullSink;

#[async_trait]
impl LogSink for NullSink {
    async fn write_batch(&self, _rows: &[TrackerEntry]) -> Result<()> {
        Ok(())
    }
}

/// Appends one JSON array per entry to a file
pub struct JsonlSink {
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl JsonlSink {
    pub async fn open(path: &std::path::Path) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            file: tokio::sync::Mutex::new(file),
        })
    }
}

#[async_trait]
impl LogSink for JsonlSink {
    async fn write_batch(&self, rows: &[TrackerEntry]) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let mut out = String::new();
        for row in rows {
            out.push_str(&row.to_row().to_string());
            out.push('\n');
        }
        let mut file = self.file.lock().await;
        file.write_all(out.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stats & Circuit Breaker
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct TrackerStats {
    processed: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time tracker numbers
#[derive(Debug, Clone, serde::Serialize)]
pub struct TrackerSnapshot {
    pub processed: u64,
    pub dropped: u64,
    pub errors: u64,
    pub consecutive_errors: u64,
    pub breaker_open: bool,
}

/// Trips open after a run of consecutive flush failures, closes again after
/// the cool-down; open means enqueues drop.
pub struct CircuitBreaker {
    consecutive_errors: AtomicU64,
    open: AtomicBool,
    opened_at: Mutex<Option<Instant>>,
    threshold: u64,
    reset_after: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u64, reset_after: Duration) -> Self {
        Self {
            consecutive_errors: AtomicU64::new(0),
            open: AtomicBool::new(false),
            opened_at: Mutex::new(None),
            threshold,
            reset_after,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn consecutive_errors(&self) -> u64 {
        self.consecutive_errors.load(Ordering::SeqCst)
    }

    fn record_success(&self) {
        self.consecutive_errors.store(0, Ordering::SeqCst);
    }

    fn record_failure(&self) {
        self.consecutive_errors.fetch_add(1, Ordering::SeqCst);
    }

    /// One watcher tick: trip on threshold, reset after the cool-down
    pub fn tick(&self) {
        if self.is_open() {
            let elapsed = self.opened_at.lock().map(|t| t.elapsed());
            if matches!(elapsed, Some(e) if e >= self.reset_after) {
                self.open.store(false, Ordering::SeqCst);
                self.consecutive_errors.store(0, Ordering::SeqCst);
                *self.opened_at.lock() = None;
                tracing::info!("tracker circuit breaker closed");
            }
        } else if self.consecutive_errors() >= self.threshold {
            self.open.store(true, Ordering::SeqCst);
            *self.opened_at.lock() = Some(Instant::now());
            tracing::warn!(
                consecutive_errors = self.consecutive_errors(),
                "tracker circuit breaker open"
            );
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tracker
// ─────────────────────────────────────────────────────────────────────────────

/// Async batched writer of [`TrackerEntry`] records
pub struct LogTracker {
    enabled: bool,
    tx: mpsc::Sender<TrackerEntry>,
    stats: Arc<TrackerStats>,
    breaker: Arc<CircuitBreaker>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl LogTracker {
    /// Build the tracker and spawn its workers and the breaker watcher
    pub fn new(config: &TrackerConfig, sink: Arc<dyn LogSink>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.channel_buffer.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let stats = Arc::new(TrackerStats::default());
        let breaker = Arc::new(CircuitBreaker::new(MAX_CONSECUTIVE_ERRORS, BREAKER_RESET));

        let shared_rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut workers = Vec::new();
        for worker_id in 0..config.workers.max(1) {
            workers.push(tokio::spawn(run_worker(
                worker_id,
                shared_rx.clone(),
                sink.clone(),
                stats.clone(),
                breaker.clone(),
                config.batch_size.max(1),
                Duration::from_millis(config.flush_interval.max(1)),
                shutdown_rx.clone(),
                config.verbose_logging,
            )));
        }

        // Breaker watcher.
        {
            let breaker = breaker.clone();
            let mut shutdown = shutdown_rx.clone();
            workers.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(BREAKER_TICK);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => breaker.tick(),
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        // Periodic stats.
        if config.stats_interval > 0 {
            let stats = stats.clone();
            let breaker = breaker.clone();
            let mut shutdown = shutdown_rx;
            let period = Duration::from_secs(config.stats_interval);
            workers.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            tracing::info!(
                                processed = stats.processed.load(Ordering::Relaxed),
                                dropped = stats.dropped.load(Ordering::Relaxed),
                                errors = stats.errors.load(Ordering::Relaxed),
                                breaker_open = breaker.is_open(),
                                "tracker stats"
                            );
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        Arc::new(Self {
            enabled: config.enabled,
            tx,
            stats,
            breaker,
            shutdown_tx,
            workers: Mutex::new(workers),
        })
    }

    /// Non-blocking enqueue. Disabled tracker, open breaker or a full channel
    /// count the entry as dropped; the caller proceeds either way.
    pub fn track(&self, entry: TrackerEntry) -> bool {
        if !self.enabled || self.breaker.is_open() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        match self.tx.try_send(entry) {
            Ok(()) => true,
            Err(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            processed: self.stats.processed.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
            consecutive_errors: self.breaker.consecutive_errors(),
            breaker_open: self.breaker.is_open(),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Signal workers to flush once and exit, wait out the grace period,
    /// then report final numbers.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            tracing::warn!("tracker workers did not drain within grace period");
        }
        let snapshot = self.snapshot();
        tracing::info!(
            processed = snapshot.processed,
            dropped = snapshot.dropped,
            errors = snapshot.errors,
            "tracker shutdown"
        );
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<TrackerEntry>>>,
    sink: Arc<dyn LogSink>,
    stats: Arc<TrackerStats>,
    breaker: Arc<CircuitBreaker>,
    batch_size: usize,
    flush_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    verbose: bool,
) {
    let mut batch: Vec<TrackerEntry> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            entry = async { rx.lock().await.recv().await } => {
                match entry {
                    Some(entry) => {
                        if breaker.is_open() {
                            stats.dropped.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                        batch.push(entry);
                        if batch.len() >= batch_size {
                            flush(&mut batch, &sink, &stats, &breaker, verbose);
                        }
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flush(&mut batch, &sink, &stats, &breaker, verbose);
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    // Drain the local buffer once and exit.
    if !batch.is_empty() {
        persist(
            std::mem::take(&mut batch),
            sink.clone(),
            stats.clone(),
            breaker.clone(),
            verbose,
        )
        .await;
    }
    tracing::debug!(worker = worker_id, "tracker worker stopped");
}

/// Move the batch out and persist it in the background
fn flush(
    batch: &mut Vec<TrackerEntry>,
    sink: &Arc<dyn LogSink>,
    stats: &Arc<TrackerStats>,
    breaker: &Arc<CircuitBreaker>,
    verbose: bool,
) {
    let taken = std::mem::replace(batch, Vec::with_capacity(batch.capacity()));
    tokio::spawn(persist(
        taken,
        sink.clone(),
        stats.clone(),
        breaker.clone(),
        verbose,
    ));
}

async fn persist(
    batch: Vec<TrackerEntry>,
    sink: Arc<dyn LogSink>,
    stats: Arc<TrackerStats>,
    breaker: Arc<CircuitBreaker>,
    verbose: bool,
) {
    let count = batch.len() as u64;
    let mut attempt: u32 = 0;
    loop {
        match sink.write_batch(&batch).await {
            Ok(()) => {
                stats.processed.fetch_add(count, Ordering::Relaxed);
                breaker.record_success();
                if verbose {
                    tracing::debug!(rows = count, "tracker batch written");
                }
                return;
            }
            Err(e) if attempt < MAX_RETRIES => {
                let delay = RETRY_BASE * 2u32.pow(attempt);
                attempt += 1;
                tracing::debug!(error = %e, attempt = attempt, "tracker write retry");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                stats.errors.fetch_add(1, Ordering::Relaxed);
                stats.dropped.fetch_add(count, Ordering::Relaxed);
                breaker.record_failure();
                tracing::warn!(error = %e, rows = count, "tracker batch dropped");
                return;
            }
        }
    }
}

/// Convenience constructor wiring the configured sink
pub async fn build_tracker(config: &TrackerConfig) -> Result<Arc<LogTracker>> {
    let sink: Arc<dyn LogSink> = if config.log_path.is_empty() {
        Arc::new(NullSink)
    } else {
        Arc::new(JsonlSink::open(std::path::Path::new(&config.log_path)).await?)
    };
    Ok(LogTracker::new(config, sink))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Error;

    struct MemorySink {
        rows: Mutex<Vec<TrackerEntry>>,
    }

    impl MemorySink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                rows: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LogSink for MemorySink {
        async fn write_batch(&self, rows: &[TrackerEntry]) -> Result<()> {
            self.rows.lock().extend_from_slice(rows);
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl LogSink for FailingSink {
        async fn write_batch(&self, _rows: &[TrackerEntry]) -> Result<()> {
            Err(Error::Transient("sink down".into()))
        }
    }

    fn entry(n: usize) -> TrackerEntry {
        TrackerEntry {
            log_id: format!("log-{}", n),
            box_id: n.to_string(),
            ..TrackerEntry::default()
        }
    }

    fn config(buffer: usize, workers: usize) -> TrackerConfig {
        TrackerConfig {
            enabled: true,
            workers,
            batch_size: 10,
            flush_interval: 20,
            channel_buffer: buffer,
            stats_interval: 0,
            verbose_logging: false,
            log_path: String::new(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_entries_processed() {
        let sink = MemorySink::new();
        let tracker = LogTracker::new(&config(100, 2), sink.clone());

        for n in 0..25 {
            assert!(tracker.track(entry(n)));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.processed, 25);
        assert_eq!(snapshot.dropped, 0);
        assert_eq!(sink.rows.lock().len(), 25);
    }

    #[tokio::test]
    async fn test_disabled_counts_dropped() {
        let mut cfg = config(100, 1);
        cfg.enabled = false;
        let tracker = LogTracker::new(&cfg, MemorySink::new());

        assert!(!tracker.track(entry(0)));
        assert_eq!(tracker.snapshot().dropped, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_liveness_under_overload() {
        let sink = MemorySink::new();
        let tracker = LogTracker::new(&config(10, 1), sink);

        for n in 0..1000 {
            tracker.track(entry(n));
        }
        tokio::time::sleep(Duration::from_millis(400)).await;

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.processed + snapshot.dropped, 1000);
        assert!(snapshot.dropped > 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failures_feed_breaker() {
        let tracker = LogTracker::new(
            &TrackerConfig {
                batch_size: 1,
                flush_interval: 5,
                ..config(100, 1)
            },
            Arc::new(FailingSink),
        );

        tracker.track(entry(0));
        // Initial attempt + 3 retries at 100/200/400ms.
        tokio::time::sleep(Duration::from_millis(900)).await;

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.dropped, 1);
        assert_eq!(snapshot.consecutive_errors, 1);
    }

    #[tokio::test]
    async fn test_breaker_hysteresis() {
        let breaker = CircuitBreaker::new(3, Duration::from_millis(50));
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert!(!breaker.is_open());
        breaker.tick();
        assert!(breaker.is_open());

        // Before the cool-down nothing changes.
        breaker.tick();
        assert!(breaker.is_open());

        std::thread::sleep(Duration::from_millis(60));
        breaker.tick();
        assert!(!breaker.is_open());
        assert_eq!(breaker.consecutive_errors(), 0);
    }

    #[tokio::test]
    async fn test_open_breaker_drops_enqueues() {
        let tracker = LogTracker::new(&config(100, 1), MemorySink::new());
        for _ in 0..MAX_CONSECUTIVE_ERRORS {
            tracker.breaker().record_failure();
        }
        tracker.breaker().tick();
        assert!(tracker.breaker().is_open());

        assert!(!tracker.track(entry(0)));
        assert_eq!(tracker.snapshot().dropped, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_drains_local_batch() {
        let sink = MemorySink::new();
        let tracker = LogTracker::new(
            &TrackerConfig {
                batch_size: 1000,
                flush_interval: 60_000,
                ..config(100, 1)
            },
            sink.clone(),
        );

        for n in 0..5 {
            tracker.track(entry(n));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        tracker.shutdown().await;

        assert_eq!(sink.rows.lock().len(), 5);
    }

    #[tokio::test]
    async fn test_jsonl_sink_row_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let sink = JsonlSink::open(&path).await.unwrap();

        let mut e = entry(1);
        e.url = "/users/42".into();
        e.duration_ms = 12;
        e.order_box = 3;
        sink.write_batch(&[e]).await.unwrap();

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let row: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(row[0], "log-1");
        assert_eq!(row[4], "/users/42");
        assert_eq!(row[7], 12);
        assert_eq!(row[8], 3);
    }
}
