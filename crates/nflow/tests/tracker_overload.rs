//! Tracker behaviour under a blocked writer: a burst beyond the channel
//! capacity must drop without losing accounting, and every entry ends up
//! either processed or counted dropped once the writer recovers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use nflow::config::TrackerConfig;
use nflow::tracker::{LogSink, LogTracker, TrackerEntry};
use nflow::types::Result;

/// Sink that refuses to complete writes until released
struct GatedSink {
    released: Notify,
    open: Mutex<bool>,
    written: Mutex<u64>,
}

impl GatedSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            released: Notify::new(),
            open: Mutex::new(false),
            written: Mutex::new(0),
        })
    }

    fn release(&self) {
        *self.open.lock() = true;
        self.released.notify_waiters();
    }
}

#[async_trait]
impl LogSink for GatedSink {
    async fn write_batch(&self, rows: &[TrackerEntry]) -> Result<()> {
        loop {
            // Register interest before checking the flag so a release between
            // the check and the await cannot be missed.
            let released = self.released.notified();
            if *self.open.lock() {
                *self.written.lock() += rows.len() as u64;
                return Ok(());
            }
            released.await;
        }
    }
}

fn entry(n: usize) -> TrackerEntry {
    TrackerEntry {
        log_id: format!("burst-{}", n),
        ..TrackerEntry::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn burst_against_blocked_writer_accounts_for_everything() {
    let sink = GatedSink::new();
    let tracker = LogTracker::new(
        &TrackerConfig {
            enabled: true,
            workers: 1,
            batch_size: 100,
            flush_interval: 10,
            channel_buffer: 10,
            stats_interval: 0,
            verbose_logging: false,
            log_path: String::new(),
        },
        sink.clone(),
    );

    // Tight burst while the writer is blocked.
    for n in 0..1000 {
        tracker.track(entry(n));
    }

    let after_burst = tracker.snapshot();
    assert!(after_burst.dropped > 0, "a burst of 1000 into a buffer of 10 must drop");

    // Unblock the writer and let everything settle.
    sink.release();
    let settled = async {
        loop {
            let snapshot = tracker.snapshot();
            if snapshot.processed + snapshot.dropped == 1000 {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    let snapshot = tokio::time::timeout(Duration::from_secs(5), settled)
        .await
        .expect("tracker did not settle");

    assert_eq!(snapshot.processed + snapshot.dropped, 1000);
    assert!(snapshot.dropped > 0);
    assert_eq!(snapshot.processed, *sink.written.lock());
    // A blocked-then-released writer is not a failure: no breaker activity.
    assert!(!snapshot.breaker_open);
    assert_eq!(snapshot.errors, 0);
}
