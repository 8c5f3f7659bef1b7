use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::observability;

/// Move every `ongoing` line whose span has ended to `finished`. Returns how many.
pub async fn sweep_once(engine: &Engine) -> usize {
    let now = engine.now_ms();
    let mut finished = 0;
    for (line_id, key) in engine.collect_elapsed(now) {
        match engine.elapse(line_id).await {
            Ok(()) => {
                finished += 1;
                debug!("swept line {line_id} of {key} to finished");
            }
            // Returned or moved on by someone else since collection.
            Err(e) => debug!("sweeper skip {line_id}: {e}"),
        }
    }
    if finished > 0 {
        metrics::counter!(observability::SWEPT_LINES_TOTAL).increment(finished as u64);
        info!("sweeper finished {finished} lines");
    }
    finished
}

/// Background task that periodically finishes elapsed rentals.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        sweep_once(&engine).await;
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
