use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::Engine;

/// Compact the engine's WAL once it has grown past `threshold` appends.
/// Returns whether a compaction ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Background task that periodically checks whether the WAL needs compacting.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}
