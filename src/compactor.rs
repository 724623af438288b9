use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::engine::Engine;

/// How often the WAL append count is checked.
const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that compacts the WAL once it has grown past `threshold`
/// appends since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

/// One compaction check. Returns true if the WAL was rewritten.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            error!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::NaiveDate;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("chairbook_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn clock() -> Arc<FixedClock> {
        Arc::new(FixedClock(NaiveDate::from_ymd_opt(2030, 1, 1).unwrap()))
    }

    #[tokio::test]
    async fn below_threshold_is_left_alone() {
        let engine = Engine::new(test_wal_path("below.wal"), clock()).unwrap();
        engine.register_user(Ulid::new(), "1".into()).await.unwrap();
        assert!(!compact_if_needed(&engine, 10).await);
        assert_eq!(engine.wal_appends_since_compact().await, 1);
    }

    #[tokio::test]
    async fn threshold_triggers_compaction() {
        let path = test_wal_path("trigger.wal");
        let engine = Engine::new(path.clone(), clock()).unwrap();
        let user = Ulid::new();
        // Re-registering rewrites the same user, so compaction drops the older records.
        for i in 0..5 {
            engine.register_user(user, format!("+1555000{i}")).await.unwrap();
        }
        assert!(compact_if_needed(&engine, 5).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        let events = crate::wal::Wal::replay(&path).unwrap();
        assert_eq!(events.len(), 1);
    }
}
