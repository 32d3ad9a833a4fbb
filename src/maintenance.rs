use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::engine::{Engine, EngineError};

/// Compact the WAL once `threshold` appends have piled up since the last compaction.
/// Returns whether it compacted.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    debug!("{appends} appends since last compaction, compacting");
    engine.compact_wal().await?;
    Ok(true)
}

/// Background task that keeps the WAL short.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&engine, threshold).await {
            warn!("WAL compaction failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Service;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_maintenance");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn service(title: &str) -> Service {
        Service {
            id: Ulid::new(),
            title: title.into(),
            description: None,
            price: 1000,
            duration_minutes: 30,
            is_active: true,
            category_id: None,
        }
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(path.clone()).unwrap();

        let svc = engine.create_service(service("Manicure")).await.unwrap();
        assert!(!compact_if_needed(&engine, 3).await.unwrap());

        for price in [1100, 1200, 1300] {
            let mut s = svc.clone();
            s.price = price;
            engine.update_service(s).await.unwrap();
        }
        assert!(compact_if_needed(&engine, 3).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        drop(engine);
        let engine = Engine::new(path).unwrap();
        assert_eq!(engine.get_service(&svc.id).unwrap().price, 1300);
    }
}
