use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::engine::store::{ReservationStore, StoreError};

const COMPACT_INTERVAL: Duration = Duration::from_secs(60);

/// Compact when at least `threshold` events were appended since the last compaction.
/// Returns whether it compacted.
pub async fn compact_if_needed(store: &ReservationStore, threshold: u64) -> Result<bool, StoreError> {
    let appends = store.appends_since_compact().await;
    if appends < threshold {
        debug!("compaction skipped: {appends} appends < {threshold}");
        return Ok(false);
    }
    store.compact().await?;
    Ok(true)
}

/// Background task that keeps the WAL from growing without bound.
pub async fn run_compactor(store: Arc<ReservationStore>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&store, threshold).await {
            error!("WAL compaction failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Event, Reservation, Span};
    use crate::wal::Wal;
    use chrono::{TimeDelta, TimeZone, Utc};
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roombook_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn reservation(h: u32) -> Reservation {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap();
        Reservation {
            id: Ulid::new(),
            resource_id: "room-a".into(),
            owner_id: "alice".into(),
            title: "t".into(),
            description: None,
            span: Span::new(start, start + TimeDelta::hours(1)),
            created_at: start,
            updated_at: start,
        }
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let store = ReservationStore::open(&path).unwrap();
        let timeout = Duration::from_secs(1);

        let mut ids = Vec::new();
        for h in 8..12 {
            let mut txn = store.begin("room-a", timeout).await.unwrap();
            ids.push(txn.insert(reservation(h)).await.unwrap().id);
        }
        store.delete(ids[0], timeout).await.unwrap();
        store.delete(ids[1], timeout).await.unwrap();

        assert!(!compact_if_needed(&store, 10).await.unwrap());
        assert!(compact_if_needed(&store, 6).await.unwrap());
        assert_eq!(store.appends_since_compact().await, 0);

        let events = Wal::replay(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| matches!(e, Event::ReservationCreated { .. })));
    }
}
