//! Per-sensor window cache.
//!
//! Each sensor owns a bounded, timestamp-ordered buffer of recent readings.
//! The buffer is the write-through layer over the durable store: an append
//! lands in memory, then in the store, then invalidates the cached window
//! snapshot. Reads serve from the warm buffer (read-your-writes for the
//! appending sensor), then the byte cache, then the store -- the cached
//! snapshot trades a short staleness window for store load, which is fine
//! for soft-real-time anomaly decisions.
//!
//! Concurrency: one async mutex per sensor_id inside a sharded map. Two
//! readings for the same sensor apply in arrival order with no lost
//! updates; different sensors never contend.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cache::CacheStore;
use crate::storage::{self, Pool, Reading};

struct SensorBuffer {
    /// Timestamp-ascending, unique timestamps.
    readings: Vec<Reading>,
    /// Whether the store has been consulted for history older than what
    /// arrived in-process.
    hydrated: bool,
}

impl SensorBuffer {
    fn new() -> Self {
        Self {
            readings: Vec::new(),
            hydrated: false,
        }
    }

    /// Insert keeping timestamp order; an equal timestamp replaces the
    /// existing reading (last write wins).
    fn insert(&mut self, reading: Reading) {
        match self
            .readings
            .binary_search_by_key(&reading.timestamp, |r| r.timestamp)
        {
            Ok(pos) => self.readings[pos] = reading,
            Err(pos) => self.readings.insert(pos, reading),
        }
    }

    /// Drop readings older than `horizon` behind the newest buffered
    /// timestamp. Anchoring on the newest reading rather than the wall
    /// clock keeps replayed or backfilled series intact.
    fn trim(&mut self, horizon: chrono::Duration) {
        let Some(newest) = self.readings.last().map(|r| r.timestamp) else {
            return;
        };
        let cutoff = newest - horizon;
        self.readings.retain(|r| r.timestamp >= cutoff);
    }

    fn merge_history(&mut self, history: Vec<Reading>) {
        for reading in history {
            // In-process readings win over store history on equal timestamps.
            if self
                .readings
                .binary_search_by_key(&reading.timestamp, |r| r.timestamp)
                .is_err()
            {
                self.insert(reading);
            }
        }
    }
}

pub struct WindowCache {
    pool: Pool,
    cache: Arc<dyn CacheStore>,
    shards: DashMap<String, Arc<Mutex<SensorBuffer>>>,
    horizon: chrono::Duration,
    cache_ttl: Duration,
    store_timeout: Duration,
}

impl WindowCache {
    pub fn new(
        pool: Pool,
        cache: Arc<dyn CacheStore>,
        horizon_hours: i64,
        cache_ttl: Duration,
        store_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            cache,
            shards: DashMap::new(),
            horizon: chrono::Duration::hours(horizon_hours),
            cache_ttl,
            store_timeout,
        }
    }

    fn shard(&self, sensor_id: &str) -> Arc<Mutex<SensorBuffer>> {
        self.shards
            .entry(sensor_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SensorBuffer::new())))
            .clone()
    }

    fn cache_key(&self, sensor_id: &str) -> String {
        format!("window:{}:{}h", sensor_id, self.horizon.num_hours())
    }

    /// Append a reading: buffer, store, cache invalidation, in that order.
    ///
    /// Returns the store-assigned row id, or None when the store was
    /// unreachable within the timeout -- the reading is still accepted into
    /// the in-memory window (best-effort), it just is not durable yet.
    pub async fn append(&self, reading: Reading) -> Result<Option<i64>> {
        let shard = self.shard(&reading.sensor_id);
        let mut buffer = shard.lock().await;

        if !buffer.hydrated {
            // First contact with this sensor since startup: pull whatever
            // history the store has before the new reading goes in.
            match self.load_from_store(&reading.sensor_id).await {
                Ok(history) => buffer.merge_history(history),
                Err(e) => {
                    warn!(
                        sensor_id = %reading.sensor_id,
                        error = %e,
                        "store hydration failed; window starts from this reading"
                    );
                }
            }
            buffer.hydrated = true;
        }

        buffer.insert(reading.clone());
        buffer.trim(self.horizon);

        let id = {
            let pool = self.pool.clone();
            let to_save = reading.clone();
            let save = tokio::task::spawn_blocking(move || storage::save_reading(&pool, &to_save));
            match tokio::time::timeout(self.store_timeout, save).await {
                Ok(Ok(Ok(id))) => Some(id),
                Ok(Ok(Err(e))) => {
                    warn!(
                        sensor_id = %reading.sensor_id,
                        timestamp = %reading.timestamp,
                        error = %e,
                        "write-through to store failed; reading held in memory only"
                    );
                    None
                }
                Ok(Err(join_err)) => {
                    warn!(error = %join_err, "store write task failed");
                    None
                }
                Err(_) => {
                    warn!(
                        sensor_id = %reading.sensor_id,
                        timestamp = %reading.timestamp,
                        "write-through to store timed out; reading held in memory only"
                    );
                    None
                }
            }
        };

        self.cache.delete(&self.cache_key(&reading.sensor_id)).await;
        Ok(id)
    }

    /// The trailing window for one sensor, oldest first, possibly empty.
    pub async fn get_window(&self, sensor_id: &str) -> Vec<Reading> {
        let shard = self.shard(sensor_id);
        let mut buffer = shard.lock().await;

        if buffer.hydrated {
            return buffer.readings.clone();
        }

        // Cold path: cached snapshot, then the store.
        let key = self.cache_key(sensor_id);
        if let Some(bytes) = self.cache.get(&key).await {
            if let Ok(readings) = serde_json::from_slice::<Vec<Reading>>(&bytes) {
                debug!(%sensor_id, count = readings.len(), "window served from cache");
                buffer.merge_history(readings);
                buffer.hydrated = true;
                return buffer.readings.clone();
            }
            // Unreadable snapshot: drop it and fall through to the store.
            self.cache.delete(&key).await;
        }

        match self.load_from_store(sensor_id).await {
            Ok(readings) => {
                if let Ok(bytes) = serde_json::to_vec(&readings) {
                    self.cache.set(&key, bytes, self.cache_ttl).await;
                }
                buffer.merge_history(readings);
                buffer.hydrated = true;
                buffer.readings.clone()
            }
            Err(e) => {
                warn!(%sensor_id, error = %e, "store fallback failed; serving empty window");
                Vec::new()
            }
        }
    }

    async fn load_from_store(&self, sensor_id: &str) -> Result<Vec<Reading>> {
        let pool = self.pool.clone();
        let sensor = sensor_id.to_string();
        let since = Utc::now() - self.horizon;
        let load =
            tokio::task::spawn_blocking(move || storage::load_window(&pool, &sensor, since));
        match tokio::time::timeout(self.store_timeout, load).await {
            Ok(join) => join?,
            Err(_) => anyhow::bail!("store load timed out after {:?}", self.store_timeout),
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::storage::open_memory_pool;

    fn reading(sensor: &str, minutes_ago: i64, value: f64) -> Reading {
        Reading {
            sensor_id: sensor.to_string(),
            sensor_type: "temperature".to_string(),
            timestamp: Utc::now() - chrono::Duration::minutes(minutes_ago),
            value,
            unit: "C".to_string(),
            location: None,
        }
    }

    fn window_cache() -> WindowCache {
        WindowCache::new(
            open_memory_pool().unwrap(),
            Arc::new(MemoryCache::new()),
            24,
            Duration::from_secs(300),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_append_then_read_your_writes() {
        let cache = window_cache();
        let id = cache.append(reading("s1", 10, 20.0)).await.unwrap();
        assert!(id.is_some());

        let window = cache.get_window("s1").await;
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].value, 20.0);
    }

    #[tokio::test]
    async fn test_appends_stay_time_ordered() {
        let cache = window_cache();
        cache.append(reading("s1", 5, 3.0)).await.unwrap();
        cache.append(reading("s1", 30, 1.0)).await.unwrap();
        cache.append(reading("s1", 15, 2.0)).await.unwrap();

        let window = cache.get_window("s1").await;
        let values: Vec<f64> = window.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_duplicate_timestamp_is_idempotent() {
        let cache = window_cache();
        let mut first = reading("s1", 10, 20.0);
        cache.append(first.clone()).await.unwrap();
        first.value = 22.0;
        cache.append(first.clone()).await.unwrap();

        let window = cache.get_window("s1").await;
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].value, 22.0); // last write wins

        // And identical payload twice changes nothing.
        cache.append(first).await.unwrap();
        assert_eq!(cache.get_window("s1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_sensors_are_isolated() {
        let cache = window_cache();
        cache.append(reading("s1", 10, 1.0)).await.unwrap();
        cache.append(reading("s2", 10, 2.0)).await.unwrap();

        assert_eq!(cache.get_window("s1").await.len(), 1);
        assert_eq!(cache.get_window("s2").await.len(), 1);
        assert_eq!(cache.get_window("s3").await.len(), 0);
    }

    #[tokio::test]
    async fn test_horizon_trims_old_readings() {
        let cache = window_cache();
        cache.append(reading("s1", 60 * 30, 1.0)).await.unwrap(); // 30h old
        cache.append(reading("s1", 10, 2.0)).await.unwrap();

        let window = cache.get_window("s1").await;
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].value, 2.0);
    }

    #[tokio::test]
    async fn test_cold_start_hydrates_from_store() {
        let pool = open_memory_pool().unwrap();
        for m in [30, 20, 10] {
            storage::save_reading(&pool, &reading("s1", m, m as f64)).unwrap();
        }

        let cache = WindowCache::new(
            pool,
            Arc::new(MemoryCache::new()),
            24,
            Duration::from_secs(300),
            Duration::from_secs(5),
        );

        let window = cache.get_window("s1").await;
        assert_eq!(window.len(), 3);
        assert!(window.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    async fn test_append_on_cold_sensor_merges_store_history() {
        let pool = open_memory_pool().unwrap();
        storage::save_reading(&pool, &reading("s1", 30, 1.0)).unwrap();

        let cache = WindowCache::new(
            pool,
            Arc::new(MemoryCache::new()),
            24,
            Duration::from_secs(300),
            Duration::from_secs(5),
        );
        cache.append(reading("s1", 5, 2.0)).await.unwrap();

        let window = cache.get_window("s1").await;
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].value, 1.0);
        assert_eq!(window[1].value, 2.0);
    }

    #[tokio::test]
    async fn test_concurrent_appends_same_sensor_lose_nothing() {
        let cache = Arc::new(window_cache());
        let mut handles = Vec::new();
        for i in 0..20 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.append(reading("s1", 100 - i, i as f64)).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let window = cache.get_window("s1").await;
        assert_eq!(window.len(), 20);
    }
}
