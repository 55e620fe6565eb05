use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// In-memory idempotency cache used to replay client-visible mutation
/// responses. Entries expire by TTL on access; the single mutex is fine at
/// this cardinality (one entry per in-flight mutation key).
pub struct IdempotencyStore {
    ttl: Duration,
    cache: Mutex<HashMap<String, (Instant, serde_json::Value)>>,
}

impl IdempotencyStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let now = Instant::now();
        let mut cache = self.cache.lock().await;
        Self::prune(&mut cache, now, self.ttl);
        cache.get(key).map(|(_, payload)| payload.clone())
    }

    pub async fn set(&self, key: &str, payload: serde_json::Value) {
        let now = Instant::now();
        let mut cache = self.cache.lock().await;
        Self::prune(&mut cache, now, self.ttl);
        cache.insert(key.to_owned(), (now, payload));
    }

    fn prune(
        cache: &mut HashMap<String, (Instant, serde_json::Value)>,
        now: Instant,
        ttl: Duration,
    ) {
        cache.retain(|_, (stored_at, _)| now.duration_since(*stored_at) <= ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn stores_and_replays_within_ttl() {
        let store = IdempotencyStore::new(Duration::from_secs(600));
        assert!(store.get("k1").await.is_none());

        store.set("k1", json!({"document_id": "d1"})).await;
        let replayed = store.get("k1").await.expect("replay");
        assert_eq!(replayed["document_id"], "d1");
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let store = IdempotencyStore::new(Duration::from_millis(10));
        store.set("k1", json!({"document_id": "d1"})).await;
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(store.get("k1").await.is_none());
    }
}
