//! Cache store with redis and in-process backends.
//!
//! Both backends speak the same hash-key protocol: JSON values in hash
//! fields, key-level TTLs, one sorted set for the leaderboard.

use crate::errors::FleetError;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

enum Backend {
    Redis(redis::Client),
    Memory(MemoryStore),
}

pub struct CacheStore {
    backend: Backend,
}

impl CacheStore {
    pub fn memory() -> Self {
        Self { backend: Backend::Memory(MemoryStore::new()) }
    }

    pub fn redis(url: &str) -> Result<Self, FleetError> {
        let client = redis::Client::open(url)
            .map_err(|e| FleetError::Config(format!("redis url {}: {}", url, e)))?;
        Ok(Self { backend: Backend::Redis(client) })
    }

    pub fn is_redis(&self) -> bool {
        matches!(self.backend, Backend::Redis(_))
    }

    pub async fn hash_set_json<T: Serialize>(
        &self,
        key: &str,
        field: &str,
        ttl: Duration,
        value: &T,
    ) -> Result<(), FleetError> {
        if field.trim().is_empty() {
            return Ok(());
        }
        let payload = serde_json::to_string(value)
            .map_err(|e| FleetError::Db(format!("cache encode {}: {}", key, e)))?;
        match &self.backend {
            Backend::Redis(client) => {
                let mut conn = connect(client).await?;
                conn.hset::<_, _, _, ()>(key, field, payload)
                    .await
                    .map_err(|e| FleetError::Db(format!("hset {}: {}", key, e)))?;
                conn.expire::<_, ()>(key, ttl.as_secs() as i64)
                    .await
                    .map_err(|e| FleetError::Db(format!("expire {}: {}", key, e)))?;
                Ok(())
            }
            Backend::Memory(store) => {
                store.hash_set(key, field, payload, ttl);
                Ok(())
            }
        }
    }

    pub async fn hash_get_json<T: DeserializeOwned>(
        &self,
        key: &str,
        field: &str,
    ) -> Result<Option<T>, FleetError> {
        if field.trim().is_empty() {
            return Ok(None);
        }
        let raw = match &self.backend {
            Backend::Redis(client) => {
                let mut conn = connect(client).await?;
                conn.hget::<_, _, Option<String>>(key, field)
                    .await
                    .map_err(|e| FleetError::Db(format!("hget {}: {}", key, e)))?
            }
            Backend::Memory(store) => store.hash_get(key, field),
        };
        match raw {
            Some(payload) if !payload.trim().is_empty() => {
                let value = serde_json::from_str(&payload)
                    .map_err(|e| FleetError::Db(format!("cache decode {}: {}", key, e)))?;
                Ok(Some(value))
            }
            _ => Ok(None),
        }
    }

    pub async fn hash_del_field(&self, key: &str, field: &str) -> Result<(), FleetError> {
        if field.trim().is_empty() {
            return Ok(());
        }
        match &self.backend {
            Backend::Redis(client) => {
                let mut conn = connect(client).await?;
                conn.hdel::<_, _, ()>(key, field)
                    .await
                    .map_err(|e| FleetError::Db(format!("hdel {}: {}", key, e)))?;
                Ok(())
            }
            Backend::Memory(store) => {
                store.hash_del(key, field);
                Ok(())
            }
        }
    }

    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        ttl: Duration,
        value: &T,
    ) -> Result<(), FleetError> {
        let payload = serde_json::to_string(value)
            .map_err(|e| FleetError::Db(format!("cache encode {}: {}", key, e)))?;
        match &self.backend {
            Backend::Redis(client) => {
                let mut conn = connect(client).await?;
                conn.set_ex::<_, _, ()>(key, payload, ttl.as_secs())
                    .await
                    .map_err(|e| FleetError::Db(format!("setex {}: {}", key, e)))?;
                Ok(())
            }
            Backend::Memory(store) => {
                store.set(key, payload, ttl);
                Ok(())
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, FleetError> {
        let raw = match &self.backend {
            Backend::Redis(client) => {
                let mut conn = connect(client).await?;
                conn.get::<_, Option<String>>(key)
                    .await
                    .map_err(|e| FleetError::Db(format!("get {}: {}", key, e)))?
            }
            Backend::Memory(store) => store.get(key),
        };
        match raw {
            Some(payload) if !payload.trim().is_empty() => {
                let value = serde_json::from_str(&payload)
                    .map_err(|e| FleetError::Db(format!("cache decode {}: {}", key, e)))?;
                Ok(Some(value))
            }
            _ => Ok(None),
        }
    }

    pub async fn zadd_score(
        &self,
        key: &str,
        member: &str,
        score: f64,
    ) -> Result<(), FleetError> {
        match &self.backend {
            Backend::Redis(client) => {
                let mut conn = connect(client).await?;
                conn.zadd::<_, _, _, ()>(key, member, score)
                    .await
                    .map_err(|e| FleetError::Db(format!("zadd {}: {}", key, e)))?;
                Ok(())
            }
            Backend::Memory(store) => {
                store.zadd(key, member, score);
                Ok(())
            }
        }
    }

    pub async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, FleetError> {
        match &self.backend {
            Backend::Redis(client) => {
                let mut conn = connect(client).await?;
                conn.zscore::<_, _, Option<f64>>(key, member)
                    .await
                    .map_err(|e| FleetError::Db(format!("zscore {}: {}", key, e)))
            }
            Backend::Memory(store) => Ok(store.zscore(key, member)),
        }
    }
}

async fn connect(client: &redis::Client) -> Result<redis::aio::MultiplexedConnection, FleetError> {
    client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| FleetError::Db(format!("redis connect: {}", e)))
}

/// In-process fallback with key-level TTLs, mirroring the redis layout.
pub struct MemoryStore {
    hashes: RwLock<HashMap<String, (HashMap<String, String>, Option<Instant>)>>,
    plain: RwLock<HashMap<String, (String, Instant)>>,
    zsets: RwLock<HashMap<String, HashMap<String, f64>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            hashes: RwLock::new(HashMap::new()),
            plain: RwLock::new(HashMap::new()),
            zsets: RwLock::new(HashMap::new()),
        }
    }

    fn hash_set(&self, key: &str, field: &str, payload: String, ttl: Duration) {
        let mut hashes = self.hashes.write().unwrap();
        let entry = hashes.entry(key.to_string()).or_insert_with(|| (HashMap::new(), None));
        entry.0.insert(field.to_string(), payload);
        entry.1 = Some(Instant::now() + ttl);
    }

    fn hash_get(&self, key: &str, field: &str) -> Option<String> {
        let mut hashes = self.hashes.write().unwrap();
        if let Some((fields, expiry)) = hashes.get(key) {
            if expiry.map(|at| at <= Instant::now()).unwrap_or(false) {
                hashes.remove(key);
                return None;
            }
            return fields.get(field).cloned();
        }
        None
    }

    fn hash_del(&self, key: &str, field: &str) {
        let mut hashes = self.hashes.write().unwrap();
        if let Some((fields, _)) = hashes.get_mut(key) {
            fields.remove(field);
            if fields.is_empty() {
                hashes.remove(key);
            }
        }
    }

    fn set(&self, key: &str, payload: String, ttl: Duration) {
        let mut plain = self.plain.write().unwrap();
        plain.insert(key.to_string(), (payload, Instant::now() + ttl));
    }

    fn get(&self, key: &str) -> Option<String> {
        let mut plain = self.plain.write().unwrap();
        match plain.get(key) {
            Some((payload, expiry)) if *expiry > Instant::now() => Some(payload.clone()),
            Some(_) => {
                plain.remove(key);
                None
            }
            None => None,
        }
    }

    fn zadd(&self, key: &str, member: &str, score: f64) {
        let mut zsets = self.zsets.write().unwrap();
        zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
    }

    fn zscore(&self, key: &str, member: &str) -> Option<f64> {
        let zsets = self.zsets.read().unwrap();
        zsets.get(key).and_then(|set| set.get(member)).copied()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_hash_round_trip() {
        let store = CacheStore::memory();
        let ttl = Duration::from_secs(60);
        store
            .hash_set_json("k", "t1", ttl, &json!({"symbol": "BTC"}))
            .await
            .unwrap();
        let got: Option<serde_json::Value> = store.hash_get_json("k", "t1").await.unwrap();
        assert_eq!(got.unwrap()["symbol"], "BTC");

        store.hash_del_field("k", "t1").await.unwrap();
        let got: Option<serde_json::Value> = store.hash_get_json("k", "t1").await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn memory_ttl_expires_whole_key() {
        let store = CacheStore::memory();
        store
            .hash_set_json("k", "t1", Duration::from_millis(10), &json!(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let got: Option<serde_json::Value> = store.hash_get_json("k", "t1").await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn memory_zset_scores() {
        let store = CacheStore::memory();
        store.zadd_score("lb", "t1", 4.2).await.unwrap();
        store.zadd_score("lb", "t1", 5.0).await.unwrap();
        assert_eq!(store.zscore("lb", "t1").await.unwrap(), Some(5.0));
        assert_eq!(store.zscore("lb", "t2").await.unwrap(), None);
    }
}
