//! State store: the sole source of truth for tunnel and token records.
//!
//! The production backend is redis (get/set with TTL, HSETNX for
//! set-if-absent, a small Lua script for field compare-and-set, HINCRBY for
//! counters, SCAN for prefix listing). `MemStateStore` implements the same
//! contract in memory for tests and local single-process runs, the same way
//! the local filesystem stands in for object storage elsewhere.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::AsyncCommands;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),
    #[error("state store protocol error: {0}")]
    Other(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
            StoreError::Unavailable(e.to_string())
        } else {
            StoreError::Other(e.to_string())
        }
    }
}

/// Outcome of a field compare-and-set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    Swapped,
    Mismatch { current: String },
    Missing,
}

#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    async fn ping(&self) -> Result<(), StoreError>;
    /// Human-readable memory usage of the backend, if it reports one.
    async fn memory_usage(&self) -> Result<Option<String>, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;
    /// Atomic SET NX; returns true when this call created the key.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Empty map when the key does not exist.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;
    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError>;
    /// Atomic HSETNX; returns true when this call created the field.
    async fn hash_set_if_absent(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<bool, StoreError>;
    /// Atomic compare-and-set of a single hash field.
    async fn hash_compare_and_set(
        &self,
        key: &str,
        field: &str,
        expected: &str,
        new: &str,
    ) -> Result<CasOutcome, StoreError>;
    async fn hash_incr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;
    /// All keys starting with `prefix`. Only used on the small recovery and
    /// sweep paths, never per-request.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// LPUSH + LTRIM: prepend and keep the newest `keep` entries.
    async fn list_push_trimmed(
        &self,
        key: &str,
        value: &str,
        keep: usize,
    ) -> Result<(), StoreError>;
    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;
    async fn set_len(&self, key: &str) -> Result<u64, StoreError>;
}

/// Build a store from the configured URL. `memory://` selects the in-process
/// backend, anything else is handed to the redis client.
pub async fn from_url(url: &str) -> Result<Arc<dyn StateStore>, StoreError> {
    if url.starts_with("memory://") {
        Ok(Arc::new(MemStateStore::default()))
    } else {
        Ok(Arc::new(RedisStateStore::connect(url).await?))
    }
}

static HCAS_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    // 1 = swapped, 0 = mismatch (current value follows), -1 = key/field missing
    redis::Script::new(
        r"
        local cur = redis.call('HGET', KEYS[1], ARGV[1])
        if not cur then return {-1, ''} end
        if cur ~= ARGV[2] then return {0, cur} end
        redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
        return {1, ''}
        ",
    )
});

pub struct RedisStateStore {
    manager: redis::aio::ConnectionManager,
}

impl RedisStateStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(StoreError::from)?;
        let manager = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(StoreError::from)?;
        Ok(Self { manager })
    }

    fn conn(&self) -> redis::aio::ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await?;
        Ok(())
    }

    async fn memory_usage(&self) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn();
        let info: String = redis::cmd("INFO")
            .arg("memory")
            .query_async(&mut conn)
            .await?;
        Ok(info
            .lines()
            .find_map(|line| line.strip_prefix("used_memory_human:"))
            .map(|v| v.trim().to_string()))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.conn().get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn();
        match ttl {
            Some(ttl) => {
                conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                    .await?
            }
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.conn().del::<_, ()>(key).await?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self.conn().hgetall(key).await?)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self.conn().hget(key, field).await?)
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        self.conn().hset_multiple::<_, _, _, ()>(key, fields).await?;
        Ok(())
    }

    async fn hash_set_if_absent(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<bool, StoreError> {
        Ok(self.conn().hset_nx(key, field, value).await?)
    }

    async fn hash_compare_and_set(
        &self,
        key: &str,
        field: &str,
        expected: &str,
        new: &str,
    ) -> Result<CasOutcome, StoreError> {
        let mut conn = self.conn();
        let (code, current): (i64, String) = HCAS_SCRIPT
            .key(key)
            .arg(field)
            .arg(expected)
            .arg(new)
            .invoke_async(&mut conn)
            .await?;
        Ok(match code {
            1 => CasOutcome::Swapped,
            0 => CasOutcome::Mismatch { current },
            _ => CasOutcome::Missing,
        })
    }

    async fn hash_incr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        Ok(self.conn().hincr(key, field, delta).await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.conn()
            .expire::<_, ()>(key, ttl.as_secs().max(1) as i64)
            .await?;
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn();
        let mut keys = Vec::new();
        let mut iter: redis::AsyncIter<String> =
            conn.scan_match(format!("{prefix}*")).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn list_push_trimmed(
        &self,
        key: &str,
        value: &str,
        keep: usize,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        redis::pipe()
            .lpush(key, value)
            .ltrim(key, 0, keep.saturating_sub(1) as isize)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn();
        Ok(conn
            .lrange(key, 0, limit.saturating_sub(1) as isize)
            .await?)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.conn().sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn set_len(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self.conn().scard(key).await?)
    }
}

#[derive(Default)]
struct MemInner {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, HashSet<String>>,
    expirations: HashMap<String, Instant>,
}

impl MemInner {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .expirations
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.expirations.remove(&key);
            self.strings.remove(&key);
            self.hashes.remove(&key);
            self.lists.remove(&key);
            self.sets.remove(&key);
        }
    }

    fn remove_key(&mut self, key: &str) {
        self.strings.remove(key);
        self.hashes.remove(key);
        self.lists.remove(key);
        self.sets.remove(key);
        self.expirations.remove(key);
    }
}

/// In-memory implementation of the store contract. Single process only;
/// atomicity comes from the mutex.
#[derive(Default)]
pub struct MemStateStore {
    inner: Mutex<MemInner>,
}

impl MemStateStore {
    fn lock(&self) -> std::sync::MutexGuard<'_, MemInner> {
        let mut guard = self.inner.lock().expect("mem store poisoned");
        guard.purge_expired();
        guard
    }
}

#[async_trait]
impl StateStore for MemStateStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn memory_usage(&self) -> Result<Option<String>, StoreError> {
        Ok(None)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.strings.insert(key.to_owned(), value.to_owned());
        match ttl {
            Some(ttl) => {
                inner.expirations.insert(key.to_owned(), Instant::now() + ttl);
            }
            None => {
                inner.expirations.remove(key);
            }
        }
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        if inner.strings.contains_key(key) {
            return Ok(false);
        }
        inner.strings.insert(key.to_owned(), value.to_owned());
        if let Some(ttl) = ttl {
            inner.expirations.insert(key.to_owned(), Instant::now() + ttl);
        }
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock().remove_key(key);
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .lock()
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .cloned())
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let hash = inner.hashes.entry(key.to_owned()).or_default();
        for (field, value) in fields {
            hash.insert((*field).to_owned(), value.clone());
        }
        Ok(())
    }

    async fn hash_set_if_absent(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let hash = inner.hashes.entry(key.to_owned()).or_default();
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_owned(), value.to_owned());
        Ok(true)
    }

    async fn hash_compare_and_set(
        &self,
        key: &str,
        field: &str,
        expected: &str,
        new: &str,
    ) -> Result<CasOutcome, StoreError> {
        let mut inner = self.lock();
        let hash = match inner.hashes.get_mut(key) {
            Some(h) => h,
            None => return Ok(CasOutcome::Missing),
        };
        match hash.get(field) {
            None => Ok(CasOutcome::Missing),
            Some(current) if current == expected => {
                hash.insert(field.to_owned(), new.to_owned());
                Ok(CasOutcome::Swapped)
            }
            Some(current) => Ok(CasOutcome::Mismatch {
                current: current.clone(),
            }),
        }
    }

    async fn hash_incr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let mut inner = self.lock();
        let hash = inner.hashes.entry(key.to_owned()).or_default();
        let current: i64 = hash
            .get(field)
            .map(|v| v.parse())
            .transpose()
            .map_err(|e| StoreError::Other(format!("hash field is not an integer: {e}")))?
            .unwrap_or(0);
        let next = current + delta;
        hash.insert(field.to_owned(), next.to_string());
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let exists = inner.strings.contains_key(key)
            || inner.hashes.contains_key(key)
            || inner.lists.contains_key(key)
            || inner.sets.contains_key(key);
        if exists {
            inner.expirations.insert(key.to_owned(), Instant::now() + ttl);
        }
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.lock();
        let mut keys: Vec<String> = inner
            .strings
            .keys()
            .chain(inner.hashes.keys())
            .chain(inner.lists.keys())
            .chain(inner.sets.keys())
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn list_push_trimmed(
        &self,
        key: &str,
        value: &str,
        keep: usize,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let list = inner.lists.entry(key.to_owned()).or_default();
        list.push_front(value.to_owned());
        list.truncate(keep);
        Ok(())
    }

    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lock()
            .lists
            .get(key)
            .map(|l| l.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner
            .sets
            .entry(key.to_owned())
            .or_default()
            .insert(member.to_owned());
        Ok(())
    }

    async fn set_len(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self.lock().sets.get(key).map(|s| s.len() as u64).unwrap_or(0))
    }
}
