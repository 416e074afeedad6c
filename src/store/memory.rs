//! In-process store.
//!
//! Mirrors the Redis semantics the queue relies on: every command runs
//! under one lock, so a single `lpop` hands an element to exactly one caller.
//! Lists that become empty are removed, as in Redis.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{KvConnection, KvStore};
use crate::error::StoreError;

#[derive(Debug, Clone)]
enum Value {
    List(VecDeque<String>),
    Hash(HashMap<String, String>),
}

type Data = Arc<Mutex<HashMap<String, Value>>>;

/// Shared in-memory key-value store.
///
/// Cloning is cheap and every clone sees the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Data,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every key currently stored, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.data).keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn contains_key(&self, key: &str) -> bool {
        lock(&self.data).contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.data).is_empty()
    }

    /// Opens a connection without going through the async trait.
    pub fn connection(&self) -> MemoryConnection {
        MemoryConnection {
            data: Arc::clone(&self.data),
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    type Connection = MemoryConnection;

    async fn acquire(&self) -> Result<MemoryConnection, StoreError> {
        Ok(self.connection())
    }
}

/// Connection handle onto a [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryConnection {
    data: Data,
}

fn lock(data: &Data) -> MutexGuard<'_, HashMap<String, Value>> {
    data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
    }
}

fn list_mut<'a>(
    data: &'a mut HashMap<String, Value>,
    key: &str,
) -> Result<Option<&'a mut VecDeque<String>>, StoreError> {
    match data.get_mut(key) {
        Some(Value::List(list)) => Ok(Some(list)),
        Some(Value::Hash(_)) => Err(wrong_type(key)),
        None => Ok(None),
    }
}

fn hash_ref<'a>(
    data: &'a HashMap<String, Value>,
    key: &str,
) -> Result<Option<&'a HashMap<String, String>>, StoreError> {
    match data.get(key) {
        Some(Value::Hash(hash)) => Ok(Some(hash)),
        Some(Value::List(_)) => Err(wrong_type(key)),
        None => Ok(None),
    }
}

fn hash_entry<'a>(
    data: &'a mut HashMap<String, Value>,
    key: &str,
) -> Result<&'a mut HashMap<String, String>, StoreError> {
    match data
        .entry(key.to_string())
        .or_insert_with(|| Value::Hash(HashMap::new()))
    {
        Value::Hash(hash) => Ok(hash),
        Value::List(_) => Err(wrong_type(key)),
    }
}

/// Resolves a Redis-style inclusive range against a list of `len` elements.
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl KvConnection for MemoryConnection {
    async fn lpop(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        let mut data = lock(&self.data);
        let Some(list) = list_mut(&mut data, key)? else {
            return Ok(None);
        };
        let head = list.pop_front();
        if list.is_empty() {
            data.remove(key);
        }
        Ok(head)
    }

    async fn rpush(&mut self, key: &str, values: &[String]) -> Result<usize, StoreError> {
        let mut data = lock(&self.data);
        if values.is_empty() {
            return Ok(list_mut(&mut data, key)?.map_or(0, |list| list.len()));
        }
        let value = data
            .entry(key.to_string())
            .or_insert_with(|| Value::List(VecDeque::new()));
        match value {
            Value::List(list) => {
                list.extend(values.iter().cloned());
                Ok(list.len())
            }
            Value::Hash(_) => Err(wrong_type(key)),
        }
    }

    async fn lrange(
        &mut self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut data = lock(&self.data);
        let Some(list) = list_mut(&mut data, key)? else {
            return Ok(Vec::new());
        };
        Ok(match resolve_range(list.len(), start, stop) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn lrem(&mut self, key: &str, count: isize, value: &str) -> Result<usize, StoreError> {
        let mut data = lock(&self.data);
        let Some(list) = list_mut(&mut data, key)? else {
            return Ok(0);
        };

        let limit = if count == 0 {
            usize::MAX
        } else {
            count.unsigned_abs()
        };
        let positions: Vec<usize> = if count < 0 {
            (0..list.len())
                .rev()
                .filter(|&i| list[i] == value)
                .take(limit)
                .collect()
        } else {
            (0..list.len())
                .filter(|&i| list[i] == value)
                .take(limit)
                .collect()
        };

        let mut sorted = positions.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        for i in sorted {
            list.remove(i);
        }
        if list.is_empty() {
            data.remove(key);
        }
        Ok(positions.len())
    }

    async fn llen(&mut self, key: &str) -> Result<usize, StoreError> {
        let mut data = lock(&self.data);
        Ok(list_mut(&mut data, key)?.map_or(0, |list| list.len()))
    }

    async fn hset_multiple(
        &mut self,
        key: &str,
        fields: &[(&str, String)],
    ) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut data = lock(&self.data);
        let hash = hash_entry(&mut data, key)?;
        for (field, value) in fields {
            hash.insert(field.to_string(), value.clone());
        }
        Ok(())
    }

    async fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let data = lock(&self.data);
        Ok(hash_ref(&data, key)?.and_then(|hash| hash.get(field).cloned()))
    }

    async fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let data = lock(&self.data);
        Ok(hash_ref(&data, key)?.cloned().unwrap_or_default())
    }

    async fn hincr(&mut self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let mut data = lock(&self.data);
        let hash = hash_entry(&mut data, key)?;
        let current = match hash.get(field) {
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                StoreError::Command(format!("hash value of '{}' is not an integer", field))
            })?,
            None => 0,
        };
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn del(&mut self, keys: &[String]) -> Result<usize, StoreError> {
        let mut data = lock(&self.data);
        Ok(keys.iter().filter(|key| data.remove(*key).is_some()).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn test_list_is_fifo() {
        let store = MemoryStore::new();
        let mut conn = store.acquire().await.expect("acquire");

        assert_eq!(conn.rpush("q", &strings(&["a", "b"])).await.unwrap(), 2);
        assert_eq!(conn.rpush("q", &strings(&["c"])).await.unwrap(), 3);
        assert_eq!(conn.llen("q").await.unwrap(), 3);

        assert_eq!(conn.lpop("q").await.unwrap().as_deref(), Some("a"));
        assert_eq!(conn.lpop("q").await.unwrap().as_deref(), Some("b"));
        assert_eq!(conn.lpop("q").await.unwrap().as_deref(), Some("c"));
        assert_eq!(conn.lpop("q").await.unwrap(), None);
        assert!(!store.contains_key("q"));
    }

    #[tokio::test]
    async fn test_lrange_indices() {
        let mut conn = MemoryStore::new().connection();
        conn.rpush("l", &strings(&["0", "1", "2", "3"])).await.unwrap();

        assert_eq!(conn.lrange("l", 0, -1).await.unwrap(), strings(&["0", "1", "2", "3"]));
        assert_eq!(conn.lrange("l", 1, 2).await.unwrap(), strings(&["1", "2"]));
        assert_eq!(conn.lrange("l", -2, -1).await.unwrap(), strings(&["2", "3"]));
        assert_eq!(conn.lrange("l", 0, 100).await.unwrap().len(), 4);
        assert!(conn.lrange("l", 3, 1).await.unwrap().is_empty());
        assert!(conn.lrange("missing", 0, -1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lrem_directions() {
        let mut conn = MemoryStore::new().connection();
        conn.rpush("l", &strings(&["x", "a", "x", "b", "x"])).await.unwrap();

        assert_eq!(conn.lrem("l", 1, "x").await.unwrap(), 1);
        assert_eq!(conn.lrange("l", 0, -1).await.unwrap(), strings(&["a", "x", "b", "x"]));

        assert_eq!(conn.lrem("l", -1, "x").await.unwrap(), 1);
        assert_eq!(conn.lrange("l", 0, -1).await.unwrap(), strings(&["a", "x", "b"]));

        assert_eq!(conn.lrem("l", 0, "x").await.unwrap(), 1);
        assert_eq!(conn.lrem("l", 0, "missing").await.unwrap(), 0);
        assert_eq!(conn.lrange("l", 0, -1).await.unwrap(), strings(&["a", "b"]));
    }

    #[tokio::test]
    async fn test_hash_commands() {
        let mut conn = MemoryStore::new().connection();
        conn.hset_multiple("h", &[("a", "1".to_string()), ("b", "x".to_string())])
            .await
            .unwrap();

        assert_eq!(conn.hget("h", "a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(conn.hget("h", "zz").await.unwrap(), None);
        assert_eq!(conn.hgetall("h").await.unwrap().len(), 2);
        assert!(conn.hgetall("missing").await.unwrap().is_empty());

        assert_eq!(conn.hincr("h", "a", 2).await.unwrap(), 3);
        assert_eq!(conn.hincr("h", "new", 1).await.unwrap(), 1);
        assert!(matches!(
            conn.hincr("h", "b", 1).await,
            Err(StoreError::Command(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_type_and_delete() {
        let store = MemoryStore::new();
        let mut conn = store.connection();
        conn.rpush("l", &strings(&["a"])).await.unwrap();
        conn.hset_multiple("h", &[("f", "v".to_string())]).await.unwrap();

        assert!(matches!(conn.hget("l", "f").await, Err(StoreError::WrongType { .. })));
        assert!(matches!(conn.lpop("h").await, Err(StoreError::WrongType { .. })));

        let deleted = conn
            .del(&strings(&["l", "h", "missing"]))
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert!(store.is_empty());
    }
}
