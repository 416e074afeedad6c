//! Partial failures while adding a batch.

use std::collections::HashMap;

use async_trait::async_trait;
use cache_queue::store::keys;
use cache_queue::store::memory::MemoryConnection;
use cache_queue::{
    Codec, JsonCodec, KvConnection, KvStore, MemoryStore, QueueError, QueueStore,
    SerializationError, StoreError,
};

/// Plain UTF-8 codec that refuses one specific item.
struct PickyCodec;

impl Codec for PickyCodec {
    type Item = String;

    fn encode(&self, item: &String) -> Result<Vec<u8>, SerializationError> {
        if item == "poison" {
            return Err(SerializationError::Codec("refusing poison".to_string()));
        }
        Ok(item.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<String, SerializationError> {
        String::from_utf8(bytes.to_vec()).map_err(|e| SerializationError::Codec(e.to_string()))
    }
}

#[tokio::test]
async fn test_encoding_failure_removes_written_blocks() {
    let store = MemoryStore::new();
    let queue = QueueStore::new(store.clone(), PickyCodec);

    let items: Vec<String> = ["a", "b", "c", "d", "poison", "f"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let err = queue.add_batch("biz", "b1", 2, &items).await.unwrap_err();

    match err {
        QueueError::Serialization { op, source } => {
            assert_eq!(op, "add_batch");
            assert!(source.to_string().contains("poison"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(store.is_empty(), "residual keys: {:?}", store.keys());
    assert!(queue.next_batch("biz").await.unwrap().is_none());
}

#[tokio::test]
async fn test_custom_codec_round_trip() {
    let queue = QueueStore::new(MemoryStore::new(), PickyCodec);
    let items = vec!["x".to_string(), "y".to_string(), "z".to_string()];
    queue.add_batch("biz", "b1", 2, &items).await.unwrap();

    let block = queue.get_block("biz", "b1", 1).await.unwrap().unwrap();
    assert_eq!(block.items(), ["z".to_string()]);
}

/// Store that rejects pushes onto the batch FIFO.
#[derive(Clone, Default)]
struct NoEnqueueStore {
    inner: MemoryStore,
}

struct NoEnqueueConnection {
    inner: MemoryConnection,
}

#[async_trait]
impl KvStore for NoEnqueueStore {
    type Connection = NoEnqueueConnection;

    async fn acquire(&self) -> Result<NoEnqueueConnection, StoreError> {
        Ok(NoEnqueueConnection {
            inner: self.inner.connection(),
        })
    }
}

#[async_trait]
impl KvConnection for NoEnqueueConnection {
    async fn lpop(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.lpop(key).await
    }

    async fn rpush(&mut self, key: &str, values: &[String]) -> Result<usize, StoreError> {
        if key.ends_with(":batches") {
            return Err(StoreError::Command("enqueue rejected".to_string()));
        }
        self.inner.rpush(key, values).await
    }

    async fn lrange(
        &mut self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        self.inner.lrange(key, start, stop).await
    }

    async fn lrem(&mut self, key: &str, count: isize, value: &str) -> Result<usize, StoreError> {
        self.inner.lrem(key, count, value).await
    }

    async fn llen(&mut self, key: &str) -> Result<usize, StoreError> {
        self.inner.llen(key).await
    }

    async fn hset_multiple(
        &mut self,
        key: &str,
        fields: &[(&str, String)],
    ) -> Result<(), StoreError> {
        self.inner.hset_multiple(key, fields).await
    }

    async fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.inner.hget(key, field).await
    }

    async fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.inner.hgetall(key).await
    }

    async fn hincr(&mut self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        self.inner.hincr(key, field, delta).await
    }

    async fn del(&mut self, keys: &[String]) -> Result<usize, StoreError> {
        self.inner.del(keys).await
    }
}

#[tokio::test]
async fn test_enqueue_failure_removes_everything() {
    let store = NoEnqueueStore::default();
    let queue = QueueStore::new(store.clone(), JsonCodec::<u32>::new());

    let err = queue
        .add_batch("biz", "b1", 3, &[1, 2, 3, 4, 5, 6, 7])
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        QueueError::Store {
            op: "add_batch",
            source: StoreError::Command(_)
        }
    ));
    assert!(store.inner.is_empty(), "residual keys: {:?}", store.inner.keys());
    assert!(!store.inner.contains_key(&keys::batch_info_key("biz", "b1")));
}

#[tokio::test]
async fn test_add_block_encoding_failure_writes_nothing() {
    let store = MemoryStore::new();
    let queue = QueueStore::new(store.clone(), PickyCodec);

    let err = queue
        .add_block("biz", "b1", 0, &["ok".to_string(), "poison".to_string()])
        .await
        .unwrap_err();

    assert!(matches!(err, QueueError::Serialization { op: "add_block", .. }));
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_resubmitting_existing_id_leaves_live_batch_intact() {
    let store = MemoryStore::new();
    let queue = QueueStore::new(store.clone(), PickyCodec);
    queue
        .add_batch("biz", "b1", 1, &["a".to_string(), "b".to_string()])
        .await
        .unwrap();
    let keys_before = store.keys();

    let err = queue
        .add_batch("biz", "b1", 1, &["poison".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QueueError::BatchExists { ref batch_id, .. } if batch_id == "b1"
    ));
    assert_eq!(store.keys(), keys_before);

    let batch = queue.get_batch("biz", "b1").await.unwrap().expect("batch kept");
    assert_eq!(batch.block_count, 2);
    let popped = queue.next_batch("biz").await.unwrap().expect("still pending");
    assert_eq!(popped.batch_id, "b1");
    let block = queue.next_block("biz", "b1").await.unwrap().expect("block 0");
    assert_eq!(block.items(), ["a".to_string()]);
}
