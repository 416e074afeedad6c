//! Redis key layout.
//!
//! | Purpose | Key | Type |
//! |---|---|---|
//! | pending batch ids | `cache_queue:{biz}:batches` | list |
//! | batch metadata | `cache_queue:{biz}:batch:{batch}:info` | hash |
//! | pending block indices | `cache_queue:{biz}:batch:{batch}:blocks` | list |
//! | block metadata | `cache_queue:{biz}:batch:{batch}:block:{index}:info` | hash |
//! | block items | `cache_queue:{biz}:batch:{batch}:block:{index}:data` | list |

pub const KEY_PREFIX: &str = "cache_queue:";

// Batch metadata fields.
pub const BATCH_BIZ_ID: &str = "bizId";
pub const BATCH_BATCH_ID: &str = "batchId";
pub const BATCH_BLOCK_SIZE: &str = "blockSize";
pub const BATCH_BLOCK_COUNT: &str = "blockCount";
pub const BATCH_CONSUMED_BLOCK_COUNT: &str = "consumedBlockCount";
pub const BATCH_START_TIME: &str = "startTime";

// Block metadata fields.
pub const BLOCK_INDEX: &str = "blockIndex";
pub const BLOCK_CONSUMED: &str = "consumed";
pub const BLOCK_CREATE_TIME: &str = "createTime";

/// FIFO of pending batch ids for a business stream.
pub fn batches_key(biz_id: &str) -> String {
    format!("{}{}:batches", KEY_PREFIX, biz_id)
}

pub fn batch_info_key(biz_id: &str, batch_id: &str) -> String {
    format!("{}{}:batch:{}:info", KEY_PREFIX, biz_id, batch_id)
}

/// FIFO of pending block indices for a batch.
pub fn blocks_key(biz_id: &str, batch_id: &str) -> String {
    format!("{}{}:batch:{}:blocks", KEY_PREFIX, biz_id, batch_id)
}

pub fn block_info_key(biz_id: &str, batch_id: &str, block_index: usize) -> String {
    format!(
        "{}{}:batch:{}:block:{}:info",
        KEY_PREFIX, biz_id, batch_id, block_index
    )
}

pub fn block_data_key(biz_id: &str, batch_id: &str, block_index: usize) -> String {
    format!(
        "{}{}:batch:{}:block:{}:data",
        KEY_PREFIX, biz_id, batch_id, block_index
    )
}
