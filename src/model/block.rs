//! Block contents.

use chrono::{DateTime, Utc};

/// A contiguous slice of a batch's items.
///
/// Blocks are numbered densely from 0 when their batch is created; the
/// numbering never changes. Item order is preserved end to end.
#[derive(Debug, Clone, PartialEq)]
pub struct Block<E> {
    /// Position of this block within its batch.
    pub block_index: usize,
    /// When the block was written.
    pub create_time: DateTime<Utc>,
    /// Whether a consumer has finished this block.
    pub consumed: bool,
    items: Vec<E>,
}

impl<E> Block<E> {
    /// Creates an empty, unconsumed block.
    pub fn new(block_index: usize) -> Self {
        Self {
            block_index,
            create_time: Utc::now(),
            consumed: false,
            items: Vec::new(),
        }
    }

    /// Creates an unconsumed block holding `items`.
    pub fn with_items(block_index: usize, items: Vec<E>) -> Self {
        Self {
            items,
            ..Self::new(block_index)
        }
    }

    pub fn with_create_time(mut self, create_time: DateTime<Utc>) -> Self {
        self.create_time = create_time;
        self
    }

    pub fn with_consumed(mut self, consumed: bool) -> Self {
        self.consumed = consumed;
        self
    }

    /// Items in their original order.
    pub fn items(&self) -> &[E] {
        &self.items
    }

    pub fn into_items(self) -> Vec<E> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_new() {
        let block: Block<String> = Block::new(1);

        assert_eq!(block.block_index, 1);
        assert!(!block.consumed);
        assert!(block.is_empty());
        assert!(block.create_time <= Utc::now());
    }

    #[test]
    fn test_block_preserves_item_order() {
        let block = Block::with_items(
            0,
            vec!["Task 1".to_string(), "Task 2".to_string(), "Task 3".to_string()],
        );

        assert_eq!(block.len(), 3);
        assert_eq!(block.items(), ["Task 1", "Task 2", "Task 3"]);
        assert_eq!(block.into_items()[2], "Task 3");
    }

    #[test]
    fn test_block_with_items() {
        let block = Block::with_items(2, vec![1, 2, 3]).with_consumed(true);

        assert_eq!(block.block_index, 2);
        assert!(block.consumed);
        assert_eq!(block.items(), &[1, 2, 3]);
    }
}
