use std::collections::VecDeque;

use blocksync_proto::constants::MAX_CONST_BLOCKS;
use bytes::Bytes;

/// Bounded FIFO of immutable data snapshots.
///
/// Pushing onto a full ring evicts the oldest entry, so indices shift down by one.
#[derive(Debug, Clone)]
pub struct ConstBlocks {
    blocks: VecDeque<Bytes>,
    capacity: usize,
}

impl Default for ConstBlocks {
    fn default() -> Self {
        Self::new(MAX_CONST_BLOCKS)
    }
}

impl ConstBlocks {
    pub fn new(capacity: usize) -> Self {
        Self {
            blocks: VecDeque::with_capacity(capacity.min(MAX_CONST_BLOCKS)),
            capacity: capacity.max(1),
        }
    }

    /// Append a block, returning the evicted one when the ring was full.
    pub fn push(&mut self, block: Bytes) -> Option<Bytes> {
        let evicted = if self.blocks.len() >= self.capacity {
            self.blocks.pop_front()
        } else {
            None
        };
        self.blocks.push_back(block);
        evicted
    }

    pub fn get(&self, index: usize) -> Option<&Bytes> {
        self.blocks.get(index)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = &Bytes> + Clone {
        self.blocks.iter()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_below_capacity_keeps_everything() {
        let mut ring = ConstBlocks::new(3);
        assert!(ring.push(Bytes::from_static(b"a")).is_none());
        assert!(ring.push(Bytes::from_static(b"b")).is_none());
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.get(0).map(|b| &b[..]), Some(&b"a"[..]));
    }

    #[test]
    fn hundred_and_first_block_evicts_oldest() {
        let mut ring = ConstBlocks::default();
        for i in 0..MAX_CONST_BLOCKS {
            ring.push(Bytes::from(vec![i as u8]));
        }
        assert_eq!(ring.len(), MAX_CONST_BLOCKS);

        let evicted = ring.push(Bytes::from_static(&[0xAA, 0xBB]));
        assert_eq!(evicted.as_deref(), Some(&[0u8][..]));
        assert_eq!(ring.len(), MAX_CONST_BLOCKS);
        assert_eq!(ring.get(0).map(|b| &b[..]), Some(&[1u8][..]));
        assert_eq!(
            ring.get(MAX_CONST_BLOCKS - 1).map(|b| &b[..]),
            Some(&[0xAA, 0xBB][..])
        );
    }
}
