//! The block-vector family: live blocks, their stale snapshots, the xor
//! scratch buffers and the const ring.
//!
//! `live[i]`, `stale[i]` and `xor[i]` always describe the same region and have
//! the same length. The whole family sits behind one lock in the owner
//! ([`crate::server::Server`]); nothing here synchronizes on its own.

use blocksync_proto::limits::MAX_UNCOMPRESSED_SIZE;
use bytes::Bytes;

use crate::block::{BlockHandle, MemoryBlock, SharedRegion};
use crate::const_blocks::ConstBlocks;
use crate::error::SyncError;

#[derive(Debug, Default)]
pub struct BlockSet {
    pub(crate) live: Vec<MemoryBlock>,
    pub(crate) stale: Vec<Box<[u8]>>,
    pub(crate) xor: Vec<Box<[u8]>>,
    pub(crate) consts: ConstBlocks,
    sealed: bool,
}

impl BlockSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a zero-initialized owned block.
    pub fn create_memory_block(&mut self, size: usize) -> Result<BlockHandle, SyncError> {
        check_block_size(size)?;
        check_family_size(self.total_size(), self.len(), size)?;
        self.register(MemoryBlock::owned(size))
    }

    /// Register a block aliasing emulator-owned memory.
    pub fn create_shared_memory_block(
        &mut self,
        region: SharedRegion,
    ) -> Result<BlockHandle, SyncError> {
        self.register(MemoryBlock::Borrowed(region))
    }

    pub fn register(&mut self, block: MemoryBlock) -> Result<BlockHandle, SyncError> {
        if self.sealed {
            return Err(SyncError::RegistrationClosed);
        }
        let size = block.len();
        check_block_size(size)?;
        check_family_size(self.total_size(), self.len(), size)?;

        // The stale snapshot starts equal to the block so the first tick only
        // reports changes made after registration.
        let stale: Box<[u8]> = block.read().to_vec().into_boxed_slice();
        let index = self.live.len();
        self.live.push(block);
        self.stale.push(stale);
        self.xor.push(vec![0; size].into_boxed_slice());

        Ok(BlockHandle { index, size })
    }

    /// Close registration. Indices are part of the wire contract from here on.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn block_len(&self, index: usize) -> Option<usize> {
        self.live.get(index).map(MemoryBlock::len)
    }

    pub fn block(&self, index: usize) -> Option<&MemoryBlock> {
        self.live.get(index)
    }

    pub fn block_mut(&mut self, index: usize) -> Option<&mut MemoryBlock> {
        self.live.get_mut(index)
    }

    pub fn stale(&self, index: usize) -> Option<&[u8]> {
        self.stale.get(index).map(|b| &b[..])
    }

    pub fn stale_blocks(&self) -> impl ExactSizeIterator<Item = &[u8]> + Clone {
        self.stale.iter().map(|b| &b[..])
    }

    /// Total bytes tracked across all live blocks.
    pub fn total_size(&self) -> usize {
        self.live.iter().map(MemoryBlock::len).sum()
    }

    pub fn consts(&self) -> &ConstBlocks {
        &self.consts
    }

    pub fn push_const(&mut self, block: Bytes) -> Option<Bytes> {
        self.consts.push(block)
    }
}

/// Length of a delta stream in which all `count` blocks are dirty: an i32
/// index plus the full xor per block, then the sentinel.
pub(crate) fn delta_stream_len(total_size: usize, count: usize) -> usize {
    total_size + 4 * count + 4
}

/// Every block dirty in the same tick must still fit one RESYNC.
fn check_family_size(total_size: usize, count: usize, size: usize) -> Result<(), SyncError> {
    let worst_case = delta_stream_len(total_size + size, count + 1);
    if worst_case > MAX_UNCOMPRESSED_SIZE {
        return Err(SyncError::FamilyTooLarge {
            size: worst_case,
            limit: MAX_UNCOMPRESSED_SIZE,
        });
    }
    Ok(())
}

fn check_block_size(size: usize) -> Result<(), SyncError> {
    if delta_stream_len(size, 1) > MAX_UNCOMPRESSED_SIZE {
        return Err(SyncError::BlockTooLarge(size));
    }
    Ok(())
}
