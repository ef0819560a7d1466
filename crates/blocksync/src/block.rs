//! Memory blocks: contiguous regions of machine state tracked for sync.
//!
//! A block either owns its buffer or borrows a region that the emulator keeps
//! writing through its own [`SharedRegion`] clone. The length is fixed at
//! creation in both cases.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

/// Emulator-owned memory that the sync layer reads without copying.
///
/// Stays valid as long as any clone is alive; the emulator component that
/// registered it usually holds the other clone.
#[derive(Clone, Debug)]
pub struct SharedRegion {
    inner: Arc<RwLock<Box<[u8]>>>,
    len: usize,
}

impl SharedRegion {
    /// Allocate a zero-filled region of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        let data = data.into_boxed_slice();
        let len = data.len();
        Self {
            inner: Arc::new(RwLock::new(data)),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Guards expose the bytes, never the allocation, so the length stays fixed.
    pub fn read(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.inner.read(), |buf| &buf[..])
    }

    pub fn write(&self) -> MappedRwLockWriteGuard<'_, [u8]> {
        RwLockWriteGuard::map(self.inner.write(), |buf| &mut buf[..])
    }
}

#[derive(Debug)]
pub enum MemoryBlock {
    Owned(Box<[u8]>),
    Borrowed(SharedRegion),
}

impl MemoryBlock {
    /// Zero-initialized owned block.
    pub fn owned(len: usize) -> Self {
        MemoryBlock::Owned(vec![0; len].into_boxed_slice())
    }

    pub fn len(&self) -> usize {
        match self {
            MemoryBlock::Owned(buf) => buf.len(),
            MemoryBlock::Borrowed(region) => region.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_borrowed(&self) -> bool {
        matches!(self, MemoryBlock::Borrowed(_))
    }

    pub fn read(&self) -> BlockRead<'_> {
        match self {
            MemoryBlock::Owned(buf) => BlockRead::Owned(buf),
            MemoryBlock::Borrowed(region) => BlockRead::Borrowed(region.read()),
        }
    }

    pub fn write(&mut self) -> BlockWrite<'_> {
        match self {
            MemoryBlock::Owned(buf) => BlockWrite::Owned(buf),
            MemoryBlock::Borrowed(region) => BlockWrite::Borrowed(region.write()),
        }
    }
}

pub enum BlockRead<'a> {
    Owned(&'a [u8]),
    Borrowed(MappedRwLockReadGuard<'a, [u8]>),
}

impl Deref for BlockRead<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            BlockRead::Owned(buf) => buf,
            BlockRead::Borrowed(guard) => guard,
        }
    }
}

pub enum BlockWrite<'a> {
    Owned(&'a mut [u8]),
    Borrowed(MappedRwLockWriteGuard<'a, [u8]>),
}

impl Deref for BlockWrite<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            BlockWrite::Owned(buf) => buf,
            BlockWrite::Borrowed(guard) => guard,
        }
    }
}

impl DerefMut for BlockWrite<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self {
            BlockWrite::Owned(buf) => buf,
            BlockWrite::Borrowed(guard) => guard,
        }
    }
}

/// Describes a registered block. Indices are dense and assigned in
/// registration order, so server and client must register in the same order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle {
    pub index: usize,
    pub size: usize,
}
