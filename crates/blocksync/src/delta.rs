//! Per-tick XOR delta engine.
//!
//! # Algorithm
//! For every block `i`:
//! 1. `xor[i] = live[i] ^ stale[i]`; the block is dirty if any byte is non-zero.
//! 2. XOR-fold checksums of live, xor and stale are accumulated for logging.
//! 3. `stale[i] = live[i]`, whether dirty or not.
//! 4. Dirty blocks are appended to the delta stream as `(i, xor[i])`.
//!
//! Since `new = old ^ (old ^ new)`, a receiver holding `stale[i]` reproduces
//! `live[i]` by XORing the diff into its copy in place.

use blocksync_proto::delta_stream::DeltaWriter;
use ring::digest;
use tracing::error;

use crate::registry::BlockSet;

/// XOR-fold checksums of one tick. Diagnostic only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickChecksums {
    pub live: u8,
    pub xor: u8,
    pub stale: u8,
}

/// Result of one delta pass over the block family.
#[derive(Debug, Default)]
pub struct DeltaFrame {
    pub dirty_blocks: usize,
    /// Bytes of xor payload in the stream (indices excluded).
    pub bytes_synced: usize,
    /// Terminated delta stream, or `None` when nothing changed.
    pub stream: Option<Vec<u8>>,
    pub checksums: TickChecksums,
}

/// Writes `live ^ stale` into `xor` and reports whether any byte differed.
pub fn xor_into(live: &[u8], stale: &[u8], xor: &mut [u8]) -> bool {
    let mut any = 0u8;
    for ((x, &l), &s) in xor.iter_mut().zip(live).zip(stale) {
        *x = l ^ s;
        any |= *x;
    }
    any != 0
}

/// XOR `diff` into `target` in place.
pub fn apply_xor(target: &mut [u8], diff: &[u8]) {
    for (t, &d) in target.iter_mut().zip(diff) {
        *t ^= d;
    }
}

pub fn xor_fold(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, &b| acc ^ b)
}

/// Diff every block against its stale snapshot and advance the baseline.
///
/// A block whose live, stale and xor lengths disagree is a configuration
/// error: it is logged and skipped, never resized.
pub fn compute_delta(set: &mut BlockSet) -> DeltaFrame {
    let mut frame = DeltaFrame::default();
    let mut writer = DeltaWriter::default();

    let blocks = set.live.iter().zip(set.stale.iter_mut()).zip(set.xor.iter_mut());
    for (index, ((live, stale), xor)) in blocks.enumerate() {
        let live = live.read();
        if live.len() != stale.len() || live.len() != xor.len() {
            error!(
                index,
                live = live.len(),
                stale = stale.len(),
                xor = xor.len(),
                "block size mismatch, skipping block"
            );
            continue;
        }

        let dirty = xor_into(&live, stale, xor);

        frame.checksums.live ^= xor_fold(&live);
        frame.checksums.xor ^= xor_fold(xor);
        frame.checksums.stale ^= xor_fold(stale);

        stale.copy_from_slice(&live);

        if dirty {
            writer.push(index, xor);
            frame.dirty_blocks += 1;
            frame.bytes_synced += xor.len();
        }
    }

    if !writer.is_empty() {
        frame.stream = Some(writer.finish());
    }
    frame
}

/// 64-bit digest of a sequence of blocks (SHA-256, truncated).
///
/// Block lengths are mixed in, so moving bytes across a block boundary
/// changes the result.
#[derive(Clone)]
pub struct StateHasher {
    ctx: digest::Context,
}

impl Default for StateHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl StateHasher {
    pub fn new() -> Self {
        Self {
            ctx: digest::Context::new(&digest::SHA256),
        }
    }

    pub fn update(&mut self, block: &[u8]) {
        self.ctx.update(&(block.len() as u64).to_le_bytes());
        self.ctx.update(block);
    }

    pub fn finish(self) -> u64 {
        let digest = self.ctx.finish();
        let mut out = [0u8; 8];
        out.copy_from_slice(&digest.as_ref()[..8]);
        u64::from_le_bytes(out)
    }
}

pub fn state_checksum<'a, I>(blocks: I) -> u64
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut hasher = StateHasher::new();
    for block in blocks {
        hasher.update(block);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::SharedRegion;
    use blocksync_proto::delta_stream::parse_delta_stream;
    use proptest::prelude::*;

    #[test]
    fn zero_change_tick_produces_nothing() {
        let mut set = BlockSet::new();
        let region = SharedRegion::from_vec(vec![3, 1, 4, 1]);
        set.create_shared_memory_block(region).expect("register");
        set.create_memory_block(8).expect("register");

        let frame = compute_delta(&mut set);
        assert!(frame.stream.is_none());
        assert_eq!(frame.dirty_blocks, 0);
        assert_eq!(set.stale(0), Some(&[3u8, 1, 4, 1][..]));
    }

    #[test]
    fn dirty_block_scenario() {
        let mut set = BlockSet::new();
        let region = SharedRegion::new(4);
        set.create_shared_memory_block(region.clone())
            .expect("register");

        region.write().copy_from_slice(&[1, 0, 0, 1]);
        let frame = compute_delta(&mut set);

        assert_eq!(frame.dirty_blocks, 1);
        assert_eq!(frame.bytes_synced, 4);
        let stream = frame.stream.expect("dirty tick has a stream");
        let mut expected = Vec::new();
        expected.extend_from_slice(&0i32.to_le_bytes());
        expected.extend_from_slice(&[1, 0, 0, 1]);
        expected.extend_from_slice(&(-1i32).to_le_bytes());
        assert_eq!(stream, expected);

        assert_eq!(set.stale(0), Some(&[1u8, 0, 0, 1][..]));
        assert!(compute_delta(&mut set).stream.is_none());
    }

    #[test]
    fn only_dirty_blocks_are_streamed() {
        let mut set = BlockSet::new();
        let a = SharedRegion::new(2);
        let b = SharedRegion::new(3);
        set.create_shared_memory_block(a).expect("register");
        set.create_shared_memory_block(b.clone()).expect("register");

        b.write()[1] = 0xff;
        let frame = compute_delta(&mut set);
        let stream = frame.stream.expect("stream");
        let entries = parse_delta_stream(&stream, |i| set.block_len(i)).expect("parse");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].index, 1);
        assert_eq!(entries[0].xor, &[0, 0xff, 0]);
    }

    #[test]
    fn checksums_fold_live_and_stale() {
        let mut set = BlockSet::new();
        let region = SharedRegion::from_vec(vec![0x0f]);
        set.create_shared_memory_block(region.clone()).expect("register");
        region.write()[0] = 0xf0;

        let frame = compute_delta(&mut set);
        assert_eq!(
            frame.checksums,
            TickChecksums {
                live: 0xf0,
                xor: 0xff,
                stale: 0x0f,
            }
        );
    }

    #[test]
    fn state_checksum_depends_on_block_boundaries() {
        let joined = state_checksum([&[1u8, 2, 3][..]]);
        let split = state_checksum([&[1u8][..], &[2u8, 3][..]]);
        assert_ne!(joined, split);
        assert_eq!(joined, state_checksum([&[1u8, 2, 3][..]]));
    }

    proptest! {
        #[test]
        fn xor_round_trip(pair in (1usize..256).prop_flat_map(|n| (
            proptest::collection::vec(any::<u8>(), n),
            proptest::collection::vec(any::<u8>(), n),
        ))) {
            let (old, new) = pair;
            let mut set = BlockSet::new();
            let region = SharedRegion::from_vec(old.clone());
            set.create_shared_memory_block(region.clone()).expect("register");
            region.write().copy_from_slice(&new);

            let frame = compute_delta(&mut set);
            let mut mirror = old.clone();
            if let Some(stream) = frame.stream {
                let entries = parse_delta_stream(&stream, |i| set.block_len(i)).expect("parse");
                for entry in entries {
                    apply_xor(&mut mirror, entry.xor);
                }
            } else {
                prop_assert_eq!(&old, &new);
            }
            prop_assert_eq!(mirror, new);
        }
    }
}
