//! Synthetic machine hosted by `serve`.
//!
//! Three shared regions stand in for the memory a real emulator would expose
//! (work RAM, video RAM, CPU registers) and one owned block holds scratch state
//! written through the server. Each frame touches a handful of bytes so the
//! delta stream stays small, the way a real frame would.

use blocksync::{BlockHandle, Server, SharedRegion, SyncError};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const WRAM_SIZE: usize = 2048;
pub const VRAM_SIZE: usize = 8192;
pub const REGS_SIZE: usize = 32;
pub const SCRATCH_SIZE: usize = 64;

/// Bytes of `regs` reserved for the latest input of each client slot.
const INPUT_LANES: usize = 8;
const INPUT_BASE: usize = REGS_SIZE - INPUT_LANES;

pub struct DemoMachine {
    wram: SharedRegion,
    vram: SharedRegion,
    regs: SharedRegion,
    scratch: BlockHandle,
    rng: StdRng,
    frame: u64,
}

impl DemoMachine {
    /// Register the machine's blocks with `server`, in a fixed order clients can rely on.
    pub fn install(server: &Server, seed: u64) -> Result<Self, SyncError> {
        let wram = SharedRegion::new(WRAM_SIZE);
        let vram = SharedRegion::new(VRAM_SIZE);
        let regs = SharedRegion::new(REGS_SIZE);
        server.create_shared_memory_block(wram.clone())?;
        server.create_shared_memory_block(vram.clone())?;
        server.create_shared_memory_block(regs.clone())?;
        let scratch = server.create_memory_block(SCRATCH_SIZE)?;

        Ok(Self {
            wram,
            vram,
            regs,
            scratch,
            rng: StdRng::seed_from_u64(seed),
            frame: 0,
        })
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Advance one frame.
    pub fn step(&mut self, server: &Server) -> Result<(), SyncError> {
        self.frame += 1;

        {
            let mut wram = self.wram.write();
            for _ in 0..self.rng.random_range(1..=4) {
                let at = self.rng.random_range(0..WRAM_SIZE);
                wram[at] ^= self.rng.random_range(1..=u8::MAX);
            }
        }

        // A short run of tiles, as if one sprite moved.
        {
            let mut vram = self.vram.write();
            let start = self.rng.random_range(0..VRAM_SIZE - 16);
            let fill = self.rng.random_range(1..=u8::MAX);
            vram[start..start + 16].fill(fill);
        }

        {
            let mut regs = self.regs.write();
            regs[..8].copy_from_slice(&self.frame.to_le_bytes());
        }

        let frame = self.frame;
        server.with_block_mut(self.scratch.index, |scratch| {
            let at = (frame as usize) % scratch.len();
            scratch[at] = scratch[at].wrapping_add(1);
        })?;
        Ok(())
    }

    /// Latch the newest input from `slot` into its register lane.
    pub fn apply_input(&mut self, slot: usize, input: &[u8]) {
        let Some(&buttons) = input.first() else {
            return;
        };
        if slot < INPUT_LANES {
            self.regs.write()[INPUT_BASE + slot] = buttons;
        }
    }

    /// Immutable payload published as a const block, e.g. a palette snapshot.
    pub fn palette(&mut self) -> Bytes {
        let mut palette = vec![0u8; 64];
        self.rng.fill(&mut palette[..]);
        palette[..8].copy_from_slice(&self.frame.to_le_bytes());
        Bytes::from(palette)
    }

    pub fn input_lane(&self, slot: usize) -> Option<u8> {
        (slot < INPUT_LANES).then(|| self.regs.read()[INPUT_BASE + slot])
    }
}

/// Pseudo-random controller state for `join`.
pub fn random_input(rng: &mut impl Rng, frame: u32) -> Bytes {
    let mut input = Vec::with_capacity(5);
    input.push(rng.random::<u8>());
    input.extend_from_slice(&frame.to_le_bytes());
    Bytes::from(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use blocksync::transport::LoopbackHub;
    use blocksync::ServerConfig;
    use std::sync::Arc;

    fn server() -> (LoopbackHub, Server) {
        let hub = LoopbackHub::new();
        let server = Server::new(Arc::new(hub.server()), ServerConfig::default());
        (hub, server)
    }

    #[test]
    fn install_registers_blocks_in_order() {
        let (_hub, server) = server();
        let machine = DemoMachine::install(&server, 1).expect("install");

        assert_eq!(server.num_blocks(), 4);
        assert_eq!(server.block_len(0), Some(WRAM_SIZE));
        assert_eq!(server.block_len(1), Some(VRAM_SIZE));
        assert_eq!(server.block_len(2), Some(REGS_SIZE));
        assert_eq!(server.block_len(3), Some(SCRATCH_SIZE));
        assert_eq!(machine.frame(), 0);
    }

    #[test]
    fn step_produces_a_sparse_delta() {
        let (_hub, server) = server();
        let mut machine = DemoMachine::install(&server, 7).expect("install");

        machine.step(&server).expect("step");
        let report = server.sync();

        // Every block changes, but only a few bytes in each.
        assert_eq!(report.dirty_blocks, 4);
        assert_eq!(
            report.bytes_synced,
            WRAM_SIZE + VRAM_SIZE + REGS_SIZE + SCRATCH_SIZE
        );
        assert!(report.compressed_size * 10 < report.uncompressed_size);
        assert_eq!(server.copy_block(2).expect("regs")[..8], 1u64.to_le_bytes());

        let idle = server.sync();
        assert_eq!(idle.dirty_blocks, 0);
    }

    #[test]
    fn inputs_land_in_their_lane() {
        let (_hub, server) = server();
        let mut machine = DemoMachine::install(&server, 3).expect("install");

        machine.apply_input(2, &[0b1010_0001, 9, 9]);
        machine.apply_input(INPUT_LANES, &[0xff]);
        machine.apply_input(0, &[]);

        assert_eq!(machine.input_lane(2), Some(0b1010_0001));
        assert_eq!(machine.input_lane(0), Some(0));
        assert_eq!(machine.input_lane(INPUT_LANES), None);
    }
}
