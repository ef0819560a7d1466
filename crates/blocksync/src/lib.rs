//! Memory block synchronization for netplay.
//!
//! An authoritative [`Server`] mirrors a machine's memory blocks to any number of
//! [`Client`]s. Each server tick XORs every live block against its stale snapshot,
//! deflates the concatenated diffs of the dirty blocks and broadcasts them on an
//! ordered channel; clients XOR the same diffs into their mirrors.
//!
//! # Architecture
//!
//! - [`block`]: memory blocks, owned or borrowed from the emulator
//! - [`registry`]: the live/stale/xor block family guarded by a single lock
//! - [`const_blocks`]: bounded FIFO of rarely-changing data blobs
//! - [`delta`]: the per-tick XOR engine and state checksums
//! - [`session`]: server-side per-connection state and input queues
//! - [`server`]: session manager and sync broadcaster
//! - [`client`]: reconciliation of full and incremental syncs
//! - [`transport`]: transport adapter trait plus loopback and TCP implementations
//! - [`error`]: error types

pub mod block;
pub mod client;
pub mod config;
pub mod const_blocks;
pub mod delta;
pub mod error;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use block::{BlockHandle, MemoryBlock, SharedRegion};
pub use client::{Client, ClientState};
pub use config::{ClientConfig, ServerConfig};
pub use error::{SyncError, TransportError};
pub use server::{Server, SyncReport};
pub use session::SessionState;
pub use transport::{PeerId, Target, Transport, TransportEvent};
