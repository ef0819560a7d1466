//! Wire layer for block synchronization.
//!
//! - [`messages`]: sync packets exchanged between the authoritative server and clients
//! - [`delta_stream`]: the uncompressed `(index, xor_bytes)*, -1` body carried by RESYNC
//! - [`compress`]: deflate helpers with declared-length checks
//! - [`header`], [`codec_tcp`], [`framing`]: transport framing used by the TCP adapter

pub mod channel;
pub mod codec_tcp;
pub mod compress;
pub mod constants;
pub mod delta_stream;
pub mod error;
pub mod framing;
pub mod header;
pub mod limits;
pub mod messages;
pub mod msg_id;
pub mod packet;
