//! Size limits for the sync protocol.
//!
//! Decoders check declared lengths against these before allocating.

use crate::constants::HEADER_LEN;

/// Upper bound on an uncompressed RESYNC body, INITIAL_SYNC block or const block.
///
/// Observed worst-case frames are tens of megabytes.
pub const MAX_UNCOMPRESSED_SIZE: usize = 64 * 1024 * 1024;

/// Upper bound on a single message payload (id byte included).
///
/// An INITIAL_SYNC carries every block uncompressed, so it may exceed one block's limit.
pub const MAX_MESSAGE_SIZE: usize = 2 * MAX_UNCOMPRESSED_SIZE;

/// Maximum size of a single framed TCP packet (header + payload).
pub const MAX_TCP_FRAME: usize = HEADER_LEN + MAX_MESSAGE_SIZE;

/// Initial TCP receive buffer capacity. The framer grows on demand up to [`MAX_TCP_FRAME`].
pub const TCP_RX_INITIAL_CAPACITY: usize = 64 * 1024;

/// Hard cap for buffered, not-yet-decoded TCP bytes.
pub const TCP_RX_BUFFER_LIMIT: usize = MAX_TCP_FRAME + 64 * 1024;

/// Maximum size of a handshake payload (Hello / Welcome / Reject).
pub const MAX_HANDSHAKE_PAYLOAD: usize = 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rx_buffer_larger_than_max_frame() {
        assert!(TCP_RX_BUFFER_LIMIT > MAX_TCP_FRAME);
    }

    #[test]
    fn max_frame_fits_length_prefix() {
        assert!(MAX_TCP_FRAME <= u32::MAX as usize);
    }
}
