/// Magic bytes at the beginning of every transport frame header.
/// Used to quickly reject unrelated or corrupted data.
pub const MAGIC: [u8; 2] = *b"BS";

/// Wire-format protocol version.
/// Bump this only for breaking changes to the header layout or message formats.
pub const VERSION: u8 = 1;

/// Fixed transport frame header length in bytes (wire format).
pub const HEADER_LEN: usize = 10;

/// TCP framing prefix length in bytes.
///
/// TCP is a byte stream, so each frame is sent as
/// `[u32 frame_len_le][Header][Payload]`,
/// where `frame_len_le` is the length of `[Header][Payload]` in bytes.
pub const TCP_LEN_PREFIX: usize = 4;

/// Terminator index of a RESYNC delta stream.
pub const DELTA_STREAM_END: i32 = -1;

/// Number of const blocks retained by both roles. The oldest is evicted first.
pub const MAX_CONST_BLOCKS: usize = 100;

/// Peer id the server uses to identify itself to its clients.
pub const SERVER_PEER_ID: u64 = 0;
