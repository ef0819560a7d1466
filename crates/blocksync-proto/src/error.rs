use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),
    #[error("buffer too short")]
    TooShort,
    #[error("payload length mismatch")]
    LengthMismatch,
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    #[error("negative length {0}")]
    NegativeLength(i32),
    #[error("payload too large: {0}")]
    PayloadTooLarge(usize),
    #[error("frame too large: {0}")]
    FrameTooLarge(usize),
    #[error("unknown msg id: {0}")]
    UnknownMsgId(u8),
    #[error("unknown frame kind: {0}")]
    UnknownFrameKind(u8),
    #[error("unknown ordering channel: {0}")]
    UnknownChannel(u8),
    #[error("empty message")]
    Empty,
    #[error("block index {0} out of range")]
    BlockIndexOutOfRange(i32),
    #[error("delta stream truncated")]
    DeltaTruncated,
    #[error("delta stream missing terminator")]
    MissingTerminator,
    #[error("compression failed: {0}")]
    Compression(#[source] std::io::Error),
    #[error("decompressed length {actual} does not match declared {expected}")]
    DecompressedLengthMismatch { expected: usize, actual: usize },
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
}
