use strum::FromRepr;

/// Leading one-byte identifier of every sync message.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr)]
pub enum MsgId {
    InitialSync = 1,
    Resync = 2,
    ConstData = 3,
    ClientInputs = 4,

    InitialSyncAck = 5,
    SyncCheck = 6,
    ChecksumReport = 7,
    FullSyncRequest = 8,
}
