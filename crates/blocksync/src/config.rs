use blocksync_proto::channel::Reliability;

/// Server-side sync behavior.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Broadcast a SYNC_CHECK every N sync ticks (0 disables consistency checks).
    pub sync_check_interval: u32,
    /// Number of recent checksums kept for comparing late CHECKSUM_REPORTs.
    pub check_history: usize,
    /// Delivery used for RESYNC. Anything but `ReliableOrdered` trades
    /// correctness for latency: one lost diff desyncs a client until the next check.
    pub resync_reliability: Reliability,
    /// Inputs buffered per session; past this the oldest is dropped.
    pub input_queue_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            sync_check_interval: 60,
            check_history: 32,
            resync_reliability: Reliability::ReliableOrdered,
            input_queue_limit: 256,
        }
    }
}

/// Client-side reconciliation behavior.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Ask the server for a fresh INITIAL_SYNC when a RESYNC cannot be applied.
    pub request_full_sync_on_error: bool,
    /// Answer SYNC_CHECK with the checksum of the mirrored blocks.
    pub report_checksums: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_full_sync_on_error: true,
            report_checksums: true,
        }
    }
}
