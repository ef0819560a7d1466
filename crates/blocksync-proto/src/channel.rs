use serde::{Deserialize, Serialize};
use strum::FromRepr;

use crate::msg_id::MsgId;

/// Independent ordering domains multiplexed over a transport.
///
/// - `Sync`: INITIAL_SYNC, RESYNC and SYNC_CHECK. Strictly ordered, since RESYNC
///   is a running delta against an implicit baseline.
/// - `ConstData`: const block announcements.
/// - `ClientInputs`: serialized input from clients.
/// - `Control`: small client reports (acks, checksums, re-sync requests).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, FromRepr)]
pub enum OrderingChannel {
    Sync = 0,
    ConstData = 1,
    ClientInputs = 2,
    Control = 3,
}

/// Delivery guarantee requested for a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reliability {
    /// May be dropped or reordered.
    Unreliable,
    /// May be dropped; stale packets are discarded rather than delivered late.
    UnreliableSequenced,
    /// Delivered exactly once, in order within its channel.
    ReliableOrdered,
}

/// Send priority. High-priority traffic is drained before low-priority traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    High,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    pub priority: Priority,
    pub reliability: Reliability,
    pub channel: OrderingChannel,
}

impl SendOptions {
    pub const fn new(
        priority: Priority,
        reliability: Reliability,
        channel: OrderingChannel,
    ) -> Self {
        Self {
            priority,
            reliability,
            channel,
        }
    }

    pub const fn is_reliable(&self) -> bool {
        matches!(self.reliability, Reliability::ReliableOrdered)
    }
}

/// Map a message ID to its default delivery options.
pub const fn default_send_options(msg_id: MsgId) -> SendOptions {
    use OrderingChannel as C;
    use Priority as P;
    use Reliability as R;

    match msg_id {
        MsgId::InitialSync => SendOptions::new(P::High, R::ReliableOrdered, C::Sync),
        MsgId::Resync | MsgId::SyncCheck => SendOptions::new(P::Low, R::ReliableOrdered, C::Sync),
        MsgId::ConstData => SendOptions::new(P::Low, R::Unreliable, C::ConstData),
        MsgId::ClientInputs => SendOptions::new(P::High, R::ReliableOrdered, C::ClientInputs),
        MsgId::InitialSyncAck | MsgId::ChecksumReport | MsgId::FullSyncRequest => {
            SendOptions::new(P::High, R::ReliableOrdered, C::Control)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_traffic_shares_one_ordered_channel() {
        for id in [MsgId::InitialSync, MsgId::Resync, MsgId::SyncCheck] {
            let opts = default_send_options(id);
            assert_eq!(opts.channel, OrderingChannel::Sync);
            assert!(opts.is_reliable());
        }
    }

    #[test]
    fn const_data_is_unreliable_on_its_own_channel() {
        let opts = default_send_options(MsgId::ConstData);
        assert_eq!(opts.channel, OrderingChannel::ConstData);
        assert_eq!(opts.reliability, Reliability::Unreliable);
    }
}
