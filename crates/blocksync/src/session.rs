use std::collections::VecDeque;

use bytes::Bytes;

use crate::transport::PeerId;

/// Server-side lifecycle of one connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Slot assigned, INITIAL_SYNC not sent yet.
    Connecting,
    /// INITIAL_SYNC sent, waiting for the client to load it.
    AwaitingInitialSyncAck,
    /// Client loaded the snapshot and follows the RESYNC stream.
    Active,
    /// Slot free for reuse.
    #[default]
    Disconnected,
}

/// Per-connection server state.
#[derive(Debug, Default)]
pub struct Session {
    /// Network identity; `None` once the peer is gone.
    pub peer: Option<PeerId>,
    pub state: SessionState,
    /// Serialized client inputs, oldest first.
    inputs: VecDeque<Bytes>,
}

impl Session {
    fn assign(&mut self, peer: PeerId) {
        self.peer = Some(peer);
        self.state = SessionState::Connecting;
        self.inputs.clear();
    }

    fn release(&mut self) {
        self.peer = None;
        self.state = SessionState::Disconnected;
        self.inputs.clear();
    }

    pub fn pending_inputs(&self) -> usize {
        self.inputs.len()
    }
}

/// Outcome of [`SessionTable::push_input`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputPush {
    Queued,
    /// Queued after evicting the oldest buffered input.
    Overflowed,
    UnknownPeer,
}

/// Session slots. Released slots are reused before the table grows, so slot
/// indices stay small and stable for the lifetime of a connection.
#[derive(Debug)]
pub struct SessionTable {
    slots: Vec<Session>,
    input_limit: usize,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    pub fn new() -> Self {
        Self::with_input_limit(usize::MAX)
    }

    /// Table whose sessions buffer at most `limit` inputs each.
    pub fn with_input_limit(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            input_limit: limit.max(1),
        }
    }

    /// Assign a slot to `peer` and return its index.
    ///
    /// A peer that already owns a slot keeps it.
    pub fn assign(&mut self, peer: PeerId) -> usize {
        if let Some(slot) = self.index_of(peer) {
            return slot;
        }
        let slot = match self.slots.iter().position(|s| s.peer.is_none()) {
            Some(free) => free,
            None => {
                self.slots.push(Session::default());
                self.slots.len() - 1
            }
        };
        self.slots[slot].assign(peer);
        slot
    }

    /// Free the slot owned by `peer`, discarding its buffered inputs.
    pub fn release(&mut self, peer: PeerId) -> Option<usize> {
        let slot = self.index_of(peer)?;
        self.slots[slot].release();
        Some(slot)
    }

    pub fn index_of(&self, peer: PeerId) -> Option<usize> {
        self.slots.iter().position(|s| s.peer == Some(peer))
    }

    pub fn get(&self, slot: usize) -> Option<&Session> {
        self.slots.get(slot)
    }

    pub fn set_state(&mut self, peer: PeerId, state: SessionState) -> Option<usize> {
        let slot = self.index_of(peer)?;
        self.slots[slot].state = state;
        Some(slot)
    }

    /// Queue inputs from `peer`, evicting the oldest entry when the session's
    /// buffer is full.
    pub fn push_input(&mut self, peer: PeerId, data: Bytes) -> InputPush {
        let Some(slot) = self.index_of(peer) else {
            return InputPush::UnknownPeer;
        };
        let inputs = &mut self.slots[slot].inputs;
        let overflowed = inputs.len() >= self.input_limit;
        if overflowed {
            inputs.pop_front();
        }
        inputs.push_back(data);
        if overflowed {
            InputPush::Overflowed
        } else {
            InputPush::Queued
        }
    }

    pub fn pop_input(&mut self, slot: usize) -> Option<Bytes> {
        self.slots.get_mut(slot)?.inputs.pop_front()
    }

    /// Number of slots, including free ones.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn connected(&self) -> impl Iterator<Item = (usize, PeerId)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, s)| s.peer.map(|peer| (slot, peer)))
    }

    /// Peers that already got an INITIAL_SYNC and follow the sync stream.
    pub fn synced(&self) -> impl Iterator<Item = (usize, PeerId)> + '_ {
        self.slots.iter().enumerate().filter_map(|(slot, s)| match s.state {
            SessionState::AwaitingInitialSyncAck | SessionState::Active => {
                s.peer.map(|peer| (slot, peer))
            }
            SessionState::Connecting | SessionState::Disconnected => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_slot_is_reused() {
        let mut table = SessionTable::new();
        let a = table.assign(10);
        let b = table.assign(11);
        assert_eq!((a, b), (0, 1));

        table.push_input(10, Bytes::from_static(b"P1:A"));
        assert_eq!(table.release(10), Some(0));
        assert_eq!(table.get(0).map(|s| s.state), Some(SessionState::Disconnected));

        let c = table.assign(12);
        assert_eq!(c, 0);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(0).map(Session::pending_inputs), Some(0));
        assert_eq!(table.get(0).map(|s| s.state), Some(SessionState::Connecting));
    }

    #[test]
    fn reassigning_a_known_peer_keeps_its_slot() {
        let mut table = SessionTable::new();
        table.assign(1);
        table.assign(2);
        assert_eq!(table.assign(2), 1);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn inputs_are_fifo_per_slot() {
        let mut table = SessionTable::new();
        table.assign(1);
        table.assign(2);
        assert_eq!(
            table.push_input(2, Bytes::from_static(b"first")),
            InputPush::Queued
        );
        assert_eq!(
            table.push_input(2, Bytes::from_static(b"second")),
            InputPush::Queued
        );
        assert_eq!(
            table.push_input(99, Bytes::from_static(b"stray")),
            InputPush::UnknownPeer
        );

        assert_eq!(table.pop_input(0), None);
        assert_eq!(table.pop_input(1).as_deref(), Some(&b"first"[..]));
        assert_eq!(table.pop_input(1).as_deref(), Some(&b"second"[..]));
        assert_eq!(table.pop_input(1), None);
        assert_eq!(table.pop_input(7), None);
    }

    #[test]
    fn full_input_queue_drops_oldest() {
        let mut table = SessionTable::with_input_limit(2);
        table.assign(1);
        table.push_input(1, Bytes::from_static(b"a"));
        table.push_input(1, Bytes::from_static(b"b"));
        assert_eq!(
            table.push_input(1, Bytes::from_static(b"c")),
            InputPush::Overflowed
        );
        assert_eq!(table.get(0).map(Session::pending_inputs), Some(2));
        assert_eq!(table.pop_input(0).as_deref(), Some(&b"b"[..]));
        assert_eq!(table.pop_input(0).as_deref(), Some(&b"c"[..]));
        assert_eq!(
            table.push_input(1, Bytes::from_static(b"d")),
            InputPush::Queued
        );
    }

    #[test]
    fn connected_skips_free_slots() {
        let mut table = SessionTable::new();
        table.assign(5);
        table.assign(6);
        table.release(5);
        assert_eq!(table.connected().collect::<Vec<_>>(), vec![(1, 6)]);
    }

    #[test]
    fn synced_excludes_peers_without_initial_sync() {
        let mut table = SessionTable::new();
        table.assign(1);
        table.assign(2);
        table.assign(3);
        table.set_state(2, SessionState::AwaitingInitialSyncAck);
        table.set_state(3, SessionState::Active);
        assert_eq!(table.synced().collect::<Vec<_>>(), vec![(1, 2), (2, 3)]);
    }
}
