//! Per-connection bookkeeping shared by the multiplexer and its discipline.

use std::collections::BTreeMap;

use cellsim_core::{ConnectionId, Counter};

/// State of one connection as seen by one multiplexer.
///
/// Counters only grow until [`ConnectionState::reset_counters`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionState {
    /// Items that arrived
    pub received: Counter,
    /// Items sent downstream
    pub served: Counter,
    /// Items not admitted
    pub lost: Counter,
    /// Items currently queued
    pub queued_items: usize,
    /// Bytes currently queued
    pub queued_bytes: u64,
    /// Next cell starts a new frame
    pub first: bool,
    /// Admission decision for the frame in progress
    pub admissible: bool,
    /// A cell of the frame in progress was lost; discard the rest
    pub truncated: bool,
    /// WFQ virtual finishing time of the head item
    pub spacing: u64,
    /// WFQ virtual time advanced per served item (inverse weight)
    pub delta: u64,
    /// DFBA weight
    pub weight: f64,
    /// Strict-priority class
    pub priority: usize,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            received: Counter::ZERO,
            served: Counter::ZERO,
            lost: Counter::ZERO,
            queued_items: 0,
            queued_bytes: 0,
            first: true,
            admissible: true,
            truncated: false,
            spacing: 0,
            delta: 1,
            weight: 1.0,
            priority: 0,
        }
    }
}

impl ConnectionState {
    /// Whether the connection has queued items.
    pub fn is_backlogged(&self) -> bool {
        self.queued_items > 0
    }

    /// Zeroes the statistics, keeping occupancy and frame state.
    pub fn reset_counters(&mut self) {
        self.received.reset();
        self.served.reset();
        self.lost.reset();
    }

    /// Records an item entering the buffer.
    pub fn on_queued(&mut self, length: u32) {
        self.queued_items += 1;
        self.queued_bytes += u64::from(length);
    }

    /// Records an item leaving the buffer.
    pub fn on_dequeued(&mut self, length: u32) {
        self.queued_items = self.queued_items.saturating_sub(1);
        self.queued_bytes = self.queued_bytes.saturating_sub(u64::from(length));
    }
}

/// Connection records keyed by id, created on first sight.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTable {
    connections: BTreeMap<ConnectionId, ConnectionState>,
}

impl ConnectionTable {
    /// Record for `id`, created and passed to `init` if unseen.
    pub fn ensure(
        &mut self,
        id: ConnectionId,
        init: impl FnOnce(ConnectionId, &mut ConnectionState),
    ) -> &mut ConnectionState {
        self.connections.entry(id).or_insert_with(|| {
            let mut state = ConnectionState::default();
            init(id, &mut state);
            state
        })
    }

    /// Record for `id`, created with defaults if unseen.
    pub fn state_mut(&mut self, id: ConnectionId) -> &mut ConnectionState {
        self.connections.entry(id).or_default()
    }

    /// Record for `id`, if seen.
    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionState> {
        self.connections.get(&id)
    }

    /// Records in id order.
    pub fn iter(&self) -> impl Iterator<Item = (ConnectionId, &ConnectionState)> {
        self.connections.iter().map(|(id, state)| (*id, state))
    }

    /// Mutable records in id order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ConnectionId, &mut ConnectionState)> {
        self.connections.iter_mut().map(|(id, state)| (*id, state))
    }

    /// Number of known connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection has been seen.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Sum of weights of backlogged connections.
    pub fn active_weight(&self) -> f64 {
        self.connections
            .values()
            .filter(|state| state.is_backlogged())
            .map(|state| state.weight)
            .sum()
    }

    /// Zeroes every record's statistics.
    pub fn reset_counters(&mut self) {
        for state in self.connections.values_mut() {
            state.reset_counters();
        }
    }

    /// Forgets every connection.
    pub fn clear(&mut self) {
        self.connections.clear();
    }
}
