//! Weighted fair queueing by virtual spacing.
//!
//! Every backlogged connection has one entry in a key-ordered sort queue,
//! keyed by its virtual spacing. Serving pops the smallest spacing, moves the
//! global virtual time there and, if the connection is still backlogged,
//! reinserts it `delta` further on. A connection with half the `delta` of
//! another therefore gets twice the service while both are backlogged.

use std::collections::BTreeMap;

use cellsim_core::{ConfigError, ConnectionId, DataItem, Queue, SimError, SimResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{
    Admission, AdmissionContext, Discipline, DropReason, ServiceContext, require_at_least,
};
use crate::connection::ConnectionState;

/// Default global virtual time at which spacings are rebased.
pub const DEFAULT_REBASE_THRESHOLD: u64 = 1 << 40;

/// WFQ parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WfqConfig {
    /// Shared buffer size in items
    pub capacity: usize,
    /// Optional per-connection buffer size
    pub connection_capacity: Option<usize>,
    /// Spacing increment of connections missing from `deltas`
    pub default_delta: u64,
    /// Per-connection spacing increment (larger means less bandwidth)
    pub deltas: BTreeMap<ConnectionId, u64>,
    /// Global virtual time above which every spacing is rebased
    pub rebase_threshold: u64,
}

impl WfqConfig {
    /// Shared buffer of `capacity` items, equal weights.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            connection_capacity: None,
            default_delta: 1,
            deltas: BTreeMap::new(),
            rebase_threshold: DEFAULT_REBASE_THRESHOLD,
        }
    }

    /// Sets the spacing increment of a connection.
    pub fn with_delta(mut self, connection: ConnectionId, delta: u64) -> Self {
        self.deltas.insert(connection, delta);
        self
    }

    /// Limits every connection's private queue.
    pub fn with_connection_capacity(mut self, capacity: usize) -> Self {
        self.connection_capacity = Some(capacity);
        self
    }

    /// Checks parameter ranges.
    ///
    /// # Errors
    ///
    /// - `ConfigError::BelowMinimum` - If a capacity, a delta or the rebase threshold is zero
    pub fn validate(&self, object: &str) -> Result<(), ConfigError> {
        require_at_least(object, "capacity", 1, self.capacity as u64)?;
        if let Some(capacity) = self.connection_capacity {
            require_at_least(object, "connection_capacity", 1, capacity as u64)?;
        }
        require_at_least(object, "default_delta", 1, self.default_delta)?;
        for delta in self.deltas.values() {
            require_at_least(object, "delta", 1, *delta)?;
        }
        require_at_least(object, "rebase_threshold", 1, self.rebase_threshold)
    }

    fn delta_of(&self, connection: ConnectionId) -> u64 {
        self.deltas
            .get(&connection)
            .copied()
            .unwrap_or(self.default_delta)
    }
}

/// Per-connection queues served in virtual-spacing order.
#[derive(Debug, Clone)]
pub struct Wfq {
    config: WfqConfig,
    queues: BTreeMap<ConnectionId, Queue<DataItem>>,
    order: Queue<ConnectionId>,
    global: u64,
    total: usize,
    rebases: u64,
}

impl Wfq {
    /// Creates the discipline.
    ///
    /// # Errors
    ///
    /// Every error of [`WfqConfig::validate`].
    pub fn new(config: WfqConfig) -> Result<Self, ConfigError> {
        config.validate("wfq")?;
        Ok(Self {
            config,
            queues: BTreeMap::new(),
            order: Queue::unbounded(),
            global: 0,
            total: 0,
            rebases: 0,
        })
    }

    /// Current global virtual time.
    pub fn global_spacing(&self) -> u64 {
        self.global
    }

    /// Items queued for one connection.
    pub fn connection_len(&self, connection: ConnectionId) -> usize {
        self.queues.get(&connection).map_or(0, Queue::len)
    }

    fn rebase(&mut self, ctx: &mut ServiceContext<'_>) {
        let amount = self.global;
        self.order.shift_keys_down(amount);
        for (_, state) in ctx.connections.iter_mut() {
            state.spacing = state.spacing.saturating_sub(amount);
        }
        self.global = 0;
        self.rebases += 1;
        debug!(owner = ctx.owner, amount, "wfq virtual time rebased");
    }
}

impl Discipline for Wfq {
    fn kind(&self) -> &'static str {
        "wfq"
    }

    fn configure_connection(&self, id: ConnectionId, state: &mut ConnectionState) {
        state.delta = self.config.delta_of(id);
    }

    fn admit(&mut self, ctx: &mut AdmissionContext<'_>, item: DataItem) -> SimResult<Admission> {
        if self.total >= self.config.capacity {
            return Ok(Admission::dropped(item, DropReason::BufferFull));
        }

        let connection = item.connection;
        let private_capacity = self.config.connection_capacity;
        let queue = self
            .queues
            .entry(connection)
            .or_insert_with(|| match private_capacity {
                Some(capacity) => Queue::bounded(capacity),
                None => Queue::unbounded(),
            });
        let was_idle = queue.is_empty();
        if let Err(item) = queue.enqueue(item) {
            return Ok(Admission::dropped(item, DropReason::BufferFull));
        }
        self.total += 1;

        if was_idle {
            let state = ctx.connection(connection);
            state.spacing = self.global.saturating_add(state.delta);
            let spacing = state.spacing;
            // Unbounded, so this cannot fail.
            let _ = self.order.enqueue_ordered(connection, spacing);
            trace!(%connection, spacing, "connection backlogged");
        }
        Ok(Admission::Queued)
    }

    fn dequeue(&mut self, ctx: &mut ServiceContext<'_>) -> SimResult<Option<DataItem>> {
        if self.total == 0 {
            return Ok(None);
        }
        let empty_schedule = |structure| SimError::EmptySchedule {
            object: ctx.owner.to_string(),
            structure,
            queued: self.total,
        };
        let (connection, spacing) = self
            .order
            .dequeue_keyed()
            .ok_or_else(|| empty_schedule("wfq sort queue"))?;
        let queue = self
            .queues
            .get_mut(&connection)
            .ok_or_else(|| empty_schedule("wfq connection queue"))?;
        let item = queue
            .dequeue()
            .ok_or_else(|| empty_schedule("wfq connection queue"))?;
        let still_backlogged = !queue.is_empty();

        self.total -= 1;
        self.global = spacing;

        if still_backlogged {
            let state = ctx.connections.state_mut(connection);
            state.spacing = self.global.saturating_add(state.delta);
            let next = state.spacing;
            let _ = self.order.enqueue_ordered(connection, next);
        }

        if self.global > self.config.rebase_threshold {
            self.rebase(ctx);
        }
        Ok(Some(item))
    }

    fn len(&self) -> usize {
        self.total
    }

    fn capacity(&self) -> usize {
        self.config.capacity
    }

    fn set_capacity(&mut self, capacity: usize) -> Result<(), ConfigError> {
        require_at_least("wfq", "capacity", 1, capacity as u64)?;
        self.config.capacity = capacity;
        Ok(())
    }

    fn value(&self, name: &str) -> Option<f64> {
        match name {
            "global_spacing" => Some(self.global as f64),
            "rebases" => Some(self.rebases as f64),
            "backlogged_connections" => Some(self.order.len() as f64),
            _ => None,
        }
    }

    fn value_names(&self) -> Vec<String> {
        ["global_spacing", "rebases", "backlogged_connections"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    fn for_each_item(&mut self, visit: &mut dyn FnMut(&mut DataItem)) {
        for queue in self.queues.values_mut() {
            queue.iter_mut().for_each(&mut *visit);
        }
    }

    fn reset_counters(&mut self) {
        self.rebases = 0;
    }

    fn drain(&mut self) -> Vec<DataItem> {
        let items = self.queues.values_mut().flat_map(Queue::drain).collect();
        self.queues.clear();
        self.order.drain();
        self.global = 0;
        self.total = 0;
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discipline::test_support::Harness;

    #[test]
    fn test_zero_delta_rejected() {
        let config = WfqConfig::new(8).with_delta(ConnectionId(1), 0);
        assert!(matches!(
            Wfq::new(config),
            Err(ConfigError::BelowMinimum { parameter: "delta", .. })
        ));
    }

    #[test]
    fn test_service_ratio_follows_inverse_delta() {
        let config = WfqConfig::new(64)
            .with_delta(ConnectionId(1), 1)
            .with_delta(ConnectionId(2), 3);
        let mut harness = Harness::new(Wfq::new(config).unwrap());
        for _ in 0..20 {
            harness.cell(1, true);
            harness.cell(2, true);
        }

        let mut served = [0u32; 3];
        for _ in 0..16 {
            let item = harness.serve().unwrap();
            served[item.connection.0 as usize] += 1;
        }
        // delta 1 : delta 3 gives a 3 : 1 split of 16 services.
        assert_eq!(served[1], 12);
        assert_eq!(served[2], 4);
    }

    #[test]
    fn test_newly_backlogged_connection_starts_at_global_time() {
        let mut harness = Harness::new(Wfq::new(WfqConfig::new(16)).unwrap());
        for _ in 0..4 {
            harness.cell(1, true);
        }
        harness.serve();
        harness.serve();
        assert_eq!(harness.discipline.global_spacing(), 2);

        harness.cell(2, true);
        assert_eq!(harness.connections.get(ConnectionId(2)).unwrap().spacing, 3);
    }

    #[test]
    fn test_buffer_limits() {
        let config = WfqConfig::new(3).with_connection_capacity(2);
        let mut harness = Harness::new(Wfq::new(config).unwrap());
        assert_eq!(harness.cell(1, true), Admission::Queued);
        assert_eq!(harness.cell(1, true), Admission::Queued);
        assert!(matches!(harness.cell(1, true), Admission::Dropped { .. }));
        assert_eq!(harness.cell(2, true), Admission::Queued);
        assert!(matches!(harness.cell(3, true), Admission::Dropped { .. }));
        assert_eq!(harness.discipline.len(), 3);
    }

    #[test]
    fn test_rebase_preserves_relative_order() {
        let mut config = WfqConfig::new(32)
            .with_delta(ConnectionId(1), 2)
            .with_delta(ConnectionId(2), 5);
        config.rebase_threshold = 6;
        let mut harness = Harness::new(Wfq::new(config).unwrap());
        for _ in 0..10 {
            harness.cell(1, true);
            harness.cell(2, true);
        }

        let order: Vec<u32> = (0..8)
            .map(|_| harness.serve().unwrap().connection.0)
            .collect();
        // Spacings: c1 at 2,4,6,8,10,... and c2 at 5,10,15,...; ties keep insertion order.
        assert_eq!(order, vec![1, 1, 2, 1, 1, 2, 1, 1]);
        assert!(harness.discipline.value("rebases").unwrap() >= 1.0);
        assert!(harness.discipline.global_spacing() <= 6);
    }

    #[test]
    fn test_drain_resets_virtual_time() {
        let mut harness = Harness::new(Wfq::new(WfqConfig::new(8)).unwrap());
        harness.cell(1, true);
        harness.cell(1, true);
        harness.serve();
        assert_eq!(harness.discipline.drain().len(), 1);
        assert!(harness.discipline.is_empty());
        assert_eq!(harness.discipline.global_spacing(), 0);
    }

    fn service_error(harness: &mut Harness<Wfq>) -> SimError {
        let mut ctx = ServiceContext {
            owner: "mux",
            now: 0,
            connections: &mut harness.connections,
        };
        harness.discipline.dequeue(&mut ctx).unwrap_err()
    }

    #[test]
    fn test_missing_sort_entry_is_fatal() {
        let mut harness = Harness::new(Wfq::new(WfqConfig::new(4)).unwrap());
        harness.cell(1, true);
        harness.discipline.order.drain();

        assert_eq!(
            service_error(&mut harness),
            SimError::EmptySchedule {
                object: "mux".to_string(),
                structure: "wfq sort queue",
                queued: 1,
            }
        );
    }

    #[test]
    fn test_missing_connection_queue_is_fatal() {
        let mut harness = Harness::new(Wfq::new(WfqConfig::new(4)).unwrap());
        harness.cell(1, true);
        harness.cell(2, true);
        harness.discipline.queues.clear();

        assert_eq!(
            service_error(&mut harness),
            SimError::EmptySchedule {
                object: "mux".to_string(),
                structure: "wfq connection queue",
                queued: 2,
            }
        );
    }

    #[test]
    fn test_shrunk_shared_buffer_refuses_until_drained() {
        let mut harness = Harness::new(Wfq::new(WfqConfig::new(3)).unwrap());
        for _ in 0..3 {
            harness.cell(1, true);
        }
        harness.discipline.set_capacity(2).unwrap();
        assert_eq!(harness.discipline.len(), 3);

        harness.serve();
        assert!(matches!(harness.cell(2, true), Admission::Dropped { .. }));
        harness.serve();
        assert_eq!(harness.cell(2, true), Admission::Queued);

        assert!(harness.discipline.set_capacity(0).is_err());
        assert_eq!(harness.discipline.capacity(), 2);
    }
}
