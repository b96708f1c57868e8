//! Admission and scheduling strategies plugged into a [`crate::Multiplexer`].
//!
//! The multiplexer owns arrival batching, loss accounting, occupancy tracking
//! and the server; a discipline only decides what enters its buffer and which
//! item leaves next.

pub mod epd;
pub mod fifo;
pub mod priority;
pub mod red;
pub mod wfq;

use std::fmt;

use cellsim_core::{ConfigError, ConnectionId, DataItem, DeterministicRng, SimResult, Tick};

use crate::connection::{ConnectionState, ConnectionTable};

/// Why an item was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DropReason {
    /// No buffer space
    BufferFull,
    /// Frame judged inadmissible at its first cell
    FrameDiscard,
    /// Rest of a frame that already lost a cell
    PartialFrameDiscard,
    /// Probabilistic early drop
    EarlyDrop,
    /// Connection above its weighted fair share
    FairShare,
}

impl DropReason {
    /// Every reason, in reporting order.
    pub const ALL: [DropReason; 5] = [
        DropReason::BufferFull,
        DropReason::FrameDiscard,
        DropReason::PartialFrameDiscard,
        DropReason::EarlyDrop,
        DropReason::FairShare,
    ];

    /// Dense index for per-reason arrays.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Name used in value keys (`lost.<name>`).
    pub fn name(self) -> &'static str {
        match self {
            DropReason::BufferFull => "buffer_full",
            DropReason::FrameDiscard => "frame_discard",
            DropReason::PartialFrameDiscard => "partial_frame_discard",
            DropReason::EarlyDrop => "early_drop",
            DropReason::FairShare => "fair_share",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of offering one item to a discipline.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// The item is in the buffer
    Queued,
    /// The item was refused and is handed back for accounting
    Dropped {
        /// Refused item
        item: DataItem,
        /// Cause
        reason: DropReason,
    },
}

impl Admission {
    /// Convenience constructor for a refusal.
    pub fn dropped(item: DataItem, reason: DropReason) -> Self {
        Admission::Dropped { item, reason }
    }

    /// Maps a queue insertion result, counting a full buffer as `BufferFull`.
    pub fn from_enqueue(result: Result<(), DataItem>) -> Self {
        match result {
            Ok(()) => Admission::Queued,
            Err(item) => Admission::dropped(item, DropReason::BufferFull),
        }
    }
}

/// What a discipline sees while admitting one item.
pub struct AdmissionContext<'a> {
    /// Name of the owning multiplexer
    pub owner: &'a str,
    /// Current tick
    pub now: Tick,
    /// Input the item arrived on
    pub input: usize,
    /// Shared seeded random stream
    pub rng: &'a mut DeterministicRng,
    /// Connection records; the item's connection already exists
    pub connections: &'a mut ConnectionTable,
}

impl AdmissionContext<'_> {
    /// Record of a connection.
    pub fn connection(&mut self, id: ConnectionId) -> &mut ConnectionState {
        self.connections.state_mut(id)
    }
}

/// What a discipline sees while choosing the next item to serve.
pub struct ServiceContext<'a> {
    /// Name of the owning multiplexer
    pub owner: &'a str,
    /// Current tick
    pub now: Tick,
    /// Connection records
    pub connections: &'a mut ConnectionTable,
}

/// Buffer management and service order of a multiplexer.
pub trait Discipline: 'static {
    /// Short name used in logs and reports.
    fn kind(&self) -> &'static str;

    /// Initializes the record of a connection seen for the first time.
    fn configure_connection(&self, _id: ConnectionId, _state: &mut ConnectionState) {}

    /// Admits or refuses one arriving item.
    ///
    /// # Errors
    ///
    /// Only for broken internal invariants; refusals are [`Admission::Dropped`].
    fn admit(&mut self, ctx: &mut AdmissionContext<'_>, item: DataItem) -> SimResult<Admission>;

    /// Removes the next item to serve.
    ///
    /// # Errors
    ///
    /// Only for broken internal invariants, e.g. an empty schedule while
    /// items are queued.
    fn dequeue(&mut self, ctx: &mut ServiceContext<'_>) -> SimResult<Option<DataItem>>;

    /// Items in the buffer.
    fn len(&self) -> usize;

    /// Items the buffer can hold in total.
    fn capacity(&self) -> usize;

    /// Resizes the buffer; disciplines with one queue per class resize every
    /// class. Items already queued above the new size stay queued and
    /// arrivals are refused until the buffer drains below it.
    ///
    /// # Errors
    ///
    /// The discipline's validation error if the new size is zero or falls
    /// below a configured threshold. The old size stays in effect.
    fn set_capacity(&mut self, capacity: usize) -> Result<(), ConfigError>;

    /// Whether the buffer is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discipline-specific statistic.
    fn value(&self, _name: &str) -> Option<f64> {
        None
    }

    /// Names accepted by [`Discipline::value`].
    fn value_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Visits every buffered item, e.g. to rebase creation ticks.
    fn for_each_item(&mut self, visit: &mut dyn FnMut(&mut DataItem));

    /// Zeroes discipline-specific statistics.
    fn reset_counters(&mut self) {}

    /// Empties the buffer and forgets derived state.
    fn drain(&mut self) -> Vec<DataItem>;
}

pub(crate) fn require_at_least(
    object: &str,
    parameter: &'static str,
    minimum: u64,
    value: u64,
) -> Result<(), ConfigError> {
    if value < minimum {
        return Err(ConfigError::BelowMinimum {
            object: object.to_string(),
            parameter,
            minimum,
            value,
        });
    }
    Ok(())
}

pub(crate) fn require_probability(
    object: &str,
    parameter: &'static str,
    value: f64,
) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::ProbabilityOutOfRange {
            object: object.to_string(),
            parameter,
            value,
        });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use cellsim_core::{ConnectionId, DataItem, DeterministicRng};

    use super::{Admission, AdmissionContext, Discipline, ServiceContext};
    use crate::connection::ConnectionTable;

    /// Drives a discipline the way the multiplexer does, without a kernel.
    pub struct Harness<D: Discipline> {
        pub discipline: D,
        pub connections: ConnectionTable,
        pub rng: DeterministicRng,
    }

    impl<D: Discipline> Harness<D> {
        pub fn new(discipline: D) -> Self {
            Self {
                discipline,
                connections: ConnectionTable::default(),
                rng: DeterministicRng::from_seed(1),
            }
        }

        pub fn offer(&mut self, item: DataItem) -> Admission {
            let discipline = &self.discipline;
            self.connections
                .ensure(item.connection, |id, state| {
                    discipline.configure_connection(id, state)
                })
                .received
                .increment("test", "received")
                .unwrap();
            let (connection, length) = (item.connection, item.length);
            let mut ctx = AdmissionContext {
                owner: "test",
                now: 0,
                input: 0,
                rng: &mut self.rng,
                connections: &mut self.connections,
            };
            let admission = self.discipline.admit(&mut ctx, item).unwrap();
            if admission == Admission::Queued {
                self.connections.state_mut(connection).on_queued(length);
            }
            admission
        }

        pub fn cell(&mut self, connection: u32, end_of_frame: bool) -> Admission {
            self.offer(
                DataItem::cell(ConnectionId(connection), 0).with_end_of_frame(end_of_frame),
            )
        }

        pub fn serve(&mut self) -> Option<DataItem> {
            let mut ctx = ServiceContext {
                owner: "test",
                now: 0,
                connections: &mut self.connections,
            };
            let item = self.discipline.dequeue(&mut ctx).unwrap()?;
            self.connections
                .state_mut(item.connection)
                .on_dequeued(item.length);
            Some(item)
        }
    }
}
