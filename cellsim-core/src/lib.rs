//! Cellsim Core - slotted discrete-event simulation kernel
//!
//! This crate provides the building blocks every simulated network element
//! relies on: the logical clock and its two-phase tick, the calendar queue
//! that schedules object activations, typed data items, ordered queues,
//! overflow-checked counters, and the driver that runs a fixed topology.

pub mod clock;
pub mod config;
pub mod counter;
pub mod error;
pub mod item;
pub mod kernel;
pub mod queue;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use clock::{DeterministicRng, Phase, Tick};
pub use config::SimulationConfig;
pub use counter::Counter;
pub use error::{ConfigError, SimError, SimResult};
pub use item::{ConnectionId, DEFAULT_CELL_LENGTH, DataItem, TypeRegistry, TypeTag};
pub use kernel::{
    Activation, Calendar, Context, Delivery, EventHandle, ObjectId, RunState, SimObject,
    Simulation, SimulationBuilder, SimulationReport, Trigger,
};
pub use queue::Queue;
